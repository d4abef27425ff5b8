pub mod audit_event;
pub mod principal;
pub mod resource;
pub mod token;

pub use audit_event::{entity, AuditAction, AuditEvent, AuditPage, AuditQuery};
pub use principal::{normalize_email, InviteRequest, OnboardingState, Principal, Role};
pub use resource::{Action, Grant, Grantee, ProtectedResource, Visibility};
pub use token::{IssuedToken, RedeemedToken, TokenKind, TokenRecord};
