//! Core services: token lifecycle, access decisions, rate limiting, audit
//! trail, and the orchestrator composing them into provisioning flows.

pub mod access;
pub mod audit;
pub mod error;
pub mod identity;
pub mod notifier;
pub mod orchestrator;
pub mod rate_limit;
pub mod token_ledger;

pub use access::{AccessDecision, AccessEvaluator, DenyReason};
pub use audit::AuditLog;
pub use error::ProvisioningError;
pub use identity::{IdentityProvider, ProvisioningMode};
pub use notifier::{token_from_link, Delivery, DeliveryKind, LogNotifier, MockNotifier, Notifier};
pub use orchestrator::{InviteOutcome, ProvisioningOrchestrator, ReinviteOutcome, RequestContext};
pub use rate_limit::{
    RateLimitDecision, RateLimitProfile, RateLimiter, RateLimiterRegistry, RateWindow,
};
pub use token_ledger::TokenLedger;
