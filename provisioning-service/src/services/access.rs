//! Resource access decisions.
//!
//! Evaluation is pure: it reads the principal and the resource with its grants
//! already loaded, and never touches the store or the clock.

use serde::Serialize;

use crate::models::{Action, Grantee, Principal, ProtectedResource, Visibility};

/// Why access was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    InactivePrincipal,
    NoRoleGrant,
    NoPrincipalGrant,
    AdminOnly,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::InactivePrincipal => "inactive_principal",
            DenyReason::NoRoleGrant => "no_role_grant",
            DenyReason::NoPrincipalGrant => "no_principal_grant",
            DenyReason::AdminOnly => "admin_only",
        }
    }
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenyReason::InactivePrincipal => write!(f, "Principal is inactive"),
            DenyReason::NoRoleGrant => write!(f, "No grant for this role permits the action"),
            DenyReason::NoPrincipalGrant => {
                write!(f, "No grant for this principal permits the action")
            }
            DenyReason::AdminOnly => write!(f, "Resource is restricted to administrators"),
        }
    }
}

/// Outcome of an access check. A deny is a normal result, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", content = "reason", rename_all = "snake_case")]
pub enum AccessDecision {
    Allow,
    Deny(DenyReason),
}

impl AccessDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AccessDecision::Allow)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AccessEvaluator;

impl AccessEvaluator {
    /// First match wins:
    /// inactive principals are denied, admins are allowed, then the
    /// resource's visibility selects which grants (if any) are consulted.
    pub fn evaluate(
        principal: &Principal,
        resource: &ProtectedResource,
        action: Action,
    ) -> AccessDecision {
        if !principal.active {
            return AccessDecision::Deny(DenyReason::InactivePrincipal);
        }

        if principal.is_admin() {
            return AccessDecision::Allow;
        }

        match resource.visibility {
            Visibility::Public => AccessDecision::Allow,
            Visibility::RoleBased => {
                if has_grant(resource, Grantee::Role(principal.role), action) {
                    AccessDecision::Allow
                } else {
                    AccessDecision::Deny(DenyReason::NoRoleGrant)
                }
            }
            Visibility::Custom => {
                if has_grant(resource, Grantee::Principal(principal.id), action) {
                    AccessDecision::Allow
                } else {
                    AccessDecision::Deny(DenyReason::NoPrincipalGrant)
                }
            }
            Visibility::AdminOnly => AccessDecision::Deny(DenyReason::AdminOnly),
        }
    }
}

fn has_grant(resource: &ProtectedResource, grantee: Grantee, action: Action) -> bool {
    resource
        .grants
        .iter()
        .any(|g| g.grantee == grantee && g.permits(action))
}
