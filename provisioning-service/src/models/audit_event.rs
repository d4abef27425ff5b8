//! Audit event model - security and compliance logging.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Audit event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    UserInvited,
    UserReinvited,
    InviteFailed,
    InviteRedeemed,
    InviteRedeemFailed,
    OnboardingTokenIssued,
    OnboardingCompleted,
    PasswordResetRequested,
    PasswordResetCompleted,
    PasswordResetFailed,
    TokenRevoked,
    AccessGranted,
    AccessDenied,
    RoleChanged,
    TeamChanged,
    PrincipalActivated,
    PrincipalDeactivated,
    ResourceRegistered,
    GrantUpserted,
    GrantRemoved,
    RateLimitExceeded,
    UnauthorizedAdminAction,
}

impl AuditAction {
    const ALL: [AuditAction; 22] = [
        AuditAction::UserInvited,
        AuditAction::UserReinvited,
        AuditAction::InviteFailed,
        AuditAction::InviteRedeemed,
        AuditAction::InviteRedeemFailed,
        AuditAction::OnboardingTokenIssued,
        AuditAction::OnboardingCompleted,
        AuditAction::PasswordResetRequested,
        AuditAction::PasswordResetCompleted,
        AuditAction::PasswordResetFailed,
        AuditAction::TokenRevoked,
        AuditAction::AccessGranted,
        AuditAction::AccessDenied,
        AuditAction::RoleChanged,
        AuditAction::TeamChanged,
        AuditAction::PrincipalActivated,
        AuditAction::PrincipalDeactivated,
        AuditAction::ResourceRegistered,
        AuditAction::GrantUpserted,
        AuditAction::GrantRemoved,
        AuditAction::RateLimitExceeded,
        AuditAction::UnauthorizedAdminAction,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::UserInvited => "user_invited",
            AuditAction::UserReinvited => "user_reinvited",
            AuditAction::InviteFailed => "invite_failed",
            AuditAction::InviteRedeemed => "invite_redeemed",
            AuditAction::InviteRedeemFailed => "invite_redeem_failed",
            AuditAction::OnboardingTokenIssued => "onboarding_token_issued",
            AuditAction::OnboardingCompleted => "onboarding_completed",
            AuditAction::PasswordResetRequested => "password_reset_requested",
            AuditAction::PasswordResetCompleted => "password_reset_completed",
            AuditAction::PasswordResetFailed => "password_reset_failed",
            AuditAction::TokenRevoked => "token_revoked",
            AuditAction::AccessGranted => "access_granted",
            AuditAction::AccessDenied => "access_denied",
            AuditAction::RoleChanged => "role_changed",
            AuditAction::TeamChanged => "team_changed",
            AuditAction::PrincipalActivated => "principal_activated",
            AuditAction::PrincipalDeactivated => "principal_deactivated",
            AuditAction::ResourceRegistered => "resource_registered",
            AuditAction::GrantUpserted => "grant_upserted",
            AuditAction::GrantRemoved => "grant_removed",
            AuditAction::RateLimitExceeded => "rate_limit_exceeded",
            AuditAction::UnauthorizedAdminAction => "unauthorized_admin_action",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.as_str() == s)
    }
}

/// Entity type labels used in audit records.
pub mod entity {
    pub const PRINCIPAL: &str = "principal";
    pub const TOKEN: &str = "token";
    pub const RESOURCE: &str = "resource";
    pub const GRANT: &str = "grant";
    pub const RATE_LIMIT: &str = "rate_limit";
}

/// Immutable audit record. `sequence` is assigned by the store on append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub sequence: i64,
    pub timestamp: DateTime<Utc>,
    pub actor_id: Option<Uuid>,
    pub action: AuditAction,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub details: serde_json::Value,
    pub source_address: Option<String>,
}

impl AuditEvent {
    /// Create a new audit event.
    pub fn new(
        timestamp: DateTime<Utc>,
        actor_id: Option<Uuid>,
        action: AuditAction,
        entity_type: impl Into<String>,
        entity_id: Option<String>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            sequence: 0,
            timestamp,
            actor_id,
            action,
            entity_type: entity_type.into(),
            entity_id,
            details: serde_json::Value::Null,
            source_address: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_source(mut self, source_address: Option<String>) -> Self {
        self.source_address = source_address;
        self
    }
}

/// Filters for the audit read path. `None` matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AuditQuery {
    pub actor_id: Option<Uuid>,
    pub action: Option<AuditAction>,
    pub entity_type: Option<String>,
}

impl AuditQuery {
    pub fn matches(&self, event: &AuditEvent) -> bool {
        self.actor_id.is_none_or(|id| event.actor_id == Some(id))
            && self.action.is_none_or(|a| event.action == a)
            && self
                .entity_type
                .as_deref()
                .is_none_or(|t| event.entity_type == t)
    }
}

/// One page of audit events, newest first, with the unpaged total.
#[derive(Debug, Clone, Serialize)]
pub struct AuditPage {
    pub events: Vec<AuditEvent>,
    pub total: i64,
}
