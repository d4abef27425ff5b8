//! One-time token model - invitation, password reset and onboarding grants.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a token grants when redeemed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Invite,
    PasswordReset,
    OnboardingComplete,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Invite => "invite",
            TokenKind::PasswordReset => "password_reset",
            TokenKind::OnboardingComplete => "onboarding_complete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "invite" => Some(TokenKind::Invite),
            "password_reset" => Some(TokenKind::PasswordReset),
            "onboarding_complete" => Some(TokenKind::OnboardingComplete),
            _ => None,
        }
    }
}

/// Persisted token state. The token value itself is never stored, only its hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRecord {
    pub token_hash: String,
    pub subject_id: Option<Uuid>,
    pub kind: TokenKind,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
    pub used_at: Option<DateTime<Utc>>,
    pub revoked: bool,
}

impl TokenRecord {
    pub fn new(
        token_hash: String,
        subject_id: Option<Uuid>,
        kind: TokenKind,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            token_hash,
            subject_id,
            kind,
            issued_at,
            expires_at,
            used: false,
            used_at: None,
            revoked: false,
        }
    }

    /// Expired at or after `expires_at`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Unused, unrevoked and not yet expired.
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        !self.used && !self.is_expired_at(now)
    }
}

/// A freshly issued token: the only place the plain value exists.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub value: String,
    pub record: TokenRecord,
}

/// Result of a successful redemption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedeemedToken {
    pub subject_id: Option<Uuid>,
    pub kind: TokenKind,
    pub used_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_expiry_boundary_is_exclusive() {
        let issued = Utc::now();
        let record = TokenRecord::new(
            "h".into(),
            None,
            TokenKind::Invite,
            issued,
            issued + Duration::hours(1),
        );
        assert!(!record.is_expired_at(issued + Duration::minutes(59)));
        assert!(record.is_expired_at(issued + Duration::hours(1)));
        assert!(record.is_live_at(issued));
    }

    #[test]
    fn test_kind_codes() {
        for kind in [
            TokenKind::Invite,
            TokenKind::PasswordReset,
            TokenKind::OnboardingComplete,
        ] {
            assert_eq!(TokenKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(TokenKind::parse("verify_email"), None);
    }
}
