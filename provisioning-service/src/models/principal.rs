//! Principal model - user identities subject to role-based authorization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// Closed set of roles a principal can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Recruiter,
    Agent,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Admin, Role::Recruiter, Role::Agent];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Recruiter => "recruiter",
            Role::Agent => "agent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "admin" => Some(Role::Admin),
            "recruiter" => Some(Role::Recruiter),
            "agent" => Some(Role::Agent),
            _ => None,
        }
    }
}

/// Onboarding state codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnboardingState {
    Invited,
    CredentialsSet,
    Active,
}

impl OnboardingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OnboardingState::Invited => "invited",
            OnboardingState::CredentialsSet => "credentials_set",
            OnboardingState::Active => "active",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "invited" => Some(OnboardingState::Invited),
            "credentials_set" => Some(OnboardingState::CredentialsSet),
            "active" => Some(OnboardingState::Active),
            _ => None,
        }
    }
}

/// Principal entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: Uuid,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub role: Role,
    pub team: Option<String>,
    pub active: bool,
    pub onboarding: OnboardingState,
    #[serde(skip_serializing)]
    pub credential_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Principal {
    /// Create a freshly invited principal.
    pub fn invited(
        email: String,
        first_name: String,
        last_name: String,
        role: Role,
        team: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            email: normalize_email(&email),
            first_name,
            last_name,
            role,
            team: team.filter(|_| role == Role::Agent),
            active: true,
            onboarding: OnboardingState::Invited,
            credential_hash: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }
}

/// Emails are compared case-insensitively everywhere.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Details supplied by an admin when inviting a user.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct InviteRequest {
    #[validate(length(min = 1, max = 100))]
    pub first_name: String,
    #[validate(length(min = 1, max = 100))]
    pub last_name: String,
    #[validate(email)]
    pub email: String,
    #[serde(default = "default_invite_role")]
    pub role: Role,
    #[validate(length(min = 1, max = 100))]
    pub team: Option<String>,
}

fn default_invite_role() -> Role {
    Role::Agent
}
