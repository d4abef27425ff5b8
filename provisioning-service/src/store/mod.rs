//! Persistence seams for the provisioning core.
//!
//! The core treats storage as an external collaborator. Each trait covers one
//! table family; [`MemoryStore`] and [`PgStore`] implement all of them.
//! Token redemption relies on [`TokenStore::consume_token`] being a single
//! conditional update, never a read followed by a write.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    AuditEvent, AuditQuery, Grant, Grantee, OnboardingState, Principal, ProtectedResource, Role,
    TokenKind, TokenRecord,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Unique constraint violated: {0}")]
    Conflict(String),

    #[error("Row not found: {0}")]
    NotFound(String),

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Insert a new token. Fails with `Conflict` if the hash already exists.
    async fn insert_token(&self, token: &TokenRecord) -> StoreResult<()>;

    async fn find_token(&self, token_hash: &str) -> StoreResult<Option<TokenRecord>>;

    /// Atomically flip `used` from false to true if the token is unused and
    /// `expires_at > now`. Returns whether this call performed the flip.
    async fn consume_token(&self, token_hash: &str, now: DateTime<Utc>) -> StoreResult<bool>;

    /// Atomically mark an unused token as used and revoked. Returns whether
    /// this call performed the flip.
    async fn revoke_token(&self, token_hash: &str, now: DateTime<Utc>) -> StoreResult<bool>;

    /// Hashes of unused, unexpired tokens of `kind` issued to `subject_id`.
    async fn live_tokens_for_subject(
        &self,
        subject_id: Uuid,
        kind: TokenKind,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<String>>;
}

#[async_trait]
pub trait PrincipalStore: Send + Sync {
    /// Insert a principal. Fails with `Conflict` if the email is taken.
    async fn insert_principal(&self, principal: &Principal) -> StoreResult<()>;

    async fn find_principal(&self, id: Uuid) -> StoreResult<Option<Principal>>;

    /// Case-insensitive lookup.
    async fn find_principal_by_email(&self, email: &str) -> StoreResult<Option<Principal>>;

    // Each setter writes only its own columns plus `updated_at`, so
    // concurrent updates to different fields never overwrite each other.
    // They return the row as stored afterwards, or `None` if no row matched.

    async fn set_credential_hash(
        &self,
        id: Uuid,
        credential_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Principal>>;

    async fn set_active(
        &self,
        id: Uuid,
        active: bool,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Principal>>;

    /// Also clears the team when the new role is not `Agent`.
    async fn set_role(
        &self,
        id: Uuid,
        role: Role,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Principal>>;

    /// Setting a team only matches a principal whose current role is `Agent`;
    /// clearing it always matches.
    async fn set_team(
        &self,
        id: Uuid,
        team: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Principal>>;

    /// Conditional onboarding transition: only applies if the principal is
    /// currently in `from`. Returns whether this call applied it.
    async fn transition_onboarding(
        &self,
        id: Uuid,
        from: OnboardingState,
        to: OnboardingState,
        credential_hash: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;
}

#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Insert or replace a resource's visibility and owner. Grants are untouched.
    async fn upsert_resource(&self, resource: &ProtectedResource) -> StoreResult<()>;

    /// The resource with all of its grants loaded.
    async fn find_resource(&self, id: Uuid) -> StoreResult<Option<ProtectedResource>>;

    /// Insert or replace the grant keyed by `(resource_id, grantee)`.
    async fn upsert_grant(&self, grant: &Grant) -> StoreResult<()>;

    /// Returns whether a grant was removed.
    async fn remove_grant(&self, resource_id: Uuid, grantee: &Grantee) -> StoreResult<bool>;
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Append an event, returning the sequence number assigned to it.
    async fn append_audit_event(&self, event: &AuditEvent) -> StoreResult<i64>;

    /// Matching events newest-first plus the total match count.
    async fn query_audit_events(
        &self,
        query: &AuditQuery,
        limit: i64,
        offset: i64,
    ) -> StoreResult<(Vec<AuditEvent>, i64)>;
}

/// Everything the orchestrator needs from one backing store.
pub trait CredentialStore: TokenStore + PrincipalStore + ResourceStore + AuditStore {}

impl<T> CredentialStore for T where T: TokenStore + PrincipalStore + ResourceStore + AuditStore {}
