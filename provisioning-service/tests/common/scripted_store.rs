//! A store wrapper that can hold or fail one named call, so tests can line
//! operations up in a chosen order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use provisioning_service::{
    models::{
        AuditEvent, AuditQuery, Grant, Grantee, OnboardingState, Principal, ProtectedResource,
        Role, TokenKind, TokenRecord,
    },
    store::{
        AuditStore, MemoryStore, PrincipalStore, ResourceStore, StoreError, StoreResult,
        TokenStore,
    },
};
use std::sync::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

#[derive(Default)]
pub struct ScriptedStore {
    inner: MemoryStore,
    hold_on: Mutex<Option<&'static str>>,
    fail_on: Mutex<Option<(&'static str, fn() -> StoreError)>>,
    reached: Notify,
    release: Notify,
}

impl ScriptedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.inner
    }

    /// The next call to `op` parks before touching the store until
    /// [`Self::release`] is called.
    pub fn hold_next(&self, op: &'static str) {
        *self.hold_on.lock().unwrap() = Some(op);
    }

    /// Resolves once a held call has parked.
    pub async fn wait_until_held(&self) {
        self.reached.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }

    /// The next call to `op` fails with the error `make` builds.
    pub fn fail_next(&self, op: &'static str, make: fn() -> StoreError) {
        *self.fail_on.lock().unwrap() = Some((op, make));
    }

    async fn gate(&self, op: &'static str) -> StoreResult<()> {
        let hold = {
            let mut slot = self.hold_on.lock().unwrap();
            if *slot == Some(op) {
                slot.take();
                true
            } else {
                false
            }
        };
        if hold {
            self.reached.notify_one();
            self.release.notified().await;
        }

        let fail = {
            let mut slot = self.fail_on.lock().unwrap();
            match *slot {
                Some((name, make)) if name == op => {
                    slot.take();
                    Some(make)
                }
                _ => None,
            }
        };
        match fail {
            Some(make) => Err(make()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl TokenStore for ScriptedStore {
    async fn insert_token(&self, token: &TokenRecord) -> StoreResult<()> {
        self.gate("insert_token").await?;
        self.inner.insert_token(token).await
    }

    async fn find_token(&self, token_hash: &str) -> StoreResult<Option<TokenRecord>> {
        self.gate("find_token").await?;
        self.inner.find_token(token_hash).await
    }

    async fn consume_token(&self, token_hash: &str, now: DateTime<Utc>) -> StoreResult<bool> {
        self.gate("consume_token").await?;
        self.inner.consume_token(token_hash, now).await
    }

    async fn revoke_token(&self, token_hash: &str, now: DateTime<Utc>) -> StoreResult<bool> {
        self.gate("revoke_token").await?;
        self.inner.revoke_token(token_hash, now).await
    }

    async fn live_tokens_for_subject(
        &self,
        subject_id: Uuid,
        kind: TokenKind,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<String>> {
        self.gate("live_tokens_for_subject").await?;
        self.inner.live_tokens_for_subject(subject_id, kind, now).await
    }
}

#[async_trait]
impl PrincipalStore for ScriptedStore {
    async fn insert_principal(&self, principal: &Principal) -> StoreResult<()> {
        self.gate("insert_principal").await?;
        self.inner.insert_principal(principal).await
    }

    async fn find_principal(&self, id: Uuid) -> StoreResult<Option<Principal>> {
        self.gate("find_principal").await?;
        self.inner.find_principal(id).await
    }

    async fn find_principal_by_email(&self, email: &str) -> StoreResult<Option<Principal>> {
        self.gate("find_principal_by_email").await?;
        self.inner.find_principal_by_email(email).await
    }

    async fn set_credential_hash(
        &self,
        id: Uuid,
        credential_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Principal>> {
        self.gate("set_credential_hash").await?;
        self.inner.set_credential_hash(id, credential_hash, now).await
    }

    async fn set_active(
        &self,
        id: Uuid,
        active: bool,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Principal>> {
        self.gate("set_active").await?;
        self.inner.set_active(id, active, now).await
    }

    async fn set_role(
        &self,
        id: Uuid,
        role: Role,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Principal>> {
        self.gate("set_role").await?;
        self.inner.set_role(id, role, now).await
    }

    async fn set_team(
        &self,
        id: Uuid,
        team: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Principal>> {
        self.gate("set_team").await?;
        self.inner.set_team(id, team, now).await
    }

    async fn transition_onboarding(
        &self,
        id: Uuid,
        from: OnboardingState,
        to: OnboardingState,
        credential_hash: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.gate("transition_onboarding").await?;
        self.inner
            .transition_onboarding(id, from, to, credential_hash, now)
            .await
    }
}

#[async_trait]
impl ResourceStore for ScriptedStore {
    async fn upsert_resource(&self, resource: &ProtectedResource) -> StoreResult<()> {
        self.gate("upsert_resource").await?;
        self.inner.upsert_resource(resource).await
    }

    async fn find_resource(&self, id: Uuid) -> StoreResult<Option<ProtectedResource>> {
        self.gate("find_resource").await?;
        self.inner.find_resource(id).await
    }

    async fn upsert_grant(&self, grant: &Grant) -> StoreResult<()> {
        self.gate("upsert_grant").await?;
        self.inner.upsert_grant(grant).await
    }

    async fn remove_grant(&self, resource_id: Uuid, grantee: &Grantee) -> StoreResult<bool> {
        self.gate("remove_grant").await?;
        self.inner.remove_grant(resource_id, grantee).await
    }
}

#[async_trait]
impl AuditStore for ScriptedStore {
    async fn append_audit_event(&self, event: &AuditEvent) -> StoreResult<i64> {
        self.gate("append_audit_event").await?;
        self.inner.append_audit_event(event).await
    }

    async fn query_audit_events(
        &self,
        query: &AuditQuery,
        limit: i64,
        offset: i64,
    ) -> StoreResult<(Vec<AuditEvent>, i64)> {
        self.gate("query_audit_events").await?;
        self.inner.query_audit_events(query, limit, offset).await
    }
}
