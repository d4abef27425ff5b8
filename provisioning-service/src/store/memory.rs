//! In-process store backed by DashMap.
//!
//! Each conditional update runs under the shard write lock of the key it
//! touches, which gives the same per-key atomicity the relational store gets
//! from `UPDATE ... WHERE`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    RwLock,
};
use uuid::Uuid;

use super::{
    AuditStore, PrincipalStore, ResourceStore, StoreError, StoreResult, TokenStore,
};
use crate::models::{
    normalize_email, AuditEvent, AuditQuery, Grant, Grantee, OnboardingState, Principal,
    ProtectedResource, Role, TokenKind, TokenRecord,
};

#[derive(Default)]
pub struct MemoryStore {
    tokens: DashMap<String, TokenRecord>,
    principals: DashMap<Uuid, Principal>,
    emails: DashMap<String, Uuid>,
    resources: DashMap<Uuid, ProtectedResource>,
    audit: RwLock<Vec<AuditEvent>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every call fails with `Unavailable` while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Raw view of a stored token, for assertions.
    pub fn token_snapshot(&self, token_hash: &str) -> Option<TokenRecord> {
        self.tokens.get(token_hash).map(|t| t.clone())
    }

    pub fn audit_len(&self) -> usize {
        self.audit.read().map(|a| a.len()).unwrap_or(0)
    }

    fn guard(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply `apply` under the entry lock. It returns false to leave the row
    /// untouched, in which case no row is reported.
    fn modify_principal(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        apply: impl FnOnce(&mut Principal) -> bool,
    ) -> StoreResult<Option<Principal>> {
        self.guard()?;
        let Some(mut principal) = self.principals.get_mut(&id) else {
            return Ok(None);
        };
        if !apply(&mut principal) {
            return Ok(None);
        }
        principal.updated_at = now;
        Ok(Some(principal.clone()))
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn insert_token(&self, token: &TokenRecord) -> StoreResult<()> {
        self.guard()?;
        match self.tokens.entry(token.token_hash.clone()) {
            Entry::Occupied(_) => Err(StoreError::Conflict("token_hash".to_string())),
            Entry::Vacant(slot) => {
                slot.insert(token.clone());
                Ok(())
            }
        }
    }

    async fn find_token(&self, token_hash: &str) -> StoreResult<Option<TokenRecord>> {
        self.guard()?;
        Ok(self.tokens.get(token_hash).map(|t| t.clone()))
    }

    async fn consume_token(&self, token_hash: &str, now: DateTime<Utc>) -> StoreResult<bool> {
        self.guard()?;
        let Some(mut token) = self.tokens.get_mut(token_hash) else {
            return Ok(false);
        };
        if token.used || token.is_expired_at(now) {
            return Ok(false);
        }
        token.used = true;
        token.used_at = Some(now);
        Ok(true)
    }

    async fn revoke_token(&self, token_hash: &str, now: DateTime<Utc>) -> StoreResult<bool> {
        self.guard()?;
        let Some(mut token) = self.tokens.get_mut(token_hash) else {
            return Ok(false);
        };
        if token.used {
            return Ok(false);
        }
        token.used = true;
        token.used_at = Some(now);
        token.revoked = true;
        Ok(true)
    }

    async fn live_tokens_for_subject(
        &self,
        subject_id: Uuid,
        kind: TokenKind,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<String>> {
        self.guard()?;
        Ok(self
            .tokens
            .iter()
            .filter(|t| t.subject_id == Some(subject_id) && t.kind == kind && t.is_live_at(now))
            .map(|t| t.token_hash.clone())
            .collect())
    }
}

#[async_trait]
impl PrincipalStore for MemoryStore {
    async fn insert_principal(&self, principal: &Principal) -> StoreResult<()> {
        self.guard()?;
        match self.emails.entry(normalize_email(&principal.email)) {
            Entry::Occupied(_) => Err(StoreError::Conflict("email".to_string())),
            Entry::Vacant(slot) => {
                slot.insert(principal.id);
                self.principals.insert(principal.id, principal.clone());
                Ok(())
            }
        }
    }

    async fn find_principal(&self, id: Uuid) -> StoreResult<Option<Principal>> {
        self.guard()?;
        Ok(self.principals.get(&id).map(|p| p.clone()))
    }

    async fn find_principal_by_email(&self, email: &str) -> StoreResult<Option<Principal>> {
        self.guard()?;
        let Some(id) = self.emails.get(&normalize_email(email)).map(|id| *id) else {
            return Ok(None);
        };
        Ok(self.principals.get(&id).map(|p| p.clone()))
    }

    async fn set_credential_hash(
        &self,
        id: Uuid,
        credential_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Principal>> {
        self.modify_principal(id, now, |p| {
            p.credential_hash = Some(credential_hash.to_string());
            true
        })
    }

    async fn set_active(
        &self,
        id: Uuid,
        active: bool,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Principal>> {
        self.modify_principal(id, now, |p| {
            p.active = active;
            true
        })
    }

    async fn set_role(
        &self,
        id: Uuid,
        role: Role,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Principal>> {
        self.modify_principal(id, now, |p| {
            p.role = role;
            if role != Role::Agent {
                p.team = None;
            }
            true
        })
    }

    async fn set_team(
        &self,
        id: Uuid,
        team: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Principal>> {
        self.modify_principal(id, now, |p| {
            if team.is_some() && p.role != Role::Agent {
                return false;
            }
            p.team = team.map(str::to_string);
            true
        })
    }

    async fn transition_onboarding(
        &self,
        id: Uuid,
        from: OnboardingState,
        to: OnboardingState,
        credential_hash: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.guard()?;
        let Some(mut principal) = self.principals.get_mut(&id) else {
            return Ok(false);
        };
        if principal.onboarding != from {
            return Ok(false);
        }
        principal.onboarding = to;
        if let Some(hash) = credential_hash {
            principal.credential_hash = Some(hash.to_string());
        }
        principal.updated_at = now;
        Ok(true)
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn upsert_resource(&self, resource: &ProtectedResource) -> StoreResult<()> {
        self.guard()?;
        self.resources
            .entry(resource.id)
            .and_modify(|existing| {
                existing.visibility = resource.visibility;
                existing.owner_id = resource.owner_id;
            })
            .or_insert_with(|| ProtectedResource {
                grants: Vec::new(),
                ..resource.clone()
            });
        Ok(())
    }

    async fn find_resource(&self, id: Uuid) -> StoreResult<Option<ProtectedResource>> {
        self.guard()?;
        Ok(self.resources.get(&id).map(|r| r.clone()))
    }

    async fn upsert_grant(&self, grant: &Grant) -> StoreResult<()> {
        self.guard()?;
        let Some(mut resource) = self.resources.get_mut(&grant.resource_id) else {
            return Err(StoreError::NotFound(format!(
                "resource {}",
                grant.resource_id
            )));
        };
        match resource
            .grants
            .iter_mut()
            .find(|g| g.grantee == grant.grantee)
        {
            Some(existing) => *existing = grant.clone(),
            None => resource.grants.push(grant.clone()),
        }
        Ok(())
    }

    async fn remove_grant(&self, resource_id: Uuid, grantee: &Grantee) -> StoreResult<bool> {
        self.guard()?;
        let Some(mut resource) = self.resources.get_mut(&resource_id) else {
            return Ok(false);
        };
        let before = resource.grants.len();
        resource.grants.retain(|g| &g.grantee != grantee);
        Ok(resource.grants.len() != before)
    }
}

#[async_trait]
impl AuditStore for MemoryStore {
    async fn append_audit_event(&self, event: &AuditEvent) -> StoreResult<i64> {
        self.guard()?;
        let mut log = self
            .audit
            .write()
            .map_err(|e| StoreError::Unavailable(format!("audit log lock poisoned: {}", e)))?;
        let sequence = log.len() as i64 + 1;
        let mut stored = event.clone();
        stored.sequence = sequence;
        log.push(stored);
        Ok(sequence)
    }

    async fn query_audit_events(
        &self,
        query: &AuditQuery,
        limit: i64,
        offset: i64,
    ) -> StoreResult<(Vec<AuditEvent>, i64)> {
        self.guard()?;
        let log = self
            .audit
            .read()
            .map_err(|e| StoreError::Unavailable(format!("audit log lock poisoned: {}", e)))?;
        let mut matching: Vec<&AuditEvent> = log.iter().filter(|e| query.matches(e)).collect();
        let total = matching.len() as i64;
        matching.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then(b.sequence.cmp(&a.sequence))
        });
        let events = matching
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect();
        Ok((events, total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AuditAction, Role, Visibility};
    use chrono::Duration;

    fn token(now: DateTime<Utc>) -> TokenRecord {
        TokenRecord::new(
            "abc".into(),
            None,
            TokenKind::Invite,
            now,
            now + Duration::hours(1),
        )
    }

    #[tokio::test]
    async fn test_consume_is_single_shot() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.insert_token(&token(now)).await.unwrap();

        assert!(store.consume_token("abc", now).await.unwrap());
        assert!(!store.consume_token("abc", now).await.unwrap());
        let stored = store.token_snapshot("abc").unwrap();
        assert!(stored.used);
        assert_eq!(stored.used_at, Some(now));
    }

    #[tokio::test]
    async fn test_consume_refuses_expired_without_mutation() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.insert_token(&token(now)).await.unwrap();

        assert!(!store
            .consume_token("abc", now + Duration::hours(2))
            .await
            .unwrap());
        assert!(!store.token_snapshot("abc").unwrap().used);
    }

    #[tokio::test]
    async fn test_duplicate_token_hash_conflicts() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.insert_token(&token(now)).await.unwrap();
        assert!(matches!(
            store.insert_token(&token(now)).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_email_uniqueness_is_case_insensitive() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let first = Principal::invited(
            "Sam@Example.com".into(),
            "Sam".into(),
            "Lee".into(),
            Role::Agent,
            None,
            now,
        );
        store.insert_principal(&first).await.unwrap();

        let mut second = first.clone();
        second.id = Uuid::new_v4();
        second.email = "sam@example.com".into();
        assert!(matches!(
            store.insert_principal(&second).await,
            Err(StoreError::Conflict(_))
        ));
        assert_eq!(
            store
                .find_principal_by_email("SAM@EXAMPLE.COM")
                .await
                .unwrap()
                .map(|p| p.id),
            Some(first.id)
        );
    }

    #[tokio::test]
    async fn test_grant_upsert_replaces_flags() {
        let store = MemoryStore::new();
        let resource = ProtectedResource::new(Visibility::RoleBased, None);
        store.upsert_resource(&resource).await.unwrap();

        let grantee = Grantee::Role(Role::Agent);
        store
            .upsert_grant(&Grant::new(resource.id, grantee, true, false))
            .await
            .unwrap();
        store
            .upsert_grant(&Grant::new(resource.id, grantee, true, true))
            .await
            .unwrap();

        let loaded = store.find_resource(resource.id).await.unwrap().unwrap();
        assert_eq!(loaded.grants.len(), 1);
        assert!(loaded.grants[0].can_download);

        assert!(store.remove_grant(resource.id, &grantee).await.unwrap());
        assert!(!store.remove_grant(resource.id, &grantee).await.unwrap());
    }

    #[tokio::test]
    async fn test_unavailable_fails_every_call() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        let event = AuditEvent::new(Utc::now(), None, AuditAction::UserInvited, "principal", None);
        assert!(matches!(
            store.append_audit_event(&event).await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_unavailable(false);
        assert_eq!(store.append_audit_event(&event).await.unwrap(), 1);
    }
}
