//! Issue and redeem single-use, time-bounded tokens.
//!
//! Callers only ever hold the plain token value; the ledger hashes it before
//! every store access. Redemption checks the record first so that failures
//! carry a precise reason, then commits through the store's conditional
//! update, which is the only step that decides who wins a race.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

use super::error::ProvisioningError;
use crate::clock::Clock;
use crate::models::{IssuedToken, RedeemedToken, TokenKind, TokenRecord};
use crate::store::TokenStore;
use crate::utils::{generate_token, hash_token};

#[derive(Clone)]
pub struct TokenLedger {
    store: Arc<dyn TokenStore>,
    clock: Arc<dyn Clock>,
}

impl TokenLedger {
    pub fn new(store: Arc<dyn TokenStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn issue(
        &self,
        kind: TokenKind,
        subject_id: Option<Uuid>,
        ttl: Duration,
    ) -> Result<IssuedToken, ProvisioningError> {
        let now = self.clock.now();
        let value = generate_token();
        let record = TokenRecord::new(hash_token(&value), subject_id, kind, now, now + ttl);

        // The only reference a token row holds is its subject.
        self.store
            .insert_token(&record)
            .await
            .map_err(|e| ProvisioningError::from_store_missing(e, ProvisioningError::PrincipalNotFound))?;

        tracing::debug!(
            kind = kind.as_str(),
            subject_id = ?subject_id,
            expires_at = %record.expires_at,
            "Token issued"
        );

        Ok(IssuedToken { value, record })
    }

    /// Read-only view of a token, without touching its state.
    pub async fn lookup(&self, token_value: &str) -> Result<TokenRecord, ProvisioningError> {
        self.store
            .find_token(&hash_token(token_value))
            .await?
            .ok_or(ProvisioningError::TokenNotFound)
    }

    pub async fn redeem(
        &self,
        token_value: &str,
        now: DateTime<Utc>,
    ) -> Result<RedeemedToken, ProvisioningError> {
        self.redeem_checked(token_value, None, now).await
    }

    /// Redeem only if the token is of `expected` kind. A token of any other
    /// kind is reported as not found and left untouched.
    pub async fn redeem_as(
        &self,
        token_value: &str,
        expected: TokenKind,
        now: DateTime<Utc>,
    ) -> Result<RedeemedToken, ProvisioningError> {
        self.redeem_checked(token_value, Some(expected), now).await
    }

    async fn redeem_checked(
        &self,
        token_value: &str,
        expected: Option<TokenKind>,
        now: DateTime<Utc>,
    ) -> Result<RedeemedToken, ProvisioningError> {
        let token_hash = hash_token(token_value);
        let record = self
            .store
            .find_token(&token_hash)
            .await?
            .ok_or(ProvisioningError::TokenNotFound)?;

        if let Some(kind) = expected {
            if record.kind != kind {
                return Err(ProvisioningError::TokenNotFound);
            }
        }

        ensure_redeemable(&record, now)?;

        // Run the commit on its own task so a dropped caller cannot abandon
        // the conditional update halfway through.
        let store = self.store.clone();
        let hash = token_hash.clone();
        let won = tokio::spawn(async move { store.consume_token(&hash, now).await })
            .await
            .map_err(|e| ProvisioningError::StoreUnavailable(format!("redeem task failed: {}", e)))??;

        if won {
            tracing::info!(kind = record.kind.as_str(), subject_id = ?record.subject_id, "Token redeemed");
            return Ok(RedeemedToken {
                subject_id: record.subject_id,
                kind: record.kind,
                used_at: now,
            });
        }

        // Lost the race: someone else flipped `used` between our read and the update.
        let current = self.store.find_token(&token_hash).await?;
        Err(match current {
            Some(r) if r.revoked => ProvisioningError::TokenRevoked,
            _ => ProvisioningError::TokenAlreadyUsed,
        })
    }

    /// Revoke a token early. Unknown, used and already revoked tokens are a
    /// no-op success.
    pub async fn invalidate(&self, token_value: &str) -> Result<(), ProvisioningError> {
        let revoked = self
            .store
            .revoke_token(&hash_token(token_value), self.clock.now())
            .await?;
        if revoked {
            tracing::info!("Token revoked");
        }
        Ok(())
    }

    /// Revoke every live token of `kind` held by `subject_id`. Returns how
    /// many were revoked by this call.
    pub async fn invalidate_live_for_subject(
        &self,
        subject_id: Uuid,
        kind: TokenKind,
    ) -> Result<usize, ProvisioningError> {
        let now = self.clock.now();
        let hashes = self
            .store
            .live_tokens_for_subject(subject_id, kind, now)
            .await?;

        let mut revoked = 0;
        for hash in hashes {
            if self.store.revoke_token(&hash, now).await? {
                revoked += 1;
            }
        }

        if revoked > 0 {
            tracing::info!(%subject_id, kind = kind.as_str(), revoked, "Revoked live tokens");
        }
        Ok(revoked)
    }
}

/// Expiry first, then prior use. Does not consult the store.
pub fn ensure_redeemable(record: &TokenRecord, now: DateTime<Utc>) -> Result<(), ProvisioningError> {
    if record.is_expired_at(now) {
        return Err(ProvisioningError::TokenExpired);
    }
    if record.used {
        return Err(used_reason(record));
    }
    Ok(())
}

fn used_reason(record: &TokenRecord) -> ProvisioningError {
    if record.revoked {
        ProvisioningError::TokenRevoked
    } else {
        ProvisioningError::TokenAlreadyUsed
    }
}
