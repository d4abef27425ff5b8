//! Append-only audit trail.
//!
//! Writes are best effort: a failed append is reported on the tracing channel
//! and never fails the operation being audited. The read path does surface
//! store errors, since an admin asked for the data.

use std::sync::Arc;

use super::error::ProvisioningError;
use crate::models::{AuditEvent, AuditPage, AuditQuery};
use crate::store::AuditStore;

pub const DEFAULT_QUERY_LIMIT: i64 = 50;
pub const MAX_QUERY_LIMIT: i64 = 200;

#[derive(Clone)]
pub struct AuditLog {
    store: Arc<dyn AuditStore>,
}

impl AuditLog {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self { store }
    }

    /// Append and wait for the write. Returns the assigned sequence, or
    /// `None` when the append failed.
    pub async fn record(&self, event: AuditEvent) -> Option<i64> {
        match self.store.append_audit_event(&event).await {
            Ok(sequence) => {
                tracing::info!(
                    action = event.action.as_str(),
                    entity_type = %event.entity_type,
                    entity_id = ?event.entity_id,
                    actor_id = ?event.actor_id,
                    sequence,
                    "Audit event recorded"
                );
                Some(sequence)
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    action = event.action.as_str(),
                    entity_type = %event.entity_type,
                    entity_id = ?event.entity_id,
                    "Failed to write audit event"
                );
                None
            }
        }
    }

    /// Fire-and-forget append on the runtime.
    pub fn record_detached(&self, event: AuditEvent) {
        let log = self.clone();
        tokio::spawn(async move {
            log.record(event).await;
        });
    }

    /// Newest first. A `limit` of zero or less means the default page of 50,
    /// larger limits are capped at 200, and a negative offset reads from the
    /// start.
    pub async fn query(
        &self,
        query: &AuditQuery,
        limit: i64,
        offset: i64,
    ) -> Result<AuditPage, ProvisioningError> {
        let limit = if limit <= 0 {
            DEFAULT_QUERY_LIMIT
        } else {
            limit.min(MAX_QUERY_LIMIT)
        };
        let offset = offset.max(0);
        let (events, total) = self.store.query_audit_events(query, limit, offset).await?;
        Ok(AuditPage { events, total })
    }
}
