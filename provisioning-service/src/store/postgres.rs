//! PostgreSQL store.
//!
//! Conditional updates carry their precondition in the `WHERE` clause and
//! report success through `rows_affected()`, so concurrent callers across
//! process instances still see exactly one winner.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPool, FromRow};
use uuid::Uuid;

use super::{
    AuditStore, PrincipalStore, ResourceStore, StoreError, StoreResult, TokenStore,
};
use crate::models::{
    AuditAction, AuditEvent, AuditQuery, Grant, Grantee, OnboardingState, Principal,
    ProtectedResource, Role, TokenKind, TokenRecord, Visibility,
};

/// PostgreSQL-backed credential store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn map_err(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() {
            return StoreError::Conflict(db_err.constraint().unwrap_or("unique").to_string());
        }
        if db_err.is_foreign_key_violation() {
            return StoreError::NotFound(
                db_err.constraint().unwrap_or("foreign key").to_string(),
            );
        }
    }
    StoreError::Database(err)
}

// ==================== Row types ====================

#[derive(FromRow)]
struct TokenRow {
    token_hash: String,
    subject_id: Option<Uuid>,
    kind_code: String,
    issued_utc: DateTime<Utc>,
    expiry_utc: DateTime<Utc>,
    used_flag: bool,
    used_utc: Option<DateTime<Utc>>,
    revoked_flag: bool,
}

impl TryFrom<TokenRow> for TokenRecord {
    type Error = StoreError;

    fn try_from(row: TokenRow) -> Result<Self, Self::Error> {
        let kind = TokenKind::parse(&row.kind_code)
            .ok_or_else(|| StoreError::Corrupt(format!("token kind '{}'", row.kind_code)))?;
        Ok(TokenRecord {
            token_hash: row.token_hash,
            subject_id: row.subject_id,
            kind,
            issued_at: row.issued_utc,
            expires_at: row.expiry_utc,
            used: row.used_flag,
            used_at: row.used_utc,
            revoked: row.revoked_flag,
        })
    }
}

#[derive(FromRow)]
struct PrincipalRow {
    principal_id: Uuid,
    email: String,
    first_name: String,
    last_name: String,
    role_code: String,
    team_label: Option<String>,
    active_flag: bool,
    onboarding_state_code: String,
    credential_hash: Option<String>,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
}

impl TryFrom<PrincipalRow> for Principal {
    type Error = StoreError;

    fn try_from(row: PrincipalRow) -> Result<Self, Self::Error> {
        let role = Role::parse(&row.role_code)
            .ok_or_else(|| StoreError::Corrupt(format!("role '{}'", row.role_code)))?;
        let onboarding = OnboardingState::parse(&row.onboarding_state_code).ok_or_else(|| {
            StoreError::Corrupt(format!("onboarding state '{}'", row.onboarding_state_code))
        })?;
        Ok(Principal {
            id: row.principal_id,
            email: row.email,
            first_name: row.first_name,
            last_name: row.last_name,
            role,
            team: row.team_label,
            active: row.active_flag,
            onboarding,
            credential_hash: row.credential_hash,
            created_at: row.created_utc,
            updated_at: row.updated_utc,
        })
    }
}

#[derive(FromRow)]
struct ResourceRow {
    resource_id: Uuid,
    visibility_code: String,
    owner_id: Option<Uuid>,
}

#[derive(FromRow)]
struct GrantRow {
    resource_id: Uuid,
    grantee_kind: String,
    grantee_value: String,
    can_view: bool,
    can_download: bool,
}

impl TryFrom<GrantRow> for Grant {
    type Error = StoreError;

    fn try_from(row: GrantRow) -> Result<Self, Self::Error> {
        let grantee = Grantee::from_codes(&row.grantee_kind, &row.grantee_value).ok_or_else(
            || {
                StoreError::Corrupt(format!(
                    "grantee '{}:{}'",
                    row.grantee_kind, row.grantee_value
                ))
            },
        )?;
        Ok(Grant {
            resource_id: row.resource_id,
            grantee,
            can_view: row.can_view,
            can_download: row.can_download,
        })
    }
}

#[derive(FromRow)]
struct AuditRow {
    sequence: i64,
    event_id: Uuid,
    created_utc: DateTime<Utc>,
    actor_id: Option<Uuid>,
    action_code: String,
    entity_type: String,
    entity_id: Option<String>,
    details: serde_json::Value,
    source_address: Option<String>,
}

impl TryFrom<AuditRow> for AuditEvent {
    type Error = StoreError;

    fn try_from(row: AuditRow) -> Result<Self, Self::Error> {
        let action = AuditAction::parse(&row.action_code)
            .ok_or_else(|| StoreError::Corrupt(format!("audit action '{}'", row.action_code)))?;
        Ok(AuditEvent {
            event_id: row.event_id,
            sequence: row.sequence,
            timestamp: row.created_utc,
            actor_id: row.actor_id,
            action,
            entity_type: row.entity_type,
            entity_id: row.entity_id,
            details: row.details,
            source_address: row.source_address,
        })
    }
}

// ==================== Token Operations ====================

#[async_trait]
impl TokenStore for PgStore {
    async fn insert_token(&self, token: &TokenRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO tokens (token_hash, subject_id, kind_code, issued_utc, expiry_utc, used_flag, used_utc, revoked_flag)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&token.token_hash)
        .bind(token.subject_id)
        .bind(token.kind.as_str())
        .bind(token.issued_at)
        .bind(token.expires_at)
        .bind(token.used)
        .bind(token.used_at)
        .bind(token.revoked)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn find_token(&self, token_hash: &str) -> StoreResult<Option<TokenRecord>> {
        sqlx::query_as::<_, TokenRow>("SELECT * FROM tokens WHERE token_hash = $1")
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?
            .map(TokenRecord::try_from)
            .transpose()
    }

    async fn consume_token(&self, token_hash: &str, now: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tokens SET used_flag = TRUE, used_utc = $2
            WHERE token_hash = $1 AND used_flag = FALSE AND expiry_utc > $2
            "#,
        )
        .bind(token_hash)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn revoke_token(&self, token_hash: &str, now: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tokens SET used_flag = TRUE, used_utc = $2, revoked_flag = TRUE
            WHERE token_hash = $1 AND used_flag = FALSE
            "#,
        )
        .bind(token_hash)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn live_tokens_for_subject(
        &self,
        subject_id: Uuid,
        kind: TokenKind,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT token_hash FROM tokens
            WHERE subject_id = $1 AND kind_code = $2 AND used_flag = FALSE AND expiry_utc > $3
            "#,
        )
        .bind(subject_id)
        .bind(kind.as_str())
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(rows.into_iter().map(|(hash,)| hash).collect())
    }
}

// ==================== Principal Operations ====================

#[async_trait]
impl PrincipalStore for PgStore {
    async fn insert_principal(&self, principal: &Principal) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO principals (principal_id, email, first_name, last_name, role_code, team_label, active_flag, onboarding_state_code, credential_hash, created_utc, updated_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(principal.id)
        .bind(&principal.email)
        .bind(&principal.first_name)
        .bind(&principal.last_name)
        .bind(principal.role.as_str())
        .bind(&principal.team)
        .bind(principal.active)
        .bind(principal.onboarding.as_str())
        .bind(&principal.credential_hash)
        .bind(principal.created_at)
        .bind(principal.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn find_principal(&self, id: Uuid) -> StoreResult<Option<Principal>> {
        sqlx::query_as::<_, PrincipalRow>("SELECT * FROM principals WHERE principal_id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?
            .map(Principal::try_from)
            .transpose()
    }

    async fn find_principal_by_email(&self, email: &str) -> StoreResult<Option<Principal>> {
        sqlx::query_as::<_, PrincipalRow>(
            "SELECT * FROM principals WHERE LOWER(email) = LOWER($1)",
        )
        .bind(email.trim())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_err)?
        .map(Principal::try_from)
        .transpose()
    }

    async fn set_credential_hash(
        &self,
        id: Uuid,
        credential_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Principal>> {
        sqlx::query_as::<_, PrincipalRow>(
            r#"
            UPDATE principals SET credential_hash = $2, updated_utc = $3
            WHERE principal_id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(credential_hash)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_err)?
        .map(Principal::try_from)
        .transpose()
    }

    async fn set_active(
        &self,
        id: Uuid,
        active: bool,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Principal>> {
        sqlx::query_as::<_, PrincipalRow>(
            r#"
            UPDATE principals SET active_flag = $2, updated_utc = $3
            WHERE principal_id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(active)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_err)?
        .map(Principal::try_from)
        .transpose()
    }

    async fn set_role(
        &self,
        id: Uuid,
        role: Role,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Principal>> {
        sqlx::query_as::<_, PrincipalRow>(
            r#"
            UPDATE principals
            SET role_code = $2,
                team_label = CASE WHEN $2 = 'agent' THEN team_label ELSE NULL END,
                updated_utc = $3
            WHERE principal_id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(role.as_str())
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_err)?
        .map(Principal::try_from)
        .transpose()
    }

    async fn set_team(
        &self,
        id: Uuid,
        team: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Principal>> {
        sqlx::query_as::<_, PrincipalRow>(
            r#"
            UPDATE principals SET team_label = $2, updated_utc = $3
            WHERE principal_id = $1 AND ($2::TEXT IS NULL OR role_code = 'agent')
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(team)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_err)?
        .map(Principal::try_from)
        .transpose()
    }

    async fn transition_onboarding(
        &self,
        id: Uuid,
        from: OnboardingState,
        to: OnboardingState,
        credential_hash: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE principals
            SET onboarding_state_code = $3, credential_hash = COALESCE($4, credential_hash), updated_utc = $5
            WHERE principal_id = $1 AND onboarding_state_code = $2
            "#,
        )
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(credential_hash)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(result.rows_affected() == 1)
    }
}

// ==================== Resource & Grant Operations ====================

#[async_trait]
impl ResourceStore for PgStore {
    async fn upsert_resource(&self, resource: &ProtectedResource) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO protected_resources (resource_id, visibility_code, owner_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (resource_id)
            DO UPDATE SET visibility_code = EXCLUDED.visibility_code, owner_id = EXCLUDED.owner_id
            "#,
        )
        .bind(resource.id)
        .bind(resource.visibility.as_str())
        .bind(resource.owner_id)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn find_resource(&self, id: Uuid) -> StoreResult<Option<ProtectedResource>> {
        let Some(row) = sqlx::query_as::<_, ResourceRow>(
            "SELECT resource_id, visibility_code, owner_id FROM protected_resources WHERE resource_id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_err)?
        else {
            return Ok(None);
        };

        let visibility = Visibility::parse(&row.visibility_code).ok_or_else(|| {
            StoreError::Corrupt(format!("visibility '{}'", row.visibility_code))
        })?;

        let grants = sqlx::query_as::<_, GrantRow>(
            "SELECT * FROM resource_grants WHERE resource_id = $1",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?
        .into_iter()
        .map(Grant::try_from)
        .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(ProtectedResource {
            id: row.resource_id,
            visibility,
            owner_id: row.owner_id,
            grants,
        }))
    }

    async fn upsert_grant(&self, grant: &Grant) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO resource_grants (resource_id, grantee_kind, grantee_value, can_view, can_download)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (resource_id, grantee_kind, grantee_value)
            DO UPDATE SET can_view = EXCLUDED.can_view, can_download = EXCLUDED.can_download
            "#,
        )
        .bind(grant.resource_id)
        .bind(grant.grantee.kind_code())
        .bind(grant.grantee.value_code())
        .bind(grant.can_view)
        .bind(grant.can_download)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn remove_grant(&self, resource_id: Uuid, grantee: &Grantee) -> StoreResult<bool> {
        let result = sqlx::query(
            "DELETE FROM resource_grants WHERE resource_id = $1 AND grantee_kind = $2 AND grantee_value = $3",
        )
        .bind(resource_id)
        .bind(grantee.kind_code())
        .bind(grantee.value_code())
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(result.rows_affected() > 0)
    }
}

// ==================== Audit Event Operations ====================

#[async_trait]
impl AuditStore for PgStore {
    async fn append_audit_event(&self, event: &AuditEvent) -> StoreResult<i64> {
        let (sequence,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO audit_events (event_id, created_utc, actor_id, action_code, entity_type, entity_id, details, source_address)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING sequence
            "#,
        )
        .bind(event.event_id)
        .bind(event.timestamp)
        .bind(event.actor_id)
        .bind(event.action.as_str())
        .bind(&event.entity_type)
        .bind(&event.entity_id)
        .bind(&event.details)
        .bind(&event.source_address)
        .fetch_one(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(sequence)
    }

    async fn query_audit_events(
        &self,
        query: &AuditQuery,
        limit: i64,
        offset: i64,
    ) -> StoreResult<(Vec<AuditEvent>, i64)> {
        // Build dynamic WHERE clause
        let mut conditions = vec!["TRUE".to_string()];
        let mut param_idx = 1;

        if query.actor_id.is_some() {
            conditions.push(format!("actor_id = ${}", param_idx));
            param_idx += 1;
        }
        if query.action.is_some() {
            conditions.push(format!("action_code = ${}", param_idx));
            param_idx += 1;
        }
        if query.entity_type.is_some() {
            conditions.push(format!("entity_type = ${}", param_idx));
            param_idx += 1;
        }

        let where_clause = conditions.join(" AND ");
        let count_query = format!("SELECT COUNT(*) FROM audit_events WHERE {}", where_clause);
        let data_query = format!(
            "SELECT * FROM audit_events WHERE {} ORDER BY created_utc DESC, sequence DESC LIMIT ${} OFFSET ${}",
            where_clause,
            param_idx,
            param_idx + 1
        );

        let mut count_q = sqlx::query_as::<_, (i64,)>(&count_query);
        let mut data_q = sqlx::query_as::<_, AuditRow>(&data_query);
        if let Some(actor_id) = query.actor_id {
            count_q = count_q.bind(actor_id);
            data_q = data_q.bind(actor_id);
        }
        if let Some(action) = query.action {
            count_q = count_q.bind(action.as_str());
            data_q = data_q.bind(action.as_str());
        }
        if let Some(entity_type) = &query.entity_type {
            count_q = count_q.bind(entity_type.clone());
            data_q = data_q.bind(entity_type.clone());
        }
        data_q = data_q.bind(limit).bind(offset);

        let (total,) = count_q.fetch_one(&self.pool).await.map_err(map_err)?;
        let events = data_q
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?
            .into_iter()
            .map(AuditEvent::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        Ok((events, total))
    }
}
