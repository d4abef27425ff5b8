//! End-to-end invite, redeem and authorize flows.
//!
//! Every operation follows the same shape: consult the rate limiter first and
//! fail fast, perform the token or access work, then write the audit trail.
//! Audit failures are logged and never change the outcome.

use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;
use validator::Validate;

use super::access::{AccessDecision, AccessEvaluator};
use super::audit::AuditLog;
use super::error::ProvisioningError;
use super::identity::{IdentityProvider, ProvisioningMode};
use super::notifier::Notifier;
use super::rate_limit::{RateLimitDecision, RateLimitProfile, RateLimiterRegistry};
use super::token_ledger::{ensure_redeemable, TokenLedger};
use crate::clock::Clock;
use crate::config::{IdentityProviderMode, ProvisioningConfig, RateLimitConfig, TokenConfig};
use crate::models::{
    entity, Action, AuditAction, AuditEvent, AuditPage, AuditQuery, Grant, Grantee,
    InviteRequest, IssuedToken, OnboardingState, Principal, ProtectedResource, Role, TokenKind,
    Visibility,
};
use crate::store::{CredentialStore, PrincipalStore, ResourceStore};
use crate::utils::{generate_temp_credential, hash_password, validate_password, Password};

/// Who is calling and from where. `caller_key` keys the rate limiter.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub caller_key: String,
    pub source_address: Option<String>,
}

impl RequestContext {
    pub fn new(caller_key: impl Into<String>) -> Self {
        Self {
            caller_key: caller_key.into(),
            source_address: None,
        }
    }

    pub fn from_address(address: impl Into<String>) -> Self {
        let address = address.into();
        Self {
            caller_key: format!("ip:{}", address),
            source_address: Some(address),
        }
    }

    pub fn with_source(mut self, source_address: impl Into<String>) -> Self {
        self.source_address = Some(source_address.into());
        self
    }
}

/// Result of a successful invitation. Holds the only copies of the token
/// value and the temporary credential.
pub struct InviteOutcome {
    pub principal: Principal,
    pub token: IssuedToken,
    pub invite_link: String,
    pub temp_credential: Password,
    pub provisioning_mode: ProvisioningMode,
}

/// Result of re-sending an invitation to a principal still in `Invited`.
pub struct ReinviteOutcome {
    pub principal: Principal,
    pub token: IssuedToken,
    pub invite_link: String,
    pub temp_credential: Password,
    pub revoked_tokens: usize,
}

pub struct ProvisioningOrchestrator {
    principals: Arc<dyn PrincipalStore>,
    resources: Arc<dyn ResourceStore>,
    ledger: TokenLedger,
    audit: AuditLog,
    limiters: RateLimiterRegistry,
    sweep_interval: std::time::Duration,
    notifier: Arc<dyn Notifier>,
    identity_mode: IdentityProviderMode,
    identity_provider: Option<Arc<dyn IdentityProvider>>,
    tokens: TokenConfig,
    clock: Arc<dyn Clock>,
}

impl ProvisioningOrchestrator {
    pub fn new<S>(store: Arc<S>, clock: Arc<dyn Clock>, notifier: Arc<dyn Notifier>) -> Self
    where
        S: CredentialStore + 'static,
    {
        Self {
            principals: store.clone(),
            resources: store.clone(),
            ledger: TokenLedger::new(store.clone(), clock.clone()),
            audit: AuditLog::new(store),
            limiters: RateLimiterRegistry::default(),
            sweep_interval: RateLimitConfig::default().sweep_interval(),
            notifier,
            identity_mode: IdentityProviderMode::Local,
            identity_provider: None,
            tokens: TokenConfig::default(),
            clock,
        }
    }

    pub fn from_config<S>(
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
        config: &ProvisioningConfig,
    ) -> Self
    where
        S: CredentialStore + 'static,
    {
        let mut orchestrator = Self::new(store, clock, notifier)
            .with_token_config(config.tokens.clone())
            .with_rate_limit_config(&config.rate_limit);
        orchestrator.identity_mode = config.identity_provider;
        orchestrator
    }

    pub fn with_token_config(mut self, tokens: TokenConfig) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn with_rate_limits(mut self, limiters: RateLimiterRegistry) -> Self {
        self.limiters = limiters;
        self
    }

    /// Build the limiters from `config` and keep its sweep period for
    /// [`Self::spawn_rate_limit_sweepers`].
    pub fn with_rate_limit_config(mut self, config: &RateLimitConfig) -> Self {
        self.limiters = RateLimiterRegistry::from_config(config);
        self.sweep_interval = config.sweep_interval();
        self
    }

    /// Provision invited principals through `provider`. Passing `None` keeps
    /// external mode selected with nothing to call, which falls back to local.
    pub fn with_identity_provider(
        mut self,
        mode: IdentityProviderMode,
        provider: Option<Arc<dyn IdentityProvider>>,
    ) -> Self {
        self.identity_mode = mode;
        self.identity_provider = provider;
        self
    }

    pub fn ledger(&self) -> &TokenLedger {
        &self.ledger
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    pub fn rate_limiters(&self) -> &RateLimiterRegistry {
        &self.limiters
    }

    /// Start one background sweeper per limiter profile. Call once at startup
    /// from inside the runtime; each task exits when its limiter is dropped.
    pub fn spawn_rate_limit_sweepers(&self) -> Vec<tokio::task::JoinHandle<()>> {
        tracing::info!(
            every_secs = self.sweep_interval.as_secs(),
            "Starting rate limit sweepers"
        );
        self.limiters
            .spawn_sweepers(self.sweep_interval, self.clock.clone())
    }

    // ==================== Rate limiting ====================

    /// Boundary check: counts the request against `profile` and reports the
    /// decision. The caller rejects the request when `allowed` is false.
    pub fn check_rate_limit(&self, caller_key: &str, profile: RateLimitProfile) -> RateLimitDecision {
        self.limiters.check(profile, caller_key, self.clock.now())
    }

    async fn enforce(
        &self,
        profile: RateLimitProfile,
        operation: &'static str,
        ctx: &RequestContext,
    ) -> Result<(), ProvisioningError> {
        let now = self.clock.now();
        let decision = self.limiters.check(profile, &ctx.caller_key, now);
        if decision.allowed {
            return Ok(());
        }

        tracing::warn!(
            caller = %ctx.caller_key,
            profile = profile.as_str(),
            operation,
            reset_at = %decision.reset_at,
            "Rate limit exceeded"
        );
        self.audit
            .record(
                self.event(None, AuditAction::RateLimitExceeded, entity::RATE_LIMIT, None, ctx)
                    .with_details(json!({
                        "caller_key": ctx.caller_key,
                        "profile": profile.as_str(),
                        "operation": operation,
                        "reset_at": decision.reset_at,
                    })),
            )
            .await;

        Err(ProvisioningError::RateLimitExceeded {
            remaining: decision.remaining,
            reset_at: decision.reset_at,
            retry_after_secs: decision.retry_after_secs(now),
        })
    }

    // ==================== Invitation ====================

    #[instrument(
        skip(self, admin, request, ctx),
        fields(
            method = "InviteUser",
            admin_id = %admin.id,
            caller = %ctx.caller_key,
            principal_id = tracing::field::Empty
        )
    )]
    pub async fn invite_user(
        &self,
        admin: &Principal,
        request: InviteRequest,
        ctx: &RequestContext,
    ) -> Result<InviteOutcome, ProvisioningError> {
        self.enforce(RateLimitProfile::Strict, "invite_user", ctx).await?;
        self.require_admin(admin, "invite_user", ctx).await?;
        request.validate()?;

        if self
            .principals
            .find_principal_by_email(&request.email)
            .await?
            .is_some()
        {
            return Err(ProvisioningError::EmailAlreadyExists);
        }

        let now = self.clock.now();
        let temp_credential = Password::new(generate_temp_credential());
        let mut principal = Principal::invited(
            request.email,
            request.first_name,
            request.last_name,
            request.role,
            request.team,
            now,
        );
        principal.credential_hash = Some(hash_credential(&temp_credential)?);
        self.principals.insert_principal(&principal).await?;
        tracing::Span::current().record("principal_id", tracing::field::display(principal.id));

        let provisioning_mode = self.provision_identity(&principal, &temp_credential).await;

        // The principal row already exists; a failed issue leaves it invited
        // with no live token, which reinvite_user recovers from.
        let token = match self
            .ledger
            .issue(TokenKind::Invite, Some(principal.id), self.tokens.invite_ttl())
            .await
        {
            Ok(token) => token,
            Err(e) => {
                tracing::error!(error = %e, principal_id = %principal.id, "Failed to issue invite token");
                self.audit
                    .record(
                        self.event(
                            Some(admin.id),
                            AuditAction::InviteFailed,
                            entity::PRINCIPAL,
                            Some(principal.id.to_string()),
                            ctx,
                        )
                        .with_details(json!({
                            "email": principal.email,
                            "reason": e.to_string(),
                        })),
                    )
                    .await;
                return Err(e);
            }
        };
        let invite_link = self.link("accept-invite", &token.value);

        let notified = match self
            .notifier
            .send_invite(&principal, &invite_link, temp_credential.expose())
            .await
        {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, principal_id = %principal.id, "Failed to deliver invitation");
                false
            }
        };

        self.audit
            .record(
                self.event(
                    Some(admin.id),
                    AuditAction::UserInvited,
                    entity::PRINCIPAL,
                    Some(principal.id.to_string()),
                    ctx,
                )
                .with_details(json!({
                    "email": principal.email,
                    "role": principal.role.as_str(),
                    "team": principal.team,
                    "provisioning_mode": provisioning_mode.as_str(),
                    "notified": notified,
                    "expires_at": token.record.expires_at,
                })),
            )
            .await;

        tracing::info!(
            principal_id = %principal.id,
            role = principal.role.as_str(),
            provisioning_mode = provisioning_mode.as_str(),
            "User invited"
        );

        Ok(InviteOutcome {
            principal,
            token,
            invite_link,
            temp_credential,
            provisioning_mode,
        })
    }

    /// Issue a fresh invitation to a principal that has not redeemed yet.
    /// Earlier invite tokens stop working.
    #[instrument(
        skip(self, admin, ctx),
        fields(method = "ReinviteUser", admin_id = %admin.id, caller = %ctx.caller_key)
    )]
    pub async fn reinvite_user(
        &self,
        admin: &Principal,
        principal_id: Uuid,
        ctx: &RequestContext,
    ) -> Result<ReinviteOutcome, ProvisioningError> {
        self.enforce(RateLimitProfile::Strict, "reinvite_user", ctx).await?;
        self.require_admin(admin, "reinvite_user", ctx).await?;

        let mut principal = self.load_principal(principal_id).await?;
        if principal.onboarding != OnboardingState::Invited {
            return Err(ProvisioningError::InvalidOnboardingState);
        }

        let revoked_tokens = self
            .ledger
            .invalidate_live_for_subject(principal.id, TokenKind::Invite)
            .await?;

        let temp_credential = Password::new(generate_temp_credential());
        let credential_hash = hash_credential(&temp_credential)?;
        let now = self.clock.now();
        // Conditional on still being invited, so a redeem that lands in
        // between keeps the credential it set.
        let applied = self
            .principals
            .transition_onboarding(
                principal.id,
                OnboardingState::Invited,
                OnboardingState::Invited,
                Some(&credential_hash),
                now,
            )
            .await?;
        if !applied {
            return Err(ProvisioningError::InvalidOnboardingState);
        }
        principal.credential_hash = Some(credential_hash);
        principal.updated_at = now;

        let token = self
            .ledger
            .issue(TokenKind::Invite, Some(principal.id), self.tokens.invite_ttl())
            .await?;
        let invite_link = self.link("accept-invite", &token.value);

        if let Err(e) = self
            .notifier
            .send_invite(&principal, &invite_link, temp_credential.expose())
            .await
        {
            tracing::warn!(error = %e, principal_id = %principal.id, "Failed to deliver invitation");
        }

        self.audit
            .record(
                self.event(
                    Some(admin.id),
                    AuditAction::UserReinvited,
                    entity::PRINCIPAL,
                    Some(principal.id.to_string()),
                    ctx,
                )
                .with_details(json!({ "revoked_tokens": revoked_tokens })),
            )
            .await;

        Ok(ReinviteOutcome {
            principal,
            token,
            invite_link,
            temp_credential,
            revoked_tokens,
        })
    }

    async fn provision_identity(
        &self,
        principal: &Principal,
        temp_credential: &Password,
    ) -> ProvisioningMode {
        if self.identity_mode == IdentityProviderMode::Local {
            return ProvisioningMode::Local;
        }

        let Some(provider) = &self.identity_provider else {
            tracing::warn!(
                principal_id = %principal.id,
                "External identity provider selected but none is configured; provisioned locally"
            );
            return ProvisioningMode::LocalFallback;
        };

        match provider.provision(principal, temp_credential).await {
            Ok(()) => ProvisioningMode::External,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    provider = provider.name(),
                    principal_id = %principal.id,
                    "External identity provider failed; provisioned locally"
                );
                ProvisioningMode::LocalFallback
            }
        }
    }

    // ==================== Redemption & onboarding ====================

    /// Redeem an invitation and set the principal's credential.
    #[instrument(skip_all, fields(method = "RedeemInvite", caller = %ctx.caller_key))]
    pub async fn redeem_invite(
        &self,
        token_value: &str,
        credential: Password,
        ctx: &RequestContext,
    ) -> Result<Principal, ProvisioningError> {
        self.enforce(RateLimitProfile::Moderate, "redeem_invite", ctx).await?;

        let result = self.redeem_invite_inner(token_value, &credential).await;
        match &result {
            Ok(principal) => {
                self.audit
                    .record(self.event(
                        Some(principal.id),
                        AuditAction::InviteRedeemed,
                        entity::PRINCIPAL,
                        Some(principal.id.to_string()),
                        ctx,
                    ))
                    .await;
            }
            Err(e) => {
                tracing::info!(reason = %e, "Invite redemption failed");
                self.audit
                    .record(
                        self.event(None, AuditAction::InviteRedeemFailed, entity::TOKEN, None, ctx)
                            .with_details(json!({ "reason": e.to_string() })),
                    )
                    .await;
            }
        }
        result
    }

    async fn redeem_invite_inner(
        &self,
        token_value: &str,
        credential: &Password,
    ) -> Result<Principal, ProvisioningError> {
        validate_password(credential).map_err(|e| ProvisioningError::Validation(e.to_string()))?;
        let now = self.clock.now();

        let mut principal = self.token_subject(token_value, TokenKind::Invite, now).await?;
        if principal.onboarding != OnboardingState::Invited {
            return Err(ProvisioningError::InvalidOnboardingState);
        }
        let credential_hash = hash_credential(credential)?;

        self.ledger
            .redeem_as(token_value, TokenKind::Invite, now)
            .await?;

        let moved = self
            .principals
            .transition_onboarding(
                principal.id,
                OnboardingState::Invited,
                OnboardingState::CredentialsSet,
                Some(&credential_hash),
                now,
            )
            .await?;
        if !moved {
            return Err(ProvisioningError::InvalidOnboardingState);
        }

        principal.onboarding = OnboardingState::CredentialsSet;
        principal.credential_hash = Some(credential_hash);
        principal.updated_at = now;
        Ok(principal)
    }

    /// Move a principal from `CredentialsSet` to `Active`. Already active
    /// principals are returned unchanged.
    #[instrument(skip(self, ctx), fields(method = "CompleteOnboarding", caller = %ctx.caller_key))]
    pub async fn complete_onboarding(
        &self,
        principal_id: Uuid,
        ctx: &RequestContext,
    ) -> Result<Principal, ProvisioningError> {
        self.enforce(RateLimitProfile::Moderate, "complete_onboarding", ctx).await?;
        self.activate_onboarding(principal_id, ctx).await
    }

    /// Issue a token the principal can later present to finish onboarding.
    pub async fn issue_onboarding_token(
        &self,
        principal_id: Uuid,
        ctx: &RequestContext,
    ) -> Result<IssuedToken, ProvisioningError> {
        self.enforce(RateLimitProfile::Moderate, "issue_onboarding_token", ctx).await?;
        let principal = self.load_principal(principal_id).await?;
        if principal.onboarding != OnboardingState::CredentialsSet {
            return Err(ProvisioningError::InvalidOnboardingState);
        }
        let token = self
            .ledger
            .issue(
                TokenKind::OnboardingComplete,
                Some(principal.id),
                self.tokens.invite_ttl(),
            )
            .await?;

        self.audit
            .record(
                self.event(
                    Some(principal.id),
                    AuditAction::OnboardingTokenIssued,
                    entity::PRINCIPAL,
                    Some(principal.id.to_string()),
                    ctx,
                )
                .with_details(json!({ "expires_at": token.record.expires_at })),
            )
            .await;
        Ok(token)
    }

    /// Finish onboarding by redeeming an onboarding-complete token.
    #[instrument(skip_all, fields(method = "CompleteOnboardingWithToken", caller = %ctx.caller_key))]
    pub async fn complete_onboarding_with_token(
        &self,
        token_value: &str,
        ctx: &RequestContext,
    ) -> Result<Principal, ProvisioningError> {
        self.enforce(RateLimitProfile::Moderate, "complete_onboarding", ctx).await?;

        let now = self.clock.now();
        let principal = self
            .token_subject(token_value, TokenKind::OnboardingComplete, now)
            .await?;
        if principal.onboarding == OnboardingState::Invited {
            return Err(ProvisioningError::InvalidOnboardingState);
        }
        self.ledger
            .redeem_as(token_value, TokenKind::OnboardingComplete, now)
            .await?;
        self.activate_onboarding(principal.id, ctx).await
    }

    async fn activate_onboarding(
        &self,
        principal_id: Uuid,
        ctx: &RequestContext,
    ) -> Result<Principal, ProvisioningError> {
        let mut principal = self.load_principal(principal_id).await?;
        match principal.onboarding {
            OnboardingState::Active => return Ok(principal),
            OnboardingState::Invited => return Err(ProvisioningError::InvalidOnboardingState),
            OnboardingState::CredentialsSet => {}
        }

        let now = self.clock.now();
        let moved = self
            .principals
            .transition_onboarding(
                principal.id,
                OnboardingState::CredentialsSet,
                OnboardingState::Active,
                None,
                now,
            )
            .await?;

        if !moved {
            // A concurrent completion got there first.
            let current = self.load_principal(principal_id).await?;
            return match current.onboarding {
                OnboardingState::Active => Ok(current),
                _ => Err(ProvisioningError::InvalidOnboardingState),
            };
        }

        principal.onboarding = OnboardingState::Active;
        principal.updated_at = now;

        self.audit
            .record(self.event(
                Some(principal.id),
                AuditAction::OnboardingCompleted,
                entity::PRINCIPAL,
                Some(principal.id.to_string()),
                ctx,
            ))
            .await;

        Ok(principal)
    }

    // ==================== Password reset ====================

    /// Always succeeds for unknown emails so callers cannot discover which
    /// addresses are registered.
    #[instrument(skip_all, fields(method = "RequestPasswordReset", caller = %ctx.caller_key))]
    pub async fn request_password_reset(
        &self,
        email: &str,
        ctx: &RequestContext,
    ) -> Result<(), ProvisioningError> {
        self.enforce(RateLimitProfile::Strict, "request_password_reset", ctx).await?;

        let principal = match self.principals.find_principal_by_email(email).await? {
            Some(p) if p.active && p.onboarding != OnboardingState::Invited => p,
            _ => {
                tracing::debug!("Password reset requested for unknown or ineligible account");
                self.audit
                    .record(
                        self.event(None, AuditAction::PasswordResetRequested, entity::PRINCIPAL, None, ctx)
                            .with_details(json!({ "matched": false })),
                    )
                    .await;
                return Ok(());
            }
        };

        self.ledger
            .invalidate_live_for_subject(principal.id, TokenKind::PasswordReset)
            .await?;
        let token = self
            .ledger
            .issue(
                TokenKind::PasswordReset,
                Some(principal.id),
                self.tokens.password_reset_ttl(),
            )
            .await?;
        let reset_link = self.link("reset-password", &token.value);

        if let Err(e) = self.notifier.send_password_reset(&principal, &reset_link).await {
            tracing::warn!(error = %e, principal_id = %principal.id, "Failed to deliver password reset");
        }

        self.audit
            .record(
                self.event(
                    Some(principal.id),
                    AuditAction::PasswordResetRequested,
                    entity::PRINCIPAL,
                    Some(principal.id.to_string()),
                    ctx,
                )
                .with_details(json!({ "matched": true, "expires_at": token.record.expires_at })),
            )
            .await;

        Ok(())
    }

    #[instrument(skip_all, fields(method = "ConfirmPasswordReset", caller = %ctx.caller_key))]
    pub async fn confirm_password_reset(
        &self,
        token_value: &str,
        credential: Password,
        ctx: &RequestContext,
    ) -> Result<Principal, ProvisioningError> {
        self.enforce(RateLimitProfile::Moderate, "confirm_password_reset", ctx).await?;

        let result = self.confirm_password_reset_inner(token_value, &credential).await;
        match &result {
            Ok(principal) => {
                self.audit
                    .record(self.event(
                        Some(principal.id),
                        AuditAction::PasswordResetCompleted,
                        entity::PRINCIPAL,
                        Some(principal.id.to_string()),
                        ctx,
                    ))
                    .await;
            }
            Err(e) => {
                self.audit
                    .record(
                        self.event(None, AuditAction::PasswordResetFailed, entity::TOKEN, None, ctx)
                            .with_details(json!({ "reason": e.to_string() })),
                    )
                    .await;
            }
        }
        result
    }

    async fn confirm_password_reset_inner(
        &self,
        token_value: &str,
        credential: &Password,
    ) -> Result<Principal, ProvisioningError> {
        validate_password(credential).map_err(|e| ProvisioningError::Validation(e.to_string()))?;
        let now = self.clock.now();

        let principal = self
            .token_subject(token_value, TokenKind::PasswordReset, now)
            .await?;
        if !principal.active {
            return Err(ProvisioningError::InactivePrincipal);
        }
        let credential_hash = hash_credential(credential)?;

        self.ledger
            .redeem_as(token_value, TokenKind::PasswordReset, now)
            .await?;

        self.principals
            .set_credential_hash(principal.id, &credential_hash, now)
            .await?
            .ok_or(ProvisioningError::PrincipalNotFound)
    }

    // ==================== Authorization ====================

    /// Evaluate and audit. Never fails: a deny is a normal decision.
    pub async fn authorize_and_audit(
        &self,
        principal: &Principal,
        resource: &ProtectedResource,
        action: Action,
        ctx: &RequestContext,
    ) -> AccessDecision {
        let decision = AccessEvaluator::evaluate(principal, resource, action);

        let (audit_action, reason) = match decision {
            AccessDecision::Allow => (AuditAction::AccessGranted, None),
            AccessDecision::Deny(reason) => (AuditAction::AccessDenied, Some(reason.as_str())),
        };
        self.audit
            .record(
                self.event(
                    Some(principal.id),
                    audit_action,
                    entity::RESOURCE,
                    Some(resource.id.to_string()),
                    ctx,
                )
                .with_details(json!({
                    "action": action.as_str(),
                    "visibility": resource.visibility.as_str(),
                    "reason": reason,
                })),
            )
            .await;

        decision
    }

    /// Load the resource with its grants, then evaluate and audit.
    #[instrument(
        skip(self, principal, ctx),
        fields(method = "Authorize", principal_id = %principal.id, caller = %ctx.caller_key)
    )]
    pub async fn authorize(
        &self,
        principal: &Principal,
        resource_id: Uuid,
        action: Action,
        ctx: &RequestContext,
    ) -> Result<AccessDecision, ProvisioningError> {
        self.enforce(RateLimitProfile::Lenient, "authorize", ctx).await?;
        let resource = self
            .resources
            .find_resource(resource_id)
            .await?
            .ok_or(ProvisioningError::ResourceNotFound)?;
        Ok(self.authorize_and_audit(principal, &resource, action, ctx).await)
    }

    // ==================== Admin mutations ====================

    pub async fn set_role(
        &self,
        admin: &Principal,
        principal_id: Uuid,
        role: Role,
        ctx: &RequestContext,
    ) -> Result<Principal, ProvisioningError> {
        self.enforce(RateLimitProfile::Lenient, "set_role", ctx).await?;
        self.require_admin(admin, "set_role", ctx).await?;

        let previous = self.load_principal(principal_id).await?.role;
        let principal = self
            .principals
            .set_role(principal_id, role, self.clock.now())
            .await?
            .ok_or(ProvisioningError::PrincipalNotFound)?;

        self.audit
            .record(
                self.event(
                    Some(admin.id),
                    AuditAction::RoleChanged,
                    entity::PRINCIPAL,
                    Some(principal.id.to_string()),
                    ctx,
                )
                .with_details(json!({ "from": previous.as_str(), "to": role.as_str() })),
            )
            .await;
        Ok(principal)
    }

    /// Teams only apply to agents; clearing a team is always allowed.
    pub async fn set_team(
        &self,
        admin: &Principal,
        principal_id: Uuid,
        team: Option<String>,
        ctx: &RequestContext,
    ) -> Result<Principal, ProvisioningError> {
        self.enforce(RateLimitProfile::Lenient, "set_team", ctx).await?;
        self.require_admin(admin, "set_team", ctx).await?;

        let current = self.load_principal(principal_id).await?;
        let team = team.map(|t| t.trim().to_string()).filter(|t| !t.is_empty());
        if team.is_some() && current.role != Role::Agent {
            return Err(team_requires_agent());
        }
        let Some(principal) = self
            .principals
            .set_team(principal_id, team.as_deref(), self.clock.now())
            .await?
        else {
            // The role changed away from agent after the load above.
            self.load_principal(principal_id).await?;
            return Err(team_requires_agent());
        };
        let previous = current.team;

        self.audit
            .record(
                self.event(
                    Some(admin.id),
                    AuditAction::TeamChanged,
                    entity::PRINCIPAL,
                    Some(principal.id.to_string()),
                    ctx,
                )
                .with_details(json!({ "from": previous, "to": principal.team })),
            )
            .await;
        Ok(principal)
    }

    /// Soft (de)activation. Deactivating also revokes outstanding invite and
    /// reset tokens.
    pub async fn set_active(
        &self,
        admin: &Principal,
        principal_id: Uuid,
        active: bool,
        ctx: &RequestContext,
    ) -> Result<Principal, ProvisioningError> {
        self.enforce(RateLimitProfile::Lenient, "set_active", ctx).await?;
        self.require_admin(admin, "set_active", ctx).await?;

        let principal = self
            .principals
            .set_active(principal_id, active, self.clock.now())
            .await?
            .ok_or(ProvisioningError::PrincipalNotFound)?;

        let mut revoked = 0;
        if !active {
            for kind in [TokenKind::Invite, TokenKind::PasswordReset, TokenKind::OnboardingComplete] {
                revoked += self
                    .ledger
                    .invalidate_live_for_subject(principal.id, kind)
                    .await?;
            }
        }

        let action = if active {
            AuditAction::PrincipalActivated
        } else {
            AuditAction::PrincipalDeactivated
        };
        self.audit
            .record(
                self.event(
                    Some(admin.id),
                    action,
                    entity::PRINCIPAL,
                    Some(principal.id.to_string()),
                    ctx,
                )
                .with_details(json!({ "revoked_tokens": revoked })),
            )
            .await;
        Ok(principal)
    }

    pub async fn register_resource(
        &self,
        admin: &Principal,
        visibility: Visibility,
        owner_id: Option<Uuid>,
        ctx: &RequestContext,
    ) -> Result<ProtectedResource, ProvisioningError> {
        self.enforce(RateLimitProfile::Lenient, "register_resource", ctx).await?;
        self.require_admin(admin, "register_resource", ctx).await?;

        let resource = ProtectedResource::new(visibility, owner_id);
        self.resources.upsert_resource(&resource).await?;

        self.audit
            .record(
                self.event(
                    Some(admin.id),
                    AuditAction::ResourceRegistered,
                    entity::RESOURCE,
                    Some(resource.id.to_string()),
                    ctx,
                )
                .with_details(json!({ "visibility": visibility.as_str(), "owner_id": owner_id })),
            )
            .await;
        Ok(resource)
    }

    pub async fn upsert_grant(
        &self,
        admin: &Principal,
        resource_id: Uuid,
        grantee: Grantee,
        can_view: bool,
        can_download: bool,
        ctx: &RequestContext,
    ) -> Result<Grant, ProvisioningError> {
        self.enforce(RateLimitProfile::Lenient, "upsert_grant", ctx).await?;
        self.require_admin(admin, "upsert_grant", ctx).await?;

        if self.resources.find_resource(resource_id).await?.is_none() {
            return Err(ProvisioningError::ResourceNotFound);
        }
        let grant = Grant::new(resource_id, grantee, can_view, can_download);
        // The resource can disappear between the check above and the write.
        self.resources
            .upsert_grant(&grant)
            .await
            .map_err(|e| ProvisioningError::from_store_missing(e, ProvisioningError::ResourceNotFound))?;

        self.audit
            .record(
                self.event(
                    Some(admin.id),
                    AuditAction::GrantUpserted,
                    entity::GRANT,
                    Some(resource_id.to_string()),
                    ctx,
                )
                .with_details(json!({
                    "grantee": grantee,
                    "can_view": can_view,
                    "can_download": can_download,
                })),
            )
            .await;
        Ok(grant)
    }

    /// Returns whether a grant existed.
    pub async fn remove_grant(
        &self,
        admin: &Principal,
        resource_id: Uuid,
        grantee: Grantee,
        ctx: &RequestContext,
    ) -> Result<bool, ProvisioningError> {
        self.enforce(RateLimitProfile::Lenient, "remove_grant", ctx).await?;
        self.require_admin(admin, "remove_grant", ctx).await?;

        let removed = self.resources.remove_grant(resource_id, &grantee).await?;
        if removed {
            self.audit
                .record(
                    self.event(
                        Some(admin.id),
                        AuditAction::GrantRemoved,
                        entity::GRANT,
                        Some(resource_id.to_string()),
                        ctx,
                    )
                    .with_details(json!({ "grantee": grantee })),
                )
                .await;
        }
        Ok(removed)
    }

    // ==================== Audit read path ====================

    pub async fn query_audit(
        &self,
        admin: &Principal,
        query: &AuditQuery,
        limit: i64,
        offset: i64,
        ctx: &RequestContext,
    ) -> Result<AuditPage, ProvisioningError> {
        self.enforce(RateLimitProfile::Lenient, "query_audit", ctx).await?;
        self.require_admin(admin, "query_audit", ctx).await?;
        self.audit.query(query, limit, offset).await
    }

    // ==================== Helpers ====================

    async fn require_admin(
        &self,
        actor: &Principal,
        operation: &'static str,
        ctx: &RequestContext,
    ) -> Result<(), ProvisioningError> {
        let refusal = if !actor.is_admin() {
            ProvisioningError::Unauthorized
        } else if !actor.active {
            ProvisioningError::InactivePrincipal
        } else {
            return Ok(());
        };

        tracing::warn!(actor_id = %actor.id, operation, "Unauthorized admin action attempted");
        self.audit
            .record(
                self.event(
                    Some(actor.id),
                    AuditAction::UnauthorizedAdminAction,
                    entity::PRINCIPAL,
                    Some(actor.id.to_string()),
                    ctx,
                )
                .with_details(json!({ "operation": operation, "role": actor.role.as_str() })),
            )
            .await;
        Err(refusal)
    }

    async fn load_principal(&self, id: Uuid) -> Result<Principal, ProvisioningError> {
        self.principals
            .find_principal(id)
            .await?
            .ok_or(ProvisioningError::PrincipalNotFound)
    }

    /// Resolve the principal a redeemable token is bound to without consuming
    /// it. Tokens of another kind, or bound to nobody, are not found.
    async fn token_subject(
        &self,
        token_value: &str,
        kind: TokenKind,
        now: DateTime<Utc>,
    ) -> Result<Principal, ProvisioningError> {
        let record = self.ledger.lookup(token_value).await?;
        if record.kind != kind {
            return Err(ProvisioningError::TokenNotFound);
        }
        ensure_redeemable(&record, now)?;
        let subject_id = record.subject_id.ok_or(ProvisioningError::TokenNotFound)?;
        self.load_principal(subject_id).await
    }

    fn link(&self, path: &str, token_value: &str) -> String {
        format!(
            "{}/{}?token={}",
            self.tokens.base_url.trim_end_matches('/'),
            path,
            token_value
        )
    }

    fn event(
        &self,
        actor_id: Option<Uuid>,
        action: AuditAction,
        entity_type: &str,
        entity_id: Option<String>,
        ctx: &RequestContext,
    ) -> AuditEvent {
        AuditEvent::new(self.clock.now(), actor_id, action, entity_type, entity_id)
            .with_source(ctx.source_address.clone())
    }
}

fn hash_credential(credential: &Password) -> Result<String, ProvisioningError> {
    hash_password(credential)
        .map(|h| h.into_string())
        .map_err(|e| ProvisioningError::Internal(e.to_string()))
}

fn team_requires_agent() -> ProvisioningError {
    ProvisioningError::Validation("team can only be assigned to agents".to_string())
}
