//! Shared harness for provisioning-service integration tests.
//!
//! Everything runs against the in-memory store with a manual clock, so
//! expiry and rate-limit windows are driven explicitly.

#![allow(dead_code)]

pub mod scripted_store;

use chrono::{DateTime, TimeZone, Utc};
use provisioning_service::{
    config::{RateLimitConfig, TokenConfig},
    models::{InviteRequest, OnboardingState, Principal, Role},
    services::{MockNotifier, ProvisioningOrchestrator, RequestContext},
    store::{CredentialStore, MemoryStore, PrincipalStore},
    ManualClock,
};
use scripted_store::ScriptedStore;
use std::sync::Arc;

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub notifier: Arc<MockNotifier>,
    pub orchestrator: ProvisioningOrchestrator,
}

/// Fixed starting instant so assertions on timestamps are stable.
pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
}

pub fn harness() -> Harness {
    harness_with(RateLimitConfig::default())
}

pub fn harness_with(limits: RateLimitConfig) -> Harness {
    init_test_tracing();

    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(epoch()));
    let notifier = Arc::new(MockNotifier::new());
    let orchestrator = orchestrator_on(store.clone(), clock.clone(), notifier.clone(), &limits);

    Harness {
        store,
        clock,
        notifier,
        orchestrator,
    }
}

/// Orchestrator over any store, configured the way the harness configures it.
pub fn orchestrator_on<S>(
    store: Arc<S>,
    clock: Arc<ManualClock>,
    notifier: Arc<MockNotifier>,
    limits: &RateLimitConfig,
) -> ProvisioningOrchestrator
where
    S: CredentialStore + 'static,
{
    ProvisioningOrchestrator::new(store, clock, notifier)
        .with_token_config(TokenConfig {
            base_url: "https://app.example.com".to_string(),
            ..TokenConfig::default()
        })
        .with_rate_limit_config(limits)
}

/// Harness over a [`ScriptedStore`]; the orchestrator is shared so held
/// calls can run on spawned tasks.
pub struct ScriptedHarness {
    pub store: Arc<ScriptedStore>,
    pub clock: Arc<ManualClock>,
    pub notifier: Arc<MockNotifier>,
    pub orchestrator: Arc<ProvisioningOrchestrator>,
}

pub fn scripted_harness() -> ScriptedHarness {
    init_test_tracing();

    let store = Arc::new(ScriptedStore::new());
    let clock = Arc::new(ManualClock::new(epoch()));
    let notifier = Arc::new(MockNotifier::new());
    let orchestrator = Arc::new(orchestrator_on(
        store.clone(),
        clock.clone(),
        notifier.clone(),
        &RateLimitConfig::default(),
    ));

    ScriptedHarness {
        store,
        clock,
        notifier,
        orchestrator,
    }
}

pub fn init_test_tracing() {
    let _ = service_core::observability::try_init_tracing("provisioning-service-test", "debug");
}

/// Insert an active, fully onboarded principal.
pub async fn seed_principal(store: &MemoryStore, email: &str, role: Role) -> Principal {
    let mut principal = Principal::invited(
        email.to_string(),
        "Seed".to_string(),
        "User".to_string(),
        role,
        None,
        epoch(),
    );
    principal.onboarding = OnboardingState::Active;
    store
        .insert_principal(&principal)
        .await
        .expect("Failed to seed principal");
    principal
}

pub async fn seed_admin(store: &MemoryStore) -> Principal {
    seed_principal(store, "admin@example.com", Role::Admin).await
}

pub fn invite_request(email: &str) -> InviteRequest {
    InviteRequest {
        first_name: "Jordan".to_string(),
        last_name: "Reyes".to_string(),
        email: email.to_string(),
        role: Role::Agent,
        team: Some("north".to_string()),
    }
}

pub fn ctx(caller: &str) -> RequestContext {
    RequestContext::new(caller).with_source("203.0.113.7")
}
