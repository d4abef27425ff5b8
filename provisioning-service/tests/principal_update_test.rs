mod common;

use common::{
    ctx, invite_request, scripted_harness, scripted_store::ScriptedStore, seed_admin,
    seed_principal,
};
use provisioning_service::{
    models::{AuditAction, AuditEvent, AuditQuery, Grantee, OnboardingState, Role, Visibility},
    services::{token_from_link, DeliveryKind, ProvisioningError},
    store::{AuditStore, PrincipalStore, StoreError},
    utils::Password,
};

fn password(value: &str) -> Password {
    Password::new(value.to_string())
}

async fn audit_events(store: &ScriptedStore, action: AuditAction) -> Vec<AuditEvent> {
    let query = AuditQuery {
        action: Some(action),
        ..AuditQuery::default()
    };
    store
        .memory()
        .query_audit_events(&query, 50, 0)
        .await
        .unwrap()
        .0
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reset_finishing_after_deactivation_keeps_principal_inactive() {
    let h = scripted_harness();
    let admin = seed_admin(h.store.memory()).await;
    let member = seed_principal(h.store.memory(), "member@example.com", Role::Recruiter).await;

    h.orchestrator
        .request_password_reset(&member.email, &ctx("member"))
        .await
        .unwrap();
    let link = h
        .notifier
        .last_link(DeliveryKind::PasswordReset, &member.email)
        .unwrap();
    let token = token_from_link(&link).unwrap().to_string();

    h.store.hold_next("set_credential_hash");
    let orchestrator = h.orchestrator.clone();
    let reset = tokio::spawn(async move {
        orchestrator
            .confirm_password_reset(&token, password("BrandNewPass1!"), &ctx("member"))
            .await
    });
    h.store.wait_until_held().await;

    let deactivated = h
        .orchestrator
        .set_active(&admin, member.id, false, &ctx("admin"))
        .await
        .unwrap();
    assert!(!deactivated.active);

    h.store.release();
    let after_reset = reset.await.unwrap().unwrap();
    assert!(!after_reset.active);

    let stored = h.store.memory().find_principal(member.id).await.unwrap().unwrap();
    assert!(!stored.active);
    assert_ne!(stored.credential_hash, member.credential_hash);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_role_change_finishing_after_redeem_keeps_onboarding_progress() {
    let h = scripted_harness();
    let admin = seed_admin(h.store.memory()).await;
    let invite = h
        .orchestrator
        .invite_user(&admin, invite_request("new.agent@example.com"), &ctx("admin"))
        .await
        .unwrap();
    let principal_id = invite.principal.id;

    h.store.hold_next("set_role");
    let orchestrator = h.orchestrator.clone();
    let admin_copy = admin.clone();
    let role_change = tokio::spawn(async move {
        orchestrator
            .set_role(&admin_copy, principal_id, Role::Recruiter, &ctx("admin"))
            .await
    });
    h.store.wait_until_held().await;

    let redeemed = h
        .orchestrator
        .redeem_invite(&invite.token.value, password("Str0ngPassw0rd!"), &ctx("visitor"))
        .await
        .unwrap();
    assert_eq!(redeemed.onboarding, OnboardingState::CredentialsSet);

    h.store.release();
    let changed = role_change.await.unwrap().unwrap();
    assert_eq!(changed.role, Role::Recruiter);
    assert_eq!(changed.onboarding, OnboardingState::CredentialsSet);

    let stored = h.store.memory().find_principal(principal_id).await.unwrap().unwrap();
    assert_eq!(stored.role, Role::Recruiter);
    assert_eq!(stored.team, None);
    assert_eq!(stored.onboarding, OnboardingState::CredentialsSet);
    assert_eq!(stored.credential_hash, redeemed.credential_hash);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_team_assignment_refused_when_role_changes_underneath() {
    let h = scripted_harness();
    let admin = seed_admin(h.store.memory()).await;
    let agent = seed_principal(h.store.memory(), "agent@example.com", Role::Agent).await;

    h.store.hold_next("set_team");
    let orchestrator = h.orchestrator.clone();
    let admin_copy = admin.clone();
    let team_change = tokio::spawn(async move {
        orchestrator
            .set_team(&admin_copy, agent.id, Some("east".to_string()), &ctx("admin"))
            .await
    });
    h.store.wait_until_held().await;

    h.orchestrator
        .set_role(&admin, agent.id, Role::Recruiter, &ctx("admin"))
        .await
        .unwrap();

    h.store.release();
    let err = team_change.await.unwrap().unwrap_err();
    assert!(matches!(err, ProvisioningError::Validation(_)));

    let stored = h.store.memory().find_principal(agent.id).await.unwrap().unwrap();
    assert_eq!(stored.role, Role::Recruiter);
    assert_eq!(stored.team, None);
}

#[tokio::test]
async fn test_failed_invite_issue_is_audited_and_reinvite_recovers() {
    let h = scripted_harness();
    let admin = seed_admin(h.store.memory()).await;

    h.store
        .fail_next("insert_token", || StoreError::Unavailable("token table offline".into()));
    let err = h
        .orchestrator
        .invite_user(&admin, invite_request("stranded@example.com"), &ctx("admin"))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, ProvisioningError::StoreUnavailable(_)));
    assert!(h.notifier.sent().is_empty());

    let failures = audit_events(&h.store, AuditAction::InviteFailed).await;
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].actor_id, Some(admin.id));
    assert_eq!(failures[0].details["email"], "stranded@example.com");
    assert!(audit_events(&h.store, AuditAction::UserInvited).await.is_empty());

    let stranded = h
        .store
        .memory()
        .find_principal_by_email("stranded@example.com")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stranded.onboarding, OnboardingState::Invited);

    let reinvite = h
        .orchestrator
        .reinvite_user(&admin, stranded.id, &ctx("admin"))
        .await
        .unwrap();
    assert_eq!(reinvite.revoked_tokens, 0);

    let principal = h
        .orchestrator
        .redeem_invite(&reinvite.token.value, password("Str0ngPassw0rd!"), &ctx("visitor"))
        .await
        .unwrap();
    assert_eq!(principal.onboarding, OnboardingState::CredentialsSet);
}

#[tokio::test]
async fn test_grant_on_vanished_resource_is_not_found() {
    let h = scripted_harness();
    let admin = seed_admin(h.store.memory()).await;
    let resource = h
        .orchestrator
        .register_resource(&admin, Visibility::Custom, None, &ctx("admin"))
        .await
        .unwrap();

    h.store.fail_next("upsert_grant", || {
        StoreError::NotFound("resource_grants_resource_id_fkey".into())
    });
    let err = h
        .orchestrator
        .upsert_grant(
            &admin,
            resource.id,
            Grantee::Role(Role::Agent),
            true,
            false,
            &ctx("admin"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisioningError::ResourceNotFound));
}
