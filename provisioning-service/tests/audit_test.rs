mod common;

use chrono::Duration;
use common::{ctx, harness, invite_request, seed_admin, seed_principal};
use provisioning_service::{
    models::{entity, Action, AuditAction, AuditQuery, ProtectedResource, Role, Visibility},
    services::ProvisioningError,
};

#[tokio::test]
async fn test_only_admins_read_the_audit_trail() {
    let h = harness();
    let agent = seed_principal(&h.store, "agent@example.com", Role::Agent).await;

    let err = h
        .orchestrator
        .query_audit(&agent, &AuditQuery::default(), 10, 0, &ctx("agent"))
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisioningError::Unauthorized));

    // The refused read is itself on the record.
    let admin = seed_admin(&h.store).await;
    let page = h
        .orchestrator
        .query_audit(
            &admin,
            &AuditQuery {
                action: Some(AuditAction::UnauthorizedAdminAction),
                ..AuditQuery::default()
            },
            10,
            0,
            &ctx("admin"),
        )
        .await
        .unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.events[0].actor_id, Some(agent.id));
    assert_eq!(page.events[0].details["operation"], "query_audit");
}

#[tokio::test]
async fn test_query_filters_and_pages_newest_first() {
    let h = harness();
    let admin = seed_admin(&h.store).await;

    for i in 0..3 {
        h.orchestrator
            .invite_user(&admin, invite_request(&format!("p{}@example.com", i)), &ctx("admin"))
            .await
            .unwrap();
        h.clock.advance(Duration::minutes(1));
    }
    h.orchestrator
        .register_resource(&admin, Visibility::Public, None, &ctx("admin"))
        .await
        .unwrap();

    let invites = AuditQuery {
        action: Some(AuditAction::UserInvited),
        ..AuditQuery::default()
    };
    let page = h
        .orchestrator
        .query_audit(&admin, &invites, 2, 0, &ctx("admin"))
        .await
        .unwrap();
    assert_eq!(page.total, 3);
    assert_eq!(page.events.len(), 2);
    assert_eq!(page.events[0].details["email"], "p2@example.com");
    assert_eq!(page.events[1].details["email"], "p1@example.com");
    assert!(page.events[0].timestamp > page.events[1].timestamp);

    let rest = h
        .orchestrator
        .query_audit(&admin, &invites, 2, 2, &ctx("admin"))
        .await
        .unwrap();
    assert_eq!(rest.events.len(), 1);
    assert_eq!(rest.events[0].details["email"], "p0@example.com");

    let by_entity = AuditQuery {
        entity_type: Some(entity::RESOURCE.to_string()),
        actor_id: Some(admin.id),
        ..AuditQuery::default()
    };
    let page = h
        .orchestrator
        .query_audit(&admin, &by_entity, 50, 0, &ctx("admin"))
        .await
        .unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.events[0].action, AuditAction::ResourceRegistered);
}

#[tokio::test]
async fn test_audit_outage_does_not_change_access_decision() {
    let h = harness();
    let agent = seed_principal(&h.store, "agent@example.com", Role::Agent).await;
    let resource = ProtectedResource::new(Visibility::Public, None);

    h.store.set_unavailable(true);
    let decision = h
        .orchestrator
        .authorize_and_audit(&agent, &resource, Action::View, &ctx("agent"))
        .await;
    assert!(decision.is_allowed());

    h.store.set_unavailable(false);
    assert_eq!(h.store.audit_len(), 0);
}

#[tokio::test]
async fn test_store_outage_surfaces_as_unavailable() {
    let h = harness();
    let admin = seed_admin(&h.store).await;

    h.store.set_unavailable(true);
    let err = h
        .orchestrator
        .invite_user(&admin, invite_request("down@example.com"), &ctx("admin"))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, ProvisioningError::StoreUnavailable(_)));
    assert!(!err.is_retryable());
}
