use async_trait::async_trait;
use std::sync::Mutex;

use crate::models::Principal;

/// Outbound delivery of invitation and reset links. Delivery mechanics live
/// outside this crate; failures are reported to the caller, who decides
/// whether they matter.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_invite(
        &self,
        principal: &Principal,
        invite_link: &str,
        temp_credential: &str,
    ) -> Result<(), anyhow::Error>;

    async fn send_password_reset(
        &self,
        principal: &Principal,
        reset_link: &str,
    ) -> Result<(), anyhow::Error>;
}

/// Records that a delivery would happen, without the secret parts.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_invite(
        &self,
        principal: &Principal,
        _invite_link: &str,
        _temp_credential: &str,
    ) -> Result<(), anyhow::Error> {
        tracing::info!(principal_id = %principal.id, email = %principal.email, "Invitation ready for delivery");
        Ok(())
    }

    async fn send_password_reset(
        &self,
        principal: &Principal,
        _reset_link: &str,
    ) -> Result<(), anyhow::Error> {
        tracing::info!(principal_id = %principal.id, email = %principal.email, "Password reset ready for delivery");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryKind {
    Invite,
    PasswordReset,
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub kind: DeliveryKind,
    pub email: String,
    pub link: String,
    pub temp_credential: Option<String>,
}

/// In-memory notifier for tests: keeps every delivery and can be told to fail.
#[derive(Default)]
pub struct MockNotifier {
    pub deliveries: Mutex<Vec<Delivery>>,
    pub fail: std::sync::atomic::AtomicBool,
}

impl MockNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let notifier = Self::default();
        notifier
            .fail
            .store(true, std::sync::atomic::Ordering::SeqCst);
        notifier
    }

    pub fn sent(&self) -> Vec<Delivery> {
        self.deliveries
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default()
    }

    /// Most recent link of `kind` sent to `email`.
    pub fn last_link(&self, kind: DeliveryKind, email: &str) -> Option<String> {
        self.sent()
            .into_iter()
            .rev()
            .find(|d| d.kind == kind && d.email == email)
            .map(|d| d.link)
    }

    fn push(&self, delivery: Delivery) -> Result<(), anyhow::Error> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(anyhow::anyhow!("mock notifier configured to fail"));
        }
        self.deliveries
            .lock()
            .map_err(|e| anyhow::anyhow!("Mock notifier mutex poisoned: {}", e))?
            .push(delivery);
        Ok(())
    }
}

#[async_trait]
impl Notifier for MockNotifier {
    async fn send_invite(
        &self,
        principal: &Principal,
        invite_link: &str,
        temp_credential: &str,
    ) -> Result<(), anyhow::Error> {
        self.push(Delivery {
            kind: DeliveryKind::Invite,
            email: principal.email.clone(),
            link: invite_link.to_string(),
            temp_credential: Some(temp_credential.to_string()),
        })
    }

    async fn send_password_reset(
        &self,
        principal: &Principal,
        reset_link: &str,
    ) -> Result<(), anyhow::Error> {
        self.push(Delivery {
            kind: DeliveryKind::PasswordReset,
            email: principal.email.clone(),
            link: reset_link.to_string(),
            temp_credential: None,
        })
    }
}

/// Pull the `token` query parameter back out of a delivered link.
pub fn token_from_link(link: &str) -> Option<&str> {
    link.split_once("token=").map(|(_, rest)| rest.split('&').next().unwrap_or(rest))
}
