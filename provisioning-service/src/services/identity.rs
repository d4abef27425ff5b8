use async_trait::async_trait;

use crate::models::Principal;
use crate::utils::Password;

/// External system that can own a principal's login instead of the local
/// credential hash.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn provision(
        &self,
        principal: &Principal,
        temp_credential: &Password,
    ) -> Result<(), anyhow::Error>;
}

/// How a newly invited principal ended up provisioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningMode {
    Local,
    External,
    /// External provisioning was requested but did not happen; the principal
    /// only exists locally.
    LocalFallback,
}

impl ProvisioningMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisioningMode::Local => "local",
            ProvisioningMode::External => "external",
            ProvisioningMode::LocalFallback => "local_fallback",
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, ProvisioningMode::LocalFallback)
    }
}
