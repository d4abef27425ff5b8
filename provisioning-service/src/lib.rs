//! Credential issuance and access-control core.
//!
//! Invitations, single-use tokens, onboarding state, resource access
//! decisions, keyed rate limiting and the audit trail. Transport is left to
//! the embedding service; errors convert into `service_core::error::AppError`
//! for rendering.
//!
//! At startup, build a [`ProvisioningOrchestrator`] with
//! [`ProvisioningOrchestrator::from_config`], then call
//! [`ProvisioningOrchestrator::spawn_rate_limit_sweepers`] from inside the
//! Tokio runtime so idle rate-limit windows are evicted on a timer.

pub mod clock;
pub mod config;
pub mod db;
pub mod models;
pub mod services;
pub mod store;
pub mod utils;

pub use clock::{Clock, ManualClock, SystemClock};
pub use services::{ProvisioningError, ProvisioningOrchestrator, RequestContext};
