use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct ProvisioningConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_version: String,
    pub database: DatabaseConfig,
    pub tokens: TokenConfig,
    pub rate_limit: RateLimitConfig,
    pub identity_provider: IdentityProviderMode,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    pub invite_ttl_hours: i64,
    pub password_reset_ttl_minutes: i64,
    /// Prefix for links embedded in invitation and reset notifications.
    pub base_url: String,
}

impl TokenConfig {
    pub fn invite_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.invite_ttl_hours)
    }

    pub fn password_reset_ttl(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.password_reset_ttl_minutes)
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            invite_ttl_hours: 168,
            password_reset_ttl_minutes: 60,
            base_url: "http://localhost:3000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct ProfileConfig {
    pub max_requests: u32,
    pub window_seconds: u64,
}

impl ProfileConfig {
    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.window_seconds as i64)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    pub strict: ProfileConfig,
    pub moderate: ProfileConfig,
    pub lenient: ProfileConfig,
    /// Window count above which `check` sweeps expired entries inline.
    pub max_entries: usize,
    /// Period of the background sweepers started at service startup.
    pub sweep_interval_seconds: u64,
}

impl RateLimitConfig {
    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_seconds)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            strict: ProfileConfig {
                max_requests: 5,
                window_seconds: 900,
            },
            moderate: ProfileConfig {
                max_requests: 10,
                window_seconds: 900,
            },
            lenient: ProfileConfig {
                max_requests: 100,
                window_seconds: 60,
            },
            max_entries: 10_000,
            sweep_interval_seconds: 60,
        }
    }
}

/// Where new principals are provisioned.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IdentityProviderMode {
    Local,
    External,
}

impl ProvisioningConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;
        let rate_defaults = RateLimitConfig::default();

        let config = ProvisioningConfig {
            common: common_config,
            environment: environment.clone(),
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")), false)?,
            database: DatabaseConfig {
                url: get_env("DATABASE_URL", None, is_prod)?,
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", "10")?,
                min_connections: parse_env("DATABASE_MIN_CONNECTIONS", "1")?,
            },
            tokens: TokenConfig {
                invite_ttl_hours: parse_env("INVITE_TOKEN_TTL_HOURS", "168")?,
                password_reset_ttl_minutes: parse_env("PASSWORD_RESET_TTL_MINUTES", "60")?,
                base_url: get_env("APP_BASE_URL", Some("http://localhost:3000"), is_prod)?,
            },
            rate_limit: RateLimitConfig {
                strict: profile_from_env("STRICT", rate_defaults.strict)?,
                moderate: profile_from_env("MODERATE", rate_defaults.moderate)?,
                lenient: profile_from_env("LENIENT", rate_defaults.lenient)?,
                max_entries: parse_env("RATE_LIMIT_MAX_ENTRIES", "10000")?,
                sweep_interval_seconds: parse_env("RATE_LIMIT_SWEEP_INTERVAL_SECONDS", "60")?,
            },
            identity_provider: get_env("IDENTITY_PROVIDER", Some("local"), false)?
                .parse()
                .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.tokens.invite_ttl_hours <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "INVITE_TOKEN_TTL_HOURS must be positive"
            )));
        }

        if self.tokens.password_reset_ttl_minutes <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PASSWORD_RESET_TTL_MINUTES must be positive"
            )));
        }

        for (name, profile) in [
            ("STRICT", &self.rate_limit.strict),
            ("MODERATE", &self.rate_limit.moderate),
            ("LENIENT", &self.rate_limit.lenient),
        ] {
            if profile.max_requests == 0 || profile.window_seconds == 0 {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "RATE_LIMIT_{} limit and window must be greater than 0",
                    name
                )));
            }
        }

        if self.rate_limit.sweep_interval_seconds == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "RATE_LIMIT_SWEEP_INTERVAL_SECONDS must be greater than 0"
            )));
        }

        if self.database.min_connections > self.database.max_connections {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "DATABASE_MIN_CONNECTIONS exceeds DATABASE_MAX_CONNECTIONS"
            )));
        }

        if self.environment == Environment::Prod && !self.tokens.base_url.starts_with("https://") {
            tracing::error!("APP_BASE_URL is not https in production - invite links will be sent in clear");
        }

        Ok(())
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required in production but not set",
                    key
                ))))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}

fn parse_env<T>(key: &str, default: &str) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    get_env(key, Some(default), false)?
        .parse()
        .map_err(|e: T::Err| AppError::ConfigError(anyhow::anyhow!("{}: {}", key, e)))
}

fn profile_from_env(name: &str, default: ProfileConfig) -> Result<ProfileConfig, AppError> {
    Ok(ProfileConfig {
        max_requests: parse_env(
            &format!("RATE_LIMIT_{}_MAX_REQUESTS", name),
            &default.max_requests.to_string(),
        )?,
        window_seconds: parse_env(
            &format!("RATE_LIMIT_{}_WINDOW_SECONDS", name),
            &default.window_seconds.to_string(),
        )?,
    })
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}

impl std::str::FromStr for IdentityProviderMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(IdentityProviderMode::Local),
            "external" => Ok(IdentityProviderMode::External),
            _ => Err(format!("Invalid identity provider: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ProvisioningConfig {
        ProvisioningConfig {
            common: core_config::Config::default(),
            environment: Environment::Dev,
            service_version: "test".to_string(),
            database: DatabaseConfig {
                url: "postgres://localhost/provisioning_test".to_string(),
                max_connections: 5,
                min_connections: 1,
            },
            tokens: TokenConfig::default(),
            rate_limit: RateLimitConfig::default(),
            identity_provider: IdentityProviderMode::Local,
        }
    }

    #[test]
    fn test_defaults_validate() {
        let config = config();
        assert!(config.validate().is_ok());
        assert_eq!(config.tokens.invite_ttl(), chrono::Duration::days(7));
        assert_eq!(config.tokens.password_reset_ttl(), chrono::Duration::hours(1));
        assert_eq!(config.rate_limit.moderate.window(), chrono::Duration::minutes(15));
    }

    #[test]
    fn test_rejects_non_positive_ttl() {
        let mut config = config();
        config.tokens.invite_ttl_hours = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_limit() {
        let mut config = config();
        config.rate_limit.lenient.max_requests = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_modes() {
        assert_eq!("PROD".parse::<Environment>(), Ok(Environment::Prod));
        assert_eq!(
            "external".parse::<IdentityProviderMode>(),
            Ok(IdentityProviderMode::External)
        );
        assert!("ldap".parse::<IdentityProviderMode>().is_err());
    }
}
