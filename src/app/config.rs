use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use url::Url;

use super::error::RouterError;
use crate::models::ProviderKind;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProviderSettings {
    pub name: String,
    pub kind: ProviderKind,
    pub base_url: Url,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default)]
    pub webhook_secret: Option<String>,
    pub currencies: Vec<String>,
    pub countries: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server_port: u16,
    pub default_provider: String,
    pub home_currency: String,
    pub home_country: String,
    pub home_provider: String,
    /// Currency code to provider, consulted for non-home currencies.
    pub currency_routes: BTreeMap<String, String>,
    pub health_check_interval_secs: u64,
    pub health_check_timeout_ms: u64,
    pub health_check_jitter_ms: u64,
    pub attempt_timeout_ms: u64,
    pub strategy_file: Option<PathBuf>,
    pub recovery_max_attempts: u32,
    pub recovery_retry_ceiling: u32,
    pub providers: Vec<ProviderSettings>,
}

/// Optional TOML overlay; every field overrides its env counterpart.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    server_port: Option<u16>,
    default_provider: Option<String>,
    home_currency: Option<String>,
    home_country: Option<String>,
    home_provider: Option<String>,
    currency_routes: Option<BTreeMap<String, String>>,
    health_check_interval_secs: Option<u64>,
    health_check_timeout_ms: Option<u64>,
    health_check_jitter_ms: Option<u64>,
    attempt_timeout_ms: Option<u64>,
    strategy_file: Option<PathBuf>,
    recovery_max_attempts: Option<u32>,
    recovery_retry_ceiling: Option<u32>,
    providers: Option<Vec<ProviderSettings>>,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_url(key: &str, default: &str) -> Result<Url, RouterError> {
    let raw = env_string(key, default);
    Url::parse(&raw).map_err(|e| RouterError::Config(format!("{}={} is not a valid URL: {}", key, raw, e)))
}

/// Parses `ZAR:yoco,USD:paystack`.
fn parse_routes(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (currency, provider) = pair.split_once(':')?;
            let (currency, provider) = (currency.trim(), provider.trim());
            if currency.is_empty() || provider.is_empty() {
                return None;
            }
            Some((currency.to_ascii_uppercase(), provider.to_string()))
        })
        .collect()
}

impl Config {
    pub fn from_env() -> Result<Self, RouterError> {
        let providers = vec![
            ProviderSettings {
                name: "paystack".into(),
                kind: ProviderKind::Paystack,
                base_url: env_url("PAYSTACK_BASE_URL", "https://api.paystack.co")?,
                secret_key: env_string("PAYSTACK_SECRET_KEY", ""),
                webhook_secret: None,
                currencies: ["NGN", "GHS", "ZAR", "KES", "USD"].map(String::from).to_vec(),
                countries: ["NG", "GH", "ZA", "KE"].map(String::from).to_vec(),
            },
            ProviderSettings {
                name: "yoco".into(),
                kind: ProviderKind::Yoco,
                base_url: env_url("YOCO_BASE_URL", "https://payments.yoco.com")?,
                secret_key: env_string("YOCO_SECRET_KEY", ""),
                webhook_secret: env::var("YOCO_WEBHOOK_SECRET").ok(),
                currencies: vec!["ZAR".into()],
                countries: vec!["ZA".into()],
            },
        ];

        Ok(Self {
            server_port: env_or("PORT", 9999),
            default_provider: env_string("DEFAULT_PROVIDER", "paystack"),
            home_currency: env_string("HOME_CURRENCY", "NGN").to_ascii_uppercase(),
            home_country: env_string("HOME_COUNTRY", "NG").to_ascii_uppercase(),
            home_provider: env_string("HOME_PROVIDER", "paystack"),
            currency_routes: parse_routes(&env_string("CURRENCY_ROUTES", "ZAR:yoco")),
            health_check_interval_secs: env_or("HEALTH_CHECK_INTERVAL_SECS", 300),
            health_check_timeout_ms: env_or("HEALTH_CHECK_TIMEOUT_MS", 10_000),
            health_check_jitter_ms: env_or("HEALTH_CHECK_JITTER_MS", 5_000),
            attempt_timeout_ms: env_or("ATTEMPT_TIMEOUT_MS", 10_000),
            strategy_file: env::var("STRATEGY_FILE").ok().map(PathBuf::from),
            recovery_max_attempts: env_or("RECOVERY_MAX_ATTEMPTS", 2),
            recovery_retry_ceiling: env_or("RECOVERY_RETRY_CEILING", 5),
            providers,
        })
    }

    /// Env defaults, then the TOML file at `path` on top, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self, RouterError> {
        let mut config = Self::from_env()?;
        if let Some(path) = path {
            let raw = std::fs::read_to_string(path)?;
            let file: FileConfig = toml::from_str(&raw)
                .map_err(|e| RouterError::Config(format!("{}: {}", path.display(), e)))?;
            config.apply(file);
        }
        config.validate()?;
        Ok(config)
    }

    fn apply(&mut self, file: FileConfig) {
        if let Some(v) = file.server_port {
            self.server_port = v;
        }
        if let Some(v) = file.default_provider {
            self.default_provider = v;
        }
        if let Some(v) = file.home_currency {
            self.home_currency = v.to_ascii_uppercase();
        }
        if let Some(v) = file.home_country {
            self.home_country = v.to_ascii_uppercase();
        }
        if let Some(v) = file.home_provider {
            self.home_provider = v;
        }
        if let Some(v) = file.currency_routes {
            self.currency_routes = v
                .into_iter()
                .map(|(currency, provider)| (currency.to_ascii_uppercase(), provider))
                .collect();
        }
        if let Some(v) = file.health_check_interval_secs {
            self.health_check_interval_secs = v;
        }
        if let Some(v) = file.health_check_timeout_ms {
            self.health_check_timeout_ms = v;
        }
        if let Some(v) = file.health_check_jitter_ms {
            self.health_check_jitter_ms = v;
        }
        if let Some(v) = file.attempt_timeout_ms {
            self.attempt_timeout_ms = v;
        }
        if let Some(v) = file.strategy_file {
            self.strategy_file = Some(v);
        }
        if let Some(v) = file.recovery_max_attempts {
            self.recovery_max_attempts = v;
        }
        if let Some(v) = file.recovery_retry_ceiling {
            self.recovery_retry_ceiling = v;
        }
        if let Some(v) = file.providers {
            self.providers = v;
        }
    }

    pub fn validate(&self) -> Result<(), RouterError> {
        if self.providers.is_empty() {
            return Err(RouterError::Config("at least one provider is required".into()));
        }

        let mut names = HashSet::new();
        for provider in &self.providers {
            if !names.insert(provider.name.as_str()) {
                return Err(RouterError::Config(format!(
                    "provider {} is declared twice",
                    provider.name
                )));
            }
        }

        let referenced = [&self.default_provider, &self.home_provider]
            .into_iter()
            .chain(self.currency_routes.values());
        for name in referenced {
            if !names.contains(name.as_str()) {
                return Err(RouterError::Config(format!(
                    "routing references undeclared provider {}",
                    name
                )));
            }
        }

        if self.health_check_interval_secs == 0 {
            return Err(RouterError::Config("HEALTH_CHECK_INTERVAL_SECS must be positive".into()));
        }
        if self.recovery_max_attempts == 0 {
            return Err(RouterError::Config("RECOVERY_MAX_ATTEMPTS must be positive".into()));
        }
        Ok(())
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}
