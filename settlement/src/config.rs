//! Configuration for the settlement node

use crate::orchestrator::{OrchestratorConfig, DEFAULT_PREPARE_TIMEOUT};
use rail_core::crypto::Domain;
use rail_core::FunctionId;
use reserve_guard::{CircuitDefinition, LimitId, RateLimitDefinition};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Settlement node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Service name
    pub service_name: String,

    /// Signing domain for attestations and confirmations
    pub domain: DomainConfig,

    /// Orchestrator settings
    pub orchestrator: OrchestratorSettings,

    /// Rails to bind at startup
    pub rails: Vec<RailConfig>,

    /// Circuits by ID
    pub circuits: BTreeMap<String, CircuitDefinition>,

    /// Rate limits by ID
    pub rate_limits: BTreeMap<String, RateLimitDefinition>,

    /// Transfer record storage
    pub storage: StorageConfig,

    /// Emit JSON logs
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "settlement-node".to_string(),
            domain: DomainConfig::default(),
            orchestrator: OrchestratorSettings::default(),
            rails: vec![RailConfig::native("native")],
            circuits: BTreeMap::new(),
            rate_limits: BTreeMap::new(),
            storage: StorageConfig::default(),
            log_json: false,
        }
    }
}

/// Signing domain
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainConfig {
    /// Protocol name
    pub name: String,
    /// Protocol version
    pub version: String,
    /// Environment; separators differ per environment
    pub environment: String,
    /// Deployment instance
    pub instance: String,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            name: "DelTran Settlement".to_string(),
            version: "1".to_string(),
            environment: "development".to_string(),
            instance: "node-0".to_string(),
        }
    }
}

impl DomainConfig {
    /// As a signing domain
    pub fn to_domain(&self) -> Domain {
        Domain::new(
            self.name.clone(),
            self.version.clone(),
            self.environment.clone(),
            self.instance.clone(),
        )
    }
}

/// Orchestrator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    /// Function name circuits restrict to stop transfers
    pub transfer_function: String,

    /// Rate limits applied to every sender
    pub sender_limits: Vec<String>,

    /// Per-leg prepare timeout in two-phase settlements (ms)
    pub prepare_timeout_ms: u64,

    /// Pending-confirmation sweep interval (ms)
    pub sweep_interval_ms: u64,

    /// Confirmation actor mailbox capacity
    pub mailbox_capacity: usize,

    /// Minimum netting efficiency (0.0 - 1.0)
    /// Below it, gross legs settle unchanged
    pub min_netting_ratio: f64,

    /// Reserve feed refresh interval (ms)
    pub feed_interval_ms: u64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            transfer_function: "transfer".to_string(),
            sender_limits: Vec::new(),
            prepare_timeout_ms: DEFAULT_PREPARE_TIMEOUT.as_millis() as u64,
            sweep_interval_ms: 1_000,
            mailbox_capacity: 1_000,
            min_netting_ratio: 0.0,
            feed_interval_ms: 5_000,
        }
    }
}

impl OrchestratorSettings {
    /// Runtime orchestrator configuration
    pub fn to_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            transfer_function: FunctionId::new(self.transfer_function.clone()),
            sender_limits: self.sender_limits.iter().map(LimitId::new).collect(),
            prepare_timeout: Duration::from_millis(self.prepare_timeout_ms),
            min_netting_ratio: self.min_netting_ratio,
        }
    }

    /// Sweep interval
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Reserve feed interval
    pub fn feed_interval(&self) -> Duration {
        Duration::from_millis(self.feed_interval_ms)
    }
}

/// Reference adapter kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RailAdapterKind {
    /// Same-ledger escrow
    Native,
    /// Allow-listed token holds
    Token,
    /// Relayed network with signed confirmations
    Attested,
}

/// One rail binding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RailConfig {
    /// Logical rail name; the registry key is derived from it
    pub name: String,

    /// Adapter
    pub kind: RailAdapterKind,

    /// Confirmation timeout for asynchronous rails (seconds)
    #[serde(default = "default_confirmation_timeout")]
    pub confirmation_timeout_secs: u64,

    /// Token allow-list
    #[serde(default)]
    pub allowed_assets: Vec<String>,

    /// Relayer Ed25519 public key, hex
    #[serde(default)]
    pub relayer_key: Option<String>,
}

fn default_confirmation_timeout() -> u64 {
    crate::adapter::DEFAULT_CONFIRMATION_TIMEOUT.as_secs()
}

impl RailConfig {
    /// Native rail binding
    pub fn native(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: RailAdapterKind::Native,
            confirmation_timeout_secs: default_confirmation_timeout(),
            allowed_assets: Vec::new(),
            relayer_key: None,
        }
    }

    /// Decoded relayer key
    pub fn relayer_key_bytes(&self) -> crate::Result<[u8; 32]> {
        let encoded = self.relayer_key.as_deref().ok_or_else(|| {
            crate::Error::Config(format!("rail {} needs a relayer_key", self.name))
        })?;
        let raw = hex::decode(encoded)
            .map_err(|e| crate::Error::Config(format!("rail {} relayer_key: {}", self.name, e)))?;
        raw.try_into().map_err(|_| {
            crate::Error::Config(format!("rail {} relayer_key must be 32 bytes", self.name))
        })
    }
}

/// Storage backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// In-process maps
    Memory,
    /// RocksDB (requires the `rocksdb` feature)
    Rocksdb,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend
    pub backend: StorageBackend,
    /// Data directory for persistent backends
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            data_dir: PathBuf::from("./data/settlement"),
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(environment) = std::env::var("SETTLEMENT_ENVIRONMENT") {
            config.domain.environment = environment;
        }

        if let Ok(dir) = std::env::var("SETTLEMENT_DATA_DIR") {
            config.storage.data_dir = PathBuf::from(dir);
        }

        if let Ok(ms) = std::env::var("SETTLEMENT_SWEEP_MS") {
            config.orchestrator.sweep_interval_ms = parse_env("SETTLEMENT_SWEEP_MS", &ms)?;
        }

        if let Ok(ms) = std::env::var("SETTLEMENT_PREPARE_TIMEOUT_MS") {
            config.orchestrator.prepare_timeout_ms =
                parse_env("SETTLEMENT_PREPARE_TIMEOUT_MS", &ms)?;
        }

        if let Ok(flag) = std::env::var("SETTLEMENT_LOG_JSON") {
            config.log_json = matches!(flag.as_str(), "1" | "true" | "yes");
        }

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> crate::Result<()> {
        let settings = &self.orchestrator;
        if settings.sweep_interval_ms == 0 || settings.prepare_timeout_ms == 0 {
            return Err(crate::Error::Config(
                "sweep_interval_ms and prepare_timeout_ms must be positive".to_string(),
            ));
        }
        if settings.mailbox_capacity == 0 {
            return Err(crate::Error::Config("mailbox_capacity must be positive".to_string()));
        }
        if !(0.0..=1.0).contains(&settings.min_netting_ratio) {
            return Err(crate::Error::Config(
                "min_netting_ratio must be within 0.0..=1.0".to_string(),
            ));
        }
        for limit in &settings.sender_limits {
            if !self.rate_limits.contains_key(limit) {
                return Err(crate::Error::Config(format!(
                    "sender limit {} is not defined",
                    limit
                )));
            }
        }

        let mut names = std::collections::BTreeSet::new();
        for rail in &self.rails {
            if !names.insert(rail.name.as_str()) {
                return Err(crate::Error::Config(format!("rail {} defined twice", rail.name)));
            }
            if rail.confirmation_timeout_secs == 0
                || rail.confirmation_timeout_secs > MAX_CONFIRMATION_TIMEOUT_SECS
            {
                return Err(crate::Error::Config(format!(
                    "rail {}: confirmation_timeout_secs must be in 1..={}",
                    rail.name, MAX_CONFIRMATION_TIMEOUT_SECS
                )));
            }
            match rail.kind {
                RailAdapterKind::Token if rail.allowed_assets.is_empty() => {
                    return Err(crate::Error::Config(format!(
                        "token rail {} has no allowed_assets",
                        rail.name
                    )));
                }
                RailAdapterKind::Attested => {
                    rail.relayer_key_bytes()?;
                }
                _ => {}
            }
        }

        for (id, definition) in &self.circuits {
            definition
                .validate()
                .map_err(|e| crate::Error::Config(format!("circuit {}: {}", id, e)))?;
        }
        for (id, definition) in &self.rate_limits {
            definition
                .validate()
                .map_err(|e| crate::Error::Config(format!("rate limit {}: {}", id, e)))?;
        }
        Ok(())
    }
}

/// Longest accepted confirmation timeout (one year)
const MAX_CONFIRMATION_TIMEOUT_SECS: u64 = 366 * 24 * 60 * 60;

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> crate::Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| crate::Error::Config(format!("{}={}: {}", name, value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.orchestrator.to_config().prepare_timeout, DEFAULT_PREPARE_TIMEOUT);
    }

    #[test]
    fn test_parse_toml() {
        let config: Config = toml::from_str(
            r#"
            service_name = "node-a"

            [domain]
            environment = "staging"

            [orchestrator]
            sender_limits = ["per-sender"]
            prepare_timeout_ms = 2000

            [[rails]]
            name = "native"
            kind = "native"

            [[rails]]
            name = "usdx"
            kind = "token"
            allowed_assets = ["USDX"]

            [circuits.reserve]
            name = "reserve ratio"
            warning_threshold = "100"
            restricted_threshold = "500"
            emergency_threshold = "900"
            cooldown_secs = 60

            [rate_limits.per-sender]
            max_count = 3
            window_secs = 60
            limit_kind = "Count"
            window_kind = "Rolling"
            "#,
        )
        .unwrap();

        config.validate().unwrap();
        assert_eq!(config.rails.len(), 2);
        assert_eq!(config.domain.environment, "staging");
        assert_eq!(config.domain.name, DomainConfig::default().name);
        assert_eq!(config.orchestrator.sweep_interval_ms, 1_000);
        assert!(config.circuits.contains_key("reserve"));
    }

    #[test]
    fn test_undefined_sender_limit_rejected() {
        let mut config = Config::default();
        config.orchestrator.sender_limits.push("missing".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_out_of_range_durations_rejected() {
        let mut config = Config::default();
        config.rails[0].confirmation_timeout_secs = u64::MAX;
        assert!(matches!(config.validate(), Err(crate::Error::Config(_))));

        let mut config = Config::default();
        config.rate_limits.insert(
            "huge".to_string(),
            RateLimitDefinition::count(1, u64::MAX, reserve_guard::WindowKind::Rolling),
        );
        assert!(matches!(config.validate(), Err(crate::Error::Config(_))));

        let mut config = Config::default();
        config.circuits.insert(
            "huge".to_string(),
            CircuitDefinition::new(
                "huge",
                rust_decimal::Decimal::from(1),
                rust_decimal::Decimal::from(2),
                rust_decimal::Decimal::from(3),
            )
            .with_cooldown(u64::MAX),
        );
        assert!(matches!(config.validate(), Err(crate::Error::Config(_))));
    }

    #[test]
    fn test_attested_rail_needs_key() {
        let mut config = Config::default();
        config.rails.push(RailConfig {
            name: "swift".to_string(),
            kind: RailAdapterKind::Attested,
            confirmation_timeout_secs: 60,
            allowed_assets: Vec::new(),
            relayer_key: None,
        });
        assert!(config.validate().is_err());

        config.rails[1].relayer_key = Some(hex::encode([7u8; 32]));
        config.validate().unwrap();
    }

    #[test]
    fn test_environment_changes_domain() {
        let staging = DomainConfig {
            environment: "staging".to_string(),
            ..DomainConfig::default()
        };
        assert_ne!(
            staging.to_domain().separator(),
            DomainConfig::default().to_domain().separator()
        );
    }
}
