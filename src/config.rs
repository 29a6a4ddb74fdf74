//! Configuration management for Tollgate.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TollgateError};
use crate::ratelimit::{KeyExtractor, Policy, PolicyRegistry};

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limit tiers
    #[serde(default = "default_policies")]
    pub policies: Vec<Policy>,

    /// Client identity derivation
    #[serde(default)]
    pub key_extraction: KeyExtractionConfig,

    /// Idle window reclamation
    #[serde(default)]
    pub sweeper: SweeperConfig,

    /// Window store selection
    #[serde(default)]
    pub backend: BackendConfig,
}

impl Default for TollgateConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            policies: default_policies(),
            key_extraction: KeyExtractionConfig::default(),
            sweeper: SweeperConfig::default(),
            backend: BackendConfig::default(),
        }
    }
}

fn default_policies() -> Vec<Policy> {
    vec![Policy::general(), Policy::ai()]
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Header carrying the authenticated principal id, set by the auth layer
    #[serde(default = "default_principal_header")]
    pub principal_header: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            principal_header: default_principal_header(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_principal_header() -> String {
    "x-principal-id".to_string()
}

/// Client key extraction configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyExtractionConfig {
    /// Proxies whose forwarded header is believed (CIDR or bare address)
    #[serde(default)]
    pub trusted_proxies: Vec<String>,

    /// Header carrying the proxy chain
    #[serde(default = "default_forwarded_header")]
    pub forwarded_header: String,
}

impl Default for KeyExtractionConfig {
    fn default() -> Self {
        Self {
            trusted_proxies: Vec::new(),
            forwarded_header: default_forwarded_header(),
        }
    }
}

fn default_forwarded_header() -> String {
    "x-forwarded-for".to_string()
}

/// Sweeper configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    #[serde(default = "default_sweeper_enabled")]
    pub enabled: bool,

    /// Time between sweeps in milliseconds
    #[serde(default = "default_sweep_interval_ms")]
    pub interval_ms: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: default_sweeper_enabled(),
            interval_ms: default_sweep_interval_ms(),
        }
    }
}

fn default_sweeper_enabled() -> bool {
    true
}

fn default_sweep_interval_ms() -> u64 {
    60_000
}

/// Which window store to run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process store
    #[default]
    Memory,
    /// Shared Redis store
    Redis,
}

/// Backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,

    /// Redis connection URL, required for the redis backend
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Prefix for keys written to the shared store
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            redis_url: None,
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_key_prefix() -> String {
    "tollgate:".to_string()
}

impl TollgateConfig {
    /// Load configuration from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load and validate configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TollgateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the whole configuration, failing on the first problem.
    pub fn validate(&self) -> Result<()> {
        self.build_registry()?;
        self.build_key_extractor()?;

        if self.sweeper.enabled && self.sweeper.interval_ms == 0 {
            return Err(TollgateError::Config(
                "sweeper.interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.backend.kind == BackendKind::Redis && self.backend.redis_url.is_none() {
            return Err(TollgateError::Config(
                "backend.redis_url is required for the redis backend".to_string(),
            ));
        }

        Ok(())
    }

    /// Build the policy registry.
    pub fn build_registry(&self) -> Result<PolicyRegistry> {
        if self.policies.is_empty() {
            return Err(TollgateError::Config(
                "at least one policy must be configured".to_string(),
            ));
        }
        PolicyRegistry::from_policies(self.policies.iter().cloned())
    }

    /// Build the key extractor from the trusted proxy list.
    pub fn build_key_extractor(&self) -> Result<KeyExtractor> {
        let trusted = self
            .key_extraction
            .trusted_proxies
            .iter()
            .map(String::as_str)
            .map(parse_proxy)
            .collect::<Result<Vec<_>>>()?;
        Ok(KeyExtractor::with_trusted_proxies(trusted))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweeper.interval_ms)
    }
}

fn parse_proxy(entry: &str) -> Result<IpNet> {
    let entry = entry.trim();
    if let Ok(net) = entry.parse::<IpNet>() {
        return Ok(net);
    }
    entry
        .parse::<IpAddr>()
        .map(IpNet::from)
        .map_err(|_| TollgateError::Config(format!("invalid trusted proxy '{}'", entry)))
}
