//! Configuration system for novon.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $NOVON_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/novon/config.toml
//!   3. ~/.config/novon/config.toml

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NovonConfig {
    pub identity: IdentityConfig,
    pub stream: StreamConfig,
    pub network: NetworkConfig,
    pub viewers: ViewersConfig,
    pub donation: DonationConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Hex wallet seed. Generated on first run. Secret: never log it.
    pub seed: String,
}

/// Prefix of wallet addresses derived from an identity seed.
pub const WALLET_PREFIX: &str = "NV";

/// Key-derivation context for the wallet address.
const WALLET_CONTEXT: &str = "novon identity seed -> wallet address v1";

impl IdentityConfig {
    /// The 32-byte seed. Errors when missing or not 64 hex characters.
    pub fn seed_bytes(&self) -> Result<[u8; 32], ConfigError> {
        if self.seed.is_empty() {
            return Err(ConfigError::Invalid("identity.seed", "missing".into()));
        }
        let mut seed = [0u8; 32];
        hex::decode_to_slice(&self.seed, &mut seed)
            .map_err(|e| ConfigError::Invalid("identity.seed", format!("not 32 hex bytes: {e}")))?;
        Ok(seed)
    }

    /// Public wallet address of this identity. Donations must be paid here.
    pub fn wallet_address(&self) -> Result<String, ConfigError> {
        let seed = self.seed_bytes()?;
        let key = blake3::derive_key(WALLET_CONTEXT, &seed);
        Ok(format!("{WALLET_PREFIX}{}", hex::encode(&key[..20])))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub title: String,
    /// Overlay address of the stream owner. Gets the owner role in chat.
    pub owner: String,
    /// Text returned for `getpanels`.
    pub panels: String,
    /// Max payload bytes per chunk.
    pub chunk_size: usize,
    /// Nominal segment length produced by ingest.
    pub segment_duration_ms: u64,
    /// Directory ingest writes finished `.ts` segments into.
    pub segment_dir: PathBuf,
    /// Ingest server command line. Empty = segments are produced externally.
    pub ingest_command: Vec<String>,
    /// Lower-quality variants, applied in order.
    pub transcode: Vec<TranscodeProfile>,
}

/// One output quality: vertical resolution and frame rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscodeProfile {
    pub resolution: u32,
    pub framerate: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// UDP address of overlay identity 0. The rest bind ephemeral ports.
    pub listen_addr: String,
    /// Number of overlay identities in the send pool.
    pub pool_size: usize,
    /// Redundant virtual routes used for replies and catch-up.
    pub viewer_sub_clients: usize,
    /// Discovery topic the stream subscribes to while live.
    pub topic: String,
    pub subscribe_duration_blocks: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewersConfig {
    /// Viewers silent for longer than this are dropped.
    pub ttl_secs: u64,
    pub sweep_interval_ms: u64,
    /// Tier assigned on first ping.
    pub default_quality: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DonationConfig {
    /// JSON-RPC endpoint of a ledger node.
    pub rpc_url: String,
    /// Look in the mempool before waiting for confirmation.
    pub allow_mempool: bool,
    pub mempool_attempts: u32,
    pub mempool_spacing_ms: u64,
    pub confirm_attempts: u32,
    pub confirm_spacing_ms: u64,
    /// Per-RPC timeout.
    pub attempt_timeout_ms: u64,
    /// Issued donation ids still unpaid after this long are forgotten.
    pub id_ttl_secs: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            title: "Unnamed Stream".to_string(),
            owner: String::new(),
            panels: String::new(),
            chunk_size: 64_000,
            segment_duration_ms: 2_000,
            segment_dir: data_dir().join("segments"),
            ingest_command: Vec::new(),
            transcode: Vec::new(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:30010".to_string(),
            pool_size: 96,
            viewer_sub_clients: 3,
            topic: "novon".to_string(),
            subscribe_duration_blocks: 100,
        }
    }
}

impl Default for ViewersConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 30,
            sweep_interval_ms: 1_000,
            default_quality: 1,
        }
    }
}

impl Default for DonationConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://seed.nkn.org:30003".to_string(),
            allow_mempool: true,
            mempool_attempts: 5,
            mempool_spacing_ms: 1_000,
            confirm_attempts: 10,
            confirm_spacing_ms: 5_000,
            attempt_timeout_ms: 5_000,
            id_ttl_secs: 3_600,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("novon")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("novon")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid setting {0}: {1}")]
    Invalid(&'static str, String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl NovonConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            NovonConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("NOVON_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists, with a fresh identity seed.
    /// Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let mut config = NovonConfig::default();
            config.identity.seed = generate_seed();
            let text = toml::to_string_pretty(&config).map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Reject settings no component can run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stream.chunk_size == 0 {
            return Err(ConfigError::Invalid("stream.chunk_size", "must be positive".into()));
        }
        if !self.identity.seed.is_empty() {
            self.identity.seed_bytes()?;
        }
        if self.stream.segment_duration_ms == 0 {
            return Err(ConfigError::Invalid(
                "stream.segment_duration_ms",
                "must be positive".into(),
            ));
        }
        if self.network.pool_size == 0 {
            return Err(ConfigError::Invalid("network.pool_size", "must be positive".into()));
        }
        if self.network.viewer_sub_clients == 0 {
            return Err(ConfigError::Invalid(
                "network.viewer_sub_clients",
                "must be positive".into(),
            ));
        }
        if let Some(p) = self
            .stream
            .transcode
            .iter()
            .find(|p| p.resolution == 0 || p.framerate == 0)
        {
            return Err(ConfigError::Invalid(
                "stream.transcode",
                format!("{}p@{} is not a valid profile", p.resolution, p.framerate),
            ));
        }
        Ok(())
    }

    /// Apply NOVON_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("NOVON_IDENTITY__SEED") {
            self.identity.seed = v;
        }
        if let Ok(v) = std::env::var("NOVON_STREAM__TITLE") {
            self.stream.title = v;
        }
        if let Ok(v) = std::env::var("NOVON_STREAM__OWNER") {
            self.stream.owner = v;
        }
        if let Ok(v) = std::env::var("NOVON_STREAM__SEGMENT_DIR") {
            self.stream.segment_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("NOVON_NETWORK__LISTEN_ADDR") {
            self.network.listen_addr = v;
        }
        if let Ok(v) = std::env::var("NOVON_NETWORK__POOL_SIZE") {
            if let Ok(n) = v.parse() {
                self.network.pool_size = n;
            }
        }
        if let Ok(v) = std::env::var("NOVON_VIEWERS__TTL_SECS") {
            if let Ok(n) = v.parse() {
                self.viewers.ttl_secs = n;
            }
        }
        if let Ok(v) = std::env::var("NOVON_DONATION__RPC_URL") {
            self.donation.rpc_url = v;
        }
        if let Ok(v) = std::env::var("NOVON_DONATION__ALLOW_MEMPOOL") {
            self.donation.allow_mempool = v == "true" || v == "1";
        }
    }
}

fn generate_seed() -> String {
    let mut seed = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut seed);
    hex::encode(seed)
}
