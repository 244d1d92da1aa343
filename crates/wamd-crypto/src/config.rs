use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::persistence::DEFAULT_KDF_ITERATIONS;
use crate::prekey::{INITIAL_PRE_KEY_COUNT, MIN_PRE_KEY_COUNT};

/// Whether remote identity keys are pinned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustPolicy {
    /// Trust on first use with no verification gate: every identity is accepted.
    #[default]
    AcceptAll,
    /// The first identity seen for an address is pinned; a different one is rejected.
    Strict,
}

/// Where and how the multi-file key store keeps its records.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Folder holding one file per record plus `creds.json`.
    #[serde(default)]
    pub folder: Option<PathBuf>,

    /// Enables at-rest sealing of every record when set.
    #[serde(default)]
    pub passphrase: Option<String>,

    /// PBKDF2 work factor for the sealing key.
    #[serde(default = "default_kdf_iterations")]
    pub kdf_iterations: u32,
}

fn default_kdf_iterations() -> u32 {
    DEFAULT_KDF_ITERATIONS
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            folder: None,
            passphrase: None,
            kdf_iterations: default_kdf_iterations(),
        }
    }
}

/// Session layer configuration, loaded from a TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct SignalConfig {
    #[serde(default)]
    pub trust_policy: TrustPolicy,

    /// Peers injected concurrently per chunk during bulk session injection.
    #[serde(default = "default_injection_chunk_size")]
    pub injection_chunk_size: usize,

    /// Pre-keys uploaded on first registration.
    #[serde(default = "default_initial_pre_key_count")]
    pub initial_pre_key_count: u32,

    /// Server-side pre-key count below which a new batch is uploaded.
    #[serde(default = "default_min_pre_key_count")]
    pub min_pre_key_count: u32,

    #[serde(default)]
    pub store: StoreConfig,
}

fn default_injection_chunk_size() -> usize {
    100
}

fn default_initial_pre_key_count() -> u32 {
    INITIAL_PRE_KEY_COUNT
}

fn default_min_pre_key_count() -> u32 {
    MIN_PRE_KEY_COUNT
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            trust_policy: TrustPolicy::default(),
            injection_chunk_size: default_injection_chunk_size(),
            initial_pre_key_count: default_initial_pre_key_count(),
            min_pre_key_count: default_min_pre_key_count(),
            store: StoreConfig::default(),
        }
    }
}

impl SignalConfig {
    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        let config: SignalConfig = toml::from_str(s)?;
        if config.injection_chunk_size == 0 {
            anyhow::bail!("injection_chunk_size must be at least 1");
        }
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
        Self::from_toml_str(&contents)
    }
}
