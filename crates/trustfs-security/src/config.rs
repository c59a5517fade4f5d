//! Security engine configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::keys::ServerKeyType;

/// Tunables for the security engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Directory holding server key files.
    pub key_file_dir: PathBuf,
    /// Directory holding per-user ticket files.
    pub ticket_file_dir: PathBuf,
    /// Suffix of the default ticket file name (`maprticket_<suffix>`). Empty
    /// means the process uid.
    pub ticket_file_suffix: String,
    /// Payloads of at least this many bytes are processed on a compression lane.
    pub offload_threshold: usize,
    /// Number of compression lanes used for offloaded crypto, 1..=3.
    pub crypto_lanes: usize,
    /// Encryptions per thread before the IV base is reseeded.
    pub iv_refresh_interval: u64,
    /// Number of server key type slots.
    pub max_key_types: usize,
    /// zstd level used for `CompressionType::Zstd`.
    pub compression_level: i32,
    /// Group treated as cluster administrators.
    pub admin_gid: u32,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            key_file_dir: PathBuf::from("/opt/mapr/conf"),
            ticket_file_dir: std::env::temp_dir(),
            ticket_file_suffix: String::new(),
            offload_threshold: crate::compression::MIN_LEN_FOR_CTX_SWITCH,
            crypto_lanes: 3,
            iv_refresh_interval: 1 << 20,
            max_key_types: 8,
            compression_level: 3,
            admin_gid: 0,
        }
    }
}

impl SecurityConfig {
    /// Loads a config from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: SecurityConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Default key file of `key_type`: `<key_file_dir>/<name>.key`.
    pub fn key_file_path(&self, key_type: ServerKeyType) -> PathBuf {
        self.key_file_dir.join(format!("{}.key", key_type.name()))
    }

    /// Checks value ranges.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.crypto_lanes == 0 || self.crypto_lanes > trustfs_dispatch::CpuQid::compress_lane_count() {
            anyhow::bail!("crypto_lanes must be between 1 and 3, got {}", self.crypto_lanes);
        }
        if self.max_key_types == 0 {
            anyhow::bail!("max_key_types must be positive");
        }
        if self.iv_refresh_interval == 0 {
            anyhow::bail!("iv_refresh_interval must be positive");
        }
        Ok(())
    }
}
