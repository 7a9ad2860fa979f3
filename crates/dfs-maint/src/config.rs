use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{MaintError, Result};

/// Settings shared by every maintenance command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintConfig {
    pub hdfs_bin: String,
    pub klist_bin: String,
    pub hostname_bin: String,
    /// Upper bound for any single collaborator call.
    pub command_timeout_ms: u64,
    /// Skips `dfs.nameservices` discovery when set.
    pub nameservice: Option<String>,
    /// Skips local FQDN discovery when set.
    pub local_hostname: Option<String>,
    pub require_ticket: bool,
    pub cleanup_age_secs: u64,
    pub verify_deletes: bool,
    /// Regexes appended to the built-in protection rules.
    pub extra_protected_patterns: Vec<String>,
    pub home_prefix: String,
    /// Exclusive lower bound of provisioned uids.
    pub min_uid: u32,
    /// Exclusive upper bound of provisioned uids.
    pub max_uid: u32,
    pub passwd_file: PathBuf,
}

impl Default for MaintConfig {
    fn default() -> Self {
        Self {
            hdfs_bin: String::from("hdfs"),
            klist_bin: String::from("klist"),
            hostname_bin: String::from("hostname"),
            command_timeout_ms: 30_000,
            nameservice: None,
            local_hostname: None,
            require_ticket: true,
            cleanup_age_secs: 2 * 86_400,
            verify_deletes: true,
            extra_protected_patterns: Vec::new(),
            home_prefix: String::from("/user"),
            min_uid: 500,
            max_uid: 65_534,
            passwd_file: PathBuf::from("/etc/passwd"),
        }
    }
}

impl MaintConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: MaintConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)
                .map_err(|e| MaintError::Configuration(format!("{}: {}", path.display(), e)))?,
            "json" => serde_json::from_str(&contents)
                .map_err(|e| MaintError::Configuration(format!("{}: {}", path.display(), e)))?,
            _ => {
                return Err(MaintError::Configuration(format!(
                    "unsupported config file extension: {}",
                    ext
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Reads `path` if it exists, otherwise falls back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            tracing::warn!("Config file not found, using defaults: {}", path.display());
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_uid >= self.max_uid {
            return Err(MaintError::Configuration(format!(
                "min_uid {} must be below max_uid {}",
                self.min_uid, self.max_uid
            )));
        }
        if !self.home_prefix.starts_with('/') {
            return Err(MaintError::Configuration(format!(
                "home_prefix must be absolute: {}",
                self.home_prefix
            )));
        }
        age_from_secs(self.cleanup_age_secs)?;
        if self.command_timeout_ms == 0 {
            return Err(MaintError::Configuration(
                "command_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.command_timeout_ms)
    }
}

/// Converts a retention age in seconds, rejecting values chrono cannot hold.
pub fn age_from_secs(secs: u64) -> Result<chrono::Duration> {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .ok_or_else(|| MaintError::Configuration(format!("cleanup age {}s out of range", secs)))
}
