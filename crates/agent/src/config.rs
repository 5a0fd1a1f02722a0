//! Agent configuration and connection-info loading.
//!
//! Config and connection-info files are sensitive (the latter embeds store
//! credentials), so loading refuses anything that is not mode 0600 and owned
//! by the process owner. JSON and YAML are dispatched on the file name.

use std::os::unix::fs::MetadataExt;
use std::path::Path;

use nix::unistd::geteuid;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Environment variable overriding the config file path.
pub const CONFIG_PATH_ENV: &str = "CATTLE_AGENT_CONFIG";
/// Environment variable selecting the log level.
pub const LOG_LEVEL_ENV: &str = "CATTLE_LOGLEVEL";
/// Environment variable enabling strict TLS verification for the remote
/// watcher.
pub const STRICT_VERIFY_ENV: &str = "CATTLE_AGENT_STRICT_VERIFY";

/// Config file used when `CATTLE_AGENT_CONFIG` is not set.
pub const DEFAULT_CONFIG_FILE: &str = "/etc/sentinel/agent/config.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("empty file path passed")]
    EmptyPath,
    #[error("configuration file not found: {0}")]
    NotFound(String),
    #[error("error gathering file information for {path}: {source}")]
    Stat {
        path: String,
        source: std::io::Error,
    },
    #[error("file {path} had permission {mode:#o} which was not expected 0600")]
    BadMode { path: String, mode: u32 },
    #[error("file {path} was not owned by the process owner (uid {expected})")]
    BadOwner { path: String, expected: u32 },
    #[error("file {0} was not a JSON or YAML file")]
    UnknownFormat(String),
    #[error("error reading {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("error parsing {path}: {message}")]
    Parse { path: String, message: String },
    #[error("neither local nor remote watching is enabled")]
    NothingEnabled,
    #[error("remote watching is enabled but connection info file not specified")]
    ConnectionInfoFileMissing,
    #[error("local watching is enabled but local plan directory not specified")]
    LocalPlanDirectoryMissing,
    #[error("work directory not specified")]
    WorkDirectoryMissing,
}

/// Recognised agent options; see the option table in the operator docs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
    #[serde(rename = "workDirectory")]
    pub work_dir: String,
    pub local_enabled: bool,
    #[serde(rename = "localPlanDirectory")]
    pub local_plan_dir: String,
    #[serde(rename = "appliedPlanDirectory")]
    pub applied_plan_dir: String,
    pub remote_enabled: bool,
    pub connection_info_file: String,
    #[serde(rename = "preserveWorkDirectory")]
    pub preserve_work_dir: bool,
    #[serde(rename = "interlockDirectory")]
    pub interlock_dir: String,
    #[serde(rename = "imagesDirectory")]
    pub images_dir: String,
    pub agent_registries_file: String,
    pub image_credential_provider_config: String,
    #[serde(rename = "imageCredentialProviderBinDirectory")]
    pub image_credential_provider_bin_dir: String,
}

impl AgentConfig {
    /// Startup validation: at least one plan source, and each enabled
    /// source fully specified.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.work_dir.is_empty() {
            return Err(ConfigError::WorkDirectoryMissing);
        }
        if !self.local_enabled && !self.remote_enabled {
            return Err(ConfigError::NothingEnabled);
        }
        if self.remote_enabled && self.connection_info_file.is_empty() {
            return Err(ConfigError::ConnectionInfoFileMissing);
        }
        if self.local_enabled && self.local_plan_dir.is_empty() {
            return Err(ConfigError::LocalPlanDirectoryMissing);
        }
        Ok(())
    }
}

/// Load and decode a config-class file after the mode/ownership checks.
pub fn parse<T: DeserializeOwned>(path: &str) -> Result<T, ConfigError> {
    if path.is_empty() {
        return Err(ConfigError::EmptyPath);
    }
    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
            return Err(ConfigError::NotFound(path.to_string()))
        }
        Err(source) => {
            return Err(ConfigError::Stat {
                path: path.to_string(),
                source,
            })
        }
    };

    let mode = metadata.mode() & 0o777;
    if mode != 0o600 {
        return Err(ConfigError::BadMode {
            path: path.to_string(),
            mode,
        });
    }
    let expected = geteuid().as_raw();
    if metadata.uid() != expected {
        return Err(ConfigError::BadOwner {
            path: path.to_string(),
            expected,
        });
    }

    let raw = std::fs::read(path).map_err(|source| ConfigError::Read {
        path: path.to_string(),
        source,
    })?;

    let name = Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let parse_err = |message: String| ConfigError::Parse {
        path: path.to_string(),
        message,
    };
    if name.contains(".json") {
        serde_json::from_slice(&raw).map_err(|e| parse_err(e.to_string()))
    } else if name.contains(".yaml") || name.contains(".yml") {
        serde_yaml::from_slice(&raw).map_err(|e| parse_err(e.to_string()))
    } else {
        Err(ConfigError::UnknownFormat(name))
    }
}
