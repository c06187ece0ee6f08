//! Reconciler configuration.
//!
//! Loaded from a TOML file; every field has a default so an empty file is a
//! valid configuration.

use lb_compute::{ApiVersion, KeyScope};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardingConfig {
    /// Use up to five discrete ports per rule instead of a port range.
    #[serde(default)]
    pub discrete_port_forwarding: bool,

    #[serde(default)]
    pub api_version: ApiVersion,

    #[serde(default)]
    pub scope: KeyScope,

    #[serde(default = "default_project")]
    pub project: String,

    #[serde(default = "default_region")]
    pub region: String,

    /// Cluster UID, part of every rule name.
    #[serde(default = "default_cluster_uid")]
    pub cluster_uid: String,

    /// Network URL used by internal rules.
    #[serde(default)]
    pub network: String,

    /// Default subnetwork URL used by internal rules.
    #[serde(default)]
    pub subnetwork: String,

    /// Deadline for a single compute API call, in seconds.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
}

fn default_project() -> String {
    "default-project".to_string()
}

fn default_region() -> String {
    "us-central1".to_string()
}

fn default_cluster_uid() -> String {
    "cluster".to_string()
}

fn default_call_timeout() -> u64 {
    30
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            discrete_port_forwarding: false,
            api_version: ApiVersion::default(),
            scope: KeyScope::default(),
            project: default_project(),
            region: default_region(),
            cluster_uid: default_cluster_uid(),
            network: String::new(),
            subnetwork: String::new(),
            call_timeout_secs: default_call_timeout(),
        }
    }
}

impl ForwardingConfig {
    /// Loads and validates the configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.call_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "call_timeout_secs must be > 0".to_string(),
            ));
        }
        if self.scope == KeyScope::Regional && self.region.is_empty() {
            return Err(ConfigError::Invalid(
                "region is required for regional scope".to_string(),
            ));
        }
        if self.cluster_uid.is_empty() {
            return Err(ConfigError::Invalid("cluster_uid must not be empty".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ForwardingConfig::default();
        assert!(!config.discrete_port_forwarding);
        assert_eq!(config.api_version, ApiVersion::Ga);
        assert_eq!(config.scope, KeyScope::Regional);
        assert_eq!(config.call_timeout(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_file_is_default() {
        assert_eq!(
            ForwardingConfig::from_toml_str("").unwrap(),
            ForwardingConfig::default()
        );
    }

    #[test]
    fn test_toml_deserialization() {
        let config = ForwardingConfig::from_toml_str(
            r#"
discrete_port_forwarding = true
api_version = "beta"
scope = "global"
region = ""
call_timeout_secs = 5
"#,
        )
        .unwrap();
        assert!(config.discrete_port_forwarding);
        assert_eq!(config.api_version, ApiVersion::Beta);
        assert_eq!(config.scope, KeyScope::Global);
        assert_eq!(config.call_timeout(), Duration::from_secs(5));
        // Unspecified values use defaults
        assert_eq!(config.cluster_uid, "cluster");
    }

    #[test]
    fn test_validate_rejects() {
        assert!(ForwardingConfig::from_toml_str("call_timeout_secs = 0").is_err());
        assert!(ForwardingConfig::from_toml_str("region = \"\"").is_err());
        assert!(matches!(
            ForwardingConfig::from_toml_str("api_version = \"gamma\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "discrete_port_forwarding = true").unwrap();
        writeln!(file, "cluster_uid = \"abc123\"").unwrap();
        let config = ForwardingConfig::load(file.path()).unwrap();
        assert!(config.discrete_port_forwarding);
        assert_eq!(config.cluster_uid, "abc123");
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = ForwardingConfig::load(dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_toml_roundtrip_keys() {
        let toml_str = toml::to_string(&ForwardingConfig::default()).unwrap();
        assert!(toml_str.contains("discrete_port_forwarding = false"));
        assert!(toml_str.contains("api_version = \"ga\""));
    }
}
