//! Server configuration.

use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use xtrieve_common::constants::DEFAULT_PORT;
use xtrieve_common::EngineConfig;

/// Configuration for the `xtrieved` daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Directory relative wire paths resolve against.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Storage engine tunables.
    #[serde(default)]
    pub engine: EngineConfig,
}

fn default_listen() -> String {
    format!("127.0.0.1:{DEFAULT_PORT}")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            data_dir: default_data_dir(),
            engine: EngineConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Renders the configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.listen, format!("127.0.0.1:{DEFAULT_PORT}"));
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.engine.cache_pages, 1024);
    }

    #[test]
    fn test_roundtrip_through_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("xtrieved.toml");

        let mut config = ServerConfig::default();
        config.listen = "0.0.0.0:9000".to_string();
        config.engine.cache_pages = 64;
        std::fs::write(&path, config.to_toml().unwrap()).unwrap();

        let loaded = ServerConfig::from_file(&path).unwrap();
        assert_eq!(loaded.listen, "0.0.0.0:9000");
        assert_eq!(loaded.engine.cache_pages, 64);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("partial.toml");
        std::fs::write(&path, "listen = \"10.0.0.1:7000\"\n").unwrap();

        let loaded = ServerConfig::from_file(&path).unwrap();
        assert_eq!(loaded.listen, "10.0.0.1:7000");
        assert_eq!(loaded.data_dir, PathBuf::from("./data"));
    }
}
