//! Service configuration handling

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),
    #[error("Home directory not found")]
    NoHomeDir,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to the wrapped VPN client binary
    pub client_binary: PathBuf,
    /// Profile store location
    pub profiles_file: PathBuf,
    /// IPC socket the service listens on
    pub socket_path: PathBuf,
    /// Command invoked with the login URL to run the automated browser.
    /// It must print the authentication cookie on stdout.
    pub browser_command: Vec<String>,
    /// Maximum time to wait for the SSO login to complete
    pub auth_timeout_secs: u64,
    /// Grace period for the client to exit before it is force-killed
    pub stop_grace_secs: u64,
    /// Physical interface that exclude routes are pinned to
    pub physical_interface: String,
    /// Directory for the recovery state file
    pub state_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let base = app_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            client_binary: PathBuf::from("openconnect"),
            profiles_file: base.join("profiles.toml"),
            socket_path: base.join("service.sock"),
            browser_command: vec!["saml-vpn-browser".to_string()],
            auth_timeout_secs: 120,
            stop_grace_secs: 3,
            physical_interface: "eth0".to_string(),
            state_dir: base,
        }
    }
}

impl Config {
    pub fn load(path: &PathBuf) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, path: &PathBuf) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Default config file location (`~/.saml-vpn/config.toml`)
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        Ok(app_dir()?.join("config.toml"))
    }
}

/// Per-user application directory (`~/.saml-vpn`)
pub fn app_dir() -> Result<PathBuf, ConfigError> {
    let home = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
    Ok(home.join(".saml-vpn"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.client_binary, PathBuf::from("openconnect"));
        assert_eq!(config.auth_timeout_secs, 120);
        assert_eq!(config.stop_grace_secs, 3);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.client_binary = PathBuf::from("/opt/openconnect/openconnect");
        config.auth_timeout_secs = 60;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(
            loaded.client_binary,
            PathBuf::from("/opt/openconnect/openconnect")
        );
        assert_eq!(loaded.auth_timeout_secs, 60);
    }

    #[test]
    fn test_load_missing_file_errors() {
        let path = PathBuf::from("/nonexistent/saml-vpn/config.toml");
        assert!(matches!(Config::load(&path), Err(ConfigError::ReadError(_))));
    }
}
