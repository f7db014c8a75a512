// src/config.rs
// Configuration file management

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ClientError, Result};

/// Client configuration, loaded from a TOML file.
///
/// Unknown keys are ignored; missing keys make the load fail with a
/// `ConfigError` naming the field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub session_credentials_db_file_path: PathBuf,
    pub container_credentials_db_file_path: PathBuf,
    pub access_token_db_file_path: PathBuf,
    pub public_rsa_key_file_path: PathBuf,
    pub private_rsa_key_file_path: PathBuf,
    pub enable_onetime_rsa_keys: bool,
}

impl Config {
    /// `~/.anweddol/config.toml`
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".anweddol")
            .join("config.toml")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ClientError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;

        toml::from_str(&raw).map_err(|e| ClientError::Config(e.to_string()))
    }

    /// Standard file layout under one base directory.
    pub fn with_base_dir(base: &Path) -> Self {
        Config {
            session_credentials_db_file_path: base.join("credentials/session_credentials.db"),
            container_credentials_db_file_path: base.join("credentials/container_credentials.db"),
            access_token_db_file_path: base.join("credentials/access_token.db"),
            public_rsa_key_file_path: base.join("rsa_keys/public_key.pem"),
            private_rsa_key_file_path: base.join("rsa_keys/private_key.pem"),
            enable_onetime_rsa_keys: false,
        }
    }
}
