use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

// TODO: Use keyring crate for secure token storage instead of plain JSON
// This would store tokens in the system's secure credential storage:
// - macOS: Keychain
// - Linux: Secret Service API / libsecret
// - Windows: Credential Manager

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct Config {
    pub token: Option<String>,
    pub backend_url: Option<String>,
    pub username: Option<String>,
}

impl Config {
    /// Get the path to the config file
    pub fn config_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Failed to get home directory")?;

        let config_dir = home.join(".config").join("mdk");

        // Create directory if it doesn't exist
        if !config_dir.exists() {
            fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
        }

        Ok(config_dir.join("config.json"))
    }

    /// Load configuration from disk
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        Self::read_from(&config_path)
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;
        self.write_to(&config_path)
    }

    fn read_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let contents = fs::read_to_string(path).context("Failed to read config file")?;

        let config: Config = serde_json::from_str(&contents).context("Failed to parse config file")?;

        Ok(config)
    }

    fn write_to(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, json).context("Failed to write config file")?;

        Ok(())
    }

    /// Record a fresh login session
    pub fn set_session(&mut self, token: String, username: String) -> Result<()> {
        self.token = Some(token);
        self.username = Some(username);
        self.save()
    }

    /// Forget the stored session
    pub fn clear_session(&mut self) -> Result<()> {
        self.token = None;
        self.username = None;
        self.save()
    }

    /// Get the authentication token
    pub fn get_token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Get the backend URL (with default fallback)
    pub fn get_backend_url(&self) -> String {
        self.backend_url
            .clone()
            .unwrap_or_else(|| "http://127.0.0.1:8080".to_string())
    }
}
