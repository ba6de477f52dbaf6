//! Application configuration management.
//!
//! This module handles loading and saving the client configuration, which
//! includes the backend base URL and the last used email and role.
//!
//! Configuration is stored at `~/.config/classdesk/config.json`. The
//! `CLASSDESK_API_URL` environment variable overrides the stored base URL.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::models::Role;

/// Application name used for config/data directory paths
const APP_NAME: &str = "classdesk";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Environment variable selecting the backend host
pub const API_URL_ENV: &str = "CLASSDESK_API_URL";

/// Backend used when nothing else is configured
pub const DEFAULT_API_URL: &str = "http://localhost:8000";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub api_base_url: Option<String>,
    pub last_email: Option<String>,
    pub last_role: Option<Role>,
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Backend base URL: environment, then config file, then the local default.
    pub fn base_url(&self) -> String {
        Self::resolve_base_url(std::env::var(API_URL_ENV).ok(), self.api_base_url.as_deref())
    }

    fn resolve_base_url(env: Option<String>, stored: Option<&str>) -> String {
        env.as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .or_else(|| stored.map(str::trim).filter(|url| !url.is_empty()))
            .unwrap_or(DEFAULT_API_URL)
            .trim_end_matches('/')
            .to_string()
    }

    /// Directory holding the session record, cookies and logs.
    pub fn data_dir(&self) -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    pub fn log_dir(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join("logs"))
    }
}
