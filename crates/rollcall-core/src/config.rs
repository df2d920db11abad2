//! Application configuration management.
//!
//! This module handles loading and saving the application configuration:
//! the backend URL, which company and employee the session belongs to, and
//! the cache tuning knobs.
//!
//! Configuration is stored at `~/.config/rollcall/config.json`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::cache::{CacheOptions, SessionContext, DEFAULT_TTL_DAYS};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "rollcall";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const DEFAULT_HISTORY_COOLDOWN_MS: u64 = 2000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: Option<String>,
    pub company: Option<String>,
    pub employee: Option<String>,
    /// Overrides the platform cache directory
    pub cache_dir: Option<PathBuf>,
    pub cache_ttl_days: i64,
    pub history_cooldown_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: None,
            company: None,
            employee: None,
            cache_dir: None,
            cache_ttl_days: DEFAULT_TTL_DAYS,
            history_cooldown_ms: DEFAULT_HISTORY_COOLDOWN_MS,
        }
    }
}

/// A company name must stay a single directory below the cache root.
fn company_dir_name(company: &str) -> Result<&str> {
    let escapes = company.is_empty()
        || company == "."
        || company == ".."
        || company.contains(|c: char| matches!(c, '/' | '\\' | '\0'));
    if escapes {
        anyhow::bail!("Company {:?} cannot be used as a cache directory name", company);
    }
    Ok(company)
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Read a config file, falling back to defaults when it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config: {}", path.display()))
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Per-company cache directory, so switching companies never mixes data.
    pub fn cache_dir(&self) -> Result<PathBuf> {
        let mut path = match self.cache_dir {
            Some(ref dir) => dir.clone(),
            None => dirs::cache_dir()
                .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?
                .join(APP_NAME),
        };
        if let Some(ref company) = self.company {
            path = path.join(company_dir_name(company)?);
        }
        Ok(path)
    }

    pub fn session(&self) -> Result<SessionContext> {
        let company = self
            .company
            .clone()
            .context("No company configured (set \"company\" in config or pass --company)")?;
        let employee = self
            .employee
            .clone()
            .context("No employee configured (set \"employee\" in config or pass --employee)")?;
        Ok(SessionContext::new(company, employee))
    }

    pub fn cache_options(&self) -> CacheOptions {
        CacheOptions {
            ttl: chrono::Duration::days(self.cache_ttl_days),
            history_cooldown: Duration::from_millis(self.history_cooldown_ms),
        }
    }
}
