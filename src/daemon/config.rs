//! Configuration management for daemon mode
//!
//! Handles TOML parsing, validation, persistence and the additive merge
//! applied by `update`

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::models::{ConditionSpec, DisableMethod, PauseCondition};

/// The single authoritative policy record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Domains redirected to localhost while enforcement is active
    #[serde(default)]
    pub blocked_websites: BTreeSet<String>,
    #[serde(default)]
    pub disable_method: DisableMethod,
    /// SHA-256 of the disable password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hashed_password: Option<String>,
    /// SHA-256 of the hosts file as last written by the daemon
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hosts_sha: Option<String>,
    /// Enforcement is suspended until this local time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_until: Option<NaiveDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_condition: Option<PauseCondition>,
    /// Named validators gating the daily unblock
    #[serde(default)]
    pub conditions: BTreeMap<String, ConditionSpec>,
}

/// Custom error types for configuration validation
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid condition name '{0}': names must be non-empty, must not contain '/' and must not start with '.'")]
    InvalidConditionName(String),
    #[error("Condition '{0}' must be required on at least one weekday")]
    NoRequiredDays(String),
    #[error("A password is required to start with disable method 'password'")]
    MissingPassword,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Write configuration as pretty TOML, replacing the file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }

    /// Check condition names and weekday sets
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, spec) in &self.conditions {
            validate_condition_name(name)?;
            if spec.require_on.is_empty() {
                return Err(ConfigError::NoRequiredDays(name.clone()));
            }
        }
        Ok(())
    }

    /// Whether enforcement is suspended at `now`
    pub fn is_paused_at(&self, now: NaiveDateTime) -> bool {
        self.pause_until.is_some_and(|until| now < until)
    }

    /// Merge a user-supplied config without loosening the policy.
    ///
    /// Websites are only added. Conditions already present keep their
    /// in-memory definition; only unknown names are taken from `user`, and
    /// those start unvalidated with no internal copy. Returns the names of
    /// the newly added conditions.
    pub fn merge_additive(&mut self, user: Config) -> Vec<String> {
        self.blocked_websites.extend(user.blocked_websites);

        let mut added = Vec::new();
        for (name, mut spec) in user.conditions {
            if self.conditions.contains_key(&name) {
                continue;
            }
            spec.validated = false;
            spec.internal_script = None;
            added.push(name.clone());
            self.conditions.insert(name, spec);
        }
        added
    }

    /// Rewrite relative script paths against `base`
    pub fn absolutize_scripts(&mut self, base: &Path) {
        for spec in self.conditions.values_mut() {
            if spec.script.is_relative() {
                spec.script = base.join(&spec.script);
            }
        }
        if let Some(pause) = self.pause_condition.as_mut() {
            if pause.script.is_relative() {
                pause.script = base.join(&pause.script);
            }
        }
    }
}

/// Condition names double as file names inside the protected directory
pub fn validate_condition_name(name: &str) -> Result<(), ConfigError> {
    if name.is_empty() || name.contains('/') || name.starts_with('.') {
        return Err(ConfigError::InvalidConditionName(name.to_string()));
    }
    Ok(())
}

/// One-way digest used for the disable password
pub fn hash_password(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}
