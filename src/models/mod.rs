//! Data models module
//!
//! Defines the policy building blocks shared by the daemon and the client:
//! - ConditionSpec: a named validator gating the daily unblock
//! - PauseCondition: the validator gating a multi-day pause
//! - Weekday: the days a condition is required on
//! - DisableMethod: how a genuine shutdown is authorized

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::constants::DEFAULT_MAX_PAUSE_DAYS;

/// Day of week as written in config files (`mon` .. `sun`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Weekday {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

impl Weekday {
    pub const ALL: [Weekday; 7] = [
        Weekday::Mon,
        Weekday::Tue,
        Weekday::Wed,
        Weekday::Thu,
        Weekday::Fri,
        Weekday::Sat,
        Weekday::Sun,
    ];
}

impl From<chrono::Weekday> for Weekday {
    fn from(day: chrono::Weekday) -> Self {
        match day {
            chrono::Weekday::Mon => Weekday::Mon,
            chrono::Weekday::Tue => Weekday::Tue,
            chrono::Weekday::Wed => Weekday::Wed,
            chrono::Weekday::Thu => Weekday::Thu,
            chrono::Weekday::Fri => Weekday::Fri,
            chrono::Weekday::Sat => Weekday::Sat,
            chrono::Weekday::Sun => Weekday::Sun,
        }
    }
}

/// Sanctioned way of turning the daemon off
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisableMethod {
    #[default]
    Password,
}

/// Per-condition pause settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionPause {
    /// Longest pause this condition may grant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pause_days: Option<u32>,
    /// Arguments passed to the condition's script when validating a pause
    #[serde(default)]
    pub pause_args: Vec<String>,
}

impl ConditionPause {
    pub fn max_days(&self) -> u32 {
        self.max_pause_days.unwrap_or(DEFAULT_MAX_PAUSE_DAYS)
    }
}

/// A named external validator gating whether blocking is lifted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionSpec {
    /// Script the operator supplied; only read when no in-memory copy exists
    pub script: PathBuf,
    /// Arguments passed on every invocation
    #[serde(default)]
    pub args: Vec<String>,
    /// Weekdays on which the condition must be met
    pub require_on: Vec<Weekday>,
    /// Outcome of the last evaluation; false until the script first succeeds
    #[serde(default)]
    pub validated: bool,
    /// Protected copy regenerated from memory every persistence cycle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_script: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause: Option<ConditionPause>,
}

impl ConditionSpec {
    pub fn new(script: impl Into<PathBuf>, require_on: Vec<Weekday>) -> Self {
        Self {
            script: script.into(),
            args: Vec::new(),
            require_on,
            validated: false,
            internal_script: None,
            pause: None,
        }
    }

    pub fn is_required_on(&self, day: Weekday) -> bool {
        self.require_on.contains(&day)
    }

    /// Path the script should be executed from
    pub fn executable_path(&self) -> &PathBuf {
        self.internal_script.as_ref().unwrap_or(&self.script)
    }
}

/// Validator gating a multi-day pause
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PauseCondition {
    pub script: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pause_days: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_script: Option<PathBuf>,
}

impl PauseCondition {
    pub fn max_days(&self) -> u32 {
        self.max_pause_days.unwrap_or(DEFAULT_MAX_PAUSE_DAYS)
    }

    pub fn executable_path(&self) -> &PathBuf {
        self.internal_script.as_ref().unwrap_or(&self.script)
    }
}

#[cfg(test)]
mod tests;
