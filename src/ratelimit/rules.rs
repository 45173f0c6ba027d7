//! Named limit rules.
//!
//! Callers vary limits by policy or tier. Rather than hard-coding a
//! `(limit, window)` pair at every call site, a host can load a rule set and
//! acquire by rule name:
//!
//! ```yaml
//! default:
//!   requests_per_unit: 100
//!   unit: minute
//! rules:
//!   puzzle_submit:
//!     requests_per_unit: 10
//!     unit: minute
//!   chat_message:
//!     requests_per_unit: 5
//!     unit: second
//!     units: 10
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, SlidegateError};

/// A set of named limit rules with an optional fallback.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitRules {
    /// Rule applied when a name is not found
    #[serde(default)]
    pub default: Option<LimitRule>,
    /// Rules by policy or tier name
    #[serde(default)]
    pub rules: HashMap<String, LimitRule>,
}

/// A limit and the sliding window it applies over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitRule {
    /// Number of permits allowed per window
    pub requests_per_unit: u64,
    /// The time unit
    pub unit: TimeUnit,
    /// Window length in units
    #[serde(default = "default_units")]
    pub units: u32,
}

fn default_units() -> u32 {
    1
}

/// Time unit for limit rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Get the duration of one unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
        }
    }
}

impl LimitRule {
    /// Create a rule of `requests_per_unit` permits per single `unit`.
    pub fn new(requests_per_unit: u64, unit: TimeUnit) -> Self {
        Self {
            requests_per_unit,
            unit,
            units: 1,
        }
    }

    /// The sliding window this rule applies over.
    pub fn window(&self) -> Duration {
        self.unit.duration() * self.units
    }
}

impl LimitRules {
    /// Create an empty rule set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| SlidegateError::Config(format!("Failed to parse limit rules: {}", e)))
    }

    /// Add or replace a named rule.
    pub fn with_rule(mut self, name: impl Into<String>, rule: LimitRule) -> Self {
        self.rules.insert(name.into(), rule);
        self
    }

    /// Set the fallback rule.
    pub fn with_default(mut self, rule: LimitRule) -> Self {
        self.default = Some(rule);
        self
    }

    /// Find the rule for `name`, falling back to the default rule.
    pub fn find(&self, name: &str) -> Option<&LimitRule> {
        self.rules.get(name).or(self.default.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rules() {
        let yaml = r#"
default:
  requests_per_unit: 100
  unit: minute
rules:
  puzzle_submit:
    requests_per_unit: 10
    unit: minute
  chat_message:
    requests_per_unit: 5
    unit: second
    units: 10
"#;
        let rules = LimitRules::from_yaml(yaml).unwrap();
        assert_eq!(rules.rules.len(), 2);

        let submit = rules.find("puzzle_submit").unwrap();
        assert_eq!(submit.requests_per_unit, 10);
        assert_eq!(submit.window(), Duration::from_secs(60));

        let chat = rules.find("chat_message").unwrap();
        assert_eq!(chat.requests_per_unit, 5);
        assert_eq!(chat.window(), Duration::from_secs(10));
    }

    #[test]
    fn test_find_falls_back_to_default() {
        let rules = LimitRules::new().with_default(LimitRule::new(100, TimeUnit::Hour));

        let rule = rules.find("anything").unwrap();
        assert_eq!(rule.requests_per_unit, 100);
        assert_eq!(rule.window(), Duration::from_secs(3600));
    }

    #[test]
    fn test_find_no_match() {
        let rules = LimitRules::new().with_rule("a", LimitRule::new(1, TimeUnit::Second));
        assert!(rules.find("b").is_none());
    }

    #[test]
    fn test_invalid_yaml() {
        let err = LimitRules::from_yaml("rules: [not, a, map]").unwrap_err();
        assert!(matches!(err, SlidegateError::Config(_)));
    }

    #[test]
    fn test_time_unit_duration() {
        assert_eq!(TimeUnit::Second.duration(), Duration::from_secs(1));
        assert_eq!(TimeUnit::Minute.duration(), Duration::from_secs(60));
        assert_eq!(TimeUnit::Hour.duration(), Duration::from_secs(3600));
        assert_eq!(TimeUnit::Day.duration(), Duration::from_secs(86400));
    }
}
