//! Throttle policy table.
//!
//! Maps an action name to its [`ThrottleRule`]. Rules are loaded once at
//! startup, from YAML or built in code, and are read-only afterwards.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use crate::error::{ConfigError, Result};

/// Upper bound for window and lockout durations (366 days).
pub const MAX_DURATION_SECS: u64 = 366 * 24 * 60 * 60;

/// Characters reserved for storage key namespacing.
const RESERVED_CHARS: [char; 2] = [':', '|'];

/// The limit applied to a single action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleRule {
    /// Action this rule belongs to
    #[serde(skip)]
    pub action: String,
    /// Attempts allowed within one window
    pub max_attempts: u32,
    /// Window length in seconds
    pub window_seconds: u64,
    /// Punitive block once the limit is exceeded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lockout_seconds: Option<u64>,
}

impl ThrottleRule {
    /// Create a rule without lockout.
    pub fn new(action: impl Into<String>, max_attempts: u32, window_seconds: u64) -> Self {
        Self {
            action: action.into(),
            max_attempts,
            window_seconds,
            lockout_seconds: None,
        }
    }

    /// Add a lockout period to the rule.
    pub fn with_lockout(mut self, lockout_seconds: u64) -> Self {
        self.lockout_seconds = Some(lockout_seconds);
        self
    }

    /// The effective lockout period. Zero means no lockout.
    pub fn lockout(&self) -> Option<u64> {
        self.lockout_seconds.filter(|secs| *secs > 0)
    }

    /// Check the rule's invariants.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| ConfigError::InvalidRule {
            action: self.action.clone(),
            reason: reason.to_string(),
        };

        if self.action.trim().is_empty() {
            return Err(invalid("action name must not be empty"));
        }
        if self.action.contains(RESERVED_CHARS) {
            return Err(invalid("action name must not contain ':' or '|'"));
        }
        if self.max_attempts == 0 {
            return Err(invalid("max_attempts must be greater than zero"));
        }
        if self.window_seconds == 0 {
            return Err(invalid("window_seconds must be greater than zero"));
        }
        if self.window_seconds > MAX_DURATION_SECS {
            return Err(invalid("window_seconds exceeds 366 days"));
        }
        if self.lockout_seconds.is_some_and(|secs| secs > MAX_DURATION_SECS) {
            return Err(invalid("lockout_seconds exceeds 366 days"));
        }
        Ok(())
    }
}

/// Serialized form of the policy table.
///
/// ```yaml
/// actions:
///   login:
///     max_attempts: 5
///     window_seconds: 900
///   register:
///     max_attempts: 5
///     window_seconds: 3600
///     lockout_seconds: 3600
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Map of action name to rule
    #[serde(default)]
    pub actions: HashMap<String, ThrottleRule>,
}

impl PolicyConfig {
    /// Whether no actions are configured.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// Read-only registry of throttle rules keyed by action name.
#[derive(Debug, Clone, Default)]
pub struct PolicyTable {
    rules: HashMap<String, ThrottleRule>,
}

impl PolicyTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rules for the platform's sensitive endpoints.
    pub fn defaults() -> Self {
        let mut table = Self::new();
        for rule in default_rules() {
            // Built-in rules are known to be valid and unique.
            table.rules.insert(rule.action.clone(), rule);
        }
        table
    }

    /// Register a rule, rejecting duplicates and invalid rules.
    pub fn register(&mut self, rule: ThrottleRule) -> Result<()> {
        rule.validate()?;
        if self.rules.contains_key(&rule.action) {
            return Err(ConfigError::DuplicateAction(rule.action));
        }
        self.rules.insert(rule.action.clone(), rule);
        Ok(())
    }

    /// Builder-style [`register`](Self::register).
    pub fn with_rule(mut self, rule: ThrottleRule) -> Result<Self> {
        self.register(rule)?;
        Ok(self)
    }

    /// Build a table from its serialized form.
    pub fn from_config(config: PolicyConfig) -> Result<Self> {
        let mut table = Self::new();
        for (action, mut rule) in config.actions {
            rule.action = action;
            table.register(rule)?;
        }
        Ok(table)
    }

    /// Load the table from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading throttle policies");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load the table from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: PolicyConfig = serde_yaml::from_str(yaml)
            .map_err(|e| ConfigError::Parse(format!("Failed to parse throttle policies: {}", e)))?;
        Self::from_config(config)
    }

    /// Look up the rule for an action.
    pub fn get_rule(&self, action: &str) -> Result<&ThrottleRule> {
        self.rules
            .get(action)
            .ok_or_else(|| ConfigError::UnknownAction(action.to_string()))
    }

    /// Whether an action is registered.
    pub fn contains(&self, action: &str) -> bool {
        self.rules.contains_key(action)
    }

    /// Registered action names, sorted.
    pub fn actions(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.rules.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of registered rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Serialized form of the table.
    pub fn to_config(&self) -> PolicyConfig {
        PolicyConfig {
            actions: self.rules.clone(),
        }
    }
}

fn default_rules() -> Vec<ThrottleRule> {
    vec![
        ThrottleRule::new("register", 5, 3600).with_lockout(3600),
        ThrottleRule::new("login", 5, 900),
        ThrottleRule::new("verification", 5, 900),
        ThrottleRule::new("resendEmail", 3, 3600),
        ThrottleRule::new("twoFactor", 5, 300).with_lockout(900),
    ]
}
