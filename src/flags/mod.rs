use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

pub type SegmentKey = String;
pub type UserId = String;
pub type CountryCode = String;

pub const MAX_PERCENTAGE: u8 = 100;

// MODELS

/// Identity of a flag record: `(flag_key, environment)`, unique together.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    pub flag_key: String,
    pub environment: String,
}

impl CacheKey {
    pub fn new(flag_key: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            flag_key: flag_key.into(),
            environment: environment.into(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.environment, self.flag_key)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TargetingRules {
    pub percentage: u8,
    pub segments: BTreeSet<SegmentKey>,
    pub user_ids: BTreeSet<UserId>,
    pub excluded_user_ids: BTreeSet<UserId>,
    pub countries: BTreeSet<CountryCode>,
}

impl TargetingRules {
    /// Clamp a raw percentage coming from a store into `[0, 100]`.
    pub fn clamp_percentage(raw: i64) -> u8 {
        raw.clamp(0, MAX_PERCENTAGE as i64) as u8
    }

    /// Ingestion-time cleanup: clamps the percentage and upper-cases country codes
    /// so evaluation never has to re-validate them.
    pub fn normalize(&mut self) {
        self.percentage = self.percentage.min(MAX_PERCENTAGE);
        self.countries = std::mem::take(&mut self.countries)
            .into_iter()
            .map(|c| c.to_ascii_uppercase())
            .collect();
    }
}

/// Explicit per-user decision, optionally time boxed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Override {
    pub value: bool,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Override {
    pub fn permanent(value: bool) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    pub fn until(value: bool, expires_at: DateTime<Utc>) -> Self {
        Self {
            value,
            expires_at: Some(expires_at),
        }
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => now < expires_at,
            None => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagRecord {
    pub flag_key: String,
    pub environment: String,
    /// Coarse kill switch.
    pub enabled: bool,
    pub default_value: bool,
    #[serde(default)]
    pub targeting_rules: TargetingRules,
    #[serde(default)]
    pub overrides: BTreeMap<UserId, Override>,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl FlagRecord {
    /// A fresh, disabled record at version 1.
    pub fn new(flag_key: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            flag_key: flag_key.into(),
            environment: environment.into(),
            enabled: false,
            default_value: false,
            targeting_rules: TargetingRules::default(),
            overrides: BTreeMap::new(),
            version: 1,
            updated_at: Utc::now(),
        }
    }

    pub fn key(&self) -> CacheKey {
        CacheKey::new(self.flag_key.clone(), self.environment.clone())
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_default_value(mut self, default_value: bool) -> Self {
        self.default_value = default_value;
        self
    }

    pub fn with_rules(mut self, rules: TargetingRules) -> Self {
        self.targeting_rules = rules;
        self
    }

    pub fn with_override(mut self, user_id: impl Into<UserId>, value: Override) -> Self {
        self.overrides.insert(user_id.into(), value);
        self
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }
}

// HELPER FUNCTIONS

const MAX_KEY_LEN: usize = 64;

fn validate_key(kind: &str, key: &str) -> Result<(), String> {
    if key.is_empty() {
        return Err(format!("{} cannot be empty", kind));
    }

    if key.len() > MAX_KEY_LEN {
        return Err(format!("{} is too long (Max: {} characters)", kind, MAX_KEY_LEN));
    }

    if !key.starts_with(|c: char| c.is_ascii_alphabetic()) {
        return Err(format!("{} must start with a letter", kind));
    }

    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
    {
        return Err(format!(
            "{} can only contain ASCII letters, numbers, underscores, hyphens and dots",
            kind
        ));
    }

    Ok(())
}

/// Validate a flag key at ingestion. Keys are case-sensitive.
pub fn validate_flag_key(key: &str) -> Result<(), String> {
    validate_key("Flag key", key)
}

/// Validate an environment key at ingestion. Keys are case-sensitive.
pub fn validate_environment_key(key: &str) -> Result<(), String> {
    validate_key("Environment key", key)
}
