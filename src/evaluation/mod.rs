pub mod bucket;
pub mod matcher;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;

use crate::error::EvaluationError;
use crate::flags::{CountryCode, FlagRecord, SegmentKey, UserId};

pub use bucket::{bucket_index, in_bucket};
pub use matcher::matches;

const MAX_USER_ID_LEN: usize = 256;

// Request context for evaluation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationContext {
    pub user_id: Option<UserId>,
    pub country: Option<CountryCode>,
    #[serde(default)]
    pub segments: BTreeSet<SegmentKey>,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl EvaluationContext {
    pub fn for_user(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Default::default()
        }
    }

    pub fn with_country(mut self, country: impl Into<CountryCode>) -> Self {
        self.country = Some(country.into().to_ascii_uppercase());
        self
    }

    pub fn with_segment(mut self, segment: impl Into<SegmentKey>) -> Self {
        self.segments.insert(segment.into());
        self
    }

    /// Parse a context at the API boundary.
    ///
    /// Accepts `userId`/`user_id`, `country`, `segments` and `attributes`. Anything with
    /// the wrong JSON type is rejected as `InvalidContext` rather than silently dropped,
    /// so callers can tell a malformed request apart from a flag that is off.
    pub fn from_json(value: &Value) -> Result<Self, EvaluationError> {
        let object = match value {
            Value::Null => return Ok(Self::default()),
            Value::Object(object) => object,
            _ => return Err(EvaluationError::invalid_context("context must be a JSON object")),
        };

        let user_id = match object.get("userId").or_else(|| object.get("user_id")) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(_) => return Err(EvaluationError::invalid_context("userId must be a string")),
        };

        let country = match object.get("country") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.to_ascii_uppercase()),
            Some(_) => return Err(EvaluationError::invalid_context("country must be a string")),
        };

        let mut segments = BTreeSet::new();
        match object.get("segments") {
            None | Some(Value::Null) => {}
            Some(Value::Array(items)) => {
                for item in items {
                    match item {
                        Value::String(s) => {
                            segments.insert(s.clone());
                        }
                        _ => {
                            return Err(EvaluationError::invalid_context(
                                "segments must be an array of strings",
                            ))
                        }
                    }
                }
            }
            Some(_) => {
                return Err(EvaluationError::invalid_context(
                    "segments must be an array of strings",
                ))
            }
        }

        let mut attributes = HashMap::new();
        match object.get("attributes") {
            None | Some(Value::Null) => {}
            Some(Value::Object(map)) => {
                for (name, value) in map {
                    match value {
                        Value::String(s) => {
                            attributes.insert(name.clone(), s.clone());
                        }
                        _ => {
                            return Err(EvaluationError::invalid_context(format!(
                                "attribute '{}' must be a string",
                                name
                            )))
                        }
                    }
                }
            }
            Some(_) => {
                return Err(EvaluationError::invalid_context("attributes must be an object"))
            }
        }

        let context = Self {
            user_id,
            country,
            segments,
            attributes,
        };
        context.validate()?;
        Ok(context)
    }

    /// Check a typed context before it reaches the rule matcher.
    pub fn validate(&self) -> Result<(), EvaluationError> {
        if let Some(user_id) = &self.user_id {
            if user_id.is_empty() {
                return Err(EvaluationError::invalid_context("userId cannot be empty"));
            }
            if user_id.len() > MAX_USER_ID_LEN {
                return Err(EvaluationError::invalid_context(format!(
                    "userId is too long (Max: {} bytes)",
                    MAX_USER_ID_LEN
                )));
            }
            if user_id.chars().any(char::is_control) {
                return Err(EvaluationError::invalid_context(
                    "userId cannot contain control characters",
                ));
            }
        }

        if let Some(country) = &self.country {
            if country.len() != 2 || !country.chars().all(|c| c.is_ascii_uppercase()) {
                return Err(EvaluationError::invalid_context(format!(
                    "country '{}' is not an upper-case two letter code",
                    country
                )));
            }
        }

        if self.segments.iter().any(|s| s.is_empty()) {
            return Err(EvaluationError::invalid_context("segment keys cannot be empty"));
        }

        Ok(())
    }
}

/// Why a decision came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Reason {
    UserOverride,
    FlagDisabled,
    SegmentMatch,
    PercentageRollout,
    Default,
    FlagNotFound,
    StoreUnavailable,
}

impl Reason {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::UserOverride => "user-override",
            Self::FlagDisabled => "flag-disabled",
            Self::SegmentMatch => "segment-match",
            Self::PercentageRollout => "percentage-rollout",
            Self::Default => "default",
            Self::FlagNotFound => "flag-not-found",
            Self::StoreUnavailable => "store-unavailable",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Flag evaluation result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub enabled: bool,
    pub reason: Reason,
}

impl Decision {
    pub const fn new(enabled: bool, reason: Reason) -> Self {
        Self { enabled, reason }
    }

    /// Unknown or tombstoned flag.
    pub const fn not_found() -> Self {
        Self::new(false, Reason::FlagNotFound)
    }

    /// Fail-closed answer when no tier can produce a record.
    pub const fn store_unavailable() -> Self {
        Self::new(false, Reason::StoreUnavailable)
    }
}

/// Evaluate a resolved record for one request. First match wins:
/// override, kill switch, rule match, percentage rollout, default.
pub fn evaluate_record(
    record: &FlagRecord,
    context: &EvaluationContext,
    now: DateTime<Utc>,
) -> Decision {
    // Step 1: a live override wins even over a disabled flag
    if let Some(user_id) = context.user_id.as_deref() {
        if let Some(o) = record.overrides.get(user_id) {
            if o.is_active(now) {
                return Decision::new(o.value, Reason::UserOverride);
            }
        }
    }

    // Step 2: kill switch
    if !record.enabled {
        return Decision::new(record.default_value, Reason::FlagDisabled);
    }

    let rules = &record.targeting_rules;

    // Excluded users skip every targeting tier
    if !matcher::is_excluded(rules, context) {
        // Step 3: user id, segment or country rules
        if matches(rules, context) {
            return Decision::new(record.enabled, Reason::SegmentMatch);
        }

        // Step 4: percentage rollout
        if in_bucket(
            &record.flag_key,
            context.user_id.as_deref(),
            rules.percentage,
        ) {
            return Decision::new(record.enabled, Reason::PercentageRollout);
        }
    }

    // Step 5: default
    Decision::new(record.default_value, Reason::Default)
}
