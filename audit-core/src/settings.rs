//! Runtime-tunable settings.
//!
//! Retention and user exclusion are operator knobs that must take effect
//! without a restart, so they are read through a `SettingsSource` on every
//! capture / cleanup run instead of being baked into the config file.

use std::collections::HashSet;

use async_trait::async_trait;

pub const RETENTION_DAYS_KEY: &str = "retention_days";
pub const EXCLUDED_USERS_KEY: &str = "excluded_users";

const DEFAULT_RETENTION_DAYS: i64 = 7;
const MIN_RETENTION_DAYS: i64 = 1;
const MAX_RETENTION_DAYS: i64 = 365;

#[async_trait]
pub trait SettingsSource: Send + Sync {
    /// Fetch one setting by key. `Ok(None)` means unset.
    async fn get_value(&self, key: &str) -> anyhow::Result<Option<String>>;
}

/// Retention window in days, clamped to [1, 365]. Unset, unreadable, or
/// unparsable values all fall back to the 7-day default — cleanup must never
/// stall on a bad knob.
pub async fn retention_days(source: &dyn SettingsSource) -> i64 {
    let raw = match source.get_value(RETENTION_DAYS_KEY).await {
        Ok(Some(v)) => v,
        Ok(None) => return DEFAULT_RETENTION_DAYS,
        Err(err) => {
            tracing::warn!("failed to read retention setting: {err:#}");
            return DEFAULT_RETENTION_DAYS;
        }
    };
    match raw.trim().parse::<i64>() {
        Ok(days) => days.clamp(MIN_RETENTION_DAYS, MAX_RETENTION_DAYS),
        Err(_) => DEFAULT_RETENTION_DAYS,
    }
}

/// Parsed exclusion list: numeric tokens match user ids, everything else
/// matches emails case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct ExcludedUsers {
    ids: HashSet<i64>,
    emails: HashSet<String>,
}

impl ExcludedUsers {
    pub fn parse(raw: &str) -> Self {
        let mut out = Self::default();
        for token in raw.split(|c: char| c == ',' || c.is_whitespace()) {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            match token.parse::<i64>() {
                Ok(id) => {
                    out.ids.insert(id);
                }
                Err(_) => {
                    out.emails.insert(token.to_lowercase());
                }
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty() && self.emails.is_empty()
    }

    pub fn is_excluded(&self, user_id: Option<i64>, email: Option<&str>) -> bool {
        if let Some(id) = user_id {
            if self.ids.contains(&id) {
                return true;
            }
        }
        if let Some(email) = email {
            let email = email.trim().to_lowercase();
            if !email.is_empty() && self.emails.contains(&email) {
                return true;
            }
        }
        false
    }
}

/// Load the exclusion list. Read errors log and return an empty list so
/// capture keeps flowing.
pub async fn excluded_users(source: &dyn SettingsSource) -> ExcludedUsers {
    match source.get_value(EXCLUDED_USERS_KEY).await {
        Ok(Some(raw)) => ExcludedUsers::parse(&raw),
        Ok(None) => ExcludedUsers::default(),
        Err(err) => {
            tracing::warn!("failed to read exclusion setting: {err:#}");
            ExcludedUsers::default()
        }
    }
}

/// Reads settings from environment variables: a key maps to `AUDIT_` plus
/// its upper-cased name, e.g. `AUDIT_RETENTION_DAYS`.
#[derive(Debug, Clone, Default)]
pub struct EnvSettings;

#[async_trait]
impl SettingsSource for EnvSettings {
    async fn get_value(&self, key: &str) -> anyhow::Result<Option<String>> {
        let var = format!("AUDIT_{}", key.to_uppercase());
        match std::env::var(&var) {
            Ok(v) if !v.trim().is_empty() => Ok(Some(v)),
            _ => Ok(None),
        }
    }
}

/// Fixed in-memory settings, used in tests.
#[derive(Debug, Clone, Default)]
pub struct StaticSettings {
    values: std::collections::HashMap<String, String>,
}

impl StaticSettings {
    pub fn new<I, K, V>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: values
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

#[async_trait]
impl SettingsSource for StaticSettings {
    async fn get_value(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.values.get(key).cloned())
    }
}

// ============================================================================
// TESTS
// ============================================================================
