use config::{Config, File};
use serde::Deserialize;

use crate::error::AuditError;

#[derive(Debug, Deserialize, Clone)]
pub struct AuditConfig {
    pub service: ServiceConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
    #[serde(default)]
    pub ai: AiConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8791,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CleanupConfig {
    pub interval_minutes: u64,
    pub run_timeout_minutes: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_minutes: 60,
            run_timeout_minutes: 5,
        }
    }
}

/// Downstream chat-completion endpoint used by the summarization relay.
/// The bearer key is taken from `AUDIT_AI_API_KEY` at call time so it never
/// lands in the config file.
#[derive(Debug, Deserialize, Clone)]
pub struct AiConfig {
    pub enabled: bool,
    pub model: String,
    pub api_base_url: String,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            model: String::new(),
            api_base_url: String::new(),
        }
    }
}

impl AuditConfig {
    pub fn load(path: &str) -> Result<Self, AuditError> {
        let s = Config::builder()
            .add_source(File::with_name(path))
            .build()?;
        Ok(s.try_deserialize()?)
    }
}
