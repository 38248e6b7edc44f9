//! Runtime configuration. Everything is read from the environment exactly
//! once, validated up front, and handed to the components as a plain struct;
//! nothing consults the environment after startup.

use chrono::Duration;

use crate::error::AppError;
use crate::policy::{PolicyConfig, UnknownDeviceRule};

pub const DEFAULT_STORE_URL: &str = "https://api.airtable.com/v0";
pub const DEFAULT_CUSTOMERS_TABLE: &str = "CLIENTES";
pub const DEFAULT_SESSIONS_TABLE: &str = "SESSIONS";
pub const DEFAULT_ACCESS_FIELD: &str = "Acceso a Biblioteca";
pub const DEFAULT_SESSION_DAYS: i64 = 30;
pub const DEFAULT_HTTP_PORT: u16 = 8080;

#[derive(Debug, Clone)]
pub struct Config {
    /// Record store API root. Overridable for tests.
    pub store_url: String,
    pub store_key: String,
    /// Location (base) identifier holding all tables.
    pub store_base: String,
    pub customers_table: String,
    pub sessions_table: String,
    pub exercises_table: Option<String>,
    pub access_field: String,
    /// Shared token-signing secret.
    pub secret: String,
    /// Token TTL in days; 0 means tokens never expire.
    pub session_ttl_days: i64,
    /// Explicit override for the sessions email column, skipping probing.
    pub sessions_email_field: Option<String>,
    pub http_port: u16,
    /// Mount the operator diagnostics routes. Off in production.
    pub diagnostics: bool,
    /// Attach truncated upstream bodies to error responses.
    pub debug: bool,
    pub recency_window_minutes: Option<i64>,
    pub unknown_device: UnknownDeviceRule,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let get = |key: &str| get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let required = |key: &str| {
            get(key).ok_or_else(|| AppError::config("missing_config".to_string(), format!("{key} is not set")))
        };

        let session_ttl_days = match get("BIBLIOTECA_SESSION_DAYS") {
            None => DEFAULT_SESSION_DAYS,
            Some(raw) => raw.parse::<i64>().ok().filter(|d| *d >= 0).ok_or_else(|| {
                AppError::config("bad_config".to_string(), format!("BIBLIOTECA_SESSION_DAYS is not a day count: {raw}"))
            })?,
        };
        let http_port = match get("BIBLIOTECA_HTTP_PORT") {
            None => DEFAULT_HTTP_PORT,
            Some(raw) => raw.parse::<u16>().map_err(|_| {
                AppError::config("bad_config".to_string(), format!("BIBLIOTECA_HTTP_PORT is not a port: {raw}"))
            })?,
        };
        let recency_window_minutes = match get("BIBLIOTECA_RECENCY_MINUTES") {
            None => None,
            Some(raw) => Some(raw.parse::<i64>().ok().filter(|m| *m > 0).ok_or_else(|| {
                AppError::config("bad_config".to_string(), format!("BIBLIOTECA_RECENCY_MINUTES is not a minute count: {raw}"))
            })?),
        };
        let unknown_device = match get("BIBLIOTECA_UNKNOWN_DEVICE").as_deref() {
            None => UnknownDeviceRule::default(),
            Some(raw) if raw.eq_ignore_ascii_case("deny") => UnknownDeviceRule::Deny,
            Some(raw) if raw.eq_ignore_ascii_case("adopt") => UnknownDeviceRule::Adopt,
            Some(raw) => {
                return Err(AppError::config(
                    "bad_config".to_string(),
                    format!("BIBLIOTECA_UNKNOWN_DEVICE must be deny or adopt, got {raw}"),
                ))
            }
        };

        Ok(Self {
            store_url: get("BIBLIOTECA_STORE_URL").unwrap_or_else(|| DEFAULT_STORE_URL.to_string()),
            store_key: required("BIBLIOTECA_STORE_KEY")?,
            store_base: required("BIBLIOTECA_STORE_BASE")?,
            customers_table: get("BIBLIOTECA_TABLE_CUSTOMERS").unwrap_or_else(|| DEFAULT_CUSTOMERS_TABLE.to_string()),
            sessions_table: get("BIBLIOTECA_TABLE_SESSIONS").unwrap_or_else(|| DEFAULT_SESSIONS_TABLE.to_string()),
            exercises_table: get("BIBLIOTECA_TABLE_EXERCISES"),
            access_field: get("BIBLIOTECA_ACCESS_FIELD").unwrap_or_else(|| DEFAULT_ACCESS_FIELD.to_string()),
            secret: required("BIBLIOTECA_SECRET")?,
            session_ttl_days,
            sessions_email_field: get("BIBLIOTECA_SESSIONS_EMAIL_FIELD"),
            http_port,
            diagnostics: flag(get("BIBLIOTECA_DIAGNOSTICS")),
            debug: flag(get("BIBLIOTECA_DEBUG")),
            recency_window_minutes,
            unknown_device,
        })
    }

    pub fn policy(&self) -> PolicyConfig {
        PolicyConfig {
            recency_window: self.recency_window_minutes.map(Duration::minutes),
            unknown_device: self.unknown_device,
        }
    }
}

fn flag(v: Option<String>) -> bool {
    matches!(v.as_deref(), Some("1") | Some("true") | Some("TRUE") | Some("True"))
}
