//! Unified application error model and mapping helpers.
//! This module provides a common error enum used by the HTTP handlers and
//! the auth components, along with the mapping to HTTP status codes.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

use crate::store::StoreError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppError {
    Validation { code: String, message: String },
    AccessDenied { code: String, message: String },
    Conflict { code: String, message: String },
    Auth { code: String, message: String },
    Upstream { status: u16, message: String, detail: Option<String> },
    Config { code: String, message: String },
}

impl AppError {
    pub fn code_str(&self) -> &str {
        match self {
            AppError::Validation { code, .. }
            | AppError::AccessDenied { code, .. }
            | AppError::Conflict { code, .. }
            | AppError::Auth { code, .. }
            | AppError::Config { code, .. } => code.as_str(),
            AppError::Upstream { .. } => "upstream_error",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            AppError::Validation { message, .. }
            | AppError::AccessDenied { message, .. }
            | AppError::Conflict { message, .. }
            | AppError::Auth { message, .. }
            | AppError::Upstream { message, .. }
            | AppError::Config { message, .. } => message.as_str(),
        }
    }

    pub fn validation<S: Into<String>>(code: S, msg: S) -> Self { AppError::Validation { code: code.into(), message: msg.into() } }
    pub fn access_denied<S: Into<String>>(code: S, msg: S) -> Self { AppError::AccessDenied { code: code.into(), message: msg.into() } }
    pub fn conflict<S: Into<String>>(code: S, msg: S) -> Self { AppError::Conflict { code: code.into(), message: msg.into() } }
    pub fn auth<S: Into<String>>(code: S, msg: S) -> Self { AppError::Auth { code: code.into(), message: msg.into() } }
    pub fn upstream<S: Into<String>>(status: u16, msg: S, detail: Option<String>) -> Self {
        AppError::Upstream { status, message: msg.into(), detail }
    }
    pub fn config<S: Into<String>>(code: S, msg: S) -> Self { AppError::Config { code: code.into(), message: msg.into() } }

    /// Map to HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            AppError::Validation { .. } => 400,
            AppError::AccessDenied { .. } => 403,
            AppError::Conflict { .. } => 409,
            AppError::Auth { .. } => 401,
            AppError::Upstream { .. } => 502,
            AppError::Config { .. } => 500,
        }
    }

    /// Strip operator-only detail (raw upstream bodies) from the error.
    /// Responses outside debug mode must stay generic.
    pub fn redacted(self) -> Self {
        match self {
            AppError::Upstream { status, message, .. } => AppError::Upstream { status, message, detail: None },
            other => other,
        }
    }

    pub fn detail(&self) -> Option<&str> {
        match self {
            AppError::Upstream { detail, .. } => detail.as_deref(),
            _ => None,
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code_str(), self.message())
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Http { status, body } => {
                AppError::upstream(status, format!("record store HTTP {status}"), Some(body))
            }
            StoreError::Transport(e) => AppError::upstream(502, format!("record store unreachable: {e}"), None),
            StoreError::Schema(msg) => AppError::upstream(502, msg, None),
            StoreError::PagingOverflow(pages) => {
                AppError::upstream(502, format!("record store paging did not terminate after {pages} pages"), None)
            }
        }
    }
}
