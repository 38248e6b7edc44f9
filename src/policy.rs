//! Single-active-session decision logic. Pure over already-fetched session
//! rows so every rule is unit-testable without the store.
//!
//! A row is active when its token is non-empty and it carries no logout
//! stamp; an optional recency window additionally requires the login stamp
//! to be recent. Per email: no active row allows a login, an active row on
//! the same device allows a refresh, an active row on another device is a
//! conflict, and an active row with no recorded device follows the
//! configured unknown-device rule.

use chrono::{DateTime, Duration, Utc};

use crate::sessions::{DesiredSession, SessionRow};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictCode {
    ActiveElsewhere,
    ActiveUnknownDevice,
}

impl ConflictCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictCode::ActiveElsewhere => "SESSION_ACTIVE_ELSEWHERE",
            ConflictCode::ActiveUnknownDevice => "SESSION_ACTIVE_UNKNOWN_DEVICE",
        }
    }
}

/// What to do with a legacy active row that never recorded a device id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownDeviceRule {
    /// Require an explicit logout before the slot can be reused.
    #[default]
    Deny,
    /// Treat the row as owned by the incoming device and refresh it.
    Adopt,
}

#[derive(Debug, Clone, Default)]
pub struct PolicyConfig {
    pub recency_window: Option<Duration>,
    pub unknown_device: UnknownDeviceRule,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Allow,
    Deny { code: ConflictCode, existing: SessionRow },
}

pub fn is_active(row: &SessionRow, now: DateTime<Utc>, cfg: &PolicyConfig) -> bool {
    if row.token.is_empty() || row.logged_out_at.is_some() {
        return false;
    }
    match (cfg.recency_window, row.logged_in_at) {
        (Some(window), Some(at)) => now.signed_duration_since(at) <= window,
        // Window enabled but no login stamp: nothing proves recency.
        (Some(_), None) => false,
        (None, _) => true,
    }
}

pub fn decide(rows: &[SessionRow], device_id: &str, now: DateTime<Utc>, cfg: &PolicyConfig) -> Decision {
    let mut unknown_device: Option<&SessionRow> = None;
    for row in rows.iter().filter(|r| is_active(r, now, cfg)) {
        if row.device_id == device_id {
            // Re-login from the same client refreshes the slot.
            continue;
        }
        if row.device_id.is_empty() {
            unknown_device.get_or_insert(row);
        } else {
            return Decision::Deny { code: ConflictCode::ActiveElsewhere, existing: row.clone() };
        }
    }
    if let Some(row) = unknown_device {
        if cfg.unknown_device == UnknownDeviceRule::Deny {
            return Decision::Deny { code: ConflictCode::ActiveUnknownDevice, existing: row.clone() };
        }
    }
    Decision::Allow
}

/// Row state an allowed login converges to: fresh token, the caller's
/// device, login stamp now and the logout stamp cleared.
pub fn desired_session(email: &str, device_id: &str, token: &str, now: DateTime<Utc>) -> DesiredSession {
    DesiredSession {
        email: email.to_string(),
        token: token.to_string(),
        device_id: device_id.to_string(),
        logged_in_at: now,
    }
}
