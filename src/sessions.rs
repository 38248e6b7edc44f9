//! Session rows in the hosted record store. The email column name varies
//! across deployments, so it is resolved once per process by probing a fixed
//! candidate list (or taken from an explicit override) and cached. Writes
//! tolerate schema rejections of optional columns by falling back to the
//! guaranteed-present field set and patching the rest best-effort.

use chrono::{DateTime, SecondsFormat, Utc};
use once_cell::sync::OnceCell;
use serde_json::Value;
use tracing::{debug, warn};

use crate::access::escape_formula;
use crate::store::{Fields, ListOptions, Record, RecordStore, StoreError};

pub const EMAIL_FIELD_CANDIDATES: [&str; 6] = ["email_lc", "Email_lc", "email", "Email", "correo", "Correo"];

pub const TOKEN_FIELD: &str = "Token";
pub const DEVICE_FIELD: &str = "DeviceId";
pub const LOGIN_TS_FIELD: &str = "ts_login";
pub const LOGOUT_TS_FIELD: &str = "ts_logout";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionRow {
    pub id: String,
    pub email: String,
    pub token: String,
    pub device_id: String,
    pub logged_in_at: Option<DateTime<Utc>>,
    pub logged_out_at: Option<DateTime<Utc>>,
}

/// Row state a successful login should converge to.
#[derive(Debug, Clone)]
pub struct DesiredSession {
    pub email: String,
    pub token: String,
    pub device_id: String,
    pub logged_in_at: DateTime<Utc>,
}

pub struct SessionStore {
    store: RecordStore,
    table: String,
    forced_email_field: Option<String>,
    email_field: OnceCell<String>,
}

impl SessionStore {
    pub fn new(store: RecordStore, table: String, forced_email_field: Option<String>) -> Self {
        Self { store, table, forced_email_field, email_field: OnceCell::new() }
    }

    /// Resolve the email column name: the override wins, otherwise probe the
    /// candidate list with one-record filter queries and cache the first
    /// name the store accepts.
    pub async fn email_field(&self) -> Result<String, StoreError> {
        if let Some(forced) = &self.forced_email_field {
            return Ok(forced.clone());
        }
        if let Some(found) = self.email_field.get() {
            return Ok(found.clone());
        }
        for candidate in EMAIL_FIELD_CANDIDATES {
            let probe = format!("{{{candidate}}}=\"\"");
            if self.store.probe_filter(&self.table, &probe).await? {
                debug!(field = candidate, "resolved sessions email column");
                let _ = self.email_field.set(candidate.to_string());
                return Ok(candidate.to_string());
            }
        }
        Err(StoreError::Schema(format!(
            "no email column found in sessions table (tried {})",
            EMAIL_FIELD_CANDIDATES.join(", ")
        )))
    }

    pub async fn find_by_email(&self, email: &str) -> Result<Vec<SessionRow>, StoreError> {
        let field = self.email_field().await?;
        let filter = format!("{{{field}}}=\"{}\"", escape_formula(email));
        let records = self.store.list_all(&self.table, Some(&filter)).await?;
        Ok(records.iter().map(|r| row_from_record(&field, r)).collect())
    }

    /// Converge the (single) session row for `desired.email` to the desired
    /// state: update in place when a row exists, create otherwise. A schema
    /// rejection of the full field set falls back to the guaranteed-present
    /// fields, then patches the optional columns one by one best-effort.
    pub async fn reconcile(&self, desired: &DesiredSession) -> Result<SessionRow, StoreError> {
        let field = self.email_field().await?;
        let ts = stamp(desired.logged_in_at);

        let full = make_fields([
            (field.as_str(), Value::String(desired.email.clone())),
            (LOGIN_TS_FIELD, Value::String(ts.clone())),
            (TOKEN_FIELD, Value::String(desired.token.clone())),
            (DEVICE_FIELD, Value::String(desired.device_id.clone())),
            (LOGOUT_TS_FIELD, Value::String(String::new())),
        ]);
        let minimal = make_fields([
            (field.as_str(), Value::String(desired.email.clone())),
            (LOGIN_TS_FIELD, Value::String(ts)),
        ]);
        let optional = [
            (TOKEN_FIELD, desired.token.clone()),
            (DEVICE_FIELD, desired.device_id.clone()),
            (LOGOUT_TS_FIELD, String::new()),
        ];

        let filter = format!("{{{field}}}=\"{}\"", escape_formula(&desired.email));
        let page = self
            .store
            .list(&self.table, &ListOptions { filter: Some(&filter), max_records: Some(1), ..Default::default() })
            .await?;

        let id = match page.records.first() {
            Some(existing) => {
                match self.store.update(&self.table, &existing.id, full).await {
                    Ok(rec) => rec.id,
                    Err(e) if e.is_schema_rejection() => {
                        self.store.update(&self.table, &existing.id, minimal).await?;
                        self.patch_optional(&existing.id, &optional).await;
                        existing.id.clone()
                    }
                    Err(e) => return Err(e),
                }
            }
            None => match self.store.create(&self.table, full).await {
                Ok(rec) => rec.id,
                Err(e) if e.is_schema_rejection() => {
                    let rec = self.store.create(&self.table, minimal).await?;
                    self.patch_optional(&rec.id, &optional).await;
                    rec.id
                }
                Err(e) => return Err(e),
            },
        };

        let saved = self.store.get(&self.table, &id).await?;
        Ok(row_from_record(&field, &saved))
    }

    async fn patch_optional(&self, id: &str, optional: &[(&str, String)]) {
        for (name, value) in optional {
            let fields = make_fields([(*name, Value::String(value.clone()))]);
            if let Err(e) = self.store.update(&self.table, id, fields).await {
                warn!(field = *name, error = %e, "optional session field not written");
            }
        }
    }

    /// Stamp every matching row as logged out (token and device cleared).
    /// `device`/`token` narrow the operation to one session; rows already
    /// cleared are left untouched. Returns the number of rows written.
    pub async fn clear_all(
        &self,
        email: &str,
        device: Option<&str>,
        token: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let rows = self.find_by_email(email).await?;
        let ts = stamp(now);
        let updates: Vec<(String, Fields)> = rows
            .into_iter()
            .filter(|r| in_scope(r, device, token))
            .filter(|r| !r.token.is_empty() || r.logged_out_at.is_none())
            .map(|r| {
                let fields = make_fields([
                    (TOKEN_FIELD, Value::String(String::new())),
                    (DEVICE_FIELD, Value::String(String::new())),
                    (LOGOUT_TS_FIELD, Value::String(ts.clone())),
                ]);
                (r.id, fields)
            })
            .collect();
        if updates.is_empty() {
            return Ok(0);
        }
        self.store.update_many(&self.table, updates).await
    }

    /// Best-effort row removal after a logout; the cleared-field state from
    /// [`clear_all`] already satisfies the single-session invariant, so
    /// callers may ignore failures here.
    pub async fn delete_all(&self, email: &str) -> Result<usize, StoreError> {
        let rows = self.find_by_email(email).await?;
        if rows.is_empty() {
            return Ok(0);
        }
        let ids: Vec<String> = rows.into_iter().map(|r| r.id).collect();
        self.store.delete_many(&self.table, &ids).await
    }
}

fn make_fields<const N: usize>(pairs: [(&str, Value); N]) -> Fields {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

fn stamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn in_scope(row: &SessionRow, device: Option<&str>, token: Option<&str>) -> bool {
    if let Some(t) = token {
        if row.token != t { return false; }
    }
    if let Some(d) = device {
        if row.device_id != d { return false; }
    }
    true
}

pub(crate) fn row_from_record(email_field: &str, rec: &Record) -> SessionRow {
    let text = |name: &str| -> String {
        rec.fields
            .get(name)
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default()
            .to_string()
    };
    let when = |name: &str| -> Option<DateTime<Utc>> {
        let raw = text(name);
        if raw.is_empty() {
            return None;
        }
        DateTime::parse_from_rfc3339(&raw).ok().map(|d| d.with_timezone(&Utc))
    };
    SessionRow {
        id: rec.id.clone(),
        email: text(email_field).to_lowercase(),
        token: text(TOKEN_FIELD),
        device_id: text(DEVICE_FIELD),
        logged_in_at: when(LOGIN_TS_FIELD),
        logged_out_at: when(LOGOUT_TS_FIELD),
    }
}
