//! Entitlement lookups against the customers table. A customer has active
//! access when a row matches the email (either `{Email}` or `{Email_lc}`
//! column convention) and the access field holds a truthy value: numeric 1,
//! a real boolean, or "si"/"sí" in any casing.

use crate::store::{ListOptions, RecordStore, StoreError};

#[derive(Clone)]
pub struct AccessChecker {
    store: RecordStore,
    table: String,
    access_field: String,
}

impl AccessChecker {
    pub fn new(store: RecordStore, table: String, access_field: String) -> Self {
        Self { store, table, access_field }
    }

    /// `Ok(false)` when no matching customer row exists; store failures
    /// propagate so a dead upstream is never read as "no access".
    pub async fn has_active_access(&self, email: &str) -> Result<bool, StoreError> {
        let formula = access_formula(&self.access_field, email);
        let page = self
            .store
            .list(&self.table, &ListOptions { filter: Some(&formula), max_records: Some(1), ..Default::default() })
            .await?;
        Ok(!page.records.is_empty())
    }
}

/// Escape a value for embedding in a double-quoted formula string literal.
pub fn escape_formula(s: &str) -> String {
    s.replace('"', "\\\"")
}

/// Filter formula matching an entitled customer row. The email side accepts
/// both column-casing conventions; the access side evaluates the
/// locale-tolerant truthy rule in the store's own language so the check
/// stays a single round trip.
pub fn access_formula(access_field: &str, email: &str) -> String {
    let email = escape_formula(email);
    format!(
        "AND(OR(LOWER({{Email}})=\"{email}\",{{Email_lc}}=\"{email}\"),\
OR({{{f}}}=1,{{{f}}}=TRUE(),LOWER(SUBSTITUTE({{{f}}},\"í\",\"i\"))=\"si\"))",
        f = access_field
    )
}
