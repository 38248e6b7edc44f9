//! HTTP client for the hosted record store (customers, sessions and the
//! exercises catalog all live in tables of one base). The store exposes a
//! filter-formula query language, opaque continuation offsets for paging and
//! a hard ceiling of 10 records per write/delete batch.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

pub type Fields = serde_json::Map<String, serde_json::Value>;

/// Per-call batch ceiling imposed by the store. Fixed external constraint.
pub const MAX_BATCH: usize = 10;

/// Upper bound on continuation-cursor iterations. A well-formed result set
/// is exhausted long before this; hitting the bound means the cursor is
/// malformed and the operation fails instead of looping.
pub const MAX_PAGES: usize = 50;

const BODY_SNIPPET_LEN: usize = 1200;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record store HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("record store transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("{0}")]
    Schema(String),
    #[error("record store paging did not terminate after {0} pages")]
    PagingOverflow(usize),
}

impl StoreError {
    /// The store answers 422 when a write or filter references a field the
    /// table does not have. Callers use this to trigger reduced-field
    /// retries and field-name probing.
    pub fn is_schema_rejection(&self) -> bool {
        matches!(self, StoreError::Http { status: 422, .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    #[serde(default)]
    pub fields: Fields,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordPage {
    #[serde(default)]
    pub records: Vec<Record>,
    #[serde(default)]
    pub offset: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ListOptions<'a> {
    pub filter: Option<&'a str>,
    pub max_records: Option<u32>,
    pub page_size: Option<u32>,
    pub offset: Option<&'a str>,
}

#[derive(Clone)]
pub struct RecordStore {
    client: reqwest::Client,
    base_url: String,
    base_id: String,
    api_key: String,
}

impl RecordStore {
    pub fn new(base_url: &str, base_id: &str, api_key: &str) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            base_id: base_id.to_string(),
            api_key: api_key.to_string(),
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/{}/{}", self.base_url, self.base_id, urlencoding::encode(table))
    }

    fn record_url(&self, table: &str, id: &str) -> String {
        format!("{}/{}", self.table_url(table), id)
    }

    async fn read_json<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, StoreError> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StoreError::Http { status: status.as_u16(), body: snippet(&body) });
        }
        Ok(resp.json().await?)
    }

    pub async fn list(&self, table: &str, opts: &ListOptions<'_>) -> Result<RecordPage, StoreError> {
        let mut params: Vec<(&str, String)> = Vec::new();
        if let Some(f) = opts.filter { params.push(("filterByFormula", f.to_string())); }
        if let Some(n) = opts.max_records { params.push(("maxRecords", n.to_string())); }
        if let Some(n) = opts.page_size { params.push(("pageSize", n.to_string())); }
        if let Some(o) = opts.offset { params.push(("offset", o.to_string())); }
        let resp = self
            .client
            .get(self.table_url(table))
            .bearer_auth(&self.api_key)
            .query(&params)
            .send()
            .await?;
        Self::read_json(resp).await
    }

    /// Page through every record matching the filter until the store stops
    /// returning a continuation offset. Bounded by [`MAX_PAGES`].
    pub async fn list_all(&self, table: &str, filter: Option<&str>) -> Result<Vec<Record>, StoreError> {
        let mut out: Vec<Record> = Vec::new();
        let mut offset: Option<String> = None;
        for _ in 0..MAX_PAGES {
            let page = self
                .list(table, &ListOptions { filter, offset: offset.as_deref(), ..Default::default() })
                .await?;
            out.extend(page.records);
            match page.offset {
                Some(o) if !o.is_empty() => offset = Some(o),
                _ => return Ok(out),
            }
        }
        Err(StoreError::PagingOverflow(MAX_PAGES))
    }

    pub async fn get(&self, table: &str, id: &str) -> Result<Record, StoreError> {
        let resp = self
            .client
            .get(self.record_url(table, id))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        Self::read_json(resp).await
    }

    pub async fn create(&self, table: &str, fields: Fields) -> Result<Record, StoreError> {
        let resp = self
            .client
            .post(self.table_url(table))
            .bearer_auth(&self.api_key)
            .json(&json!({ "records": [{ "fields": fields }] }))
            .send()
            .await?;
        let page: RecordPage = Self::read_json(resp).await?;
        page.records
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::Schema("record store returned an empty create result".into()))
    }

    pub async fn update(&self, table: &str, id: &str, fields: Fields) -> Result<Record, StoreError> {
        let resp = self
            .client
            .patch(self.record_url(table, id))
            .bearer_auth(&self.api_key)
            .json(&json!({ "fields": fields }))
            .send()
            .await?;
        Self::read_json(resp).await
    }

    /// Patch many records, chunked to the store's batch ceiling.
    pub async fn update_many(&self, table: &str, updates: Vec<(String, Fields)>) -> Result<usize, StoreError> {
        let mut written = 0usize;
        for chunk in updates.chunks(MAX_BATCH) {
            let records: Vec<serde_json::Value> = chunk
                .iter()
                .map(|(id, fields)| json!({ "id": id, "fields": fields }))
                .collect();
            let resp = self
                .client
                .patch(self.table_url(table))
                .bearer_auth(&self.api_key)
                .json(&json!({ "records": records }))
                .send()
                .await?;
            let page: RecordPage = Self::read_json(resp).await?;
            written += page.records.len();
        }
        Ok(written)
    }

    pub async fn delete(&self, table: &str, id: &str) -> Result<(), StoreError> {
        let resp = self
            .client
            .delete(self.record_url(table, id))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StoreError::Http { status: status.as_u16(), body: snippet(&body) });
        }
        Ok(())
    }

    /// Delete many records, chunked to the store's batch ceiling.
    pub async fn delete_many(&self, table: &str, ids: &[String]) -> Result<usize, StoreError> {
        let mut deleted = 0usize;
        for chunk in ids.chunks(MAX_BATCH) {
            let params: Vec<(&str, &str)> = chunk.iter().map(|id| ("records[]", id.as_str())).collect();
            let resp = self
                .client
                .delete(self.table_url(table))
                .bearer_auth(&self.api_key)
                .query(&params)
                .send()
                .await?;
            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(StoreError::Http { status: status.as_u16(), body: snippet(&body) });
            }
            deleted += chunk.len();
        }
        Ok(deleted)
    }

    /// Issue a one-record probe list with the given filter. `Ok(true)` means
    /// the store accepted the formula, `Ok(false)` that it rejected it as
    /// referencing an unknown field; anything else is a real failure.
    pub async fn probe_filter(&self, table: &str, filter: &str) -> Result<bool, StoreError> {
        match self
            .list(table, &ListOptions { filter: Some(filter), max_records: Some(1), ..Default::default() })
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.is_schema_rejection() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Truncate an upstream body for logs and debug payloads.
pub fn snippet(s: &str) -> String {
    if s.len() <= BODY_SNIPPET_LEN {
        s.to_string()
    } else {
        let mut end = BODY_SNIPPET_LEN;
        while !s.is_char_boundary(end) { end -= 1; }
        format!("{}…", &s[..end])
    }
}
