//!
//! biblioteca HTTP server
//! ----------------------
//! Axum-based HTTP API for the members-site session layer.
//!
//! Responsibilities:
//! - Login endpoint: entitlement check, single-active-session policy,
//!   session row reconciliation and bearer-token issuance.
//! - Logout endpoint: stamp matching rows logged-out, then best-effort
//!   row deletion; idempotent.
//! - Validate/check endpoint: token signature + live-session lookup.
//! - Read-only exercises catalog with paging passthrough and search.
//! - Operator diagnostics routes, mounted only when enabled in config.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::access::AccessChecker;
use crate::catalog;
use crate::config::Config;
use crate::error::AppError;
use crate::policy::{self, Decision, PolicyConfig};
use crate::sessions::SessionStore;
use crate::store::{ListOptions, RecordStore, StoreError};
use crate::token::TokenCodec;

pub const LOGIN_REDIRECT: &str = "/interfaz/";

/// Shared server state injected into all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: RecordStore,
    pub access: AccessChecker,
    pub sessions: Arc<SessionStore>,
    pub codec: TokenCodec,
    pub policy: PolicyConfig,
}

pub fn build_state(config: Config) -> Result<AppState, AppError> {
    let store = RecordStore::new(&config.store_url, &config.store_base, &config.store_key)?;
    let access = AccessChecker::new(store.clone(), config.customers_table.clone(), config.access_field.clone());
    let sessions = Arc::new(SessionStore::new(
        store.clone(),
        config.sessions_table.clone(),
        config.sessions_email_field.clone(),
    ));
    let codec = TokenCodec::new(config.secret.as_bytes().to_vec());
    let policy = config.policy();
    Ok(AppState { config: Arc::new(config), store, access, sessions, codec, policy })
}

pub fn app(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/", get(|| async { "biblioteca ok" }))
        .route("/auth/login", post(login))
        .route("/auth/logout", post(logout))
        .route("/auth/validate", post(validate))
        .route("/auth/check", post(validate))
        .route("/catalog/exercises", get(exercises));
    if state.config.diagnostics {
        router = router
            .route("/diagnostics/customers", get(diag_customers))
            .route("/diagnostics/sessions", get(diag_sessions));
    }
    router.with_state(state)
}

pub async fn run() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    run_with_config(config).await
}

pub async fn run_with_config(config: Config) -> anyhow::Result<()> {
    let port = config.http_port;
    let state = build_state(config)?;
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;
    info!("Starting server on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct LoginPayload {
    #[serde(default)]
    email: String,
    #[serde(default, rename = "deviceId")]
    device_id: String,
}

#[derive(Debug, Deserialize)]
struct LogoutPayload {
    #[serde(default)]
    email: String,
    #[serde(default, rename = "deviceId")]
    device_id: Option<String>,
    #[serde(default)]
    token: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ValidatePayload {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ExercisesQuery {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    q: Option<String>,
    #[serde(default)]
    offset: Option<String>,
}

fn fail(state: &AppState, err: AppError) -> (StatusCode, Json<Value>) {
    let err = if state.config.debug { err } else { err.redacted() };
    let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut body = json!({ "ok": false, "error": err.message(), "code": err.code_str() });
    if let Some(detail) = err.detail() {
        body["detail"] = json!(detail);
    }
    (status, Json(body))
}

async fn login(State(state): State<AppState>, Json(payload): Json<LoginPayload>) -> impl IntoResponse {
    let email = payload.email.trim().to_lowercase();
    if email.is_empty() || !email.contains('@') {
        return fail(&state, AppError::validation("bad_email", "A valid email is required"));
    }
    // The client may send its own device id; without one the server mints
    // an opaque identifier so the session is still device-bound.
    let device_id = {
        let d = payload.device_id.trim();
        if d.is_empty() { format!("srv_{}", Uuid::new_v4()) } else { d.to_string() }
    };

    match state.access.has_active_access(&email).await {
        Ok(true) => {}
        Ok(false) => return fail(&state, AppError::access_denied("no_access", "No active access for this account")),
        Err(e) => {
            error!("customer lookup failed: {e}");
            return fail(&state, e.into());
        }
    }

    let rows = match state.sessions.find_by_email(&email).await {
        Ok(rows) => rows,
        Err(e) => {
            error!("session lookup failed: {e}");
            return fail(&state, e.into());
        }
    };

    let now = Utc::now();
    if let Decision::Deny { code, existing } = policy::decide(&rows, &device_id, now, &state.policy) {
        warn!(email = %email, held_by = %existing.device_id, code = code.as_str(), "login refused");
        return fail(&state, AppError::conflict(code.as_str(), "Session already active. Log out to continue."));
    }

    let token = state.codec.issue(&email, state.config.session_ttl_days);
    let desired = policy::desired_session(&email, &device_id, &token, now);
    if let Err(e) = state.sessions.reconcile(&desired).await {
        error!("session write failed: {e}");
        return fail(&state, e.into());
    }
    info!(email = %email, "login ok");
    (StatusCode::OK, Json(json!({ "ok": true, "token": token, "redirect": LOGIN_REDIRECT })))
}

async fn logout(State(state): State<AppState>, Json(payload): Json<LogoutPayload>) -> impl IntoResponse {
    let email = payload.email.trim().to_lowercase();
    if email.is_empty() {
        return fail(&state, AppError::validation("bad_email", "Email is required"));
    }
    let device = payload.device_id.as_deref().map(str::trim).filter(|s| !s.is_empty());
    let token = payload.token.as_deref().map(str::trim).filter(|s| !s.is_empty());

    match state.sessions.clear_all(&email, device, token, Utc::now()).await {
        Ok(cleared) => {
            // Cleared fields already satisfy the invariant; row deletion is
            // cleanup and only safe when the logout is not scoped to one
            // session.
            if device.is_none() && token.is_none() {
                if let Err(e) = state.sessions.delete_all(&email).await {
                    warn!("session row cleanup failed: {e}");
                }
            }
            info!(email = %email, cleared, "logout ok");
            (StatusCode::OK, Json(json!({ "ok": true })))
        }
        Err(e) => {
            error!("logout failed: {e}");
            fail(&state, e.into())
        }
    }
}

async fn validate(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    // Tolerant body read: absent or malformed JSON counts as no payload so
    // bearer-header-only calls work.
    let payload: ValidatePayload = serde_json::from_slice(&body).unwrap_or_default();
    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let token = payload
        .token
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .or(bearer);
    let Some(token) = token else {
        return fail(&state, AppError::auth("missing_token", "Missing token"));
    };

    let verification = state.codec.verify(&token);
    let Some(subject) = verification.subject else {
        return fail(&state, AppError::auth("invalid_token", "Invalid token"));
    };
    if let Some(claimed) = payload.email.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        if claimed.to_lowercase() != subject {
            return fail(&state, AppError::auth("session_mismatch", "Token does not match this account"));
        }
    }

    let rows = match state.sessions.find_by_email(&subject).await {
        Ok(rows) => rows,
        Err(e) => {
            error!("session lookup failed: {e}");
            return fail(&state, e.into());
        }
    };
    let live = rows.iter().any(|r| r.token == token && r.logged_out_at.is_none());
    if !live {
        return fail(&state, AppError::auth("session_not_found", "Session not found"));
    }
    (StatusCode::OK, Json(json!({ "ok": true, "email": subject })))
}

async fn exercises(State(state): State<AppState>, Query(params): Query<ExercisesQuery>) -> impl IntoResponse {
    let Some(table) = state.config.exercises_table.clone() else {
        return fail(&state, AppError::config("missing_config", "exercises table is not configured"));
    };

    if let Some(id) = params.id.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        return match state.store.get(&table, id).await {
            Ok(rec) => (StatusCode::OK, Json(json!({ "ok": true, "detail": catalog::detail_from_record(&rec) }))),
            Err(e) => fail(&state, e.into()),
        };
    }

    let offset = params.offset.as_deref().map(str::trim).filter(|s| !s.is_empty());
    let page = state
        .store
        .list(&table, &ListOptions { page_size: Some(catalog::PAGE_SIZE), offset, ..Default::default() })
        .await;
    match page {
        Ok(page) => {
            let query = catalog::normalize(params.q.as_deref().unwrap_or(""));
            let rows: Vec<catalog::Exercise> = page
                .records
                .iter()
                .map(catalog::exercise_from_record)
                .filter(|e| catalog::matches_query(e, &query))
                .collect();
            let next = page.offset.unwrap_or_default();
            (
                StatusCode::OK,
                Json(json!({ "ok": true, "rows": rows, "hasMore": !next.is_empty(), "nextOffset": next })),
            )
        }
        Err(e) => fail(&state, e.into()),
    }
}

async fn diag_customers(State(state): State<AppState>) -> impl IntoResponse {
    let table = state.config.customers_table.clone();
    diag_probe(&state, &table).await
}

async fn diag_sessions(State(state): State<AppState>) -> impl IntoResponse {
    let table = state.config.sessions_table.clone();
    diag_probe(&state, &table).await
}

/// One-record read against a table, echoing config presence and the raw
/// upstream outcome. Always answers 200; the payload carries the result.
async fn diag_probe(state: &AppState, table: &str) -> (StatusCode, Json<Value>) {
    let using = json!({
        "store_url": state.config.store_url,
        "store_base": state.config.store_base,
        "table": table,
        "store_key_set": !state.config.store_key.is_empty(),
        "secret_set": !state.config.secret.is_empty(),
    });
    let result = state
        .store
        .list(table, &ListOptions { max_records: Some(1), ..Default::default() })
        .await;
    let body = match result {
        Ok(page) => {
            let sample = page.records.first().map(|r| {
                let fields: Vec<&String> = r.fields.keys().take(6).collect();
                json!({ "id": r.id, "fields": fields })
            });
            json!({ "ok": true, "http": 200, "using": using, "sample": sample })
        }
        Err(StoreError::Http { status, body }) => {
            json!({ "ok": false, "http": status, "using": using, "body": body })
        }
        Err(e) => json!({ "ok": false, "using": using, "error": e.to_string() }),
    };
    (StatusCode::OK, Json(body))
}
