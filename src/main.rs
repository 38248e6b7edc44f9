use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Init logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    fmt().with_env_filter(filter).init();

    // Startup banner at info level so something always prints at default
    // verbosity. Secrets are reported as present/absent only.
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "<unset>".to_string());
    let http_port = std::env::var("BIBLIOTECA_HTTP_PORT").unwrap_or_else(|_| "8080".to_string());
    let store_base = std::env::var("BIBLIOTECA_STORE_BASE").unwrap_or_else(|_| "<unset>".to_string());
    let store_key_set = std::env::var("BIBLIOTECA_STORE_KEY").is_ok();
    let secret_set = std::env::var("BIBLIOTECA_SECRET").is_ok();
    info!(
        target: "startup",
        "biblioteca starting: RUST_LOG='{}', http_port={}, store_base='{}', store_key_set={}, secret_set={}",
        rust_log, http_port, store_base, store_key_set, secret_set
    );

    biblioteca::server::run().await
}
