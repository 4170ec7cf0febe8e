//! Purpose: Provide the HTTP/JSON page server for pagewise collections.
//! Exports: `ServeConfig`, `serve`.
//! Role: Axum-based loopback server exposing `PageFetcher` over the v0 wire contract.
//! Invariants: Request/response bodies are `api::wire` types; error kinds remain stable.
//! Invariants: Loopback-only unless explicitly allowed; non-loopback requires a token.

use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Path as AxumPath, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use std::future::IntoFuture;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::Duration;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use pagewise::api::wire::{
    AppendRequest, CollectionsEnvelope, ErrorEnvelope, ListRequest, ListResponse,
};
use pagewise::api::{Error, ErrorKind};
use pagewise::catalog::Catalog;

#[derive(Clone, Debug)]
pub struct ServeConfig {
    pub bind: SocketAddr,
    pub catalog: PathBuf,
    pub token: Option<String>,
    pub allow_non_loopback: bool,
    pub max_body_bytes: u64,
    pub cors_origins: Vec<String>,
}

struct AppState {
    catalog: Catalog,
    token: Option<String>,
}

pub async fn serve(config: ServeConfig) -> Result<(), Error> {
    validate_config(&config)?;

    init_tracing();

    let max_body_bytes: usize = config
        .max_body_bytes
        .try_into()
        .map_err(|_| Error::new(ErrorKind::Usage).with_message("--max-body-bytes is too large"))?;

    let catalog = Catalog::load(&config.catalog)?;
    let state = Arc::new(AppState {
        catalog,
        token: config.token,
    });

    let mut app = Router::new()
        .route("/healthz", get(healthz))
        .route("/v0/collections", get(list_collections))
        .route("/v0/collections/:name/list", post(list_records))
        .route("/v0/collections/:name/records", post(append_records))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state);
    if !config.cors_origins.is_empty() {
        app = app.layer(cors_layer(&config.cors_origins)?);
    }

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to bind server")
                .with_source(err)
        })?;
    info!(bind = %config.bind, "pagewise server listening");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        })
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => {
            result.map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("server failed")
                    .with_source(err)
            })?;
        }
        _ = shutdown_signal() => {
            let _ = shutdown_tx.send(());
            match tokio::time::timeout(Duration::from_secs(10), &mut server).await {
                Ok(result) => result.map_err(|err| {
                    Error::new(ErrorKind::Io)
                        .with_message("server failed")
                        .with_source(err)
                })?,
                Err(_) => {
                    return Err(Error::new(ErrorKind::Io).with_message("server shutdown timed out"));
                }
            }
        }
    };
    Ok(())
}

fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(addr) => addr.is_loopback(),
        IpAddr::V6(addr) => addr.is_loopback(),
    }
}

fn validate_config(config: &ServeConfig) -> Result<(), Error> {
    let is_loopback_bind = is_loopback(config.bind.ip());
    if !is_loopback_bind && !config.allow_non_loopback {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("non-loopback bind requires explicit opt-in")
            .with_hint("Re-run with --allow-non-loopback or use a loopback address."));
    }

    if !is_loopback_bind && config.token.is_none() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("non-loopback bind requires --token")
            .with_hint("Set a bearer token so remote callers must authenticate."));
    }

    if config.token.as_deref().is_some_and(str::is_empty) {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--token must not be empty")
            .with_hint("Omit --token to disable authentication on loopback binds."));
    }

    if config.max_body_bytes == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--max-body-bytes must be greater than zero")
            .with_hint("Use a positive value like 1048576."));
    }

    if config.max_body_bytes > usize::MAX as u64 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--max-body-bytes exceeds platform limits")
            .with_hint("Use a smaller value that fits in memory."));
    }

    for origin in &config.cors_origins {
        if origin != "*" && HeaderValue::from_str(origin).is_err() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("invalid --cors-origin `{origin}`"))
                .with_hint("Use an origin like http://localhost:3000 or `*`."));
        }
    }

    Ok(())
}

fn cors_layer(origins: &[String]) -> Result<CorsLayer, Error> {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);
    if origins.iter().any(|origin| origin == "*") {
        return Ok(layer.allow_origin(Any));
    }
    let values = origins
        .iter()
        .map(|origin| {
            HeaderValue::from_str(origin).map_err(|err| {
                Error::new(ErrorKind::Usage)
                    .with_message(format!("invalid --cors-origin `{origin}`"))
                    .with_source(err)
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(layer.allow_origin(AllowOrigin::list(values)))
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(unix)]
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    #[cfg(not(unix))]
    ctrl_c.await;
}

fn authorize(headers: &HeaderMap, state: &AppState) -> Result<(), Error> {
    let Some(token) = state.token.as_ref() else {
        return Ok(());
    };
    let Some(value) = headers.get(axum::http::header::AUTHORIZATION) else {
        return Err(Error::new(ErrorKind::Permission).with_message("missing bearer token"));
    };
    let presented = value
        .to_str()
        .ok()
        .and_then(|value| value.strip_prefix("Bearer "))
        .unwrap_or_default();
    if !constant_time_eq(presented.as_bytes(), token.as_bytes()) {
        return Err(Error::new(ErrorKind::Permission).with_message("invalid bearer token"));
    }
    Ok(())
}

/// Byte comparison whose running time depends only on the lengths.
fn constant_time_eq(left: &[u8], right: &[u8]) -> bool {
    if left.len() != right.len() {
        return false;
    }
    left.iter()
        .zip(right)
        .fold(0u8, |diff, (a, b)| diff | (a ^ b))
        == 0
}

async fn healthz() -> Response {
    json_response(json!({ "ok": true }))
}

async fn list_collections(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(err) = authorize(&headers, &state) {
        return error_response(err);
    }
    json_response(CollectionsEnvelope {
        collections: state.catalog.info(),
    })
}

async fn list_records(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(name): AxumPath<String>,
    payload: Result<Json<ListRequest>, JsonRejection>,
) -> Response {
    if let Err(err) = authorize(&headers, &state) {
        return error_response(err);
    }
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => return error_response(rejection_error(rejection)),
    };
    let collection = match state.catalog.get(&name) {
        Ok(collection) => collection,
        Err(err) => return error_response(err),
    };
    match collection.fetcher().fetch_request(&request) {
        Ok(page) => {
            debug!(collection = %name, returned = page.records.len(), state = page.state.as_str(), "served page");
            json_response(ListResponse::from(page))
        }
        Err(err) => error_response(err.with_collection(name)),
    }
}

async fn append_records(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(name): AxumPath<String>,
    payload: Result<Json<AppendRequest>, JsonRejection>,
) -> Response {
    if let Err(err) = authorize(&headers, &state) {
        return error_response(err);
    }
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => return error_response(rejection_error(rejection)),
    };
    let collection = match state.catalog.get(&name) {
        Ok(collection) => collection,
        Err(err) => return error_response(err),
    };
    match collection.append(request.records) {
        Ok(receipt) => json_response(receipt),
        Err(err) => error_response(err),
    }
}

fn rejection_error(rejection: JsonRejection) -> Error {
    Error::new(ErrorKind::Usage)
        .with_message(format!("invalid request body: {}", rejection.body_text()))
        .with_hint("Send a JSON object with Content-Type: application/json.")
}

fn json_response(payload: impl Serialize) -> Response {
    let mut response = Json(payload).into_response();
    response
        .headers_mut()
        .insert("pagewise-version", HeaderValue::from_static("0"));
    response
}

fn error_response(err: Error) -> Response {
    let status = match err.kind() {
        ErrorKind::Usage | ErrorKind::InvalidQuery | ErrorKind::InvalidBound => {
            StatusCode::BAD_REQUEST
        }
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Permission => StatusCode::UNAUTHORIZED,
        ErrorKind::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Cancelled | ErrorKind::Io | ErrorKind::Internal => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    let mut response = (status, Json(ErrorEnvelope::from_error(&err))).into_response();
    response
        .headers_mut()
        .insert("pagewise-version", HeaderValue::from_static("0"));
    response
}

#[cfg(test)]
mod tests {
    use super::{AppState, ErrorKind, ServeConfig, authorize, constant_time_eq, serve, validate_config};
    use axum::http::{HeaderMap, HeaderValue, header::AUTHORIZATION};

    fn config(bind: &str) -> ServeConfig {
        ServeConfig {
            bind: bind.parse().expect("bind"),
            catalog: "catalog.json".into(),
            token: None,
            allow_non_loopback: false,
            max_body_bytes: 1024 * 1024,
            cors_origins: Vec::new(),
        }
    }

    #[tokio::test]
    async fn serve_rejects_non_loopback_bind() {
        let err = serve(config("0.0.0.0:0"))
            .await
            .expect_err("expected usage error");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[tokio::test]
    async fn serve_reports_missing_catalog() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut config = config("127.0.0.1:0");
        config.catalog = temp.path().join("missing.json");
        let err = serve(config).await.expect_err("expected io error");
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn non_loopback_requires_allow_flag_and_token() {
        let mut config = config("0.0.0.0:0");
        let err = validate_config(&config).expect_err("expected usage error");
        assert_eq!(err.kind(), ErrorKind::Usage);

        config.allow_non_loopback = true;
        let err = validate_config(&config).expect_err("expected token error");
        assert_eq!(err.kind(), ErrorKind::Usage);

        config.token = Some("dev".to_string());
        validate_config(&config).expect("config ok");
    }

    #[test]
    fn safety_limits_require_positive_values() {
        let mut config = config("127.0.0.1:0");
        config.max_body_bytes = 0;
        let err = validate_config(&config).expect_err("expected usage error");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn cors_origins_must_be_header_values() {
        let mut config = config("127.0.0.1:0");
        config.cors_origins = vec!["http://localhost:3000".to_string(), "*".to_string()];
        validate_config(&config).expect("config ok");
        config.cors_origins = vec!["bad\norigin".to_string()];
        let err = validate_config(&config).expect_err("expected usage error");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn bearer_tokens_must_match_exactly() {
        let catalog = pagewise::catalog::Catalog::from_json_str(
            r#"{"collections":[{"name":"notes","fields":{"title":"text"}}]}"#,
            std::path::Path::new("."),
        )
        .expect("catalog");
        let state = AppState {
            catalog,
            token: Some("s3cret".to_string()),
        };
        let with = |value: &'static str| {
            let mut headers = HeaderMap::new();
            headers.insert(AUTHORIZATION, HeaderValue::from_static(value));
            headers
        };

        authorize(&with("Bearer s3cret"), &state).expect("valid token");
        for value in ["Bearer s3cre", "Bearer s3cret2", "s3cret", "Basic s3cret"] {
            let err = authorize(&with(value), &state).expect_err("rejected");
            assert_eq!(err.kind(), ErrorKind::Permission);
        }
        let err = authorize(&HeaderMap::new(), &state).expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::Permission);

        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }
}
