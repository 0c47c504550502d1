//! HTTP surface implementing the gallery protocol.
//!
//! The router binds parsed gallery queries to the query engine and
//! storage:
//!
//! - `POST /api/extensionquery` – evaluate a filter+flags query.
//! - `GET /assets/...` and the `vspackage` routes – 301 redirects to
//!   the `/files/...` URL serving the asset.
//! - `GET /files/*` – raw byte service over the storage `open` call.
//! - `GET /`, `/healthz`, `/item` – plaintext informational pages.
//! - A handful of POST stubs accepted for client compatibility.
//!
//! Every response carries an `X-Request-Id`; error envelopes echo it
//! so operator logs can be correlated.

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, Path, Query, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use log::{debug, error, info};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;

use crate::error::Error;
use crate::models::{ErrorResponse, QueryFlags, QueryRequest, QueryResponse};
use crate::search::engine;
use crate::storage::Storage;

pub mod ratelimit;

use ratelimit::RateLimiter;

/// In-flight requests get this long to finish after shutdown begins.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn Storage>,
    pub max_page_size: i32,
    /// Prepended to derived base URLs; stored without a trailing
    /// slash.
    pub base_path: String,
    pub limiter: Option<Arc<RateLimiter>>,
}

impl AppState {
    pub fn new(storage: Arc<dyn Storage>, max_page_size: i32, base_path: &str) -> Self {
        Self {
            storage,
            max_page_size,
            base_path: base_path.trim_end_matches('/').to_string(),
            limiter: None,
        }
    }

    pub fn with_rate_limit(mut self, limit: i64) -> Self {
        if limit > 0 {
            self.limiter = Some(Arc::new(RateLimiter::new(limit as u32)));
        }
        self
    }
}

/// Request id attached by middleware and echoed in error envelopes.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_request_id() -> String {
    let sequence = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    let clock = time::OffsetDateTime::now_utc().unix_timestamp_nanos() as u128;
    format!("{clock:x}-{sequence:x}")
}

/// Error type handlers use to produce the JSON error envelope.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
    detail: String,
    request_id: String,
}

impl ApiError {
    fn bad_request(
        request_id: &RequestId,
        message: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            detail: detail.into(),
            request_id: request_id.0.clone(),
        }
    }

    /// Map storage and engine errors onto status codes: missing
    /// things are 404s, bad input is a 400, anything else is a 500
    /// whose cause stays in the logs.
    fn from_storage(request_id: &RequestId, err: Error) -> Self {
        if err.is_not_found() {
            return Self {
                status: StatusCode::NOT_FOUND,
                message: "Not found".to_string(),
                detail: err.to_string(),
                request_id: request_id.0.clone(),
            };
        }
        match err {
            Error::Validation(detail) => Self {
                status: StatusCode::BAD_REQUEST,
                message: "Invalid request".to_string(),
                detail,
                request_id: request_id.0.clone(),
            },
            err => {
                error!("request {} failed: {err}", request_id.0);
                Self {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    message: "Internal server error".to_string(),
                    detail: "Contact your administrator with the request ID".to_string(),
                    request_id: request_id.0.clone(),
                }
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            message: self.message,
            detail: self.detail,
            request_id: self.request_id,
        });
        (self.status, body).into_response()
    }
}

/// Build the router with all middleware attached.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/healthz", get(health))
        .route("/item", get(item))
        .route("/api/extensionquery", post(extension_query))
        .route("/extensionquery", post(extension_query))
        .route(
            "/assets/:publisher/:extension/:version/:type",
            get(asset_redirect),
        )
        .route(
            "/publishers/:publisher/vsextensions/:extension/:version/vspackage",
            get(vspackage_redirect),
        )
        .route(
            "/api/publishers/:publisher/vsextensions/:extension/:version/vspackage",
            get(vspackage_redirect),
        )
        .route("/files/*path", get(serve_file))
        .route(
            "/api/itemName/:item/version/:version/vscodewebextension",
            post(accept_and_ignore),
        )
        .route(
            "/api/publishers/:publisher/vsextensions/:extension/:version/stats",
            post(accept_and_ignore),
        )
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit))
        .layer(middleware::from_fn(attach_request_id))
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until `shutdown` fires, then give in-flight
/// requests a bounded grace period.
pub async fn run(addr: SocketAddr, state: AppState, shutdown: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("listening on http://{}", listener.local_addr()?);
    serve_with_listener(listener, state, shutdown).await
}

/// Serve on an existing listener; tests use this to bind ephemeral
/// ports.
pub async fn serve_with_listener(
    listener: TcpListener,
    state: AppState,
    shutdown: CancellationToken,
) -> Result<()> {
    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    let graceful = shutdown.clone();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move { graceful.cancelled().await })
        .into_future();
    let mut server = std::pin::pin!(server);

    tokio::select! {
        result = &mut server => result?,
        _ = async {
            shutdown.cancelled().await;
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        } => {
            log::warn!("graceful shutdown timed out; aborting in-flight requests");
        }
    }
    Ok(())
}

async fn attach_request_id(mut request: Request, next: Next) -> Response {
    let id = next_request_id();
    request.extensions_mut().insert(RequestId(id.clone()));
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

async fn rate_limit(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request: Request,
    next: Next,
) -> Response {
    if let (Some(limiter), Some(ConnectInfo(addr))) = (&state.limiter, connect_info) {
        let endpoint = request.uri().path().to_string();
        if !limiter.allow(addr.ip(), &endpoint) {
            debug!("rate limited {} on {endpoint}", addr.ip());
            return StatusCode::TOO_MANY_REQUESTS.into_response();
        }
    }
    next.run(request).await
}

fn handle_panic(err: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("handler panicked");
    error!("recovered from panic: {detail}");
    let body = Json(ErrorResponse {
        message: "Internal server error".to_string(),
        detail: "The server recovered from a panic".to_string(),
        request_id: String::new(),
    });
    (StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
}

/// Derive the externally visible base URL for a request.
///
/// `Forwarded` wins; the `X-Forwarded-*` pair applies only when it is
/// absent; the request's own `Host` is the last resort. The
/// configured base path is appended.
pub fn base_url(headers: &HeaderMap, base_path: &str) -> String {
    let mut host = None;
    let mut proto = None;

    if let Some(forwarded) = header_str(headers, "forwarded") {
        // Only the first (closest) proxy element matters.
        let element = forwarded.split(',').next().unwrap_or_default();
        for pair in element.split(';') {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"');
            match key.trim().to_ascii_lowercase().as_str() {
                "host" => host = Some(value.to_string()),
                "proto" => proto = Some(value.to_string()),
                _ => {}
            }
        }
    }

    if host.is_none() && proto.is_none() {
        host = header_str(headers, "x-forwarded-host")
            .map(|value| value.split(',').next().unwrap_or_default().trim().to_string());
        proto = header_str(headers, "x-forwarded-proto")
            .map(|value| value.split(',').next().unwrap_or_default().trim().to_string());
    }

    let host = host
        .filter(|value| !value.is_empty())
        .or_else(|| header_str(headers, "host").map(str::to_string))
        .unwrap_or_else(|| "localhost".to_string());
    let proto = proto.filter(|value| !value.is_empty()).unwrap_or_else(|| "http".to_string());

    format!("{proto}://{host}{base_path}")
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

async fn index() -> &'static str {
    "Marketplace is running. Point the Visual Studio Code service URL at\n\
     this server to browse and install the extensions it hosts.\n"
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
struct ItemParams {
    #[serde(rename = "itemName")]
    item_name: Option<String>,
}

async fn item(Query(params): Query<ItemParams>) -> String {
    match params.item_name {
        Some(id) => format!(
            "Extension pages are not supported. Install the extension from the\n\
             editor instead, or download it with the extension id {id}.\n"
        ),
        None => "Extension pages are not supported.\n".to_string(),
    }
}

async fn accept_and_ignore() -> StatusCode {
    StatusCode::OK
}

async fn extension_query(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<QueryResponse>, ApiError> {
    let request: QueryRequest = if body.is_empty() {
        QueryRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|err| {
            debug!("malformed query: {err}");
            ApiError::bad_request(
                &request_id,
                "Unable to read query",
                "Check that the posted data is valid",
            )
        })?
    };

    if request.filters.len() > 1 {
        return Err(ApiError::bad_request(
            &request_id,
            "Too many filters",
            "Check that the query has no more than one filter",
        ));
    }
    let filter = request.filters.into_iter().next().unwrap_or_default();
    if filter.page_size < 0 || filter.page_size > state.max_page_size {
        return Err(ApiError::bad_request(
            &request_id,
            "Invalid page size",
            format!(
                "Check that the page size is between zero and {}; contact your administrator to raise the limit",
                state.max_page_size
            ),
        ));
    }

    let flags = QueryFlags::from_bits_truncate(request.flags);
    let base = base_url(&headers, &state.base_path);
    let result = engine::run_query(state.storage.as_ref(), &filter, flags, &base)
        .await
        .map_err(|err| ApiError::from_storage(&request_id, err))?;

    Ok(Json(QueryResponse {
        results: vec![result],
    }))
}

#[derive(Debug, Deserialize)]
struct AssetParams {
    #[serde(rename = "targetPlatform")]
    target_platform: Option<String>,
}

async fn asset_redirect(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Path((publisher, extension, version, asset)): Path<(String, String, String, String)>,
    Query(params): Query<AssetParams>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    redirect_to_asset(
        &state,
        &request_id,
        &headers,
        &publisher,
        &extension,
        &version,
        &asset,
        params.target_platform.as_deref(),
    )
    .await
}

async fn vspackage_redirect(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Path((publisher, extension, version)): Path<(String, String, String)>,
    Query(params): Query<AssetParams>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    redirect_to_asset(
        &state,
        &request_id,
        &headers,
        &publisher,
        &extension,
        &version,
        "vspackage",
        params.target_platform.as_deref(),
    )
    .await
}

#[allow(clippy::too_many_arguments)]
async fn redirect_to_asset(
    state: &AppState,
    request_id: &RequestId,
    headers: &HeaderMap,
    publisher: &str,
    extension: &str,
    version: &str,
    asset: &str,
    target_platform: Option<&str>,
) -> Result<Response, ApiError> {
    let path = engine::resolve_asset(
        state.storage.as_ref(),
        publisher,
        extension,
        version,
        asset,
        target_platform,
    )
    .await
    .map_err(|err| ApiError::from_storage(request_id, err))?;

    let location = format!("{}{path}", base_url(headers, &state.base_path));
    let location = HeaderValue::from_str(&location).map_err(|_| {
        ApiError::bad_request(request_id, "Invalid request", "Asset path is not a valid URL")
    })?;
    Ok((
        StatusCode::MOVED_PERMANENTLY,
        [(header::LOCATION, location)],
    )
        .into_response())
}

async fn serve_file(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Path(path): Path<String>,
) -> Result<Response, ApiError> {
    let reader = state
        .storage
        .open(&path)
        .await
        .map_err(|err| ApiError::from_storage(&request_id, err))?;
    Ok(Body::from_stream(ReaderStream::new(reader)).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::local::LocalStorage;
    use crate::vsix::testutil::build_zip;

    fn request_id() -> RequestId {
        RequestId("test".to_string())
    }

    async fn test_state() -> (tempfile::TempDir, AppState) {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = LocalStorage::new(dir.path().to_path_buf()).expect("storage");

        let xml = r#"<PackageManifest>
  <Metadata>
    <Identity Id="zany" Version="3.0.0" Publisher="foo" />
    <DisplayName>Zany</DisplayName>
  </Metadata>
</PackageManifest>"#;
        let vsix = build_zip(&[(crate::vsix::MANIFEST_ENTRY, xml.as_bytes())]);
        let manifest = crate::manifest::parse_manifest(xml.as_bytes()).expect("manifest");
        storage
            .add_extension(&manifest, &vsix, Vec::new())
            .await
            .expect("add");

        (dir, AppState::new(Arc::new(storage), 200, ""))
    }

    fn host_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("gallery.test"));
        headers
    }

    #[test]
    fn base_url_prefers_forwarded_header() {
        let mut headers = host_headers();
        headers.insert(
            "forwarded",
            HeaderValue::from_static("host=proxy.example;proto=https"),
        );
        headers.insert("x-forwarded-host", HeaderValue::from_static("wrong.example"));
        assert_eq!(base_url(&headers, ""), "https://proxy.example");
    }

    #[test]
    fn base_url_strips_quotes_and_extra_elements() {
        let mut headers = host_headers();
        headers.insert(
            "forwarded",
            HeaderValue::from_static(
                "host=\"proxy.example:8443\";proto=https, host=inner.example",
            ),
        );
        assert_eq!(base_url(&headers, ""), "https://proxy.example:8443");
    }

    #[test]
    fn base_url_falls_back_to_x_forwarded_then_host() {
        let mut headers = host_headers();
        headers.insert(
            "x-forwarded-host",
            HeaderValue::from_static("edge.example, inner.example"),
        );
        headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));
        assert_eq!(base_url(&headers, "/gallery"), "https://edge.example/gallery");

        assert_eq!(base_url(&host_headers(), ""), "http://gallery.test");
    }

    #[tokio::test]
    async fn query_with_empty_body_is_an_empty_query() {
        let (_dir, state) = test_state().await;
        let Json(response) = extension_query(
            State(state),
            Extension(request_id()),
            host_headers(),
            Bytes::new(),
        )
        .await
        .expect("query");
        assert_eq!(response.results.len(), 1);
        assert_eq!(response.results[0].extensions.len(), 1);
    }

    #[tokio::test]
    async fn malformed_query_is_a_400() {
        let (_dir, state) = test_state().await;
        let err = extension_query(
            State(state),
            Extension(request_id()),
            host_headers(),
            Bytes::from_static(b"{not json"),
        )
        .await
        .expect_err("malformed body");
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.message, "Unable to read query");
    }

    #[tokio::test]
    async fn too_many_filters_is_a_400() {
        let (_dir, state) = test_state().await;
        let err = extension_query(
            State(state),
            Extension(request_id()),
            host_headers(),
            Bytes::from_static(br#"{"filters":[{},{}]}"#),
        )
        .await
        .expect_err("two filters");
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.message, "Too many filters");
    }

    #[tokio::test]
    async fn oversized_page_is_a_400_naming_the_limit() {
        let (_dir, state) = test_state().await;
        let err = extension_query(
            State(state),
            Extension(request_id()),
            host_headers(),
            Bytes::from_static(br#"{"filters":[{"pageSize":500}]}"#),
        )
        .await
        .expect_err("oversized page");
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert!(err.detail.contains("200"));
        assert!(err.detail.contains("administrator"));
    }

    #[tokio::test]
    async fn asset_redirect_points_at_files() {
        let (_dir, state) = test_state().await;
        let response = redirect_to_asset(
            &state,
            &request_id(),
            &host_headers(),
            "foo",
            "zany",
            "3.0.0",
            "vspackage",
            None,
        )
        .await
        .expect("redirect");
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            response.headers()[header::LOCATION],
            "http://gallery.test/files/foo/zany/3.0.0/foo.zany-3.0.0.vsix"
        );
    }

    #[tokio::test]
    async fn missing_asset_is_a_404_envelope() {
        let (_dir, state) = test_state().await;
        let err = redirect_to_asset(
            &state,
            &request_id(),
            &host_headers(),
            "foo",
            "missing",
            "1.0.0",
            "vspackage",
            None,
        )
        .await
        .expect_err("missing extension");
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.request_id, "test");
    }
}
