use std::{
    collections::HashSet,
    io::Write,
    sync::{Arc, Mutex},
};

use axum::{
    extract::{Path, Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{AppendHeaders, IntoResponse, Response},
    routing::get,
    Router,
};
use base64::Engine;
use flate2::{write::GzEncoder, Compression};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use uuid::Uuid;

pub const DEFAULT_USERNAME: &str = "surveyor";
pub const DEFAULT_PASSWORD: &str = "tiles123";

/// One request as seen by the server, captured before routing.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordedRequest {
    pub path: String,
    pub authorization: Option<String>,
    pub cookies: Vec<String>,
}

#[derive(Clone)]
pub struct AppState {
    name: String,
    username: String,
    password: String,
    sessions: Arc<Mutex<HashSet<String>>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl AppState {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            username: DEFAULT_USERNAME.to_string(),
            password: DEFAULT_PASSWORD.to_string(),
            sessions: Arc::default(),
            requests: Arc::default(),
        }
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.username = username.to_string();
        self.password = password.to_string();
        self
    }

    /// Snapshot of every request received so far, in arrival order.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Requests whose path starts with `prefix`.
    pub fn requests_to(&self, prefix: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.path.starts_with(prefix))
            .collect()
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        let expected = format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD
                .encode(format!("{}:{}", self.username, self.password))
        );
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == expected)
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new("tiles")
    }
}

#[derive(Deserialize)]
pub struct BounceParams {
    pub to: String,
}

pub fn app() -> Router {
    app_with_state(AppState::default())
}

pub fn app_with_state(state: AppState) -> Router {
    Router::new()
        .route("/tiles/{z}/{x}/{y}", get(tile))
        .route("/gzip/tiles/{z}/{x}/{y}", get(gzip_tile))
        .route("/hops/{n}", get(hops))
        .route("/bounce", get(bounce))
        .route("/relative", get(relative))
        .route("/loop", get(redirect_loop))
        .route("/broken-redirect", get(broken_redirect))
        .route("/status/{code}", get(status))
        .route("/protected/tiles/{z}/{x}/{y}", get(protected_tile))
        .route("/session/start", get(session_start))
        .route("/session/tiles/{z}/{x}/{y}", get(session_tile))
        .route("/sso/start", get(sso_start))
        .route("/sso/portal", get(sso_portal))
        .layer(middleware::from_fn_with_state(state.clone(), record))
        .with_state(state)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    run_with_state(listener, AppState::default()).await
}

pub async fn run_with_state(listener: TcpListener, state: AppState) -> Result<(), std::io::Error> {
    axum::serve(listener, app_with_state(state)).await
}

/// Body served for a tile coordinate. Prefixed with the server name so tests
/// can tell which host answered.
pub fn tile_body(server: &str, z: u32, x: u32, y: u32) -> String {
    format!("{server}:tile:{z}/{x}/{y}")
}

/// Split every `Cookie` header into its `name=value` segments.
pub fn cookie_pairs(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .map(|pair| pair.trim().to_string())
        .filter(|pair| !pair.is_empty())
        .collect()
}

async fn record(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let recorded = RecordedRequest {
        path: request.uri().path().to_string(),
        authorization: request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        cookies: request
            .headers()
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::to_string)
            .collect(),
    };
    if let Ok(mut requests) = state.requests.lock() {
        requests.push(recorded);
    }
    next.run(request).await
}

async fn tile(State(state): State<AppState>, Path((z, x, y)): Path<(u32, u32, u32)>) -> String {
    tile_body(&state.name, z, x, y)
}

async fn gzip_tile(
    State(state): State<AppState>,
    Path((z, x, y)): Path<(u32, u32, u32)>,
) -> Result<Response, StatusCode> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(tile_body(&state.name, z, x, y).as_bytes())
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let compressed = encoder.finish().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(([(header::CONTENT_ENCODING, "gzip")], compressed).into_response())
}

async fn hops(State(state): State<AppState>, Path(n): Path<u32>) -> Response {
    if n == 0 {
        return format!("{}:hops:done", state.name).into_response();
    }
    found(&format!("/hops/{}", n - 1))
}

async fn bounce(Query(params): Query<BounceParams>) -> Response {
    found(&params.to)
}

async fn relative() -> Response {
    (StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, "/tiles/9/9/9")]).into_response()
}

async fn redirect_loop() -> Response {
    found("/loop")
}

async fn broken_redirect() -> StatusCode {
    StatusCode::FOUND
}

async fn status(Path(code): Path<u16>) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_REQUEST)
}

async fn protected_tile(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((z, x, y)): Path<(u32, u32, u32)>,
) -> Response {
    if !state.authorized(&headers) {
        return unauthorized();
    }
    tile_body(&state.name, z, x, y).into_response()
}

async fn session_start(State(state): State<AppState>) -> Response {
    let sid = Uuid::new_v4().to_string();
    if let Ok(mut sessions) = state.sessions.lock() {
        sessions.insert(sid.clone());
    }
    (
        StatusCode::FOUND,
        AppendHeaders([
            (header::SET_COOKIE, format!("sid={sid}; Path=/; HttpOnly")),
            (header::SET_COOKIE, "region=emea; Path=/".to_string()),
            (header::LOCATION, "/session/tiles/0/0/0".to_string()),
        ]),
    )
        .into_response()
}

async fn session_tile(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((z, x, y)): Path<(u32, u32, u32)>,
) -> Response {
    let pairs = cookie_pairs(&headers);
    let known_session = pairs
        .iter()
        .filter_map(|pair| pair.strip_prefix("sid="))
        .any(|sid| state.sessions.lock().is_ok_and(|s| s.contains(sid)));
    let has_region = pairs.iter().any(|pair| pair == "region=emea");
    if !known_session || !has_region {
        return StatusCode::FORBIDDEN.into_response();
    }
    tile_body(&state.name, z, x, y).into_response()
}

async fn sso_start() -> Response {
    (
        StatusCode::FOUND,
        [
            (header::LOCATION, "/sso/portal"),
            (header::ALLOW, "GET, Authorization"),
        ],
    )
        .into_response()
}

async fn sso_portal(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !state.authorized(&headers) {
        return unauthorized();
    }
    format!("{}:portal", state.name).into_response()
}

fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic realm=\"tiles\"")],
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tile_body_names_server_and_coordinate() {
        assert_eq!(tile_body("a", 3, 4, 5), "a:tile:3/4/5");
    }

    #[test]
    fn cookie_pairs_splits_every_header() {
        let mut headers = HeaderMap::new();
        headers.append(header::COOKIE, "sid=1; Path=/; HttpOnly".parse().unwrap());
        headers.append(header::COOKIE, "region=emea".parse().unwrap());
        assert_eq!(
            cookie_pairs(&headers),
            vec!["sid=1", "Path=/", "HttpOnly", "region=emea"]
        );
    }

    #[test]
    fn authorized_accepts_only_configured_credentials() {
        let state = AppState::new("t").with_credentials("u", "p");
        let mut headers = HeaderMap::new();
        assert!(!state.authorized(&headers));
        headers.insert(header::AUTHORIZATION, "Basic dTpw".parse().unwrap());
        assert!(state.authorized(&headers));
        headers.insert(header::AUTHORIZATION, "Basic dTp4".parse().unwrap());
        assert!(!state.authorized(&headers));
    }

    #[test]
    fn bounce_params_require_target() {
        let ok: Result<BounceParams, _> = serde_json::from_str(r#"{"to":"http://x/"}"#);
        assert_eq!(ok.unwrap().to, "http://x/");
        let missing: Result<BounceParams, _> = serde_json::from_str("{}");
        assert!(missing.is_err());
    }

    #[test]
    fn recorded_request_roundtrips_through_json() {
        let recorded = RecordedRequest {
            path: "/tiles/1/2/3".to_string(),
            authorization: None,
            cookies: vec!["sid=1".to_string()],
        };
        let json = serde_json::to_string(&recorded).unwrap();
        let back: RecordedRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, recorded);
    }
}
