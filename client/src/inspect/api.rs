//! # Inspector API
//!
//! The local HTTP surface on a loopback address (default `127.0.0.1:4040`,
//! probing 4041-4049 when taken): exchange listing with filters, detail,
//! summary, SSE live stream, replay, and ring-buffer clearing. Unknown
//! non-API paths fall through to the embedded dashboard.

use crate::inspect::capture::ExchangeParser;
use crate::inspect::{ui, Exchange};
use crate::state::AgentState;
use anyhow::Context as _;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures::StreamExt;
use fxtunnel_protocol::unix_millis;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::info;

/// Replay aborts when the local service stays silent this long.
const REPLAY_TIMEOUT: Duration = Duration::from_secs(30);

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 1000;

#[derive(Clone)]
pub struct ApiState {
    pub agent: Arc<AgentState>,
}

// ─── Router & Binding ───────────────────────────────────────────

pub fn router(agent: Arc<AgentState>) -> Router {
    Router::new()
        .route("/api/status", get(status))
        .route("/api/tunnels", get(tunnels))
        .route(
            "/api/requests/http",
            get(list).post(replay).delete(clear),
        )
        .route("/api/requests/http/summary", get(summary))
        .route("/api/requests/http/stream", get(stream))
        .route("/api/requests/http/{id}", get(detail))
        .fallback(ui::serve_asset)
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(ApiState { agent })
}

/// Binds the inspector address. When the default port 4040 is taken, the
/// next ports through 4049 are probed before giving up.
pub async fn bind(addr: &str) -> anyhow::Result<TcpListener> {
    let requested: SocketAddr = addr
        .parse()
        .with_context(|| format!("`{addr}` is not a valid inspector address"))?;
    match TcpListener::bind(requested).await {
        Ok(listener) => Ok(listener),
        Err(original) if requested.port() == 4040 => {
            for port in 4041..=4049u16 {
                let mut fallback = requested;
                fallback.set_port(port);
                if let Ok(listener) = TcpListener::bind(fallback).await {
                    return Ok(listener);
                }
            }
            Err(original).context("ports 4040-4049 are all taken")
        }
        Err(e) => Err(e).with_context(|| format!("binding inspector on {requested}")),
    }
}

pub async fn serve(agent: Arc<AgentState>, listener: TcpListener) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    info!(addr = %addr, "inspector up");
    axum::serve(listener, router(agent)).await?;
    Ok(())
}

// ─── Error Shape ────────────────────────────────────────────────

#[derive(Debug)]
struct ApiError(StatusCode, String);

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self(StatusCode::NOT_FOUND, message.into())
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self(StatusCode::BAD_REQUEST, message.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.0, Json(serde_json::json!({ "error": self.1 }))).into_response()
    }
}

// ─── Status & Tunnels ───────────────────────────────────────────

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    uptime_seconds: u64,
    inspect_enabled: bool,
    total_exchanges: u64,
}

async fn status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let inspector = &state.agent.inspector;
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: inspector.uptime_seconds(),
        inspect_enabled: inspector.enabled,
        total_exchanges: inspector.total_exchanges(),
    })
}

#[derive(Serialize)]
struct TunnelView {
    tunnel_id: String,
    name: String,
    #[serde(rename = "type")]
    tunnel_type: String,
    local_port: u16,
    public_address: String,
}

async fn tunnels(State(state): State<ApiState>) -> Json<Vec<TunnelView>> {
    let tunnels = state.agent.tunnels.read().await;
    Json(
        tunnels
            .iter()
            .map(|t| TunnelView {
                tunnel_id: t.tunnel_id.clone(),
                name: t.name.clone(),
                tunnel_type: t.tunnel_type.to_string(),
                local_port: t.local_port,
                public_address: t.public_address.clone(),
            })
            .collect(),
    )
}

// ─── Exchange Views ─────────────────────────────────────────────

#[derive(Serialize)]
struct ExchangeSummary {
    id: String,
    tunnel_id: String,
    method: String,
    host: String,
    path: String,
    status: u16,
    started_at: u64,
    duration_ms: u64,
    request_body_size: u64,
    response_body_size: u64,
    malformed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    replay_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_body: Option<String>,
}

impl ExchangeSummary {
    fn from_exchange(x: &Exchange, include_body: bool) -> Self {
        Self {
            id: x.id.clone(),
            tunnel_id: x.tunnel_id.clone(),
            method: x.method.clone(),
            host: x.host.clone(),
            path: x.path.clone(),
            status: x.response_status,
            started_at: x.started_at,
            duration_ms: x.duration_ns / 1_000_000,
            request_body_size: x.request_body_size,
            response_body_size: x.response_body_size,
            malformed: x.malformed,
            replay_ref: x.replay_ref.clone(),
            request_body: include_body.then(|| BASE64.encode(&x.request_body)),
            response_body: include_body.then(|| BASE64.encode(&x.response_body)),
        }
    }
}

#[derive(Serialize)]
struct ExchangeDetail {
    id: String,
    tunnel_id: String,
    method: String,
    host: String,
    path: String,
    status: u16,
    request_headers: Vec<(String, String)>,
    request_body: String,
    request_truncated: bool,
    request_body_size: u64,
    response_headers: Vec<(String, String)>,
    response_body: String,
    response_truncated: bool,
    response_body_size: u64,
    started_at: u64,
    duration_ns: u64,
    malformed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    replay_ref: Option<String>,
}

impl ExchangeDetail {
    fn from_exchange(x: &Exchange) -> Self {
        Self {
            id: x.id.clone(),
            tunnel_id: x.tunnel_id.clone(),
            method: x.method.clone(),
            host: x.host.clone(),
            path: x.path.clone(),
            status: x.response_status,
            request_headers: x.request_headers.clone(),
            request_body: BASE64.encode(&x.request_body),
            request_truncated: x.request_truncated,
            request_body_size: x.request_body_size,
            response_headers: x.response_headers.clone(),
            response_body: BASE64.encode(&x.response_body),
            response_truncated: x.response_truncated,
            response_body_size: x.response_body_size,
            started_at: x.started_at,
            duration_ns: x.duration_ns,
            malformed: x.malformed,
            replay_ref: x.replay_ref.clone(),
        }
    }
}

// ─── List & Filters ─────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ListQuery {
    limit: Option<usize>,
    method: Option<String>,
    status: Option<String>,
    path: Option<String>,
    search: Option<String>,
    since: Option<String>,
    include_body: Option<bool>,
}

async fn list(
    State(state): State<ApiState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<ExchangeSummary>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
    let status_filter = query
        .status
        .as_deref()
        .map(|s| StatusFilter::parse(s).ok_or_else(|| ApiError::bad_request("bad status filter")))
        .transpose()?;
    let since_cutoff = query
        .since
        .as_deref()
        .map(|s| {
            humantime::parse_duration(s)
                .map(|d| unix_millis().saturating_sub(d.as_millis() as u64))
                .map_err(|_| ApiError::bad_request(format!("bad since duration `{s}`")))
        })
        .transpose()?;
    let include_body = query.include_body.unwrap_or(false);

    let mut snapshot = state.agent.inspector.snapshot();
    snapshot.reverse(); // newest first

    let matches = |x: &Exchange| -> bool {
        if let Some(method) = &query.method {
            if !x.method.eq_ignore_ascii_case(method) {
                return false;
            }
        }
        if let Some(filter) = &status_filter {
            if !filter.matches(x.response_status) {
                return false;
            }
        }
        if let Some(pattern) = &query.path {
            if !glob_match(pattern, &x.path) {
                return false;
            }
        }
        if let Some(needle) = &query.search {
            let in_request = contains_bytes(&x.request_body, needle.as_bytes());
            let in_response = contains_bytes(&x.response_body, needle.as_bytes());
            if !in_request && !in_response {
                return false;
            }
        }
        if let Some(cutoff) = since_cutoff {
            if x.started_at < cutoff {
                return false;
            }
        }
        true
    };

    Ok(Json(
        snapshot
            .iter()
            .filter(|x| matches(x))
            .take(limit)
            .map(|x| ExchangeSummary::from_exchange(x, include_body))
            .collect(),
    ))
}

/// `5xx` style class filters and exact codes.
enum StatusFilter {
    Class(u16),
    Exact(u16),
}

impl StatusFilter {
    fn parse(s: &str) -> Option<Self> {
        if let Some(class) = s.strip_suffix("xx") {
            let class: u16 = class.parse().ok()?;
            (1..=5).contains(&class).then_some(StatusFilter::Class(class))
        } else {
            let code: u16 = s.parse().ok()?;
            (100..=599).contains(&code).then_some(StatusFilter::Exact(code))
        }
    }

    fn matches(&self, status: u16) -> bool {
        match self {
            StatusFilter::Class(class) => status / 100 == *class,
            StatusFilter::Exact(code) => status == *code,
        }
    }
}

/// Glob where `*` matches any byte sequence (including empty).
fn glob_match(pattern: &str, text: &str) -> bool {
    let p = pattern.as_bytes();
    let t = text.as_bytes();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut mark = 0usize;
    while ti < t.len() {
        if pi < p.len() && (p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == b'*' {
            star = Some(pi);
            mark = ti;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            ti = mark;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == b'*' {
        pi += 1;
    }
    pi == p.len()
}

fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}

// ─── Summary ────────────────────────────────────────────────────

#[derive(Serialize)]
struct SummaryResponse {
    total: u64,
    by_status: BTreeMap<String, u64>,
    by_method: BTreeMap<String, u64>,
    error_rate: f64,
    avg_duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_request_at: Option<u64>,
}

async fn summary(State(state): State<ApiState>) -> Json<SummaryResponse> {
    let snapshot = state.agent.inspector.snapshot();
    let total = snapshot.len() as u64;
    let mut by_status: BTreeMap<String, u64> = BTreeMap::new();
    let mut by_method: BTreeMap<String, u64> = BTreeMap::new();
    let mut errors = 0u64;
    let mut duration_ms_sum = 0u64;
    let mut last_request_at = None;

    for x in &snapshot {
        *by_status
            .entry(format!("{}xx", x.response_status / 100))
            .or_default() += 1;
        *by_method.entry(x.method.to_ascii_uppercase()).or_default() += 1;
        if x.response_status >= 400 {
            errors += 1;
        }
        duration_ms_sum += x.duration_ns / 1_000_000;
        last_request_at = last_request_at.max(Some(x.started_at));
    }

    Json(SummaryResponse {
        total,
        by_status,
        by_method,
        error_rate: if total == 0 {
            0.0
        } else {
            errors as f64 / total as f64
        },
        avg_duration_ms: if total == 0 { 0 } else { duration_ms_sum / total },
        last_request_at,
    })
}

// ─── Detail, Clear, Stream ──────────────────────────────────────

async fn detail(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<ExchangeDetail>, ApiError> {
    state
        .agent
        .inspector
        .get(&id)
        .map(|x| Json(ExchangeDetail::from_exchange(&x)))
        .ok_or_else(|| ApiError::not_found(format!("no exchange `{id}`")))
}

async fn clear(State(state): State<ApiState>) -> StatusCode {
    state.agent.inspector.clear();
    StatusCode::NO_CONTENT
}

/// Live exchange feed. Latest-only: nothing is replayed on (re)connect; a
/// `: ping` comment goes out every 30 seconds.
async fn stream(
    State(state): State<ApiState>,
) -> Sse<impl futures::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let rx = state.agent.inspector.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|item| async move {
        match item {
            Ok(exchange) => {
                let summary = ExchangeSummary::from_exchange(&exchange, false);
                let data = serde_json::to_string(&summary).ok()?;
                Some(Ok(Event::default().event("exchange").data(data)))
            }
            // This subscriber lagged; its oldest events are gone.
            Err(BroadcastStreamRecvError::Lagged(_)) => None,
        }
    });
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(30))
            .text("ping"),
    )
}

// ─── Replay ─────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ReplayRequest {
    id: String,
    method: Option<String>,
    path: Option<String>,
    /// Merged over the original headers, name-insensitively.
    headers: Option<Vec<(String, String)>>,
    /// Base64; replaces the original body.
    body: Option<String>,
}

#[derive(Serialize)]
struct ReplayResponse {
    status_code: u16,
    response_headers: Vec<(String, String)>,
    /// Base64.
    response_body: String,
    exchange_id: String,
}

/// Re-issues a recorded request against the local service and records the
/// outcome as a new exchange pointing back at the original.
async fn replay(
    State(state): State<ApiState>,
    Json(request): Json<ReplayRequest>,
) -> Result<Json<ReplayResponse>, ApiError> {
    let original = state
        .agent
        .inspector
        .get(&request.id)
        .ok_or_else(|| ApiError::not_found(format!("no exchange `{}`", request.id)))?;
    let tunnel = state
        .agent
        .tunnel_by_id(&original.tunnel_id)
        .await
        .ok_or_else(|| {
            ApiError(
                StatusCode::CONFLICT,
                format!("tunnel `{}` is no longer active", original.tunnel_id),
            )
        })?;

    let method = request.method.unwrap_or_else(|| original.method.clone());
    let path = request.path.unwrap_or_else(|| original.path.clone());
    let body = match request.body {
        Some(encoded) => BASE64
            .decode(encoded.as_bytes())
            .map_err(|_| ApiError::bad_request("body is not valid base64"))?,
        None => original.request_body.clone(),
    };
    let headers = merge_headers(
        &original.request_headers,
        request.headers.as_deref().unwrap_or(&[]),
        &original.host,
        body.len(),
    );
    let raw = build_request_bytes(&method, &path, &headers, &body);

    let max_body = state.agent.inspector.max_body_size as usize;
    let draft = tokio::time::timeout(
        REPLAY_TIMEOUT,
        issue_replay(
            tunnel.local_port,
            &raw,
            &original.tunnel_id,
            max_body,
            &original.id,
        ),
    )
    .await
    .map_err(|_| {
        ApiError(
            StatusCode::GATEWAY_TIMEOUT,
            "local service did not answer in time".into(),
        )
    })?
    .map_err(|e| ApiError(StatusCode::BAD_GATEWAY, e.to_string()))?;

    let exchange = state.agent.inspector.record(draft);
    Ok(Json(ReplayResponse {
        status_code: exchange.response_status,
        response_headers: exchange.response_headers.clone(),
        response_body: BASE64.encode(&exchange.response_body),
        exchange_id: exchange.id.clone(),
    }))
}

/// Overrides win by case-insensitive name; framing headers are rebuilt.
fn merge_headers(
    original: &[(String, String)],
    overrides: &[(String, String)],
    host: &str,
    body_len: usize,
) -> Vec<(String, String)> {
    let dropped = ["content-length", "transfer-encoding", "connection"];
    let mut merged: Vec<(String, String)> = original
        .iter()
        .filter(|(name, _)| !dropped.contains(&name.to_ascii_lowercase().as_str()))
        .cloned()
        .collect();
    for (name, value) in overrides {
        if dropped.contains(&name.to_ascii_lowercase().as_str()) {
            continue;
        }
        match merged
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            Some(slot) => slot.1 = value.clone(),
            None => merged.push((name.clone(), value.clone())),
        }
    }
    if !merged.iter().any(|(n, _)| n.eq_ignore_ascii_case("host")) && !host.is_empty() {
        merged.push(("Host".into(), host.to_string()));
    }
    merged.push(("Content-Length".into(), body_len.to_string()));
    merged.push(("Connection".into(), "close".into()));
    merged
}

fn build_request_bytes(method: &str, path: &str, headers: &[(String, String)], body: &[u8]) -> Vec<u8> {
    let mut raw = format!("{method} {path} HTTP/1.1\r\n").into_bytes();
    for (name, value) in headers {
        raw.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    raw.extend_from_slice(b"\r\n");
    raw.extend_from_slice(body);
    raw
}

async fn issue_replay(
    local_port: u16,
    raw: &[u8],
    tunnel_id: &str,
    max_body: usize,
    replay_ref: &str,
) -> anyhow::Result<crate::inspect::capture::ExchangeDraft> {
    let mut parser = ExchangeParser::new(tunnel_id, max_body).with_replay_ref(replay_ref);
    parser.push_request(raw);

    let mut stream = TcpStream::connect(("127.0.0.1", local_port))
        .await
        .with_context(|| format!("dialing 127.0.0.1:{local_port}"))?;
    stream.write_all(raw).await?;
    stream.flush().await?;

    let mut buf = [0u8; 8192];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            let draft = parser
                .finish()
                .into_iter()
                .next()
                .context("local service closed without a response")?;
            anyhow::ensure!(
                draft.response_status != 0,
                "local service closed without a response"
            );
            return Ok(draft);
        }
        if let Some(draft) = parser.push_response(&buf[..n]).into_iter().next() {
            return Ok(draft);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::history::NullHistory;
    use crate::inspect::capture::ExchangeDraft;
    use crate::inspect::InspectorState;
    use crate::state::ActiveTunnel;
    use fxtunnel_protocol::TunnelType;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn glob_semantics() {
        assert!(glob_match("/api/*", "/api/foo"));
        assert!(glob_match("/api/*", "/api/foo/bar"));
        assert!(!glob_match("/api/*", "/api"));
        assert!(!glob_match("/api/*", "/other/api/x"));
        assert!(glob_match("*", "/anything"));
        assert!(glob_match("/a*c", "/abc"));
        assert!(glob_match("/a*c", "/ac"));
        assert!(!glob_match("/a*c", "/ab"));
    }

    #[test]
    fn status_filter_semantics() {
        let class = StatusFilter::parse("5xx").unwrap();
        assert!(class.matches(500));
        assert!(class.matches(599));
        assert!(!class.matches(404));
        let exact = StatusFilter::parse("418").unwrap();
        assert!(exact.matches(418));
        assert!(!exact.matches(400));
        assert!(StatusFilter::parse("9xx").is_none());
        assert!(StatusFilter::parse("abc").is_none());
    }

    #[test]
    fn merge_headers_overrides_and_reframes() {
        let original = vec![
            ("Host".to_string(), "abc.example".to_string()),
            ("Content-Length".to_string(), "99".to_string()),
            ("X-Token".to_string(), "old".to_string()),
        ];
        let overrides = vec![("x-token".to_string(), "new".to_string())];
        let merged = merge_headers(&original, &overrides, "abc.example", 4);
        assert!(merged
            .iter()
            .any(|(n, v)| n == "X-Token" && v == "new"));
        assert!(merged
            .iter()
            .any(|(n, v)| n == "Content-Length" && v == "4"));
        assert_eq!(
            merged
                .iter()
                .filter(|(n, _)| n.eq_ignore_ascii_case("content-length"))
                .count(),
            1
        );
    }

    fn draft(path: &str, status: u16, started_at: u64) -> ExchangeDraft {
        ExchangeDraft {
            tunnel_id: "t-1".into(),
            method: "GET".into(),
            host: "h".into(),
            path: path.into(),
            request_headers: Vec::new(),
            request_body: Vec::new(),
            request_truncated: false,
            request_body_size: 0,
            response_status: status,
            response_headers: Vec::new(),
            response_body: b"needle-in-body".to_vec(),
            response_truncated: false,
            response_body_size: 14,
            started_at,
            duration_ns: 2_000_000,
            malformed: false,
            replay_ref: None,
        }
    }

    fn api_state(inspector: Arc<InspectorState>) -> ApiState {
        ApiState {
            agent: crate::state::AgentState::new(
                ClientConfig::default(),
                inspector,
                Arc::new(NullHistory::new()),
            ),
        }
    }

    #[tokio::test]
    async fn since_filter_boundary() {
        let inspector = InspectorState::new(true, 1024, 16);
        let now = unix_millis();
        inspector.record(draft("/old", 200, now - 5 * 60 * 1000 - 1000));
        inspector.record(draft("/new", 200, now - 4 * 60 * 1000 - 59 * 1000));
        let state = api_state(inspector);

        let result = list(
            State(state),
            Query(ListQuery {
                since: Some("5m".into()),
                ..Default::default()
            }),
        )
        .await
        .unwrap();
        assert_eq!(result.0.len(), 1);
        assert_eq!(result.0[0].path, "/new");
    }

    #[tokio::test]
    async fn list_filters_and_limit() {
        let inspector = InspectorState::new(true, 1024, 64);
        let now = unix_millis();
        for i in 0..10 {
            inspector.record(draft(&format!("/api/item{i}"), 200, now));
        }
        inspector.record(draft("/api/broken", 503, now));
        let state = api_state(inspector);

        let result = list(
            State(state.clone()),
            Query(ListQuery {
                status: Some("5xx".into()),
                ..Default::default()
            }),
        )
        .await
        .unwrap();
        assert_eq!(result.0.len(), 1);
        assert_eq!(result.0[0].path, "/api/broken");

        let result = list(
            State(state.clone()),
            Query(ListQuery {
                path: Some("/api/*".into()),
                limit: Some(3),
                ..Default::default()
            }),
        )
        .await
        .unwrap();
        assert_eq!(result.0.len(), 3);

        let result = list(
            State(state),
            Query(ListQuery {
                search: Some("needle".into()),
                limit: Some(1000),
                ..Default::default()
            }),
        )
        .await
        .unwrap();
        assert_eq!(result.0.len(), 11);
    }

    #[tokio::test]
    async fn summary_math() {
        let inspector = InspectorState::new(true, 1024, 16);
        let now = unix_millis();
        inspector.record(draft("/a", 200, now - 10));
        inspector.record(draft("/b", 200, now - 5));
        inspector.record(draft("/c", 500, now));
        let state = api_state(inspector);

        let result = summary(State(state)).await;
        assert_eq!(result.0.total, 3);
        assert_eq!(result.0.by_status["2xx"], 2);
        assert_eq!(result.0.by_status["5xx"], 1);
        assert_eq!(result.0.by_method["GET"], 3);
        assert!((result.0.error_rate - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(result.0.last_request_at, Some(now));
        assert_eq!(result.0.avg_duration_ms, 2);
    }

    #[tokio::test]
    async fn replay_records_new_exchange_with_ref() {
        // Mock local service: always answers 200 "ok".
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        std::thread::spawn(move || {
            use std::io::{Read, Write};
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                let mut buf = [0u8; 4096];
                let mut seen = Vec::new();
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            seen.extend_from_slice(&buf[..n]);
                            if seen.windows(4).any(|w| w == b"\r\n\r\n") {
                                break;
                            }
                        }
                    }
                }
                let _ = stream
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok");
            }
        });

        let inspector = InspectorState::new(true, 1024, 16);
        let now = unix_millis();
        let recorded = inspector.record(draft("/x", 500, now));
        let state = api_state(inspector);
        state.agent.tunnels.write().await.push(ActiveTunnel {
            tunnel_id: "t-1".into(),
            name: "web".into(),
            tunnel_type: TunnelType::Http,
            local_port: port,
            public_address: "http://x.test".into(),
            history_id: 0,
            bytes_sent: Arc::new(AtomicU64::new(0)),
            bytes_received: Arc::new(AtomicU64::new(0)),
        });

        let result = replay(
            State(state.clone()),
            Json(ReplayRequest {
                id: recorded.id.clone(),
                method: None,
                path: None,
                headers: None,
                body: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(result.0.status_code, 200);
        assert_eq!(BASE64.decode(&result.0.response_body).unwrap(), b"ok");

        let replayed = state.agent.inspector.get(&result.0.exchange_id).unwrap();
        assert_eq!(replayed.replay_ref.as_deref(), Some(recorded.id.as_str()));
        assert_eq!(replayed.response_status, 200);
    }
}
