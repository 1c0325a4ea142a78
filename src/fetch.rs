use std::error::Error as StdError;
use std::time::Duration;

use clap::ValueEnum;
use hyper::ext::ReasonPhrase;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT};
use reqwest::{Client, Response, StatusCode};
use thiserror::Error;
use tracing::{debug, warn};

use crate::types::{Category, FetchReport};

/// User-Agent sent on every outbound request.
pub const USER_AGENT: &str = "SSRF-Relay/1.0";

/// Largest body excerpt kept from a successful fetch.
pub const SUCCESS_BODY_CAP: usize = 3000;

/// Largest body excerpt kept from an HTTP error response.
pub const ERROR_BODY_CAP: usize = 1000;

/// Largest `<data>` block rendered into the webhook text.
pub const TEXT_DATA_CAP: usize = 3000;

/// Certificate handling for outbound requests.
///
/// `AcceptInvalid` turns off both certificate chain and hostname checks. The
/// relay exists to show that a destination answers at all, so self-signed
/// and metadata endpoints must not be filtered out by TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TlsPolicy {
    Verify,
    AcceptInvalid,
}

/// Per-mode request policy.
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    /// Hard bound on the whole exchange, connect through body.
    pub timeout: Duration,
    pub tls: TlsPolicy,
    /// Send `Metadata-Flavor: Google` and `Metadata: true`.
    pub metadata_headers: bool,
}

impl FetchPolicy {
    /// Single-target relay policy.
    pub fn relay(timeout: Duration, tls: TlsPolicy) -> Self {
        Self { timeout, tls, metadata_headers: false }
    }

    /// Multi-target scan policy.
    pub fn scan(timeout: Duration, tls: TlsPolicy) -> Self {
        Self { timeout, tls, metadata_headers: true }
    }
}

/// A 2xx/3xx response and its (capped) body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    pub status: u16,
    pub body: String,
}

/// Every way a fetch can fail. `Display` is the text shown to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The server answered with a 4xx/5xx status.
    #[error("HTTP Error {code}: {reason}")]
    Http {
        code: u16,
        reason: String,
        body: Option<String>,
    },

    /// DNS failure, refused connection or timeout.
    #[error("Connection Error: {0}")]
    Connection(String),

    /// Bad URL, unsupported scheme, redirect loop, undecodable body...
    #[error("Error: {kind}: {message}")]
    Other { kind: &'static str, message: String },
}

pub type FetchOutcome = Result<Fetched, FetchError>;

/// Reusable outbound client bound to one [`FetchPolicy`].
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: Client,
    policy: FetchPolicy,
}

impl Fetcher {
    pub fn new(policy: FetchPolicy) -> reqwest::Result<Self> {
        let client = build_client(&policy)?;
        Ok(Self { client, policy })
    }

    pub fn policy(&self) -> &FetchPolicy {
        &self.policy
    }

    /// GET `url` and classify the result. Never fails outward.
    pub async fn fetch(&self, url: &str, extra_headers: Option<HeaderMap>) -> FetchOutcome {
        let outcome = self.fetch_inner(url, extra_headers).await;
        match &outcome {
            Ok(f) => debug!(url, status = f.status, bytes = f.body.len(), "fetch succeeded"),
            Err(FetchError::Connection(reason)) => warn!(url, %reason, "fetch could not connect"),
            Err(e) => debug!(url, error = %e, "fetch failed"),
        }
        outcome
    }

    /// Fetch and flatten into a [`FetchReport`].
    pub async fn report(&self, url: &str, extra_headers: Option<HeaderMap>) -> FetchReport {
        to_report(url, &self.fetch(url, extra_headers).await)
    }

    async fn fetch_inner(&self, url: &str, extra_headers: Option<HeaderMap>) -> FetchOutcome {
        let mut request = self.client.get(url);
        if let Some(headers) = extra_headers {
            request = request.headers(headers);
        }

        let response = request.send().await.map_err(classify)?;
        let status = response.status();

        if status.is_client_error() || status.is_server_error() {
            let reason = reason_phrase(&response);
            // A broken error body is dropped without a trace.
            let body = read_capped(response, ERROR_BODY_CAP).await.ok();
            return Err(FetchError::Http {
                code: status.as_u16(),
                reason,
                body,
            });
        }

        let body = read_capped(response, SUCCESS_BODY_CAP).await.map_err(classify)?;
        Ok(Fetched { status: status.as_u16(), body })
    }
}

fn build_client(policy: &FetchPolicy) -> reqwest::Result<Client> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
    if policy.metadata_headers {
        headers.insert(
            HeaderName::from_static("metadata-flavor"),
            HeaderValue::from_static("Google"),
        );
        headers.insert(HeaderName::from_static("metadata"), HeaderValue::from_static("true"));
    }

    let mut builder = Client::builder()
        .user_agent(USER_AGENT)
        .default_headers(headers)
        .timeout(policy.timeout);

    if policy.tls == TlsPolicy::AcceptInvalid {
        builder = builder
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true);
    }

    builder.build()
}

/// Stream at most `cap` bytes of body and decode them lossily.
async fn read_capped(mut response: Response, cap: usize) -> reqwest::Result<String> {
    // A few bytes past the cap let a multi-byte char straddling it decode whole.
    let limit = cap + 3;
    let mut buf: Vec<u8> = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        buf.extend_from_slice(&chunk);
        if buf.len() >= limit {
            buf.truncate(limit);
            break;
        }
    }
    Ok(excerpt(&buf, cap))
}

/// Lossy UTF-8 decode of `bytes`, cut to at most `cap` bytes of text.
pub fn excerpt(bytes: &[u8], cap: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    truncate_on_char_boundary(&text, cap).to_owned()
}

/// Longest prefix of `s` that is at most `cap` bytes and ends on a char boundary.
pub fn truncate_on_char_boundary(s: &str, cap: usize) -> &str {
    if s.len() <= cap {
        return s;
    }
    let mut end = cap;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Phrase the server actually sent, falling back to the canonical one.
///
/// hyper only keeps the phrase as an extension when it differs from the
/// canonical text for the status.
fn reason_phrase(response: &Response) -> String {
    if let Some(sent) = response.extensions().get::<ReasonPhrase>() {
        return String::from_utf8_lossy(sent.as_bytes()).into_owned();
    }
    canonical_reason(response.status())
}

fn canonical_reason(status: StatusCode) -> String {
    status.canonical_reason().unwrap_or("Unknown").to_string()
}

fn classify(err: reqwest::Error) -> FetchError {
    if err.is_connect() || err.is_timeout() {
        return FetchError::Connection(root_cause(&err));
    }
    FetchError::Other {
        kind: error_kind(&err),
        message: error_chain(&err),
    }
}

fn error_kind(err: &reqwest::Error) -> &'static str {
    if err.is_builder() {
        "InvalidRequest"
    } else if err.is_redirect() {
        "Redirect"
    } else if err.is_decode() {
        "Decode"
    } else if err.is_body() {
        "Body"
    } else if err.is_status() {
        "Status"
    } else {
        "Request"
    }
}

/// Text of the innermost error in the source chain.
fn root_cause(err: &(dyn StdError + 'static)) -> String {
    let mut current = err;
    while let Some(next) = current.source() {
        current = next;
    }
    current.to_string()
}

/// `outer: inner: innermost` rendering of the whole source chain.
fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut parts = vec![err.to_string()];
    let mut current = err.source();
    while let Some(e) = current {
        parts.push(e.to_string());
        current = e.source();
    }
    parts.join(": ")
}

/// Outcome bucket plus the `SUCCESS - HTTP 200` style headline.
pub fn category(outcome: &FetchOutcome) -> (Category, String) {
    match outcome {
        Ok(f) => (Category::Success, format!("SUCCESS - HTTP {}", f.status)),
        Err(FetchError::Http { code, .. }) => (Category::HttpError, format!("HTTP_ERROR_{code}")),
        Err(FetchError::Connection(_)) => (Category::ConnectionError, "CONNECTION_ERROR".into()),
        Err(FetchError::Other { .. }) => (Category::GenericError, "ERROR".into()),
    }
}

pub fn to_report(url: &str, outcome: &FetchOutcome) -> FetchReport {
    let (bucket, _) = category(outcome);
    let (status_code, status_detail, body_excerpt) = match outcome {
        Ok(f) => (Some(f.status), f.status.to_string(), Some(f.body.clone())),
        Err(FetchError::Http { code, reason, body }) => (Some(*code), reason.clone(), body.clone()),
        Err(FetchError::Connection(reason)) => (None, reason.clone(), None),
        Err(FetchError::Other { kind, message }) => (None, format!("{kind}: {message}"), None),
    };
    FetchReport {
        url: url.to_string(),
        category: bucket,
        status_code,
        status_detail,
        body_excerpt,
    }
}

/// Text payload shown under the headline.
pub fn outcome_data(outcome: &FetchOutcome) -> String {
    match outcome {
        Ok(f) => f.body.clone(),
        Err(e @ FetchError::Http { body: Some(body), .. }) => format!("{e}\nBody: {body}"),
        Err(e) => e.to_string(),
    }
}

/// Markdown block rendered into the webhook envelope.
pub fn render(url: &str, outcome: &FetchOutcome) -> String {
    let (_, headline) = category(outcome);
    let data = outcome_data(outcome);
    let data = truncate_on_char_boundary(&data, TEXT_DATA_CAP);
    format!(
        "🔴 **SSRF RELAY - {headline}**\n\n**Target:** `{url}`\n\n**Response:**\n```\n{data}\n```"
    )
}
