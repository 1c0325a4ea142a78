use std::collections::BTreeMap;

use serde::Serialize;

/// Display name stamped on every webhook envelope.
pub const DISPLAY_NAME: &str = "SSRF-Relay-Render";

/// Visibility flag understood by Mattermost/Slack slash-command consumers.
pub const RESPONSE_TYPE: &str = "in_channel";

/// JSON body returned by every route.
///
/// Route-specific payloads (`full_results`, `full_data`, ...) are flattened
/// next to the three fixed fields.
#[derive(Serialize, Debug, Clone)]
pub struct Envelope<T: Serialize> {
    pub response_type: &'static str,
    pub text: String,
    pub username: &'static str,
    #[serde(flatten)]
    pub extra: T,
}

impl<T: Serialize> Envelope<T> {
    pub fn with(text: impl Into<String>, extra: T) -> Self {
        Self {
            response_type: RESPONSE_TYPE,
            text: text.into(),
            username: DISPLAY_NAME,
            extra,
        }
    }
}

/// Outcome bucket of a single fetch.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Category {
    Success,
    HttpError,
    ConnectionError,
    GenericError,
}

/// Flattened, serializable view of one fetch.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct FetchReport {
    pub url: String,
    pub category: Category,
    /// Upstream status for `SUCCESS` and `HTTP_ERROR`.
    pub status_code: Option<u16>,
    pub status_detail: String,
    pub body_excerpt: Option<String>,
}

/// One row of a multi-target scan.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanEntry {
    pub label: String,
    #[serde(flatten)]
    pub report: FetchReport,
}

/// Which endpoint produced a log record.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    Log,
    Capture,
    Exfil,
}

/// Metadata about one inbound request, as kept by the event log.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: String,
    pub kind: LogKind,
    pub source_addr: String,
    pub user_agent: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub query: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub form: BTreeMap<String, String>,
}

impl LogEntry {
    /// Entry stamped with the current UTC time and no optional fields.
    pub fn new(kind: LogKind, source_addr: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            timestamp: now_rfc3339(),
            kind,
            source_addr: source_addr.into(),
            user_agent: user_agent.into(),
            method: None,
            path: None,
            headers: BTreeMap::new(),
            query: BTreeMap::new(),
            form: BTreeMap::new(),
        }
    }
}

pub fn now_rfc3339() -> String {
    use time::{format_description::well_known, OffsetDateTime};

    OffsetDateTime::now_utc()
        .format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_flattens_extra_fields() {
        let env = Envelope::with("hi", json!({ "full_data": [1, 2] }));
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["response_type"], "in_channel");
        assert_eq!(v["username"], DISPLAY_NAME);
        assert_eq!(v["text"], "hi");
        assert_eq!(v["full_data"], json!([1, 2]));
    }

    #[test]
    fn log_entry_omits_empty_maps() {
        let e = LogEntry::new(LogKind::Capture, "10.0.0.1", "curl/8");
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["kind"], "capture");
        assert!(v.get("headers").is_none());
        assert!(v.get("form").is_none());
        assert!(v.get("method").is_none());
    }
}
