use std::borrow::Cow;

use tracing::info;

use crate::fetch::Fetcher;
use crate::types::{Category, ScanEntry};

/// A labelled probe destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanTarget {
    pub label: Cow<'static, str>,
    pub url: Cow<'static, str>,
}

impl ScanTarget {
    pub fn new(label: impl Into<Cow<'static, str>>, url: impl Into<Cow<'static, str>>) -> Self {
        Self {
            label: label.into(),
            url: url.into(),
        }
    }
}

const fn target(label: &'static str, url: &'static str) -> ScanTarget {
    ScanTarget {
        label: Cow::Borrowed(label),
        url: Cow::Borrowed(url),
    }
}

/// Well-known cloud metadata endpoints and common localhost services.
pub static SCAN_TARGETS: [ScanTarget; 14] = [
    target("AWS metadata", "http://169.254.169.254/latest/meta-data/"),
    target("AWS IAM credentials", "http://169.254.169.254/latest/meta-data/iam/security-credentials/"),
    target("AWS user-data", "http://169.254.169.254/latest/user-data/"),
    target("AWS ECS task metadata", "http://169.254.170.2/v2/metadata"),
    target("GCP metadata", "http://metadata.google.internal/computeMetadata/v1/"),
    target("GCP metadata (IP)", "http://169.254.169.254/computeMetadata/v1/"),
    target("Azure IMDS", "http://169.254.169.254/metadata/instance?api-version=2021-02-01"),
    target("DigitalOcean metadata", "http://169.254.169.254/metadata/v1/"),
    target("Oracle Cloud metadata", "http://169.254.169.254/opc/v2/instance/"),
    target("Alibaba Cloud metadata", "http://100.100.100.200/latest/meta-data/"),
    target("localhost:80", "http://127.0.0.1/"),
    target("localhost:8080", "http://127.0.0.1:8080/"),
    target("Docker API", "http://127.0.0.1:2375/version"),
    target("Kubelet API", "https://127.0.0.1:10250/pods"),
];

/// Probe each target in order with the scan fetcher.
///
/// Targets are independent: every one yields exactly one entry whatever
/// happened to the others.
pub async fn scan_targets(fetcher: &Fetcher, targets: &[ScanTarget]) -> Vec<ScanEntry> {
    let mut entries = Vec::with_capacity(targets.len());
    for t in targets {
        let report = fetcher.report(&t.url, None).await;
        entries.push(ScanEntry {
            label: t.label.to_string(),
            report,
        });
    }

    let reachable = entries
        .iter()
        .filter(|e| e.report.category != Category::ConnectionError)
        .count();
    info!(total = entries.len(), reachable, "scan finished");
    entries
}

/// Headline used for one row of the scan summary.
fn row_status(entry: &ScanEntry) -> String {
    let r = &entry.report;
    match (r.category, r.status_code) {
        (Category::Success, Some(code)) => format!("SUCCESS - HTTP {code}"),
        (Category::HttpError, Some(code)) => format!("HTTP_ERROR_{code}"),
        (Category::ConnectionError, _) => "CONNECTION_ERROR".to_string(),
        _ => "ERROR".to_string(),
    }
}

/// One `label: STATUS` line per entry, under a bold header.
pub fn summary_text(entries: &[ScanEntry]) -> String {
    let mut out = format!("🔴 **SSRF SCAN - {} targets**\n\n", entries.len());
    for e in entries {
        out.push_str(&format!("**{}**: {}\n", e.label, row_status(e)));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FetchReport;

    #[test]
    fn fourteen_unique_targets() {
        assert_eq!(SCAN_TARGETS.len(), 14);
        let mut labels: Vec<_> = SCAN_TARGETS.iter().map(|t| t.label.as_ref()).collect();
        labels.sort();
        labels.dedup();
        assert_eq!(labels.len(), 14);
    }

    #[test]
    fn summary_has_one_line_per_entry() {
        let entries = vec![
            ScanEntry {
                label: "a".into(),
                report: FetchReport {
                    url: "http://a/".into(),
                    category: Category::HttpError,
                    status_code: Some(403),
                    status_detail: "Forbidden".into(),
                    body_excerpt: None,
                },
            },
            ScanEntry {
                label: "b".into(),
                report: FetchReport {
                    url: "http://b/".into(),
                    category: Category::ConnectionError,
                    status_code: None,
                    status_detail: "refused".into(),
                    body_excerpt: None,
                },
            },
        ];
        let text = summary_text(&entries);
        assert!(text.contains("**a**: HTTP_ERROR_403\n"));
        assert!(text.contains("**b**: CONNECTION_ERROR\n"));
    }
}
