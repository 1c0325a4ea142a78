use std::net::SocketAddr;
use std::time::Duration;

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use ssrf_relay::fetch::{FetchPolicy, Fetcher, TlsPolicy};
use ssrf_relay::scanner::{scan_targets, summary_text, ScanTarget};
use ssrf_relay::types::Category;
use tokio::net::TcpListener;

async fn spawn_upstream() -> SocketAddr {
    let app = Router::new()
        .route("/ok", get(|| async { "metadata" }))
        .route("/missing", get(|| async { (StatusCode::NOT_FOUND, "no") }));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

#[tokio::test]
async fn mixed_outcomes_do_not_affect_each_other() {
    let up = spawn_upstream().await;
    let closed = closed_port().await;
    let targets = vec![
        ScanTarget::new("ok", format!("http://{up}/ok")),
        ScanTarget::new("missing", format!("http://{up}/missing")),
        ScanTarget::new("refused", format!("http://{closed}/")),
        ScanTarget::new("bad scheme", "gopher://x/"),
    ];
    let fetcher =
        Fetcher::new(FetchPolicy::scan(Duration::from_secs(2), TlsPolicy::AcceptInvalid)).unwrap();

    let entries = scan_targets(&fetcher, &targets).await;

    let got: Vec<_> = entries
        .iter()
        .map(|e| (e.label.as_str(), e.report.category))
        .collect();
    assert_eq!(
        got,
        vec![
            ("ok", Category::Success),
            ("missing", Category::HttpError),
            ("refused", Category::ConnectionError),
            ("bad scheme", Category::GenericError),
        ]
    );
    assert_eq!(entries[0].report.body_excerpt.as_deref(), Some("metadata"));
    assert_eq!(entries[1].report.status_code, Some(404));

    let text = summary_text(&entries);
    assert!(text.contains("**ok**: SUCCESS - HTTP 200\n"));
    assert!(text.contains("**missing**: HTTP_ERROR_404\n"));
    assert!(text.contains("**refused**: CONNECTION_ERROR\n"));
    assert!(text.contains("**bad scheme**: ERROR\n"));
}
