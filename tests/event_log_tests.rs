use std::sync::Arc;

use ssrf_relay::event_log::EventLog;
use ssrf_relay::types::{LogEntry, LogKind};

fn entry(i: usize) -> LogEntry {
    LogEntry::new(LogKind::Log, format!("addr-{i}"), "tests")
}

#[tokio::test]
async fn keeps_everything_under_capacity() {
    let log = EventLog::new(100);
    for i in 0..100 {
        log.record(entry(i)).await;
    }
    let all = log.all().await;
    assert_eq!(all.len(), 100);
    assert_eq!(all.first().unwrap().source_addr, "addr-0");
    assert_eq!(all.last().unwrap().source_addr, "addr-99");
}

#[tokio::test]
async fn evicts_oldest_first_over_capacity() {
    let log = EventLog::new(100);
    for i in 0..150 {
        log.record(entry(i)).await;
    }
    let all = log.all().await;
    assert_eq!(all.len(), 100);
    let addrs: Vec<_> = all.iter().map(|e| e.source_addr.clone()).collect();
    let expected: Vec<_> = (50..150).map(|i| format!("addr-{i}")).collect();
    assert_eq!(addrs, expected);
}

#[tokio::test]
async fn recent_returns_tail_in_order() {
    let log = EventLog::new(100);
    for i in 0..30 {
        log.record(entry(i)).await;
    }
    let recent = log.recent(20).await;
    assert_eq!(recent.len(), 20);
    assert_eq!(recent[0].source_addr, "addr-10");
    assert_eq!(recent[19].source_addr, "addr-29");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_appends_are_not_lost() {
    let log = Arc::new(EventLog::new(1000));
    let mut handles = Vec::new();
    for t in 0..8 {
        let log = log.clone();
        handles.push(tokio::spawn(async move {
            for i in 0..50 {
                log.record(entry(t * 100 + i)).await;
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }
    assert_eq!(log.len().await, 400);
}
