use std::time::Duration;

use codescout_distributed::spill::fnv64a;
use codescout_distributed::{Coordinator, CoordinatorConfig, ErrorKind, Event};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// A backend that accepts one connection, drains the request, streams the
/// given JSON messages back-to-back, and closes.
async fn spawn_backend(messages: Vec<Value>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        if let Ok((mut sock, _)) = listener.accept().await {
            let mut buf = [0u8; 4096];
            loop {
                match sock.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            for m in &messages {
                let bytes = serde_json::to_vec(m).unwrap();
                if sock.write_all(&bytes).await.is_err() {
                    break;
                }
            }
            let _ = sock.shutdown().await;
        }
    });
    addr
}

/// A backend that accepts, drains the request, then goes silent.
async fn spawn_silent_backend() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        if let Ok((mut sock, _)) = listener.accept().await {
            let mut buf = [0u8; 4096];
            loop {
                match sock.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(sock);
        }
    });
    addr
}

fn test_config(backends: Vec<String>, results_root: &std::path::Path) -> CoordinatorConfig {
    CoordinatorConfig {
        backends,
        results_root: results_root.to_path_buf(),
        connect_timeout: Duration::from_secs(2),
        read_deadline: Duration::from_secs(2),
        // Never delete anything under the test root.
        headroom_fraction: 0.0,
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn full_query_flow() {
    let root = tempfile::tempdir().unwrap();
    let b1 = spawn_backend(vec![
        json!({"Path": "i3-wm_4.16/main.c", "PathRank": 0.5, "Ranking": 0.8, "Context": ["int main()"]}),
        json!({"Type": "progress", "FilesProcessed": 2, "FilesTotal": 2}),
    ])
    .await;
    let b2 = spawn_backend(vec![
        json!({"Path": "i3-wm_4.17/main.c", "PathRank": 0.5, "Ranking": 0.9}),
        json!({"Path": "vim_8.2/regexp.c", "PathRank": 0.5, "Ranking": 0.2}),
        json!({"Type": "progress", "FilesProcessed": 3, "FilesTotal": 3}),
    ])
    .await;

    let coord = Coordinator::new(test_config(vec![b1, b2], root.path()));
    let qs = coord.start_query("int main").unwrap();
    assert!(qs.wait_done(Duration::from_secs(5)).await);

    assert_eq!(qs.num_results(), 3);
    assert_eq!(qs.result_pages(), 1);
    let events = qs.events_snapshot();
    assert!(events.iter().any(|e| matches!(e, Event::Result(_))));
    assert!(events.iter().any(|e| matches!(
        e,
        Event::Progress {
            files_total: 5,
            ..
        }
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        Event::Pagination {
            result_pages: 1,
            ..
        }
    )));

    // Spill files exist, one per backend.
    assert!(qs.results_dir().join("unsorted_0.json").is_file());
    assert!(qs.results_dir().join("unsorted_1.json").is_file());

    // The page is a JSON array of rewritten results, ranked descending.
    let page = coord.write_result_page(&qs, 0).unwrap();
    let parsed: Vec<Value> = serde_json::from_slice(&std::fs::read(&page).unwrap()).unwrap();
    assert_eq!(parsed.len(), 3);
    let ranks: Vec<f64> = parsed
        .iter()
        .map(|v| v["Ranking"].as_f64().unwrap())
        .collect();
    assert!(ranks.windows(2).all(|w| w[0] >= w[1]));
    for v in &parsed {
        assert_eq!(v["Type"], "result");
        assert!(v["Package"].is_string());
    }

    // Per-package file keeps only the newest i3-wm version.
    let pp = coord.write_per_package_page(&qs, 0).unwrap();
    let parsed: Vec<Value> = serde_json::from_slice(&std::fs::read(&pp).unwrap()).unwrap();
    let i3 = parsed
        .iter()
        .find(|v| v["Package"] == "i3-wm")
        .expect("i3-wm group");
    let results = i3["Results"].as_array().unwrap();
    assert!(!results.is_empty());
    assert!(results
        .iter()
        .all(|r| r["Path"].as_str().unwrap().starts_with("i3-wm_4.17/")));
    assert!(parsed.iter().any(|v| v["Package"] == "vim"));

    // Out-of-range pages are input errors.
    assert!(coord.write_result_page(&qs, 7).is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn ranking_blend_uses_first_path_rank() {
    let root = tempfile::tempdir().unwrap();
    // Single backend, so arrival order is deterministic: the first result
    // passes its content rank through, later ones get the blend.
    let b = spawn_backend(vec![
        json!({"Path": "pkg_1.0/first.c", "PathRank": 0.5, "Ranking": 0.8}),
        json!({"Path": "pkg_1.0/second.c", "PathRank": 0.3, "Ranking": 0.5}),
        json!({"Type": "progress", "FilesProcessed": 2, "FilesTotal": 2}),
    ])
    .await;
    let coord = Coordinator::new(test_config(vec![b], root.path()));
    let qs = coord.start_query("blend").unwrap();
    assert!(qs.wait_done(Duration::from_secs(5)).await);

    let page = coord.write_result_page(&qs, 0).unwrap();
    let parsed: Vec<Value> = serde_json::from_slice(&std::fs::read(&page).unwrap()).unwrap();
    let rank_of = |path: &str| {
        parsed
            .iter()
            .find(|v| v["Path"] == path)
            .unwrap()["Ranking"]
            .as_f64()
            .unwrap()
    };
    assert!((rank_of("pkg_1.0/first.c") - 0.8).abs() < 1e-9);
    // 0.3 + (0.5 * 0.1) * 0.5
    assert!((rank_of("pkg_1.0/second.c") - 0.325).abs() < 1e-9);
}

#[tokio::test(flavor = "multi_thread")]
async fn equal_rankings_sort_by_path_hash_descending() {
    let root = tempfile::tempdir().unwrap();
    // PathRank 0 keeps first_path_rank unset, so both results keep their
    // identical content rank and only the path hash can order them.
    let b = spawn_backend(vec![
        json!({"Path": "pkg_1.0/a", "PathRank": 0.0, "Ranking": 0.9}),
        json!({"Path": "pkg_1.0/b", "PathRank": 0.0, "Ranking": 0.9}),
        json!({"Type": "progress", "FilesProcessed": 2, "FilesTotal": 2}),
    ])
    .await;
    let coord = Coordinator::new(test_config(vec![b], root.path()));
    let qs = coord.start_query("tie").unwrap();
    assert!(qs.wait_done(Duration::from_secs(5)).await);

    let page = coord.write_result_page(&qs, 0).unwrap();
    let parsed: Vec<Value> = serde_json::from_slice(&std::fs::read(&page).unwrap()).unwrap();
    let got: Vec<&str> = parsed.iter().map(|v| v["Path"].as_str().unwrap()).collect();
    let mut expect = vec!["pkg_1.0/a", "pkg_1.0/b"];
    expect.sort_by_key(|p| std::cmp::Reverse(fnv64a(p.as_bytes())));
    assert_eq!(got, expect);
}

#[tokio::test(flavor = "multi_thread")]
async fn unresponsive_backend_is_synthesized_and_reported() {
    let root = tempfile::tempdir().unwrap();
    let good = spawn_backend(vec![
        json!({"Path": "pkg_1.0/hit.c", "PathRank": 0.5, "Ranking": 0.7}),
        json!({"Type": "progress", "FilesProcessed": 1, "FilesTotal": 1}),
    ])
    .await;
    let silent = spawn_silent_backend().await;

    let mut cfg = test_config(vec![good, silent], root.path());
    cfg.read_deadline = Duration::from_millis(300);
    let coord = Coordinator::new(cfg);
    let qs = coord.start_query("partial").unwrap();

    // The silent backend trips its inactivity deadline; the coordinator
    // synthesizes its progress so the query still finalizes.
    assert!(qs.wait_done(Duration::from_secs(5)).await);
    let events = qs.events_snapshot();
    assert!(events.iter().any(|e| matches!(
        e,
        Event::Error {
            error_type: ErrorKind::BackendUnavailable
        }
    )));
    assert_eq!(qs.num_results(), 1);
    assert_eq!(qs.result_pages(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn identical_query_reuses_live_state() {
    let root = tempfile::tempdir().unwrap();
    let silent = spawn_silent_backend().await;
    let coord = Coordinator::new(test_config(vec![silent], root.path()));
    let first = coord.start_query("needle").unwrap();
    let second = coord.start_query("  needle ").unwrap();
    assert!(std::sync::Arc::ptr_eq(&first, &second));
    coord.cancel(&first.id);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_emits_event_and_stops_waiters() {
    let root = tempfile::tempdir().unwrap();
    let silent = spawn_silent_backend().await;
    let coord = Coordinator::new(test_config(vec![silent], root.path()));
    let qs = coord.start_query("forever").unwrap();
    assert!(!qs.is_done());

    assert!(coord.cancel(&qs.id));
    assert!(qs.wait_done(Duration::from_secs(2)).await);
    let ev = qs.next_event(0, Duration::from_secs(1)).await;
    assert!(matches!(
        ev,
        Some(Event::Error {
            error_type: ErrorKind::Cancelled
        })
    ));
    // No further events will come.
    let n = qs.events_snapshot().len();
    assert!(qs.next_event(n, Duration::from_millis(100)).await.is_none());

    assert!(!coord.cancel("unknown-query-id"));
}

#[tokio::test(flavor = "multi_thread")]
async fn completed_queries_are_garbage_collected() {
    let root = tempfile::tempdir().unwrap();
    let done_backend = spawn_backend(vec![
        json!({"Type": "progress", "FilesProcessed": 0, "FilesTotal": 0}),
    ])
    .await;
    let mut cfg = test_config(vec![done_backend], root.path());
    cfg.max_live_queries = 1;
    let coord = Coordinator::new(cfg);

    let first = coord.start_query("one").unwrap();
    assert!(first.wait_done(Duration::from_secs(5)).await);

    // Starting a different query evicts the completed one.
    let _second = coord.start_query("two").unwrap();
    assert!(coord.get_query(&first.id).is_none());
}
