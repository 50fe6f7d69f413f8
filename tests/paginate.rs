//! Pagination engine tests against a scripted search backend.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use dexchart_core::prelude::*;

// ─── Scripted backend ────────────────────────────────────────────────────────

struct ScriptedBackend {
    pages: Mutex<VecDeque<Result<SearchPage, RpcError>>>,
    requests: Mutex<Vec<SearchRequest>>,
}

impl ScriptedBackend {
    fn new(pages: Vec<Result<SearchPage, RpcError>>) -> Self {
        Self {
            pages: Mutex::new(pages.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn request(&self, index: usize) -> SearchRequest {
        self.requests.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl SearchBackend for ScriptedBackend {
    async fn search(&self, request: &SearchRequest) -> Result<SearchPage, RpcError> {
        self.requests.lock().unwrap().push(request.clone());
        self.pages
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| panic!("backend queried past the scripted pages"))
    }
}

fn hit(timestamp_ms: u64, seq: u64) -> SearchHit {
    SearchHit {
        source: json!({"price": "1.5", "seq": seq}),
        sort: vec![json!(timestamp_ms), json!(seq)],
    }
}

fn page(total: u64, hits: Vec<SearchHit>) -> Result<SearchPage, RpcError> {
    Ok(SearchPage { total, hits })
}

fn engine(backend: Arc<ScriptedBackend>) -> PaginatedQueryEngine<Arc<ScriptedBackend>> {
    let config = SearchConfig {
        page_size: 2,
        ..SearchConfig::default()
    };
    PaginatedQueryEngine::new(backend, &config)
}

fn build_request(cursor: Option<&Cursor>) -> SearchRequest {
    SearchRequest {
        size: 2,
        query: json!({"range": {"timestamp": {"gte": 0, "lte": 10_000}}}),
        sort: json!([{"timestamp": "asc"}, {"seq": "asc"}]),
        search_after: cursor.cloned(),
    }
}

// ─── Draining ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_zero_total_returns_empty_after_one_request() {
    let backend = Arc::new(ScriptedBackend::new(vec![page(0, vec![])]));
    let running = AtomicBool::new(true);

    let hits = engine(Arc::clone(&backend))
        .fetch_all(build_request, 0, 10_000, None, &running)
        .await
        .unwrap();

    assert!(hits.is_empty());
    assert_eq!(backend.request_count(), 1);
}

#[tokio::test]
async fn test_short_page_ends_the_drain() {
    let backend = Arc::new(ScriptedBackend::new(vec![
        page(3, vec![hit(1_000, 1), hit(2_000, 2)]),
        page(3, vec![hit(3_000, 3)]),
    ]));
    let running = AtomicBool::new(true);

    let hits = engine(Arc::clone(&backend))
        .fetch_all(build_request, 0, 10_000, None, &running)
        .await
        .unwrap();

    assert_eq!(hits.len(), 3);
    assert_eq!(hits[2].source["seq"], json!(3));
    assert_eq!(backend.request_count(), 2);
}

#[tokio::test]
async fn test_cursor_threads_the_last_sort_key_forward() {
    let backend = Arc::new(ScriptedBackend::new(vec![
        page(4, vec![hit(1_000, 1), hit(2_000, 2)]),
        page(4, vec![hit(3_000, 3), hit(4_000, 4)]),
        page(4, vec![]),
    ]));
    let running = AtomicBool::new(true);

    engine(Arc::clone(&backend))
        .fetch_all(build_request, 0, 10_000, None, &running)
        .await
        .unwrap();

    assert_eq!(backend.request(0).search_after, None);
    assert_eq!(
        backend.request(1).search_after,
        Some(Cursor(vec![json!(2_000), json!(2)]))
    );
    assert_eq!(
        backend.request(2).search_after,
        Some(Cursor(vec![json!(4_000), json!(4)]))
    );
}

#[tokio::test]
async fn test_cap_stops_the_drain() {
    let backend = Arc::new(ScriptedBackend::new(vec![
        page(100, vec![hit(1_000, 1), hit(2_000, 2)]),
        page(100, vec![hit(3_000, 3), hit(4_000, 4)]),
        // Never reached: the cap trips after page two.
        page(100, vec![hit(5_000, 5), hit(6_000, 6)]),
    ]));
    let running = AtomicBool::new(true);

    let hits = engine(Arc::clone(&backend))
        .fetch_all(build_request, 0, 10_000, Some(4), &running)
        .await
        .unwrap();

    assert_eq!(hits.len(), 4);
    assert_eq!(backend.request_count(), 2);
}

#[tokio::test]
async fn test_cancellation_keeps_already_fetched_pages() {
    let backend = Arc::new(ScriptedBackend::new(vec![
        page(100, vec![hit(1_000, 1), hit(2_000, 2)]),
        page(100, vec![hit(3_000, 3), hit(4_000, 4)]),
    ]));
    let running = Arc::new(AtomicBool::new(true));

    let flag = Arc::clone(&running);
    let hits = engine(Arc::clone(&backend))
        .on_progress(move |_| flag.store(false, Ordering::Relaxed))
        .fetch_all(build_request, 0, 10_000, None, &running)
        .await
        .unwrap();

    // Cancelled after the first page; the second scripted page stays unread.
    assert_eq!(hits.len(), 2);
    assert_eq!(backend.request_count(), 1);
}

#[tokio::test]
async fn test_transport_error_aborts_the_whole_drain() {
    let backend = Arc::new(ScriptedBackend::new(vec![
        page(100, vec![hit(1_000, 1), hit(2_000, 2)]),
        Err(ConnectionError::Transport("backend unreachable".into()).into()),
    ]));
    let running = AtomicBool::new(true);

    let err = engine(Arc::clone(&backend))
        .fetch_all(build_request, 0, 10_000, None, &running)
        .await
        .unwrap_err();

    assert!(err.is_connection_error());
    assert_eq!(backend.request_count(), 2);
}

// ─── Progress reporting ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_progress_is_monotonic_and_bounded() {
    let backend = Arc::new(ScriptedBackend::new(vec![
        page(5, vec![hit(2_000, 1), hit(4_000, 2)]),
        page(5, vec![hit(6_000, 3), hit(8_000, 4)]),
        page(5, vec![hit(10_000, 5)]),
    ]));
    let running = AtomicBool::new(true);
    let observed = Arc::new(Mutex::new(Vec::<f64>::new()));

    let sink = Arc::clone(&observed);
    engine(Arc::clone(&backend))
        .on_progress(move |fraction| sink.lock().unwrap().push(fraction))
        .fetch_all(build_request, 0, 10_000, None, &running)
        .await
        .unwrap();

    let observed = observed.lock().unwrap();
    assert_eq!(observed.len(), 3);
    for pair in observed.windows(2) {
        assert!(pair[0] <= pair[1]);
    }
    assert!(observed.iter().all(|f| (0.0..=1.0).contains(f)));
    assert!((observed[2] - 1.0).abs() < 1e-9); // last hit reaches stop_ms
}
