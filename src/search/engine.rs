//! Cursor-based deep pagination over the search backend.
//!
//! Drains an arbitrarily large result set page by page, threading the
//! `search_after` cursor forward. A drain is all-or-nothing: any transport
//! failure aborts the whole invocation and already-accumulated pages are
//! discarded (contrast with the batch fetcher's best-effort merging).

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::error::{ConnectionError, RpcError};
use crate::network;
use crate::search::{Cursor, SearchEnvelope, SearchHit, SearchPage, SearchRequest};

/// Hits requested per page.
pub const PAGE_SIZE: usize = 10_000;

/// Default bound on accumulated hits per drain.
pub const DEFAULT_RESULT_CAP: usize = 1_000_000;

// ─── Backend seam ────────────────────────────────────────────────────────────

/// Issues one page request against the search index.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn search(&self, request: &SearchRequest) -> Result<SearchPage, RpcError>;
}

#[async_trait]
impl<T: SearchBackend + ?Sized> SearchBackend for std::sync::Arc<T> {
    async fn search(&self, request: &SearchRequest) -> Result<SearchPage, RpcError> {
        (**self).search(request).await
    }
}

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub url: String,
    pub page_size: usize,
    pub result_cap: usize,
    pub request_timeout: Duration,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            url: network::DEFAULT_SEARCH_URL.to_string(),
            page_size: PAGE_SIZE,
            result_cap: DEFAULT_RESULT_CAP,
            request_timeout: Duration::from_secs(30),
        }
    }
}

// ─── HTTP backend ────────────────────────────────────────────────────────────

/// Production backend: JSON POST against the search endpoint.
pub struct HttpSearchBackend {
    url: String,
    client: Client,
}

impl HttpSearchBackend {
    pub fn new(config: &SearchConfig) -> Self {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .pool_max_idle_per_host(10)
            .build()
            .expect("Failed to build HTTP client");
        Self {
            url: config.url.clone(),
            client,
        }
    }
}

#[async_trait]
impl SearchBackend for HttpSearchBackend {
    async fn search(&self, request: &SearchRequest) -> Result<SearchPage, RpcError> {
        let response = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RpcError::from(ConnectionError::RequestTimeout)
                } else {
                    ConnectionError::Transport(e.to_string()).into()
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            // A rejected query is a request problem, not a connectivity one.
            return if status.is_client_error() {
                Err(RpcError::Protocol(format!(
                    "search backend rejected the query ({}): {}",
                    status, body
                )))
            } else {
                Err(ConnectionError::Transport(format!(
                    "search backend error {}: {}",
                    status, body
                ))
                .into())
            };
        }

        let envelope = response
            .json::<SearchEnvelope>()
            .await
            .map_err(|e| RpcError::Protocol(format!("undecodable search response: {}", e)))?;
        Ok(envelope.into())
    }
}

// ─── Engine ──────────────────────────────────────────────────────────────────

type ProgressFn = Box<dyn Fn(f64) + Send + Sync>;

/// Drains a search query via `search_after` deep pagination.
pub struct PaginatedQueryEngine<B> {
    backend: B,
    page_size: usize,
    result_cap: usize,
    on_progress: Option<ProgressFn>,
}

impl<B: SearchBackend> PaginatedQueryEngine<B> {
    pub fn new(backend: B, config: &SearchConfig) -> Self {
        Self {
            backend,
            page_size: config.page_size,
            result_cap: config.result_cap,
            on_progress: None,
        }
    }

    /// Register a progress observer, called after each page with the covered
    /// fraction of the requested time span (0.0 ..= 1.0).
    pub fn on_progress(mut self, callback: impl Fn(f64) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Box::new(callback));
        self
    }

    /// Drain the whole result set for a query.
    ///
    /// `build` constructs each page request from the current cursor (`None`
    /// on the first page). The drain stops when the first page reports zero
    /// total hits, when a page comes back shorter than the page size, when
    /// `cap` hits have accumulated, or when `keep_running` turns false
    /// (checked between pages only — never mid-request).
    pub async fn fetch_all<F>(
        &self,
        mut build: F,
        start_ms: u64,
        stop_ms: u64,
        cap: Option<usize>,
        keep_running: &AtomicBool,
    ) -> Result<Vec<SearchHit>, RpcError>
    where
        F: FnMut(Option<&Cursor>) -> SearchRequest,
    {
        let cap = cap.unwrap_or(self.result_cap);
        let mut accumulated: Vec<SearchHit> = Vec::new();
        let mut cursor: Option<Cursor> = None;

        loop {
            if !keep_running.load(Ordering::Relaxed) {
                tracing::info!(
                    fetched = accumulated.len(),
                    "pagination cancelled by caller"
                );
                break;
            }

            let request = build(cursor.as_ref());
            let page = self.backend.search(&request).await?;

            if accumulated.is_empty() && page.total == 0 {
                return Ok(Vec::new());
            }

            let fetched = page.hits.len();
            cursor = page.hits.last().map(|hit| Cursor(hit.sort.clone()));
            accumulated.extend(page.hits);

            self.report_progress(cursor.as_ref(), start_ms, stop_ms);
            tracing::debug!(
                fetched,
                accumulated = accumulated.len(),
                total = page.total,
                "fetched page"
            );

            if fetched < self.page_size {
                break; // the index is exhausted
            }
            if accumulated.len() >= cap {
                tracing::warn!(cap, "pagination stopped at the result cap");
                break;
            }
        }

        Ok(accumulated)
    }

    fn report_progress(&self, cursor: Option<&Cursor>, start_ms: u64, stop_ms: u64) {
        if let (Some(callback), Some(cursor)) = (&self.on_progress, cursor) {
            callback(progress_fraction(cursor, start_ms, stop_ms));
        }
    }
}

/// Covered fraction of `[start_ms, stop_ms]` implied by the cursor's
/// timestamp component, clamped to 0.0 ..= 1.0.
fn progress_fraction(cursor: &Cursor, start_ms: u64, stop_ms: u64) -> f64 {
    let Some(ts) = cursor.timestamp_ms() else {
        return 0.0;
    };
    if stop_ms <= start_ms {
        return 1.0;
    }
    let covered = ts.saturating_sub(start_ms) as f64;
    let span = (stop_ms - start_ms) as f64;
    (covered / span).clamp(0.0, 1.0)
}
