//! Failover pool — one logical RPC surface over a rotating endpoint list.
//!
//! The pool keeps at most one active connection. Concurrent callers that
//! find the pool disconnected coalesce onto a single connection attempt
//! (single-flight with a waiter queue) and all receive its outcome.
//! Connection-class call failures trigger failover and bounded retries;
//! protocol and data failures propagate immediately.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};

use crate::error::{ConnectionError, RpcError};
use crate::network;
use crate::rpc::connection::ConnectionManager;
use crate::rpc::retry::LinearBackoff;
use crate::rpc::ConnectionConfig;

// ─── Trait seams ─────────────────────────────────────────────────────────────

/// A live node connection as seen by the pool.
#[async_trait]
pub trait NodeClient: Send + Sync {
    async fn call(&self, api: &str, method: &str, args: Vec<Value>) -> Result<Value, RpcError>;
    fn is_connected(&self) -> bool;
    fn observed_latency_ms(&self) -> Option<u64>;
    async fn close(&self);
}

impl std::fmt::Debug for dyn NodeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("NodeClient")
    }
}

/// Establishes node connections. The production connector dials a
/// `ConnectionManager`; tests substitute an in-memory transport.
#[async_trait]
pub trait NodeConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Arc<dyn NodeClient>, RpcError>;
}

#[async_trait]
impl NodeClient for ConnectionManager {
    async fn call(&self, api: &str, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        ConnectionManager::call(self, api, method, args).await
    }

    fn is_connected(&self) -> bool {
        ConnectionManager::is_connected(self)
    }

    fn observed_latency_ms(&self) -> Option<u64> {
        ConnectionManager::observed_latency_ms(self)
    }

    async fn close(&self) {
        ConnectionManager::close(self).await;
    }
}

/// Dials real WebSocket connections using the pool's connection template.
pub struct WsNodeConnector {
    template: ConnectionConfig,
}

impl WsNodeConnector {
    pub fn new(template: ConnectionConfig) -> Self {
        Self { template }
    }
}

#[async_trait]
impl NodeConnector for WsNodeConnector {
    async fn connect(&self, url: &str) -> Result<Arc<dyn NodeClient>, RpcError> {
        let manager = ConnectionManager::new(ConnectionConfig {
            url: url.to_string(),
            ..self.template.clone()
        });
        manager.connect().await?;
        Ok(Arc::new(manager))
    }
}

// ─── Node records ────────────────────────────────────────────────────────────

/// Health bookkeeping for one configured endpoint. Mutated in place on every
/// success and failure; never destroyed during the pool's lifetime.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub url: String,
    pub last_attempted_at: Option<DateTime<Utc>>,
    pub error_count: u64,
    pub consecutive_failures: u32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub observed_latency_ms: Option<u64>,
}

impl NodeRecord {
    fn new(url: String) -> Self {
        Self {
            url,
            last_attempted_at: None,
            error_count: 0,
            consecutive_failures: 0,
            last_success_at: None,
            observed_latency_ms: None,
        }
    }

    fn mark_failure(&mut self) {
        self.error_count += 1;
        self.consecutive_failures += 1;
    }

    fn mark_success(&mut self, latency_ms: Option<u64>) {
        self.consecutive_failures = 0;
        self.last_success_at = Some(Utc::now());
        if latency_ms.is_some() {
            self.observed_latency_ms = latency_ms;
        }
    }
}

// ─── Configuration ───────────────────────────────────────────────────────────

/// Configuration for the failover pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Endpoints in rotation order.
    pub urls: Vec<String>,
    /// Pool-level bound on each call attempt, independent of the
    /// connection's own request timeout. The shorter governs.
    pub call_timeout: Duration,
    /// Retry schedule: `base_delay` is also the inter-endpoint delay within
    /// one connect rotation, `max_attempts` the call retry budget.
    pub retry_backoff: LinearBackoff,
    /// Template for per-node connections (url is filled per endpoint).
    pub connection: ConnectionConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            urls: network::DEFAULT_NODE_URLS
                .iter()
                .map(|u| u.to_string())
                .collect(),
            call_timeout: Duration::from_secs(3),
            retry_backoff: LinearBackoff::failover(),
            connection: ConnectionConfig::default(),
        }
    }
}

// ─── Pool ────────────────────────────────────────────────────────────────────

type ConnectOutcome = Result<Arc<dyn NodeClient>, RpcError>;

struct PoolState {
    /// Active instance plus the index of the node record serving it.
    active: Option<(Arc<dyn NodeClient>, usize)>,
    current_node_index: usize,
    records: Vec<NodeRecord>,
    /// `Some` while a connect rotation is underway; holds the waiter queue.
    connecting: Option<Vec<oneshot::Sender<ConnectOutcome>>>,
}

/// Shared pool internals. Owned behind an `Arc` so a connect rotation can
/// run as a detached task, surviving cancellation of the caller that
/// started it.
struct PoolInner {
    config: PoolConfig,
    connector: Arc<dyn NodeConnector>,
    state: Mutex<PoolState>,
}

/// Single logical RPC surface backed by a rotating list of endpoints.
pub struct FailoverPool {
    inner: Arc<PoolInner>,
}

impl FailoverPool {
    /// Pool dialing real WebSocket connections.
    pub fn new(config: PoolConfig) -> Self {
        let connector = Arc::new(WsNodeConnector::new(config.connection.clone()));
        Self::with_connector(config, connector)
    }

    /// Pool with a custom connector (tests use an in-memory one).
    pub fn with_connector(config: PoolConfig, connector: Arc<dyn NodeConnector>) -> Self {
        let records = config
            .urls
            .iter()
            .map(|url| NodeRecord::new(url.clone()))
            .collect();
        Self {
            inner: Arc::new(PoolInner {
                config,
                connector,
                state: Mutex::new(PoolState {
                    active: None,
                    current_node_index: 0,
                    records,
                    connecting: None,
                }),
            }),
        }
    }

    /// Resolve the active instance, connecting if necessary.
    ///
    /// When an attempt is already underway, the caller joins its waiter
    /// queue and receives that attempt's outcome — at most one connection
    /// establishment runs at a time. The rotation itself runs as a detached
    /// task: dropping any waiting caller (a caller-side timeout or select)
    /// neither cancels the attempt nor strands the other waiters.
    pub async fn active_instance(&self) -> ConnectOutcome {
        let (rx, lead) = {
            let mut st = self.inner.state.lock().await;
            if let Some((active, _)) = &st.active {
                if active.is_connected() {
                    return Ok(Arc::clone(active));
                }
            }
            let (tx, rx) = oneshot::channel();
            match st.connecting.as_mut() {
                Some(waiters) => {
                    waiters.push(tx);
                    (rx, false)
                }
                None => {
                    st.connecting = Some(vec![tx]);
                    (rx, true)
                }
            }
        };

        if lead {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                let outcome = inner.connect_rotation().await;
                let waiters = {
                    let mut st = inner.state.lock().await;
                    if let Ok(client) = &outcome {
                        let index = st.current_node_index;
                        st.active = Some((Arc::clone(client), index));
                    }
                    st.connecting.take().unwrap_or_default()
                };
                for waiter in waiters {
                    let _ = waiter.send(outcome.clone());
                }
            });
        }

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(ConnectionError::NotConnected.into()),
        }
    }
}

impl PoolInner {
    /// One rotation over the endpoint list, starting at the current index.
    async fn connect_rotation(&self) -> ConnectOutcome {
        let (stale, node_count) = {
            let mut st = self.state.lock().await;
            (st.active.take(), st.records.len())
        };
        if let Some((stale, _)) = stale {
            stale.close().await;
        }
        if node_count == 0 {
            return Err(ConnectionError::AllNodesFailed.into());
        }

        for attempt in 0..node_count {
            if attempt > 0 {
                tokio::time::sleep(self.config.retry_backoff.base_delay).await;
            }

            let (index, url) = {
                let mut st = self.state.lock().await;
                let index = st.current_node_index;
                st.records[index].last_attempted_at = Some(Utc::now());
                (index, st.records[index].url.clone())
            };

            tracing::debug!(%url, index, "trying node");
            match self.connector.connect(&url).await {
                Ok(client) => {
                    let mut st = self.state.lock().await;
                    st.records[index].mark_success(client.observed_latency_ms());
                    tracing::info!(%url, index, "node connected");
                    return Ok(client);
                }
                Err(e) => {
                    let mut st = self.state.lock().await;
                    st.records[index].mark_failure();
                    st.current_node_index = (index + 1) % node_count;
                    tracing::warn!(%url, index, "node connect failed: {}", e);
                }
            }
        }

        Err(ConnectionError::AllNodesFailed.into())
    }
}

impl FailoverPool {
    /// Perform one `api.method(args)` call with failover and retries.
    ///
    /// Connection-class failures mark the serving node unhealthy, drop the
    /// active instance (only if it is still the active one — a stale failure
    /// from an already-superseded instance must not cause a second failover)
    /// and retry up to the configured budget. Protocol and data errors
    /// propagate immediately.
    pub async fn call(&self, api: &str, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        let budget = self.inner.config.retry_backoff.max_attempts;
        let mut last_error: Option<RpcError> = None;

        for attempt in 1..=budget {
            if attempt > 1 {
                let delay = self.inner.config.retry_backoff.delay_for_attempt(attempt - 1);
                tracing::debug!(
                    attempt,
                    budget,
                    delay_ms = delay.as_millis() as u64,
                    "retrying {}.{}",
                    api,
                    method
                );
                tokio::time::sleep(delay).await;
            }

            let instance = match self.active_instance().await {
                Ok(instance) => instance,
                Err(e) => {
                    last_error = Some(e);
                    continue;
                }
            };

            let outcome =
                tokio::time::timeout(self.inner.config.call_timeout, instance.call(api, method, args.clone()))
                    .await;

            match outcome {
                Ok(Ok(value)) => {
                    self.mark_instance_healthy(&instance).await;
                    return Ok(value);
                }
                Ok(Err(e)) if e.is_connection_error() => {
                    tracing::warn!("{}.{} failed on connection: {}", api, method, e);
                    self.fail_instance(&instance).await;
                    last_error = Some(e);
                }
                Ok(Err(e)) => return Err(e),
                Err(_elapsed) => {
                    tracing::warn!(
                        timeout_ms = self.inner.config.call_timeout.as_millis() as u64,
                        "{}.{} exceeded the pool call timeout",
                        api,
                        method
                    );
                    self.fail_instance(&instance).await;
                    last_error = Some(ConnectionError::RequestTimeout.into());
                }
            }
        }

        Err(RpcError::RetryExhausted {
            attempts: budget,
            last_error: Box::new(
                last_error.unwrap_or_else(|| ConnectionError::NotConnected.into()),
            ),
        })
    }

    /// Forced manual rotation. Fails while an automatic connection attempt
    /// is underway (mutual exclusion with the single-flight path). Returns
    /// the new rotation index.
    pub async fn switch_to_next_node(&self) -> Result<usize, RpcError> {
        let (stale, index) = {
            let mut st = self.inner.state.lock().await;
            if st.connecting.is_some() {
                return Err(RpcError::Data(
                    "a connection attempt is in progress".into(),
                ));
            }
            if st.records.is_empty() {
                return Err(ConnectionError::AllNodesFailed.into());
            }
            st.current_node_index = (st.current_node_index + 1) % st.records.len();
            (st.active.take(), st.current_node_index)
        };
        if let Some((stale, _)) = stale {
            stale.close().await;
        }
        tracing::info!(index, "manually rotated to next node");
        Ok(index)
    }

    /// Snapshot of the per-node health table.
    pub async fn node_records(&self) -> Vec<NodeRecord> {
        self.inner.state.lock().await.records.clone()
    }

    /// Current rotation index.
    pub async fn current_node_index(&self) -> usize {
        self.inner.state.lock().await.current_node_index
    }

    async fn mark_instance_healthy(&self, instance: &Arc<dyn NodeClient>) {
        let mut st = self.inner.state.lock().await;
        if let Some((active, index)) = &st.active {
            if Arc::ptr_eq(active, instance) {
                let index = *index;
                st.records[index].mark_success(instance.observed_latency_ms());
            }
        }
    }

    /// Drop the failing instance, but only if it is still the active one.
    async fn fail_instance(&self, instance: &Arc<dyn NodeClient>) {
        let stale = {
            let mut st = self.inner.state.lock().await;
            let still_active = st
                .active
                .as_ref()
                .map(|(active, _)| Arc::ptr_eq(active, instance))
                .unwrap_or(false);
            if !still_active {
                tracing::debug!("ignoring failure from a superseded instance");
                return;
            }
            let (stale, index) = match st.active.take() {
                Some(pair) => pair,
                None => return,
            };
            st.records[index].mark_failure();
            // Failover: the next rotation starts at the following node.
            st.current_node_index = (index + 1) % st.records.len();
            stale
        };
        stale.close().await;
    }
}
