//! # dexchart-core
//!
//! Systems core for a DEX charting dashboard on a Graphene-style chain.
//! UI concerns (rendering, forms, persistence) live in collaborators; this
//! crate owns the parts with real failure modes:
//!
//! 1. **RPC** — a resilient JSON-RPC-over-WebSocket client: one live
//!    connection at a time over a rotating, intermittently-available node
//!    list, with health tracking, retries and failover, safe under
//!    concurrent callers.
//! 2. **Search** — cursor-based deep pagination draining the trade index in
//!    bounded chunks, with progress reporting and caller cancellation.
//! 3. **Candles** — deterministic trade-to-OHLCV aggregation producing a
//!    gapless, time-bucketed series.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use dexchart_core::prelude::*;
//! use std::sync::Arc;
//!
//! let pool = Arc::new(FailoverPool::new(PoolConfig::default()));
//! let fetcher = BatchFetcher::new(Arc::clone(&pool));
//!
//! let assets = fetcher.get_objects(&ids).await;
//! let candles = candles::aggregate(&trades, 60_000);
//! ```

// ── Layer 1: Pure domain ─────────────────────────────────────────────────────

/// Trade-to-candle (OHLCV) aggregation.
pub mod candles;

/// Unified error types.
pub mod error;

/// Default endpoint constants.
pub mod network;

// ── Layer 2: Node RPC ────────────────────────────────────────────────────────

/// RPC client: connection lifecycle, failover pool, batch lookups.
pub mod rpc;

// ── Layer 3: Search backend ──────────────────────────────────────────────────

/// Search index access: wire types and the pagination engine.
pub mod search;

// ── Prelude ──────────────────────────────────────────────────────────────────

pub mod prelude {
    pub use crate::candles::{self, aggregate, Candle, Trade};

    pub use crate::error::{ConnectionError, RpcError};

    pub use crate::rpc::batch::{BatchFetcher, BATCH_CHUNK_SIZE};
    pub use crate::rpc::connection::ConnectionManager;
    pub use crate::rpc::pool::{
        FailoverPool, NodeClient, NodeConnector, NodeRecord, PoolConfig,
    };
    pub use crate::rpc::retry::LinearBackoff;
    pub use crate::rpc::{ConnectionConfig, ConnectionState, RpcRequest, RpcResponse};

    pub use crate::search::engine::{
        HttpSearchBackend, PaginatedQueryEngine, SearchBackend, SearchConfig,
        DEFAULT_RESULT_CAP, PAGE_SIZE,
    };
    pub use crate::search::{Cursor, SearchHit, SearchPage, SearchRequest};
}
