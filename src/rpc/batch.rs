//! Batch fetcher — bounded-size bulk lookups over the pool.
//!
//! The node caps how many identifiers one call may resolve, so large lookups
//! are partitioned into fixed-size chunks, one pool call per chunk, and the
//! successful chunk results merged. Assembly is best-effort: a failed chunk
//! is logged and skipped, and absent/null entries are omitted — unlike the
//! pagination engine, this is deliberately not all-or-nothing.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::rpc::pool::FailoverPool;

/// Identifiers per RPC call, matching the backend's per-call limit.
pub const BATCH_CHUNK_SIZE: usize = 90;

/// Fetches large identifier sets without exceeding the per-call limit.
pub struct BatchFetcher {
    pool: Arc<FailoverPool>,
    chunk_size: usize,
}

impl BatchFetcher {
    pub fn new(pool: Arc<FailoverPool>) -> Self {
        Self {
            pool,
            chunk_size: BATCH_CHUNK_SIZE,
        }
    }

    /// Override the chunk size (tests use small chunks).
    pub fn with_chunk_size(pool: Arc<FailoverPool>, chunk_size: usize) -> Self {
        Self {
            pool,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Resolve object ids to objects, keyed by id.
    pub async fn get_objects(&self, ids: &[String]) -> HashMap<String, Value> {
        self.fetch_chunked(ids, "get_objects").await
    }

    /// Resolve symbolic names to objects, keyed by name.
    pub async fn get_objects_by_name(&self, names: &[String]) -> HashMap<String, Value> {
        self.fetch_chunked(names, "lookup_asset_symbols").await
    }

    async fn fetch_chunked(&self, keys: &[String], method: &str) -> HashMap<String, Value> {
        let mut merged = HashMap::with_capacity(keys.len());

        for chunk in keys.chunks(self.chunk_size) {
            let args = vec![Value::Array(
                chunk.iter().map(|k| Value::String(k.clone())).collect(),
            )];

            match self.pool.call("database", method, args).await {
                Ok(Value::Array(objects)) => {
                    if objects.len() != chunk.len() {
                        tracing::warn!(
                            method,
                            expected = chunk.len(),
                            got = objects.len(),
                            "batch response length mismatch; unmatched keys skipped"
                        );
                    }
                    // The node answers positionally; null marks an unknown key.
                    for (key, object) in chunk.iter().zip(objects) {
                        if !object.is_null() {
                            merged.insert(key.clone(), object);
                        }
                    }
                }
                Ok(other) => {
                    tracing::warn!(method, "unexpected batch response shape: {}", other);
                }
                Err(e) => {
                    tracing::warn!(method, chunk_len = chunk.len(), "batch chunk failed: {}", e);
                }
            }
        }

        merged
    }
}
