//! Search backend layer — wire types and the cursor pagination engine.

pub mod engine;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Cursor ──────────────────────────────────────────────────────────────────

/// Opaque deep-pagination cursor: the sort key of the last returned hit,
/// echoed back as `search_after` to fetch the next page without offset
/// scanning. By convention the first sort component is a millisecond
/// timestamp, which drives progress reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor(pub Vec<Value>);

impl Cursor {
    /// Millisecond timestamp component, if the sort key carries one.
    pub fn timestamp_ms(&self) -> Option<u64> {
        self.0.first().and_then(Value::as_u64)
    }
}

// ─── Requests ────────────────────────────────────────────────────────────────

/// One page request against the search index.
#[derive(Debug, Clone, Serialize)]
pub struct SearchRequest {
    pub size: usize,
    pub query: Value,
    pub sort: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_after: Option<Cursor>,
}

// ─── Responses ───────────────────────────────────────────────────────────────

/// One returned hit.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SearchHit {
    #[serde(rename = "_source")]
    pub source: Value,
    #[serde(default)]
    pub sort: Vec<Value>,
}

/// One page of results, already lifted out of the backend's envelope.
#[derive(Debug, Clone)]
pub struct SearchPage {
    pub total: u64,
    pub hits: Vec<SearchHit>,
}

/// Raw search backend envelope (`hits.total` / `hits.hits`).
#[derive(Debug, Deserialize)]
pub(crate) struct SearchEnvelope {
    pub hits: SearchEnvelopeHits,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SearchEnvelopeHits {
    pub total: TotalHits,
    #[serde(default)]
    pub hits: Vec<SearchHit>,
}

/// Older backends report a bare number, newer ones `{value, relation}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum TotalHits {
    Count(u64),
    Tracked { value: u64 },
}

impl TotalHits {
    pub fn value(&self) -> u64 {
        match self {
            TotalHits::Count(n) => *n,
            TotalHits::Tracked { value } => *value,
        }
    }
}

impl From<SearchEnvelope> for SearchPage {
    fn from(envelope: SearchEnvelope) -> Self {
        SearchPage {
            total: envelope.hits.total.value(),
            hits: envelope.hits.hits,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cursor_timestamp_component() {
        let cursor = Cursor(vec![json!(1_700_000_000_000u64), json!("op_42")]);
        assert_eq!(cursor.timestamp_ms(), Some(1_700_000_000_000));

        let no_ts = Cursor(vec![json!("not-a-number")]);
        assert_eq!(no_ts.timestamp_ms(), None);

        assert_eq!(Cursor(Vec::new()).timestamp_ms(), None);
    }

    #[test]
    fn test_request_omits_absent_search_after() {
        let req = SearchRequest {
            size: 10_000,
            query: json!({"match_all": {}}),
            sort: json!([{"timestamp": "asc"}]),
            search_after: None,
        };
        let body = serde_json::to_value(&req).unwrap();
        assert!(body.get("search_after").is_none());

        let req = SearchRequest {
            search_after: Some(Cursor(vec![json!(42)])),
            ..req
        };
        let body = serde_json::to_value(&req).unwrap();
        assert_eq!(body["search_after"], json!([42]));
    }

    #[test]
    fn test_envelope_with_tracked_total() {
        let raw = json!({
            "hits": {
                "total": {"value": 120, "relation": "eq"},
                "hits": [
                    {"_source": {"price": "1.5"}, "sort": [1000, "a"]},
                ],
            },
        });
        let page: SearchPage = serde_json::from_value::<SearchEnvelope>(raw).unwrap().into();
        assert_eq!(page.total, 120);
        assert_eq!(page.hits.len(), 1);
        assert_eq!(page.hits[0].sort[0], json!(1000));
    }

    #[test]
    fn test_envelope_with_bare_total() {
        let raw = json!({"hits": {"total": 7, "hits": []}});
        let page: SearchPage = serde_json::from_value::<SearchEnvelope>(raw).unwrap().into();
        assert_eq!(page.total, 7);
        assert!(page.hits.is_empty());
    }
}
