//! Default endpoint constants.

/// Default node WebSocket endpoints, in rotation order.
pub const DEFAULT_NODE_URLS: &[&str] = &[
    "wss://node1.dexchart.io/ws",
    "wss://node2.dexchart.io/ws",
    "wss://node3.dexchart.io/ws",
];

/// Default search backend endpoint (trade history index).
pub const DEFAULT_SEARCH_URL: &str = "https://es.dexchart.io/trades/_search";
