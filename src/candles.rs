//! Trade-to-candle (OHLCV) aggregation.
//!
//! Pure data transformation: an unordered, possibly sparse trade stream in,
//! a gapless time-bucketed series out. No I/O, no shared state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::RpcError;

/// A single executed trade, as produced by the domain parsers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub timestamp_ms: u64,
    pub price: f64,
    pub volume: f64,
}

impl Trade {
    /// Checked constructor: price must be strictly positive, volume
    /// non-negative. NaN fails both checks.
    pub fn new(timestamp_ms: u64, price: f64, volume: f64) -> Result<Self, RpcError> {
        if !(price > 0.0) {
            return Err(RpcError::Data(format!("non-positive trade price: {price}")));
        }
        if !(volume >= 0.0) {
            return Err(RpcError::Data(format!("negative trade volume: {volume}")));
        }
        Ok(Self {
            timestamp_ms,
            price,
            volume,
        })
    }
}

/// One OHLCV bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub bucket_start_ms: u64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Aggregate trades into a gapless, ascending OHLCV series.
///
/// Trades are sorted by timestamp (stable — tie-break order among equal
/// timestamps follows input order) and bucketed into
/// `floor(ts / bucket_size_ms) * bucket_size_ms`. Buckets with no trades are
/// filled with a flat carry-forward candle: open/high/low/close equal the
/// previous close, volume 0. The span always starts at a populated bucket,
/// so the carry-forward seed exists whenever the output is non-empty.
///
/// Empty input (or a zero bucket size) yields an empty series.
pub fn aggregate(trades: &[Trade], bucket_size_ms: u64) -> Vec<Candle> {
    if trades.is_empty() || bucket_size_ms == 0 {
        return Vec::new();
    }

    let mut sorted = trades.to_vec();
    sorted.sort_by_key(|t| t.timestamp_ms);

    let mut buckets: BTreeMap<u64, Candle> = BTreeMap::new();
    for trade in &sorted {
        let start = trade.timestamp_ms / bucket_size_ms * bucket_size_ms;
        buckets
            .entry(start)
            .and_modify(|c| {
                c.high = c.high.max(trade.price);
                c.low = c.low.min(trade.price);
                c.close = trade.price;
                c.volume += trade.volume;
            })
            .or_insert(Candle {
                bucket_start_ms: start,
                open: trade.price,
                high: trade.price,
                low: trade.price,
                close: trade.price,
                volume: trade.volume,
            });
    }

    let (first, last) = match (
        buckets.keys().next().copied(),
        buckets.keys().next_back().copied(),
    ) {
        (Some(first), Some(last)) => (first, last),
        _ => return Vec::new(),
    };

    let mut series = Vec::with_capacity(((last - first) / bucket_size_ms + 1) as usize);
    let mut last_close = 0.0;
    let mut start = first;
    while start <= last {
        match buckets.get(&start) {
            Some(candle) => {
                last_close = candle.close;
                series.push(*candle);
            }
            None => series.push(Candle {
                bucket_start_ms: start,
                open: last_close,
                high: last_close,
                low: last_close,
                close: last_close,
                volume: 0.0,
            }),
        }
        start += bucket_size_ms;
    }

    series
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(ts: u64, price: f64, volume: f64) -> Trade {
        Trade {
            timestamp_ms: ts,
            price,
            volume,
        }
    }

    #[test]
    fn test_empty_input_yields_empty_series() {
        assert!(aggregate(&[], 60_000).is_empty());
    }

    #[test]
    fn test_zero_bucket_size_yields_empty_series() {
        assert!(aggregate(&[trade(1000, 10.0, 1.0)], 0).is_empty());
    }

    #[test]
    fn test_two_bucket_example() {
        let trades = [
            trade(1000, 10.0, 1.0),
            trade(1000, 12.0, 1.0),
            trade(61_000, 11.0, 2.0),
        ];
        let candles = aggregate(&trades, 60_000);
        assert_eq!(
            candles,
            vec![
                Candle {
                    bucket_start_ms: 0,
                    open: 10.0,
                    high: 12.0,
                    low: 10.0,
                    close: 12.0,
                    volume: 2.0,
                },
                Candle {
                    bucket_start_ms: 60_000,
                    open: 11.0,
                    high: 11.0,
                    low: 11.0,
                    close: 11.0,
                    volume: 2.0,
                },
            ]
        );
    }

    #[test]
    fn test_unsorted_input_is_sorted_first() {
        let trades = [trade(61_000, 11.0, 2.0), trade(1000, 10.0, 1.0)];
        let candles = aggregate(&trades, 60_000);
        assert_eq!(candles[0].open, 10.0);
        assert_eq!(candles[1].open, 11.0);
    }

    #[test]
    fn test_gap_is_filled_with_carry_forward() {
        let trades = [trade(0, 5.0, 1.0), trade(180_000, 7.0, 1.0)];
        let candles = aggregate(&trades, 60_000);
        assert_eq!(candles.len(), 4);

        // Buckets 60_000 and 120_000 are synthetic flat candles at close=5.0.
        for synthetic in &candles[1..3] {
            assert_eq!(synthetic.open, 5.0);
            assert_eq!(synthetic.high, 5.0);
            assert_eq!(synthetic.low, 5.0);
            assert_eq!(synthetic.close, 5.0);
            assert_eq!(synthetic.volume, 0.0);
        }
        assert_eq!(candles[3].close, 7.0);
    }

    #[test]
    fn test_span_has_no_missing_buckets() {
        let trades = [
            trade(10, 1.0, 1.0),
            trade(250_123, 2.0, 1.0),
            trade(790_456, 3.0, 1.0),
        ];
        let bucket = 60_000;
        let candles = aggregate(&trades, bucket);

        let first = 0;
        let last = 790_456 / bucket * bucket;
        assert_eq!(candles.len() as u64, (last - first) / bucket + 1);
        for (i, candle) in candles.iter().enumerate() {
            assert_eq!(candle.bucket_start_ms, first + i as u64 * bucket);
        }
    }

    #[test]
    fn test_equal_timestamps_keep_input_order() {
        // Both trades land in the same millisecond: open is the first seen,
        // close the last seen, per input order.
        let trades = [trade(500, 3.0, 1.0), trade(500, 4.0, 1.0)];
        let candles = aggregate(&trades, 60_000);
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].open, 3.0);
        assert_eq!(candles[0].close, 4.0);
        assert_eq!(candles[0].volume, 2.0);
    }

    #[test]
    fn test_trade_validation() {
        assert!(Trade::new(0, 10.0, 0.0).is_ok());
        assert!(matches!(Trade::new(0, 0.0, 1.0), Err(RpcError::Data(_))));
        assert!(matches!(Trade::new(0, -1.0, 1.0), Err(RpcError::Data(_))));
        assert!(matches!(Trade::new(0, f64::NAN, 1.0), Err(RpcError::Data(_))));
        assert!(matches!(Trade::new(0, 10.0, -0.5), Err(RpcError::Data(_))));
    }
}
