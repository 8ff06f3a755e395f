//! Oracle port: price snapshots at wall-clock instants. The port is
//! narrow on purpose; caching, request coalescing, and the nearest
//! timestamp fallback live in [`OracleSource`] so callers can assume
//! identical `(market, ts)` queries return identical snapshots within the
//! grace window.

pub mod http;

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};

use crate::{errors::EngineError, market::MarketSpec};

/// How long a resolved `(market, ts)` snapshot stays replayable.
const CACHE_GRACE_SECONDS: i64 = 600;

/// Half-width of the nearest-timestamp search around a stale instant.
pub const NEAREST_SEARCH_SECONDS: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricePoint {
    pub price: i64,
    pub expo: i32,
}

impl PricePoint {
    /// Compare two prices that may carry different exponents by aligning
    /// mantissas in i128 space.
    pub fn cmp_value(&self, other: &PricePoint) -> std::cmp::Ordering {
        if self.expo == other.expo {
            return self.price.cmp(&other.price);
        }
        let min_expo = self.expo.min(other.expo);
        let scale = |p: &PricePoint| -> i128 {
            (p.price as i128) * 10i128.pow((p.expo - min_expo) as u32)
        };
        scale(self).cmp(&scale(other))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleSnapshot {
    pub price: i64,
    pub expo: i32,
    pub publish_time: i64,
    pub confidence: u64,
    pub source_owner: String,
}

impl OracleSnapshot {
    pub fn price_point(&self) -> PricePoint {
        PricePoint { price: self.price, expo: self.expo }
    }
}

#[derive(Debug, Clone, Error)]
pub enum OracleError {
    #[error("oracle unreachable: {0}")]
    Unreachable(String),

    #[error("snapshot stale: published {publish_time}, requested {requested}")]
    Stale { publish_time: i64, requested: i64 },

    #[error("feed owner mismatch: expected {expected}, got {actual}")]
    OwnerMismatch { expected: String, actual: String },
}

impl From<OracleError> for EngineError {
    fn from(err: OracleError) -> Self {
        match err {
            OracleError::Unreachable(msg) => EngineError::TransientExternal(msg),
            OracleError::Stale { publish_time, requested } => {
                EngineError::StaleOracle { publish_time, requested }
            }
            OracleError::OwnerMismatch { expected, actual } => {
                EngineError::OracleOwnerMismatch { expected, actual }
            }
        }
    }
}

#[async_trait]
pub trait OraclePort: Send + Sync {
    /// Price for `market` at `unix_ts`. Implementations enforce the
    /// publish-time freshness tolerance and surface `source_owner` so the
    /// state machine can verify authenticity.
    async fn price_at(&self, market: &MarketSpec, unix_ts: i64)
        -> Result<OracleSnapshot, OracleError>;
}

type CacheKey = (String, i64);

/// Coalescing front of the oracle port. Concurrent callers asking for the
/// same `(market, ts)` share one in-flight request; resolved snapshots are
/// pinned for the grace window so settlement replays see the same price.
pub struct OracleSource {
    port: Arc<dyn OraclePort>,
    cells: Mutex<HashMap<CacheKey, Arc<OnceCell<OracleSnapshot>>>>,
}

impl OracleSource {
    pub fn new(port: Arc<dyn OraclePort>) -> Self {
        Self { port, cells: Mutex::new(HashMap::new()) }
    }

    pub async fn snapshot_at(
        &self,
        market: &MarketSpec,
        unix_ts: i64,
    ) -> Result<OracleSnapshot, OracleError> {
        let cell = {
            let mut cells = self.cells.lock().await;
            cells.retain(|(_, ts), _| unix_ts - *ts < CACHE_GRACE_SECONDS);
            cells
                .entry((market.symbol.clone(), unix_ts))
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };
        // A failed fetch leaves the cell empty; the next caller retries.
        cell.get_or_try_init(|| self.port.price_at(market, unix_ts))
            .await
            .map(|snapshot| snapshot.clone())
    }

    /// Exact instant first, then spiral outward one second at a time up to
    /// ±10s. Only staleness widens the search; transport and authenticity
    /// failures surface immediately.
    pub async fn snapshot_near(
        &self,
        market: &MarketSpec,
        unix_ts: i64,
    ) -> Result<OracleSnapshot, OracleError> {
        let mut last_stale = None;
        for offset in search_offsets() {
            match self.snapshot_at(market, unix_ts + offset).await {
                Ok(snapshot) => return Ok(snapshot),
                Err(OracleError::Stale { publish_time, .. }) => {
                    last_stale = Some(OracleError::Stale { publish_time, requested: unix_ts });
                }
                Err(other) => return Err(other),
            }
        }
        Err(last_stale.unwrap_or(OracleError::Unreachable("empty search window".into())))
    }
}

fn search_offsets() -> impl Iterator<Item = i64> {
    std::iter::once(0).chain((1..=NEAREST_SEARCH_SECONDS).flat_map(|d| [d, -d]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    use crate::market::default_markets;

    struct CountingPort {
        calls: AtomicU64,
        stale_below: i64,
    }

    #[async_trait]
    impl OraclePort for CountingPort {
        async fn price_at(
            &self,
            _market: &MarketSpec,
            unix_ts: i64,
        ) -> Result<OracleSnapshot, OracleError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if unix_ts < self.stale_below {
                return Err(OracleError::Stale { publish_time: 0, requested: unix_ts });
            }
            Ok(OracleSnapshot {
                price: unix_ts * 10,
                expo: -8,
                publish_time: unix_ts,
                confidence: 5,
                source_owner: "owner".into(),
            })
        }
    }

    fn sol() -> MarketSpec {
        default_markets().remove(0)
    }

    #[tokio::test]
    async fn concurrent_identical_requests_coalesce() {
        let port = Arc::new(CountingPort { calls: AtomicU64::new(0), stale_below: 0 });
        let source = Arc::new(OracleSource::new(port.clone()));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let source = source.clone();
            handles.push(tokio::spawn(async move {
                source.snapshot_at(&sol(), 1_000).await.unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().publish_time, 1_000);
        }
        assert_eq!(port.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn repeated_request_is_served_from_cache() {
        let port = Arc::new(CountingPort { calls: AtomicU64::new(0), stale_below: 0 });
        let source = OracleSource::new(port.clone());
        let first = source.snapshot_at(&sol(), 2_000).await.unwrap();
        let second = source.snapshot_at(&sol(), 2_000).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(port.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn nearest_search_walks_outward() {
        // Everything below 1005 is stale, so ts=1000 resolves at +5.
        let port = Arc::new(CountingPort { calls: AtomicU64::new(0), stale_below: 1_005 });
        let source = OracleSource::new(port);
        let snapshot = source.snapshot_near(&sol(), 1_000).await.unwrap();
        assert_eq!(snapshot.publish_time, 1_005);
    }

    #[tokio::test]
    async fn nearest_search_reports_stale_when_exhausted() {
        let port = Arc::new(CountingPort { calls: AtomicU64::new(0), stale_below: i64::MAX });
        let source = OracleSource::new(port);
        let err = source.snapshot_near(&sol(), 1_000).await.unwrap_err();
        assert!(matches!(err, OracleError::Stale { requested: 1_000, .. }));
    }

    #[test]
    fn price_points_compare_across_exponents() {
        use std::cmp::Ordering;
        let a = PricePoint { price: 100_000, expo: -3 };
        let b = PricePoint { price: 1_000, expo: -1 };
        assert_eq!(a.cmp_value(&b), Ordering::Equal);
        let c = PricePoint { price: 1_001, expo: -1 };
        assert_eq!(a.cmp_value(&c), Ordering::Less);
    }
}
