use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::{OracleError, OraclePort, OracleSnapshot};
use crate::market::MarketSpec;

/// HTTP transport for the oracle port. The endpoint returns the feed
/// update closest to the requested instant; freshness is enforced here so
/// callers only ever see in-tolerance snapshots or a `Stale` error.
pub struct HttpOracle {
    http: reqwest::Client,
    base_url: String,
    max_age_sec: i64,
}

#[derive(Debug, Deserialize)]
struct PriceResponse {
    price: i64,
    expo: i32,
    publish_time: i64,
    conf: u64,
    owner: String,
}

impl HttpOracle {
    pub fn new(base_url: &str, max_age_sec: i64) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            max_age_sec,
        }
    }
}

#[async_trait]
impl OraclePort for HttpOracle {
    async fn price_at(
        &self,
        market: &MarketSpec,
        unix_ts: i64,
    ) -> Result<OracleSnapshot, OracleError> {
        let url = format!(
            "{}/v2/updates/price?feed_id={}&publish_time={}",
            self.base_url, market.feed_id, unix_ts
        );
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| OracleError::Unreachable(e.to_string()))?
            .error_for_status()
            .map_err(|e| OracleError::Unreachable(e.to_string()))?;
        let body: PriceResponse = response
            .json()
            .await
            .map_err(|e| OracleError::Unreachable(e.to_string()))?;

        if (body.publish_time - unix_ts).abs() > self.max_age_sec {
            return Err(OracleError::Stale {
                publish_time: body.publish_time,
                requested: unix_ts,
            });
        }
        Ok(OracleSnapshot {
            price: body.price,
            expo: body.expo,
            publish_time: body.publish_time,
            confidence: body.conf,
            source_owner: body.owner,
        })
    }
}
