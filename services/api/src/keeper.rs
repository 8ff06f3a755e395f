//! Periodic driver. Every tick it makes sure upcoming rounds exist, locks
//! rounds past their lock point, and triggers settlement. Replicas need no
//! leader election: every mutation goes through the ledger's idempotent
//! operations and the per-round processing lock.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::sync::watch;

use crate::{
    audit::{AuditLevel, AuditSink},
    config::Config,
    errors::{EngineError, EngineResult},
    ledger::{Ledger, RoundKey},
    market::MarketSpec,
    metrics::Metrics,
    oracle::OracleSource,
    round::{Round, RoundStatus},
    settlement::SettlementEngine,
};

/// Retry a transient-failure-prone operation with linear backoff. Bounded
/// to keep every retry chain inside a single keeper tick.
pub async fn with_retries<T, F, Fut>(
    attempts: u32,
    base_delay: Duration,
    mut op: F,
) -> EngineResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = EngineResult<T>>,
{
    let attempts = attempts.max(1);
    let mut last = None;
    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < attempts => {
                tokio::time::sleep(base_delay * attempt).await;
                last = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    Err(last.unwrap_or_else(|| EngineError::transient("retries exhausted")))
}

pub struct Keeper {
    ledger: Arc<dyn Ledger>,
    oracle: Arc<OracleSource>,
    engine: Arc<SettlementEngine>,
    cfg: Arc<Config>,
    metrics: Metrics,
    audit: Arc<dyn AuditSink>,
}

/// How many past cycles the lock step scans. Rounds older than that are
/// force-settled as refunds by the settlement step anyway.
const LOCK_SCAN_CYCLES: i64 = 3;

impl Keeper {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        oracle: Arc<OracleSource>,
        engine: Arc<SettlementEngine>,
        cfg: Arc<Config>,
        metrics: Metrics,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self { ledger, oracle, engine, cfg, metrics, audit }
    }

    /// Treasury hard lock: refuse to drive rounds at all when the
    /// configured treasury is not the one operations expects.
    pub fn verify_treasury(&self) -> EngineResult<()> {
        if let Some(expected) = &self.cfg.expected_treasury_wallet {
            if expected != &self.cfg.treasury_wallet {
                return Err(EngineError::fatal(format!(
                    "treasury lock mismatch: expected {expected}, configured {}",
                    self.cfg.treasury_wallet
                )));
            }
        }
        Ok(())
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.cfg.keeper_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval_ms = self.cfg.keeper_interval.as_millis() as u64, "keeper started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = Utc::now().timestamp();
                    self.tick(now).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("keeper stopped");
    }

    /// One pass over all markets. A failing step or market never prevents
    /// the other steps or markets from running in the same tick.
    pub async fn tick(&self, now: i64) {
        for market in &self.cfg.markets {
            if let Err(err) = self.ensure_rounds(market, now).await {
                self.metrics.observe_keeper_error("create");
                self.audit
                    .record(AuditLevel::Warn, "create_rounds_failed", &format!("{}: {err}", market.symbol))
                    .await;
            }
            if let Err(err) = self.lock_due_rounds(market, now).await {
                self.metrics.observe_keeper_error("lock");
                self.audit
                    .record(AuditLevel::Warn, "lock_rounds_failed", &format!("{}: {err}", market.symbol))
                    .await;
            }
        }

        if self.cfg.pause.settlement_paused(self.cfg.custody_mode) {
            tracing::debug!("settlement paused, skipping settle step");
        } else {
            let result = with_retries(self.cfg.retry_attempts, self.cfg.retry_base_delay, || {
                self.engine.settle_due_rounds(now)
            })
            .await;
            match result {
                Ok(settled) if !settled.is_empty() => {
                    tracing::info!(count = settled.len(), rounds = ?settled, "settled rounds");
                }
                Ok(_) => {}
                Err(err) => {
                    self.metrics.observe_keeper_error("settle");
                    self.audit
                        .record(AuditLevel::Error, "settle_step_failed", &err.to_string())
                        .await;
                }
            }
        }

        if let Err(err) = self.refresh_gauges(now).await {
            tracing::debug!("gauge refresh failed: {err}");
        }
    }

    /// Idempotent round creation for the current and next entry cycle.
    async fn ensure_rounds(&self, market: &MarketSpec, now: i64) -> EngineResult<()> {
        let cycle = self.cfg.cycle_seconds();
        let current = now - now.rem_euclid(cycle);
        for start in [current, current + cycle] {
            let round = Round::schedule(&market.symbol, start, &self.cfg)?;
            if !round.can_create(now, &self.cfg) {
                continue;
            }
            if self.ledger.insert_round(&round).await? {
                tracing::info!(round = %round.id_string(), "created round");
            }
        }
        Ok(())
    }

    /// Lock any OPEN round in the recent candidate window whose lock
    /// point has passed, freezing its start price.
    async fn lock_due_rounds(&self, market: &MarketSpec, now: i64) -> EngineResult<()> {
        let cycle = self.cfg.cycle_seconds();
        let current = now - now.rem_euclid(cycle);
        for k in 0..=LOCK_SCAN_CYCLES {
            let key = RoundKey::new(&market.symbol, current - k * cycle);
            if key.round_id < 0 {
                break;
            }
            let candidate = match self.ledger.get_round(&key).await? {
                Some(round) => round,
                None => continue,
            };
            if candidate.status != RoundStatus::Open || candidate.lock_ts > now {
                continue;
            }
            match self.lock_one(market, &key, now).await {
                Ok(true) => tracing::info!(round = %key.id_string(), "locked round"),
                Ok(false) => {}
                Err(err) if err.is_transient() => return Err(err),
                Err(err) => {
                    // Stale or unauthentic oracle: leave the round OPEN;
                    // it force-settles as a refund at end_ts.
                    self.audit
                        .record(
                            AuditLevel::Warn,
                            "lock_skipped",
                            &format!("{}: {err}", key.id_string()),
                        )
                        .await;
                }
            }
        }
        Ok(())
    }

    async fn lock_one(
        &self,
        market: &MarketSpec,
        key: &RoundKey,
        now: i64,
    ) -> EngineResult<bool> {
        if !self
            .ledger
            .try_acquire_round_lock(key, self.cfg.round_lock_ttl)
            .await?
        {
            return Ok(false);
        }
        let outcome = self.lock_under_guard(market, key, now).await;
        if let Err(err) = self.ledger.release_round_lock(key).await {
            self.audit
                .record(
                    AuditLevel::Warn,
                    "lock_release_failed",
                    &format!("{}: {err}", key.id_string()),
                )
                .await;
        }
        outcome
    }

    async fn lock_under_guard(
        &self,
        market: &MarketSpec,
        key: &RoundKey,
        now: i64,
    ) -> EngineResult<bool> {
        let mut round = match self.ledger.get_round(key).await? {
            Some(round) => round,
            None => return Ok(false),
        };
        if round.status != RoundStatus::Open || round.lock_ts > now {
            return Ok(false);
        }

        let lock_ts = round.lock_ts;
        let snapshot = with_retries(self.cfg.retry_attempts, self.cfg.retry_base_delay, || async move {
            self.oracle
                .snapshot_near(market, lock_ts)
                .await
                .map_err(EngineError::from)
        })
        .await?;

        round.lock(now, &snapshot, market, self.cfg.oracle_max_age_sec)?;
        self.ledger.store_round(&round).await?;
        Ok(true)
    }

    async fn refresh_gauges(&self, now: i64) -> EngineResult<()> {
        let due = self.ledger.rounds_due(now, self.cfg.ops_scan_limit).await?;
        let max_lag_ms = due
            .iter()
            .map(|d| (now - d.end_ts).max(0) * 1000)
            .max()
            .unwrap_or(0);
        self.metrics.set_pending_due(due.len() as i64, max_lag_ms);
        Ok(())
    }
}
