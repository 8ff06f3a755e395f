use std::time::Duration;

use anyhow::Context;
use prometheus::{HistogramVec, IntCounterVec, IntGauge, Registry, TextEncoder};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    joins: IntCounterVec,
    settlements: IntCounterVec,
    transfers: IntCounterVec,
    keeper_errors: IntCounterVec,
    oracle_requests: IntCounterVec,
    request_latency: HistogramVec,
    settlement_duration: HistogramVec,
    pending_due_rounds: IntGauge,
    settlement_lag_ms: IntGauge,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let joins = IntCounterVec::new(
            prometheus::Opts::new("joins_total", "Entry submissions by result"),
            &["result"],
        )
        .context("joins metric")?;

        let settlements = IntCounterVec::new(
            prometheus::Opts::new("settlements_total", "Settled rounds by mode"),
            &["mode"],
        )
        .context("settlements metric")?;

        let transfers = IntCounterVec::new(
            prometheus::Opts::new("transfers_executed_total", "Executed transfers by kind"),
            &["kind"],
        )
        .context("transfers metric")?;

        let keeper_errors = IntCounterVec::new(
            prometheus::Opts::new("keeper_step_errors_total", "Keeper step failures"),
            &["step"],
        )
        .context("keeper_errors metric")?;

        let oracle_requests = IntCounterVec::new(
            prometheus::Opts::new("oracle_requests_total", "Oracle snapshot requests by outcome"),
            &["outcome"],
        )
        .context("oracle_requests metric")?;

        let request_latency = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "http_request_duration_seconds",
                "HTTP latency in seconds",
            ),
            &["endpoint"],
        )
        .context("request_latency metric")?;

        let settlement_duration = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "settlement_duration_seconds",
                "Per-round settlement duration",
            ),
            &["mode"],
        )
        .context("settlement_duration metric")?;

        let pending_due_rounds = IntGauge::new(
            "pending_due_rounds",
            "Rounds past end_ts awaiting settlement",
        )
        .context("pending_due_rounds metric")?;

        let settlement_lag_ms = IntGauge::new(
            "max_settlement_lag_ms",
            "Age of the oldest unsettled due round",
        )
        .context("settlement_lag metric")?;

        registry.register(Box::new(joins.clone()))?;
        registry.register(Box::new(settlements.clone()))?;
        registry.register(Box::new(transfers.clone()))?;
        registry.register(Box::new(keeper_errors.clone()))?;
        registry.register(Box::new(oracle_requests.clone()))?;
        registry.register(Box::new(request_latency.clone()))?;
        registry.register(Box::new(settlement_duration.clone()))?;
        registry.register(Box::new(pending_due_rounds.clone()))?;
        registry.register(Box::new(settlement_lag_ms.clone()))?;

        Ok(Self {
            registry,
            joins,
            settlements,
            transfers,
            keeper_errors,
            oracle_requests,
            request_latency,
            settlement_duration,
            pending_due_rounds,
            settlement_lag_ms,
        })
    }

    pub fn observe_join(&self, result: &str) {
        self.joins.with_label_values(&[result]).inc();
    }

    pub fn observe_settlement(&self, mode: &str, duration: Duration) {
        self.settlements.with_label_values(&[mode]).inc();
        self.settlement_duration
            .with_label_values(&[mode])
            .observe(duration.as_secs_f64());
    }

    pub fn observe_transfer(&self, kind: &str) {
        self.transfers.with_label_values(&[kind]).inc();
    }

    pub fn observe_keeper_error(&self, step: &str) {
        self.keeper_errors.with_label_values(&[step]).inc();
    }

    pub fn observe_oracle(&self, outcome: &str) {
        self.oracle_requests.with_label_values(&[outcome]).inc();
    }

    pub fn observe_request(&self, endpoint: &str, duration: Duration) {
        self.request_latency
            .with_label_values(&[endpoint])
            .observe(duration.as_secs_f64());
    }

    pub fn set_pending_due(&self, pending: i64, max_lag_ms: i64) {
        self.pending_due_rounds.set(pending);
        self.settlement_lag_ms.set(max_lag_ms);
    }

    pub fn render(&self) -> anyhow::Result<String> {
        let mut buffer = vec![];
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        prometheus::Encoder::encode(&encoder, &metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
