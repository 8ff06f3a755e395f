#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;

use updown_api::{
    audit::TracingAudit,
    chain::{Deposit, TransferError, TransferFacility, TransferIntent},
    config::{Config, CustodyMode, RateBucket},
    errors::EngineError,
    join::{JoinHandler, JoinRequest},
    ledger::{memory::MemoryLedger, Entry, Ledger, RoundKey},
    market::{MarketSpec, Side},
    metrics::Metrics,
    oracle::{OracleError, OraclePort, OracleSnapshot, OracleSource},
    round::Round,
    settlement::SettlementEngine,
};

pub const TEST_ORACLE_OWNER: &str = "test-oracle-owner";
pub const SOL_FEED: &str = "feed-sol";

pub const ALICE: &str = "A1iceA1iceA1iceA1iceA1iceA1iceA1ice";
pub const BOB: &str = "BobBobBobBobBobBobBobBobBobBobBobBo";
pub const CAROL: &str = "Caro1Caro1Caro1Caro1Caro1Caro1Caro1";

pub fn sol_market() -> MarketSpec {
    MarketSpec {
        symbol: "SOL".into(),
        asset: "Solana".into(),
        feed_id: SOL_FEED.into(),
        oracle_owner: TEST_ORACLE_OWNER.into(),
    }
}

/// Test schedule: OPEN=60, LOCK=40 (cycle 100, so start 1000 is aligned),
/// SETTLE=300. A round starting at 1000 locks at 1060 and ends at 1360.
pub fn test_config() -> Config {
    let mut cfg = Config::from_env();
    cfg.custody_mode = CustodyMode::Sim;
    cfg.open_seconds = 60;
    cfg.lock_seconds = 40;
    cfg.settle_seconds = 300;
    cfg.fee_bps = 600;
    cfg.oracle_max_age_sec = 120;
    cfg.min_creation_slack_sec = 5;
    cfg.retry_attempts = 3;
    cfg.retry_base_delay = std::time::Duration::from_millis(1);
    cfg.stake_tiers = vec![25, 30, 40, 50];
    cfg.markets = vec![sol_market()];
    cfg.treasury_wallet = "TreasuryTreasuryTreasuryTreasuryTre".into();
    cfg.escrow_wallet = "EscrowEscrowEscrowEscrowEscrowEscro".into();
    cfg.expected_treasury_wallet = None;
    cfg.pause = Default::default();
    cfg.entries_ip_bucket = RateBucket {
        limit: 1_000,
        window: std::time::Duration::from_secs(60),
    };
    cfg.entries_wallet_bucket = RateBucket {
        limit: 1_000,
        window: std::time::Duration::from_secs(60),
    };
    cfg
}

// ---------------------------------------------------------------------------
// Mock oracle
// ---------------------------------------------------------------------------

pub struct MockOracle {
    snapshots: Mutex<HashMap<(String, i64), OracleSnapshot>>,
    unreachable: Mutex<bool>,
}

impl MockOracle {
    pub fn new() -> Self {
        Self {
            snapshots: Mutex::new(HashMap::new()),
            unreachable: Mutex::new(false),
        }
    }

    /// Publishes a fresh, authentic snapshot at exactly `ts`.
    pub fn set_price(&self, market: &str, ts: i64, price: i64) {
        self.set_snapshot(
            market,
            ts,
            OracleSnapshot {
                price,
                expo: -8,
                publish_time: ts,
                confidence: 10,
                source_owner: TEST_ORACLE_OWNER.into(),
            },
        );
    }

    pub fn set_snapshot(&self, market: &str, ts: i64, snapshot: OracleSnapshot) {
        self.snapshots
            .lock()
            .unwrap()
            .insert((market.to_string(), ts), snapshot);
    }

    pub fn set_unreachable(&self, value: bool) {
        *self.unreachable.lock().unwrap() = value;
    }
}

#[async_trait]
impl OraclePort for MockOracle {
    async fn price_at(
        &self,
        market: &MarketSpec,
        unix_ts: i64,
    ) -> Result<OracleSnapshot, OracleError> {
        if *self.unreachable.lock().unwrap() {
            return Err(OracleError::Unreachable("mock oracle down".into()));
        }
        match self
            .snapshots
            .lock()
            .unwrap()
            .get(&(market.symbol.clone(), unix_ts))
        {
            Some(snapshot) => Ok(snapshot.clone()),
            None => Err(OracleError::Stale { publish_time: 0, requested: unix_ts }),
        }
    }
}

// ---------------------------------------------------------------------------
// Mock transfer facility
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ChainInner {
    submitted: Vec<TransferIntent>,
    signatures: HashMap<String, String>,
    deposits: HashMap<String, Deposit>,
    fail_submits_after: Option<u32>,
    submit_count: u32,
}

#[derive(Default)]
pub struct MockChain {
    inner: Mutex<ChainInner>,
}

impl MockChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_deposit(&self, deposit: Deposit) {
        let mut inner = self.inner.lock().unwrap();
        inner.deposits.insert(deposit.signature.clone(), deposit);
    }

    /// Simulates a transfer that was confirmed externally but whose
    /// receipt was never appended (crash between submit and append).
    pub fn preload_signature(&self, memo: &str, signature: &str) {
        self.inner
            .lock()
            .unwrap()
            .signatures
            .insert(memo.to_string(), signature.to_string());
    }

    /// Submissions beyond `n` fail transiently until cleared.
    pub fn fail_submits_after(&self, n: u32) {
        self.inner.lock().unwrap().fail_submits_after = Some(n);
    }

    pub fn clear_failures(&self) {
        self.inner.lock().unwrap().fail_submits_after = None;
    }

    pub fn submitted(&self) -> Vec<TransferIntent> {
        self.inner.lock().unwrap().submitted.clone()
    }

    pub fn submitted_memos(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .submitted
            .iter()
            .map(|i| i.memo())
            .collect()
    }
}

#[async_trait]
impl TransferFacility for MockChain {
    async fn submit_transfer(&self, intent: &TransferIntent) -> Result<String, TransferError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(limit) = inner.fail_submits_after {
            if inner.submit_count >= limit {
                return Err(TransferError::Transient("mock chain timeout".into()));
            }
        }
        inner.submit_count += 1;
        let memo = intent.memo();
        let signature = format!("tx:{memo}");
        inner.signatures.insert(memo, signature.clone());
        inner.submitted.push(intent.clone());
        Ok(signature)
    }

    async fn find_signature(&self, memo: &str) -> Result<Option<String>, TransferError> {
        Ok(self.inner.lock().unwrap().signatures.get(memo).cloned())
    }

    async fn find_deposit(&self, signature: &str) -> Result<Option<Deposit>, TransferError> {
        Ok(self.inner.lock().unwrap().deposits.get(signature).cloned())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub cfg: Arc<Config>,
    pub ledger: Arc<MemoryLedger>,
    pub ledger_dyn: Arc<dyn Ledger>,
    pub oracle_port: Arc<MockOracle>,
    pub oracle: Arc<OracleSource>,
    pub chain: Arc<MockChain>,
    pub engine: Arc<SettlementEngine>,
    pub join: JoinHandler,
    pub metrics: Metrics,
}

pub fn harness(cfg: Config) -> Harness {
    let cfg = Arc::new(cfg);
    let ledger = Arc::new(MemoryLedger::new());
    let ledger_dyn: Arc<dyn Ledger> = ledger.clone();
    let oracle_port = Arc::new(MockOracle::new());
    let oracle = Arc::new(OracleSource::new(oracle_port.clone()));
    let chain = Arc::new(MockChain::new());
    let metrics = Metrics::new().expect("metrics");
    let audit = Arc::new(TracingAudit);

    let engine = Arc::new(SettlementEngine::new(
        ledger_dyn.clone(),
        oracle.clone(),
        chain.clone(),
        cfg.clone(),
        metrics.clone(),
        audit,
    ));
    let join = JoinHandler::new(
        ledger_dyn.clone(),
        chain.clone(),
        cfg.clone(),
        metrics.clone(),
    );

    Harness {
        cfg,
        ledger,
        ledger_dyn,
        oracle_port,
        oracle,
        chain,
        engine,
        join,
        metrics,
    }
}

impl Harness {
    pub async fn seed_round(&self, start_ts: i64) -> Round {
        let round = Round::schedule("SOL", start_ts, &self.cfg).expect("aligned start");
        self.ledger_dyn.insert_round(&round).await.expect("insert round");
        round
    }

    pub async fn seed_entry(
        &self,
        round_id: i64,
        id: &str,
        wallet: &str,
        side: Side,
        stake: u64,
        joined_at_ms: i64,
    ) -> Entry {
        let entry = Entry {
            id: id.into(),
            market: "SOL".into(),
            round_id,
            wallet: wallet.into(),
            side,
            stake_units: stake,
            joined_at_ms,
        };
        assert!(self.ledger_dyn.add_entry(&entry).await.expect("add entry"));
        entry
    }

    /// Lock a seeded round through the state machine, the way the keeper
    /// would, freezing `price` as the start price.
    pub async fn lock_round(&self, start_ts: i64, price: i64) {
        let key = RoundKey::new("SOL", start_ts);
        let mut round = self
            .ledger_dyn
            .get_round(&key)
            .await
            .expect("get round")
            .expect("round exists");
        self.oracle_port.set_price("SOL", round.lock_ts, price);
        let snapshot = self
            .oracle
            .snapshot_at(&sol_market(), round.lock_ts)
            .await
            .expect("lock snapshot");
        round
            .lock(round.lock_ts, &snapshot, &sol_market(), self.cfg.oracle_max_age_sec)
            .expect("lock round");
        self.ledger_dyn.store_round(&round).await.expect("store round");
    }
}

/// A fully consistent sim-mode join payload for the SOL round at
/// `start_sec`, matching the harness schedule.
pub fn join_request(cfg: &Config, start_sec: i64, wallet: &str, direction: &str, stake: u64) -> JoinRequest {
    JoinRequest {
        round_id: format!("SOL-{start_sec}-5m"),
        market: "SOL".into(),
        feed_id: SOL_FEED.into(),
        round_start_ms: start_sec * 1000,
        round_end_ms: (start_sec + cfg.round_duration_seconds()) * 1000,
        wallet: wallet.into(),
        direction: direction.into(),
        stake_usd: None,
        stake_lamports: stake,
        signature: None,
        joined_at_ms: None,
        start_price: None,
    }
}

pub fn is_validation(err: &EngineError) -> bool {
    matches!(err, EngineError::Validation(_))
}
