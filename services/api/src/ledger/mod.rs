//! Durable store of rounds, entries, positions, settlement plans,
//! receipts, processing locks, and join-attempt counters. The trait
//! prescribes atomicity and uniqueness, not storage shape: the Postgres
//! backend is the durable deployment, the memory backend is the
//! non-durable dev mode and the test double.

pub mod memory;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    errors::EngineError,
    market::{round_id_string, Side},
    oracle::PricePoint,
    round::{Round, SettleMode},
};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoundKey {
    pub market: String,
    pub round_id: i64,
}

impl RoundKey {
    pub fn new(market: &str, round_id: i64) -> Self {
        Self { market: market.to_string(), round_id }
    }

    pub fn of(round: &Round) -> Self {
        Self::new(&round.market, round.round_id)
    }

    pub fn id_string(&self) -> String {
        round_id_string(&self.market, self.round_id)
    }
}

/// One join by one wallet on one side of one round. Append-only; the
/// identity is the client transfer signature in server-custody mode or a
/// server-assigned id otherwise, and is unique across the whole ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub id: String,
    pub market: String,
    pub round_id: i64,
    pub wallet: String,
    pub side: Side,
    pub stake_units: u64,
    pub joined_at_ms: i64,
}

/// Canonical entry order: ascending `joined_at`, ties broken by entry
/// identity. This is the order the payout allocator sees, so the rounding
/// remainder is assigned identically across replays.
pub fn canonical_order(entries: &mut [Entry]) {
    entries.sort_by(|a, b| {
        a.joined_at_ms
            .cmp(&b.joined_at_ms)
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Aggregated stake per `(round, wallet, side)`; custody-mode claims flip
/// `claimed` exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub market: String,
    pub round_id: i64,
    pub wallet: String,
    pub side: Side,
    pub amount_units: u64,
    pub claimed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferKind {
    Payout,
    Refund,
    Fee,
}

impl TransferKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransferKind::Payout => "PAYOUT",
            TransferKind::Refund => "REFUND",
            TransferKind::Fee => "FEE",
        }
    }

    pub fn parse(value: &str) -> Option<TransferKind> {
        match value {
            "PAYOUT" => Some(TransferKind::Payout),
            "REFUND" => Some(TransferKind::Refund),
            "FEE" => Some(TransferKind::Fee),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedTransfer {
    pub id: String,
    pub recipient: String,
    pub units: u64,
    pub kind: TransferKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettlementState {
    Processing,
    Completed,
}

impl SettlementState {
    pub fn as_str(self) -> &'static str {
        match self {
            SettlementState::Processing => "PROCESSING",
            SettlementState::Completed => "COMPLETED",
        }
    }

    pub fn parse(value: &str) -> Option<SettlementState> {
        match value {
            "PROCESSING" => Some(SettlementState::Processing),
            "COMPLETED" => Some(SettlementState::Completed),
            _ => None,
        }
    }
}

/// Immutable description of what a settled round owes, produced exactly
/// once per round and then executed transfer by transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementPlan {
    pub market: String,
    pub round_id: i64,
    pub mode: SettleMode,
    pub winner_side: Option<Side>,
    pub start_price: Option<PricePoint>,
    pub end_price: Option<PricePoint>,
    pub fee_units: u64,
    pub distributable_units: u64,
    pub transfers: Vec<PlannedTransfer>,
    pub state: SettlementState,
}

impl SettlementPlan {
    pub fn key(&self) -> RoundKey {
        RoundKey::new(&self.market, self.round_id)
    }

    pub fn planned_total(&self) -> u64 {
        self.transfers.iter().map(|t| t.units).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub market: String,
    pub round_id: i64,
    pub transfer_id: String,
    pub signature: String,
    pub units: u64,
    pub executed_at_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateScope {
    Ip,
    Wallet,
}

/// A round past its end point that has not finished settlement, with its
/// end timestamp for lag accounting.
#[derive(Debug, Clone, PartialEq)]
pub struct DueRound {
    pub key: RoundKey,
    pub end_ts: i64,
}

#[async_trait]
pub trait Ledger: Send + Sync {
    // -- rounds ----------------------------------------------------------

    /// Insert-if-absent; `Ok(false)` when the round already exists.
    async fn insert_round(&self, round: &Round) -> Result<bool, EngineError>;

    async fn get_round(&self, key: &RoundKey) -> Result<Option<Round>, EngineError>;

    /// Persist a mutated round. Callers hold the round's processing lock.
    async fn store_round(&self, round: &Round) -> Result<(), EngineError>;

    /// Rounds with `end_ts <= now` whose settlement has not completed,
    /// oldest first. Includes rounds already marked SETTLED whose plan is
    /// still PROCESSING so a crashed execution is resumed.
    async fn rounds_due(&self, now: i64, limit: i64) -> Result<Vec<DueRound>, EngineError>;

    // -- entries ---------------------------------------------------------

    /// Insert-if-absent by entry identity. On a fresh insert the round's
    /// side total and the wallet's position aggregate move atomically with
    /// the entry row. `Ok(false)` is the replay no-op.
    async fn add_entry(&self, entry: &Entry) -> Result<bool, EngineError>;

    async fn has_entry(&self, id: &str) -> Result<bool, EngineError>;

    /// All entries of a round in canonical order.
    async fn entries_for_round(&self, key: &RoundKey) -> Result<Vec<Entry>, EngineError>;

    // -- rate policy -----------------------------------------------------

    async fn record_join_attempt(
        &self,
        wallet: &str,
        ip: &str,
        at_ms: i64,
    ) -> Result<(), EngineError>;

    async fn count_recent_attempts(
        &self,
        scope: RateScope,
        key: &str,
        window: Duration,
        now_ms: i64,
    ) -> Result<u64, EngineError>;

    // -- processing locks ------------------------------------------------

    /// Exclusive per-round lock. Succeeds when no holder exists or the
    /// current holder is older than `stale_after`.
    async fn try_acquire_round_lock(
        &self,
        key: &RoundKey,
        stale_after: Duration,
    ) -> Result<bool, EngineError>;

    async fn release_round_lock(&self, key: &RoundKey) -> Result<(), EngineError>;

    // -- settlements -----------------------------------------------------

    /// First writer wins; `Ok(false)` when a plan already exists.
    async fn add_settlement(&self, plan: &SettlementPlan) -> Result<bool, EngineError>;

    /// Replace a persisted plan. Only legal before any transfer has been
    /// executed; a refinement attempt after receipts exist is corruption.
    async fn upsert_settlement(&self, plan: &SettlementPlan) -> Result<(), EngineError>;

    async fn get_settlement(&self, key: &RoundKey)
        -> Result<Option<SettlementPlan>, EngineError>;

    /// Unique on `(round, transfer_id)` and globally unique on signature.
    /// Re-appending the same transfer returns `Ok(false)` silently; a
    /// signature reused for a different transfer is fatal.
    async fn append_transfer_receipt(
        &self,
        receipt: &TransferReceipt,
    ) -> Result<bool, EngineError>;

    async fn receipts_for_round(
        &self,
        key: &RoundKey,
    ) -> Result<Vec<TransferReceipt>, EngineError>;

    async fn mark_settlement_completed(&self, key: &RoundKey) -> Result<(), EngineError>;

    // -- positions -------------------------------------------------------

    async fn get_position(
        &self,
        key: &RoundKey,
        wallet: &str,
        side: Side,
    ) -> Result<Option<Position>, EngineError>;

    /// Monotone false→true; `Ok(false)` when already claimed.
    async fn mark_position_claimed(
        &self,
        key: &RoundKey,
        wallet: &str,
        side: Side,
    ) -> Result<bool, EngineError>;
}
