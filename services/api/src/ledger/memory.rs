//! In-memory ledger: the dev-mode backend and the test double. A single
//! async mutex gives every operation row-level atomicity; semantics match
//! the Postgres backend exactly.

use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use super::{
    canonical_order, DueRound, Entry, Ledger, Position, RateScope, RoundKey, SettlementPlan,
    SettlementState, TransferReceipt,
};
use crate::{errors::EngineError, market::Side, round::Round};

#[derive(Default)]
struct Inner {
    rounds: HashMap<RoundKey, Round>,
    entries: HashMap<String, Entry>,
    positions: HashMap<(RoundKey, String, Side), Position>,
    attempts: Vec<JoinAttempt>,
    locks: HashMap<RoundKey, i64>,
    settlements: HashMap<RoundKey, SettlementPlan>,
    receipts: HashMap<RoundKey, Vec<TransferReceipt>>,
    receipt_signatures: HashMap<String, (RoundKey, String)>,
}

struct JoinAttempt {
    wallet: String,
    ip: String,
    at_ms: i64,
}

#[derive(Default)]
pub struct MemoryLedger {
    inner: Mutex<Inner>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn insert_round(&self, round: &Round) -> Result<bool, EngineError> {
        let mut inner = self.inner.lock().await;
        let key = RoundKey::of(round);
        if inner.rounds.contains_key(&key) {
            return Ok(false);
        }
        inner.rounds.insert(key, round.clone());
        Ok(true)
    }

    async fn get_round(&self, key: &RoundKey) -> Result<Option<Round>, EngineError> {
        Ok(self.inner.lock().await.rounds.get(key).cloned())
    }

    async fn store_round(&self, round: &Round) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().await;
        inner.rounds.insert(RoundKey::of(round), round.clone());
        Ok(())
    }

    async fn rounds_due(&self, now: i64, limit: i64) -> Result<Vec<DueRound>, EngineError> {
        let inner = self.inner.lock().await;
        let mut due: Vec<DueRound> = inner
            .rounds
            .values()
            .filter(|r| r.end_ts <= now)
            .filter(|r| {
                !matches!(
                    inner.settlements.get(&RoundKey::of(r)).map(|p| p.state),
                    Some(SettlementState::Completed)
                )
            })
            .map(|r| DueRound { key: RoundKey::of(r), end_ts: r.end_ts })
            .collect();
        due.sort_by_key(|d| (d.end_ts, d.key.market.clone()));
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn add_entry(&self, entry: &Entry) -> Result<bool, EngineError> {
        let mut inner = self.inner.lock().await;
        if inner.entries.contains_key(&entry.id) {
            return Ok(false);
        }
        let key = RoundKey::new(&entry.market, entry.round_id);
        let round = inner
            .rounds
            .get_mut(&key)
            .ok_or_else(|| EngineError::validation(format!("no round {}", key.id_string())))?;
        match entry.side {
            Side::Up => round.up_total += entry.stake_units,
            Side::Down => round.down_total += entry.stake_units,
        }
        let position = inner
            .positions
            .entry((key.clone(), entry.wallet.clone(), entry.side))
            .or_insert_with(|| Position {
                market: entry.market.clone(),
                round_id: entry.round_id,
                wallet: entry.wallet.clone(),
                side: entry.side,
                amount_units: 0,
                claimed: false,
            });
        position.amount_units += entry.stake_units;
        inner.entries.insert(entry.id.clone(), entry.clone());
        Ok(true)
    }

    async fn has_entry(&self, id: &str) -> Result<bool, EngineError> {
        Ok(self.inner.lock().await.entries.contains_key(id))
    }

    async fn entries_for_round(&self, key: &RoundKey) -> Result<Vec<Entry>, EngineError> {
        let inner = self.inner.lock().await;
        let mut entries: Vec<Entry> = inner
            .entries
            .values()
            .filter(|e| e.market == key.market && e.round_id == key.round_id)
            .cloned()
            .collect();
        canonical_order(&mut entries);
        Ok(entries)
    }

    async fn record_join_attempt(
        &self,
        wallet: &str,
        ip: &str,
        at_ms: i64,
    ) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().await;
        // Opportunistic prune: anything older than an hour is outside
        // every configurable window.
        inner.attempts.retain(|a| at_ms - a.at_ms < 3_600_000);
        inner.attempts.push(JoinAttempt {
            wallet: wallet.to_string(),
            ip: ip.to_string(),
            at_ms,
        });
        Ok(())
    }

    async fn count_recent_attempts(
        &self,
        scope: RateScope,
        key: &str,
        window: Duration,
        now_ms: i64,
    ) -> Result<u64, EngineError> {
        let inner = self.inner.lock().await;
        let cutoff = now_ms - window.as_millis() as i64;
        let count = inner
            .attempts
            .iter()
            .filter(|a| a.at_ms >= cutoff)
            .filter(|a| match scope {
                RateScope::Ip => a.ip == key,
                RateScope::Wallet => a.wallet == key,
            })
            .count();
        Ok(count as u64)
    }

    async fn try_acquire_round_lock(
        &self,
        key: &RoundKey,
        stale_after: Duration,
    ) -> Result<bool, EngineError> {
        let mut inner = self.inner.lock().await;
        let now = now_ms();
        match inner.locks.get(key) {
            Some(acquired_at) if now - acquired_at < stale_after.as_millis() as i64 => Ok(false),
            _ => {
                inner.locks.insert(key.clone(), now);
                Ok(true)
            }
        }
    }

    async fn release_round_lock(&self, key: &RoundKey) -> Result<(), EngineError> {
        self.inner.lock().await.locks.remove(key);
        Ok(())
    }

    async fn add_settlement(&self, plan: &SettlementPlan) -> Result<bool, EngineError> {
        let mut inner = self.inner.lock().await;
        let key = plan.key();
        if inner.settlements.contains_key(&key) {
            return Ok(false);
        }
        check_unique_transfer_ids(plan)?;
        inner.settlements.insert(key, plan.clone());
        Ok(true)
    }

    async fn upsert_settlement(&self, plan: &SettlementPlan) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().await;
        let key = plan.key();
        if inner.receipts.get(&key).map(|r| !r.is_empty()).unwrap_or(false) {
            return Err(EngineError::fatal(format!(
                "refusing to replace plan for {} after execution started",
                key.id_string()
            )));
        }
        check_unique_transfer_ids(plan)?;
        inner.settlements.insert(key, plan.clone());
        Ok(())
    }

    async fn get_settlement(
        &self,
        key: &RoundKey,
    ) -> Result<Option<SettlementPlan>, EngineError> {
        Ok(self.inner.lock().await.settlements.get(key).cloned())
    }

    async fn append_transfer_receipt(
        &self,
        receipt: &TransferReceipt,
    ) -> Result<bool, EngineError> {
        let mut inner = self.inner.lock().await;
        let key = RoundKey::new(&receipt.market, receipt.round_id);
        let existing = inner.receipts.entry(key.clone()).or_default();
        if existing.iter().any(|r| r.transfer_id == receipt.transfer_id) {
            return Ok(false);
        }
        if let Some((other_key, other_id)) = inner.receipt_signatures.get(&receipt.signature) {
            if other_key != &key || other_id != &receipt.transfer_id {
                return Err(EngineError::fatal(format!(
                    "receipt signature {} reused across transfers",
                    receipt.signature
                )));
            }
        }
        inner
            .receipt_signatures
            .insert(receipt.signature.clone(), (key.clone(), receipt.transfer_id.clone()));
        if let Some(receipts) = inner.receipts.get_mut(&key) {
            receipts.push(receipt.clone());
        }
        Ok(true)
    }

    async fn receipts_for_round(
        &self,
        key: &RoundKey,
    ) -> Result<Vec<TransferReceipt>, EngineError> {
        Ok(self
            .inner
            .lock()
            .await
            .receipts
            .get(key)
            .cloned()
            .unwrap_or_default())
    }

    async fn mark_settlement_completed(&self, key: &RoundKey) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().await;
        match inner.settlements.get_mut(key) {
            Some(plan) => {
                plan.state = SettlementState::Completed;
                Ok(())
            }
            None => Err(EngineError::validation(format!(
                "no settlement for {}",
                key.id_string()
            ))),
        }
    }

    async fn get_position(
        &self,
        key: &RoundKey,
        wallet: &str,
        side: Side,
    ) -> Result<Option<Position>, EngineError> {
        Ok(self
            .inner
            .lock()
            .await
            .positions
            .get(&(key.clone(), wallet.to_string(), side))
            .cloned())
    }

    async fn mark_position_claimed(
        &self,
        key: &RoundKey,
        wallet: &str,
        side: Side,
    ) -> Result<bool, EngineError> {
        let mut inner = self.inner.lock().await;
        let position = inner
            .positions
            .get_mut(&(key.clone(), wallet.to_string(), side))
            .ok_or_else(|| EngineError::validation("no such position"))?;
        if position.claimed {
            return Ok(false);
        }
        position.claimed = true;
        Ok(true)
    }
}

fn check_unique_transfer_ids(plan: &SettlementPlan) -> Result<(), EngineError> {
    let mut seen = HashSet::new();
    for transfer in &plan.transfers {
        if !seen.insert(transfer.id.as_str()) {
            return Err(EngineError::fatal(format!(
                "duplicate transfer id {} in plan",
                transfer.id
            )));
        }
    }
    Ok(())
}
