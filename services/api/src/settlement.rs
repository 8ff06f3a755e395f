//! Settlement orchestration: discover due rounds, serialize per round via
//! the durable processing lock, freeze the plan, execute transfers
//! idempotently, and finalize. Everything here is safe to re-run: the
//! unit of progress is `(round, transfer_id)` and the external signature
//! index is consulted before every submission.

use std::{collections::HashSet, sync::Arc, time::Instant};

use chrono::Utc;

use crate::{
    audit::{AuditLevel, AuditSink},
    chain::{pda, TransferFacility, TransferIntent},
    config::Config,
    errors::{EngineError, EngineResult},
    ledger::{
        canonical_order, Entry, Ledger, PlannedTransfer, RoundKey, SettlementPlan,
        SettlementState, TransferKind, TransferReceipt,
    },
    market::Side,
    metrics::Metrics,
    oracle::{OracleError, OracleSource},
    payout,
    round::{Round, RoundStatus, SettleMode},
};

pub struct SettlementEngine {
    ledger: Arc<dyn Ledger>,
    oracle: Arc<OracleSource>,
    chain: Arc<dyn TransferFacility>,
    cfg: Arc<Config>,
    metrics: Metrics,
    audit: Arc<dyn AuditSink>,
}

impl SettlementEngine {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        oracle: Arc<OracleSource>,
        chain: Arc<dyn TransferFacility>,
        cfg: Arc<Config>,
        metrics: Metrics,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self { ledger, oracle, chain, cfg, metrics, audit }
    }

    /// Settle every round whose end point has passed. Per-round failures
    /// never block the rest of the batch; transient ones retry on the
    /// next tick.
    pub async fn settle_due_rounds(&self, now: i64) -> EngineResult<Vec<String>> {
        if self.cfg.pause.settlement_paused(self.cfg.custody_mode) {
            return Err(EngineError::Paused("settlement"));
        }

        let due = self.ledger.rounds_due(now, self.cfg.ops_scan_limit).await?;
        let mut settled = Vec::new();
        for round in due {
            match self.settle_one(&round.key, now).await {
                Ok(true) => settled.push(round.key.id_string()),
                Ok(false) => {}
                Err(err) if err.is_transient() => {
                    self.audit
                        .record(
                            AuditLevel::Warn,
                            "settle_retry",
                            &format!("{}: {err}", round.key.id_string()),
                        )
                        .await;
                }
                Err(err) => {
                    self.audit
                        .record(
                            AuditLevel::Error,
                            "settle_failed",
                            &format!("{}: {err}", round.key.id_string()),
                        )
                        .await;
                }
            }
        }
        Ok(settled)
    }

    /// One settlement attempt under the round's processing lock. Returns
    /// `Ok(false)` when another worker holds the lock or the round is
    /// already fully settled.
    async fn settle_one(&self, key: &RoundKey, now: i64) -> EngineResult<bool> {
        if !self
            .ledger
            .try_acquire_round_lock(key, self.cfg.round_lock_ttl)
            .await?
        {
            return Ok(false);
        }
        let outcome = self.settle_locked(key, now).await;
        // The lock is released on every exit path; a failed release only
        // delays the next attempt by the lock TTL.
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

    async fn settle_locked(&self, key: &RoundKey, now: i64) -> EngineResult<bool> {
        let started = Instant::now();
        let mut round = self
            .ledger
            .get_round(key)
            .await?
            .ok_or_else(|| EngineError::validation(format!("no round {}", key.id_string())))?;

        let plan = match self.ledger.get_settlement(key).await? {
            Some(plan) if plan.state == SettlementState::Completed => return Ok(false),
            Some(plan) => plan,
            None => {
                if now < round.end_ts {
                    return Err(EngineError::validation(format!(
                        "round {} not yet due",
                        key.id_string()
                    )));
                }
                let fresh = self.build_plan(&round).await?;
                if self.ledger.add_settlement(&fresh).await? {
                    fresh
                } else {
                    // Lost a race before our lock was visible; execute the
                    // plan the winner persisted.
                    self.ledger
                        .get_settlement(key)
                        .await?
                        .ok_or_else(|| EngineError::fatal("settlement vanished"))?
                }
            }
        };

        if round.status != RoundStatus::Settled {
            round.settle(
                now,
                plan.end_price,
                plan.winner_side,
                plan.fee_units,
                plan.distributable_units,
            )?;
            self.ledger.store_round(&round).await?;
        }

        self.execute_plan(&plan).await?;
        self.ledger.mark_settlement_completed(key).await?;
        self.metrics
            .observe_settlement(plan.mode.as_str(), started.elapsed());
        Ok(true)
    }

    /// Freeze the settlement decision into a plan. The plan is a pure
    /// function of the round's frozen totals, the canonical entry order,
    /// and the two price samples, so rebuilding it is deterministic.
    async fn build_plan(&self, round: &Round) -> EngineResult<SettlementPlan> {
        let market = self
            .cfg
            .market(&round.market)
            .ok_or_else(|| EngineError::validation(format!("unknown market {}", round.market)))?;

        let end_price = match self.oracle.snapshot_near(market, round.end_ts).await {
            Ok(snapshot) => {
                self.metrics.observe_oracle("ok");
                if snapshot.source_owner != market.oracle_owner {
                    return Err(EngineError::OracleOwnerMismatch {
                        expected: market.oracle_owner.clone(),
                        actual: snapshot.source_owner,
                    });
                }
                Some(snapshot.price_point())
            }
            Err(OracleError::Stale { publish_time, requested }) => {
                // Out of search budget: the round refunds.
                self.metrics.observe_oracle("stale");
                self.audit
                    .record(
                        AuditLevel::Warn,
                        "oracle_stale_refund",
                        &format!(
                            "{}: publish {publish_time} vs requested {requested}",
                            round.id_string()
                        ),
                    )
                    .await;
                None
            }
            Err(err) => {
                self.metrics.observe_oracle("error");
                return Err(err.into());
            }
        };

        let (mode, winner) = round.decide(end_price);
        let mut entries = self.ledger.entries_for_round(&RoundKey::of(round)).await?;
        canonical_order(&mut entries);

        let total = round.total();
        let (fee, distributable) = match mode {
            SettleMode::Win => {
                let fee = payout::fee_units(total, self.cfg.fee_bps);
                (fee, total - fee)
            }
            SettleMode::Refund => (0, total),
        };

        let mut transfers = Vec::new();
        match mode {
            SettleMode::Win => {
                let winner = winner.ok_or_else(|| EngineError::fatal("win without winner"))?;
                let winners: Vec<&Entry> =
                    entries.iter().filter(|e| e.side == winner).collect();
                let recipients: Vec<(String, u64)> = winners
                    .iter()
                    .map(|e| (e.id.clone(), e.stake_units))
                    .collect();
                for (alloc, entry) in payout::allocate(distributable, &recipients)
                    .into_iter()
                    .zip(winners.iter())
                {
                    if alloc.units == 0 {
                        continue;
                    }
                    transfers.push(PlannedTransfer {
                        id: format!("payout:{}", entry.id),
                        recipient: entry.wallet.clone(),
                        units: alloc.units,
                        kind: TransferKind::Payout,
                    });
                }
                if fee > 0 {
                    transfers.push(PlannedTransfer {
                        id: "fee".to_string(),
                        recipient: self.cfg.treasury_wallet.clone(),
                        units: fee,
                        kind: TransferKind::Fee,
                    });
                }
            }
            SettleMode::Refund => {
                let recipients: Vec<(String, u64)> = entries
                    .iter()
                    .map(|e| (e.id.clone(), e.stake_units))
                    .collect();
                for (alloc, entry) in payout::allocate(distributable, &recipients)
                    .into_iter()
                    .zip(entries.iter())
                {
                    if alloc.units == 0 {
                        continue;
                    }
                    transfers.push(PlannedTransfer {
                        id: format!("refund:{}", entry.id),
                        recipient: entry.wallet.clone(),
                        units: alloc.units,
                        kind: TransferKind::Refund,
                    });
                }
            }
        }

        debug_assert_eq!(
            transfers.iter().map(|t| t.units).sum::<u64>(),
            if transfers.is_empty() { 0 } else { fee + distributable },
        );

        Ok(SettlementPlan {
            market: round.market.clone(),
            round_id: round.round_id,
            mode,
            winner_side: winner,
            start_price: round.start_price,
            end_price,
            fee_units: fee,
            distributable_units: distributable,
            transfers,
            state: SettlementState::Processing,
        })
    }

    /// Execute planned transfers in plan order, skipping any that already
    /// have a receipt. A transient failure leaves the plan PROCESSING and
    /// surfaces for the next tick.
    async fn execute_plan(&self, plan: &SettlementPlan) -> EngineResult<()> {
        let key = plan.key();
        let receipts = self.ledger.receipts_for_round(&key).await?;
        let done: HashSet<&str> = receipts.iter().map(|r| r.transfer_id.as_str()).collect();

        for transfer in &plan.transfers {
            if done.contains(transfer.id.as_str()) {
                continue;
            }
            let intent = self.intent_for(plan, transfer);
            let memo = intent.memo();
            let signature = match self.chain.find_signature(&memo).await? {
                Some(signature) => signature,
                None => self.chain.submit_transfer(&intent).await?,
            };
            self.ledger
                .append_transfer_receipt(&TransferReceipt {
                    market: plan.market.clone(),
                    round_id: plan.round_id,
                    transfer_id: transfer.id.clone(),
                    signature,
                    units: transfer.units,
                    executed_at_ms: Utc::now().timestamp_millis(),
                })
                .await?;
            self.metrics.observe_transfer(transfer.kind.as_str());
        }
        Ok(())
    }

    fn intent_for(&self, plan: &SettlementPlan, transfer: &PlannedTransfer) -> TransferIntent {
        TransferIntent {
            market: plan.market.clone(),
            round_id: plan.round_id,
            transfer_id: transfer.id.clone(),
            source: self.source_for(&plan.market, plan.round_id, plan.winner_side, transfer.kind),
            recipient: transfer.recipient.clone(),
            units: transfer.units,
            kind: transfer.kind,
        }
    }

    /// Payouts draw from the winning side's vault; refunds and the fee
    /// draw from the escrow pool.
    fn source_for(
        &self,
        market: &str,
        round_id: i64,
        winner: Option<Side>,
        kind: TransferKind,
    ) -> String {
        match (kind, winner) {
            (TransferKind::Payout, Some(side)) => {
                let round_key = pda::round_key(&self.cfg.program_id, market, round_id);
                pda::vault_key(&self.cfg.program_id, &round_key, side)
            }
            _ => self.cfg.escrow_wallet.clone(),
        }
    }

    /// Custody-mode pull path: pay one settled position to its wallet and
    /// flip the claimed flag exactly once.
    pub async fn claim_position(
        &self,
        key: &RoundKey,
        wallet: &str,
        side: Side,
    ) -> EngineResult<(String, u64)> {
        let round = self
            .ledger
            .get_round(key)
            .await?
            .ok_or_else(|| EngineError::validation(format!("no round {}", key.id_string())))?;
        let position = self
            .ledger
            .get_position(key, wallet, side)
            .await?
            .ok_or_else(|| EngineError::validation("no such position"))?;
        if position.claimed {
            return Err(EngineError::Replay);
        }

        let units = round.claim_amount(side, position.amount_units)?;
        if !self.ledger.mark_position_claimed(key, wallet, side).await? {
            return Err(EngineError::Replay);
        }

        let kind = if round.winner_side.is_some() {
            TransferKind::Payout
        } else {
            TransferKind::Refund
        };
        let intent = TransferIntent {
            market: key.market.clone(),
            round_id: key.round_id,
            transfer_id: format!("claim:{wallet}:{}", side.as_str()),
            source: self.source_for(&key.market, key.round_id, round.winner_side, kind),
            recipient: wallet.to_string(),
            units,
            kind,
        };
        let memo = intent.memo();
        let signature = match self.chain.find_signature(&memo).await? {
            Some(signature) => signature,
            None => self.chain.submit_transfer(&intent).await?,
        };
        self.ledger
            .append_transfer_receipt(&TransferReceipt {
                market: key.market.clone(),
                round_id: key.round_id,
                transfer_id: intent.transfer_id.clone(),
                signature: signature.clone(),
                units,
                executed_at_ms: Utc::now().timestamp_millis(),
            })
            .await?;
        self.metrics.observe_transfer(kind.as_str());
        Ok((signature, units))
    }
}
