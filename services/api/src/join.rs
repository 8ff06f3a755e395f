//! Entry submission: rate policy, payload validation against the round
//! schedule, deposit verification in server-custody mode, and replay-safe
//! insertion. Server-received time is authoritative everywhere; client
//! timestamps are never trusted.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    chain::TransferFacility,
    config::{Config, CustodyMode},
    errors::{EngineError, EngineResult},
    ledger::{Entry, Ledger, RateScope, RoundKey},
    market::{is_well_formed_wallet, parse_round_id, Side},
    metrics::Metrics,
    rate_limit,
    round::Round,
};

#[derive(Debug, Clone, Deserialize)]
pub struct JoinRequest {
    pub round_id: String,
    pub market: String,
    pub feed_id: String,
    pub round_start_ms: i64,
    pub round_end_ms: i64,
    pub wallet: String,
    pub direction: String,
    pub stake_usd: Option<f64>,
    pub stake_lamports: u64,
    pub signature: Option<String>,
    pub joined_at_ms: Option<i64>,
    pub start_price: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JoinOutcome {
    pub created: bool,
}

pub struct JoinHandler {
    ledger: Arc<dyn Ledger>,
    chain: Arc<dyn TransferFacility>,
    cfg: Arc<Config>,
    metrics: Metrics,
}

impl JoinHandler {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        chain: Arc<dyn TransferFacility>,
        cfg: Arc<Config>,
        metrics: Metrics,
    ) -> Self {
        Self { ledger, chain, cfg, metrics }
    }

    pub async fn submit(
        &self,
        req: &JoinRequest,
        ip: &str,
        now_ms: i64,
    ) -> EngineResult<JoinOutcome> {
        let outcome = self.submit_inner(req, ip, now_ms).await;
        let label = match &outcome {
            Ok(o) if o.created => "created",
            Ok(_) => "replayed",
            Err(EngineError::RateLimited { .. }) => "rate_limited",
            Err(EngineError::Paused(_)) => "paused",
            Err(_) => "rejected",
        };
        self.metrics.observe_join(label);
        outcome
    }

    async fn submit_inner(
        &self,
        req: &JoinRequest,
        ip: &str,
        now_ms: i64,
    ) -> EngineResult<JoinOutcome> {
        if self.cfg.pause.joins {
            return Err(EngineError::Paused("joins"));
        }

        rate_limit::check_bucket(
            &self.ledger,
            RateScope::Ip,
            ip,
            &self.cfg.entries_ip_bucket,
            now_ms,
        )
        .await?;
        rate_limit::check_bucket(
            &self.ledger,
            RateScope::Wallet,
            &req.wallet,
            &self.cfg.entries_wallet_bucket,
            now_ms,
        )
        .await?;
        self.ledger.record_join_attempt(&req.wallet, ip, now_ms).await?;

        let (side, start_sec) = self.validate(req)?;
        let now_sec = now_ms / 1000;
        let lock_ts = start_sec + self.cfg.open_seconds;
        if now_sec < start_sec || now_sec >= lock_ts {
            return Err(EngineError::validation("round not open"));
        }

        let id = match self.cfg.custody_mode {
            CustodyMode::Server => {
                let signature = req
                    .signature
                    .as_deref()
                    .ok_or_else(|| EngineError::validation("deposit signature required"))?;
                self.verify_deposit(req, signature, side, start_sec, lock_ts).await?;
                signature.to_string()
            }
            CustodyMode::Sim => req
                .signature
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
        };

        let key = RoundKey::new(&req.market, start_sec);
        match self.ledger.get_round(&key).await? {
            Some(round) => {
                if !round.is_open_for_entries(now_sec) {
                    return Err(EngineError::validation("round not open"));
                }
            }
            None => {
                if self.cfg.custody_mode == CustodyMode::Server {
                    return Err(EngineError::validation("round does not exist"));
                }
                // Pre-on-chain mode: the first join materializes the round,
                // under the same creation guard the keeper honors.
                let round = Round::schedule(&req.market, start_sec, &self.cfg)?;
                if !round.can_create(now_sec, &self.cfg) {
                    return Err(EngineError::validation("round not open"));
                }
                self.ledger.insert_round(&round).await?;
            }
        }

        let entry = Entry {
            id,
            market: req.market.clone(),
            round_id: start_sec,
            wallet: req.wallet.clone(),
            side,
            stake_units: req.stake_lamports,
            joined_at_ms: now_ms,
        };
        let created = self.ledger.add_entry(&entry).await?;
        Ok(JoinOutcome { created })
    }

    /// Static payload checks: market binding, tier membership, direction,
    /// and the redundant schedule fields all have to agree with the
    /// round-id identity.
    fn validate(&self, req: &JoinRequest) -> EngineResult<(Side, i64)> {
        let market = self
            .cfg
            .market(&req.market)
            .ok_or_else(|| EngineError::validation(format!("unknown market {}", req.market)))?;
        if req.feed_id != market.feed_id {
            return Err(EngineError::validation("feed does not match market"));
        }
        if !self.cfg.stake_tiers.contains(&req.stake_lamports) {
            return Err(EngineError::validation("stake not in tier set"));
        }
        let side = Side::parse(&req.direction)
            .ok_or_else(|| EngineError::validation("direction must be UP or DOWN"))?;

        let (id_market, start_sec) = parse_round_id(&req.round_id)?;
        if id_market != req.market {
            return Err(EngineError::validation("round id does not match market"));
        }
        if start_sec * 1000 != req.round_start_ms {
            return Err(EngineError::validation("round id does not match start time"));
        }
        if start_sec % self.cfg.cycle_seconds() != 0 {
            return Err(EngineError::validation("round start not cycle-aligned"));
        }
        let expected_end_ms = (start_sec + self.cfg.round_duration_seconds()) * 1000;
        if req.round_end_ms != expected_end_ms {
            return Err(EngineError::validation("round end time mismatch"));
        }
        if !is_well_formed_wallet(&req.wallet) {
            return Err(EngineError::validation("malformed wallet"));
        }
        Ok((side, start_sec))
    }

    /// Server-custody check: the claimed stake must already sit in escrow,
    /// tagged with the expected memo, transferred inside the open window
    /// by the external ledger's own clock.
    async fn verify_deposit(
        &self,
        req: &JoinRequest,
        signature: &str,
        side: Side,
        start_sec: i64,
        lock_ts: i64,
    ) -> EngineResult<()> {
        let deposit = self
            .chain
            .find_deposit(signature)
            .await
            .map_err(EngineError::from)?
            .ok_or_else(|| EngineError::validation("deposit not found"))?;

        if deposit.to != self.cfg.escrow_wallet {
            return Err(EngineError::validation("deposit not sent to escrow"));
        }
        if deposit.lamports != req.stake_lamports {
            return Err(EngineError::validation("deposit amount mismatch"));
        }
        let expected_memo = format!("{}:{}:{}", req.round_id, req.wallet, side.as_str());
        if deposit.memo.as_deref() != Some(expected_memo.as_str()) {
            return Err(EngineError::validation("deposit memo mismatch"));
        }
        if deposit.block_time < start_sec || deposit.block_time >= lock_ts {
            return Err(EngineError::validation("deposit outside open window"));
        }
        Ok(())
    }
}
