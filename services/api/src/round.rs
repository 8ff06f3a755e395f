//! Round lifecycle: OPEN → LOCKED → SETTLED, with strict temporal gates.
//! Every mutation here happens under the round's processing lock; the
//! state machine itself is synchronous and pure so the guards are easy to
//! reason about and test.

use serde::{Deserialize, Serialize};

use crate::{
    config::Config,
    errors::EngineError,
    market::{round_id_string, MarketSpec, Side},
    oracle::{OracleSnapshot, PricePoint},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoundStatus {
    Open,
    Locked,
    Settled,
}

impl RoundStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RoundStatus::Open => "OPEN",
            RoundStatus::Locked => "LOCKED",
            RoundStatus::Settled => "SETTLED",
        }
    }

    pub fn parse(value: &str) -> Option<RoundStatus> {
        match value {
            "OPEN" => Some(RoundStatus::Open),
            "LOCKED" => Some(RoundStatus::Locked),
            "SETTLED" => Some(RoundStatus::Settled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettleMode {
    Win,
    Refund,
}

impl SettleMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SettleMode::Win => "WIN",
            SettleMode::Refund => "REFUND",
        }
    }

    pub fn parse(value: &str) -> Option<SettleMode> {
        match value {
            "WIN" => Some(SettleMode::Win),
            "REFUND" => Some(SettleMode::Refund),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Round {
    pub market: String,
    /// Unix-second alignment of the round start; doubles as the numeric
    /// half of the wire identity.
    pub round_id: i64,
    pub start_ts: i64,
    pub lock_ts: i64,
    pub end_ts: i64,
    pub status: RoundStatus,
    pub start_price: Option<PricePoint>,
    pub end_price: Option<PricePoint>,
    pub winner_side: Option<Side>,
    pub up_total: u64,
    pub down_total: u64,
    pub fee_units: u64,
    pub distributable_units: u64,
    pub locked_at: Option<i64>,
    pub settled_at: Option<i64>,
}

impl Round {
    /// Lay out a round at `start_ts`. Rejects starts that are not aligned
    /// to the entry cycle; the schedule is what makes round ids globally
    /// agreed upon.
    pub fn schedule(market: &str, start_ts: i64, cfg: &Config) -> Result<Round, EngineError> {
        let cycle = cfg.cycle_seconds();
        if start_ts < 0 || start_ts % cycle != 0 {
            return Err(EngineError::validation(format!(
                "round start {start_ts} not aligned to {cycle}s cycle"
            )));
        }
        Ok(Round {
            market: market.to_string(),
            round_id: start_ts,
            start_ts,
            lock_ts: start_ts + cfg.open_seconds,
            end_ts: start_ts + cfg.round_duration_seconds(),
            status: RoundStatus::Open,
            start_price: None,
            end_price: None,
            winner_side: None,
            up_total: 0,
            down_total: 0,
            fee_units: 0,
            distributable_units: 0,
            locked_at: None,
            settled_at: None,
        })
    }

    pub fn id_string(&self) -> String {
        round_id_string(&self.market, self.round_id)
    }

    pub fn total(&self) -> u64 {
        self.up_total + self.down_total
    }

    pub fn side_total(&self, side: Side) -> u64 {
        match side {
            Side::Up => self.up_total,
            Side::Down => self.down_total,
        }
    }

    /// Creation guard: a round may only be created while there is still
    /// slack before its lock point.
    pub fn can_create(&self, now: i64, cfg: &Config) -> bool {
        now < self.lock_ts - cfg.min_creation_slack_sec
    }

    pub fn is_open_for_entries(&self, now: i64) -> bool {
        self.status == RoundStatus::Open && now >= self.start_ts && now < self.lock_ts
    }

    /// OPEN → LOCKED. Freezes the start price from a fresh, authentic
    /// oracle snapshot.
    pub fn lock(
        &mut self,
        now: i64,
        snapshot: &OracleSnapshot,
        market: &MarketSpec,
        max_age_sec: i64,
    ) -> Result<(), EngineError> {
        match self.status {
            RoundStatus::Open => {}
            RoundStatus::Locked | RoundStatus::Settled => return Err(EngineError::Replay),
        }
        if now < self.lock_ts {
            return Err(EngineError::validation(format!(
                "round {} not yet at lock point",
                self.id_string()
            )));
        }
        if snapshot.source_owner != market.oracle_owner {
            return Err(EngineError::OracleOwnerMismatch {
                expected: market.oracle_owner.clone(),
                actual: snapshot.source_owner.clone(),
            });
        }
        if (snapshot.publish_time - self.lock_ts).abs() > max_age_sec {
            return Err(EngineError::StaleOracle {
                publish_time: snapshot.publish_time,
                requested: self.lock_ts,
            });
        }
        self.start_price = Some(snapshot.price_point());
        self.locked_at = Some(now);
        self.status = RoundStatus::Locked;
        Ok(())
    }

    /// Settlement decision. Nothing but pool shape and the two price
    /// points may influence this.
    pub fn decide(&self, end_price: Option<PricePoint>) -> (SettleMode, Option<Side>) {
        if self.up_total == 0 || self.down_total == 0 {
            return (SettleMode::Refund, None);
        }
        let (start, end) = match (self.start_price, end_price) {
            (Some(start), Some(end)) => (start, end),
            // Forced settle or missing sample: stakes go back.
            _ => return (SettleMode::Refund, None),
        };
        match end.cmp_value(&start) {
            std::cmp::Ordering::Greater => (SettleMode::Win, Some(Side::Up)),
            std::cmp::Ordering::Less => (SettleMode::Win, Some(Side::Down)),
            std::cmp::Ordering::Equal => (SettleMode::Refund, None),
        }
    }

    /// LOCKED → SETTLED (or OPEN → SETTLED as a forced refund when the
    /// lock was skipped). The caller has already built the plan numbers.
    pub fn settle(
        &mut self,
        now: i64,
        end_price: Option<PricePoint>,
        winner_side: Option<Side>,
        fee_units: u64,
        distributable_units: u64,
    ) -> Result<(), EngineError> {
        if self.status == RoundStatus::Settled {
            return Err(EngineError::Replay);
        }
        if now < self.end_ts {
            return Err(EngineError::validation(format!(
                "round {} not yet at end point",
                self.id_string()
            )));
        }
        self.end_price = end_price;
        self.winner_side = winner_side;
        self.fee_units = fee_units;
        self.distributable_units = distributable_units;
        self.settled_at = Some(now);
        self.status = RoundStatus::Settled;
        Ok(())
    }

    /// Pro-rata share a position may claim from the settled round. WIN
    /// rounds pay winners from the distributable pool; REFUND rounds give
    /// every position its stake back.
    pub fn claim_amount(&self, side: Side, amount_units: u64) -> Result<u64, EngineError> {
        if self.status != RoundStatus::Settled {
            return Err(EngineError::validation(format!(
                "round {} not settled",
                self.id_string()
            )));
        }
        match self.winner_side {
            None => Ok(amount_units),
            Some(winner) if winner == side => {
                let winner_total = self.side_total(winner);
                if winner_total == 0 {
                    return Err(EngineError::fatal("winning side has zero total"));
                }
                Ok(((self.distributable_units as u128 * amount_units as u128)
                    / winner_total as u128) as u64)
            }
            Some(_) => Err(EngineError::validation("position is not on the winning side")),
        }
    }
}
