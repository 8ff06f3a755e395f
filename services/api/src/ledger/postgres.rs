//! Postgres-backed ledger. Row-granular atomicity comes from single
//! statements with `ON CONFLICT` arms; the multi-row entry insert runs in
//! a transaction. Concurrent settlement serializes on the `round_locks`
//! row, never on table locks.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};

use super::{
    DueRound, Entry, Ledger, PlannedTransfer, Position, RateScope, RoundKey, SettlementPlan,
    SettlementState, TransferReceipt,
};
use crate::{
    errors::EngineError,
    market::Side,
    oracle::PricePoint,
    round::{Round, RoundStatus, SettleMode},
};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS rounds (
        market TEXT NOT NULL,
        round_id BIGINT NOT NULL,
        start_ts BIGINT NOT NULL,
        lock_ts BIGINT NOT NULL,
        end_ts BIGINT NOT NULL,
        status TEXT NOT NULL,
        start_price BIGINT,
        start_expo INT,
        end_price BIGINT,
        end_expo INT,
        winner_side TEXT NOT NULL DEFAULT 'NONE',
        up_total BIGINT NOT NULL DEFAULT 0,
        down_total BIGINT NOT NULL DEFAULT 0,
        fee_units BIGINT NOT NULL DEFAULT 0,
        distributable_units BIGINT NOT NULL DEFAULT 0,
        locked_at BIGINT,
        settled_at BIGINT,
        PRIMARY KEY (market, round_id))",
    "CREATE TABLE IF NOT EXISTS entries (
        id TEXT PRIMARY KEY,
        market TEXT NOT NULL,
        round_id BIGINT NOT NULL,
        wallet TEXT NOT NULL,
        side TEXT NOT NULL,
        stake_units BIGINT NOT NULL,
        joined_at_ms BIGINT NOT NULL)",
    "CREATE INDEX IF NOT EXISTS entries_round_idx
        ON entries (market, round_id, joined_at_ms, id)",
    "CREATE TABLE IF NOT EXISTS positions (
        market TEXT NOT NULL,
        round_id BIGINT NOT NULL,
        wallet TEXT NOT NULL,
        side TEXT NOT NULL,
        amount_units BIGINT NOT NULL DEFAULT 0,
        claimed BOOLEAN NOT NULL DEFAULT FALSE,
        PRIMARY KEY (market, round_id, wallet, side))",
    "CREATE TABLE IF NOT EXISTS join_attempts (
        id BIGSERIAL PRIMARY KEY,
        wallet TEXT NOT NULL,
        ip TEXT NOT NULL,
        at_ms BIGINT NOT NULL)",
    "CREATE INDEX IF NOT EXISTS join_attempts_wallet_idx ON join_attempts (wallet, at_ms)",
    "CREATE INDEX IF NOT EXISTS join_attempts_ip_idx ON join_attempts (ip, at_ms)",
    "CREATE TABLE IF NOT EXISTS round_locks (
        market TEXT NOT NULL,
        round_id BIGINT NOT NULL,
        acquired_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (market, round_id))",
    "CREATE TABLE IF NOT EXISTS settlements (
        market TEXT NOT NULL,
        round_id BIGINT NOT NULL,
        mode TEXT NOT NULL,
        winner_side TEXT NOT NULL DEFAULT 'NONE',
        start_price BIGINT,
        start_expo INT,
        end_price BIGINT,
        end_expo INT,
        fee_units BIGINT NOT NULL,
        distributable_units BIGINT NOT NULL,
        transfers JSONB NOT NULL,
        state TEXT NOT NULL,
        PRIMARY KEY (market, round_id))",
    "CREATE TABLE IF NOT EXISTS transfer_receipts (
        market TEXT NOT NULL,
        round_id BIGINT NOT NULL,
        transfer_id TEXT NOT NULL,
        signature TEXT NOT NULL UNIQUE,
        units BIGINT NOT NULL,
        executed_at_ms BIGINT NOT NULL,
        PRIMARY KEY (market, round_id, transfer_id))",
];

#[derive(Clone)]
pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(25)
            .min_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .context("failed to connect to postgres")?;
        let ledger = Self { pool };
        ledger.ensure_schema().await?;
        Ok(ledger)
    }

    async fn ensure_schema(&self) -> anyhow::Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("failed to apply ledger schema")?;
        }
        Ok(())
    }
}

fn db_err(err: sqlx::Error) -> EngineError {
    EngineError::transient(format!("ledger: {err}"))
}

fn corrupt(what: &str) -> EngineError {
    EngineError::fatal(format!("ledger corruption: {what}"))
}

fn price_point(price: Option<i64>, expo: Option<i32>) -> Option<PricePoint> {
    match (price, expo) {
        (Some(price), Some(expo)) => Some(PricePoint { price, expo }),
        _ => None,
    }
}

fn winner_from_str(value: &str) -> Result<Option<Side>, EngineError> {
    match value {
        "NONE" => Ok(None),
        other => Side::parse(other)
            .map(Some)
            .ok_or_else(|| corrupt("unknown winner side")),
    }
}

fn winner_to_str(winner: Option<Side>) -> &'static str {
    winner.map(|s| s.as_str()).unwrap_or("NONE")
}

fn round_from_row(row: &sqlx::postgres::PgRow) -> Result<Round, EngineError> {
    let status: String = row.try_get("status").map_err(db_err)?;
    let winner: String = row.try_get("winner_side").map_err(db_err)?;
    let side_totals = |name: &str| -> Result<u64, EngineError> {
        Ok(row.try_get::<i64, _>(name).map_err(db_err)?.max(0) as u64)
    };
    Ok(Round {
        market: row.try_get("market").map_err(db_err)?,
        round_id: row.try_get("round_id").map_err(db_err)?,
        start_ts: row.try_get("start_ts").map_err(db_err)?,
        lock_ts: row.try_get("lock_ts").map_err(db_err)?,
        end_ts: row.try_get("end_ts").map_err(db_err)?,
        status: RoundStatus::parse(&status).ok_or_else(|| corrupt("unknown round status"))?,
        start_price: price_point(
            row.try_get("start_price").map_err(db_err)?,
            row.try_get("start_expo").map_err(db_err)?,
        ),
        end_price: price_point(
            row.try_get("end_price").map_err(db_err)?,
            row.try_get("end_expo").map_err(db_err)?,
        ),
        winner_side: winner_from_str(&winner)?,
        up_total: side_totals("up_total")?,
        down_total: side_totals("down_total")?,
        fee_units: side_totals("fee_units")?,
        distributable_units: side_totals("distributable_units")?,
        locked_at: row.try_get("locked_at").map_err(db_err)?,
        settled_at: row.try_get("settled_at").map_err(db_err)?,
    })
}

fn entry_from_row(row: &sqlx::postgres::PgRow) -> Result<Entry, EngineError> {
    let side: String = row.try_get("side").map_err(db_err)?;
    Ok(Entry {
        id: row.try_get("id").map_err(db_err)?,
        market: row.try_get("market").map_err(db_err)?,
        round_id: row.try_get("round_id").map_err(db_err)?,
        wallet: row.try_get("wallet").map_err(db_err)?,
        side: Side::parse(&side).ok_or_else(|| corrupt("unknown entry side"))?,
        stake_units: row.try_get::<i64, _>("stake_units").map_err(db_err)?.max(0) as u64,
        joined_at_ms: row.try_get("joined_at_ms").map_err(db_err)?,
    })
}

#[async_trait]
impl Ledger for PostgresLedger {
    async fn insert_round(&self, round: &Round) -> Result<bool, EngineError> {
        let result = sqlx::query(
            "INSERT INTO rounds (market, round_id, start_ts, lock_ts, end_ts, status)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (market, round_id) DO NOTHING",
        )
        .bind(&round.market)
        .bind(round.round_id)
        .bind(round.start_ts)
        .bind(round.lock_ts)
        .bind(round.end_ts)
        .bind(round.status.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_round(&self, key: &RoundKey) -> Result<Option<Round>, EngineError> {
        let row = sqlx::query("SELECT * FROM rounds WHERE market = $1 AND round_id = $2")
            .bind(&key.market)
            .bind(key.round_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(round_from_row).transpose()
    }

    async fn store_round(&self, round: &Round) -> Result<(), EngineError> {
        sqlx::query(
            "UPDATE rounds SET
                status = $3,
                start_price = $4, start_expo = $5,
                end_price = $6, end_expo = $7,
                winner_side = $8,
                up_total = $9, down_total = $10,
                fee_units = $11, distributable_units = $12,
                locked_at = $13, settled_at = $14
             WHERE market = $1 AND round_id = $2",
        )
        .bind(&round.market)
        .bind(round.round_id)
        .bind(round.status.as_str())
        .bind(round.start_price.map(|p| p.price))
        .bind(round.start_price.map(|p| p.expo))
        .bind(round.end_price.map(|p| p.price))
        .bind(round.end_price.map(|p| p.expo))
        .bind(winner_to_str(round.winner_side))
        .bind(round.up_total as i64)
        .bind(round.down_total as i64)
        .bind(round.fee_units as i64)
        .bind(round.distributable_units as i64)
        .bind(round.locked_at)
        .bind(round.settled_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn rounds_due(&self, now: i64, limit: i64) -> Result<Vec<DueRound>, EngineError> {
        let rows = sqlx::query(
            "SELECT r.market, r.round_id, r.end_ts
             FROM rounds r
             LEFT JOIN settlements s
               ON s.market = r.market AND s.round_id = r.round_id
             WHERE r.end_ts <= $1 AND (s.state IS NULL OR s.state <> 'COMPLETED')
             ORDER BY r.end_ts ASC, r.market ASC
             LIMIT $2",
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut due = Vec::with_capacity(rows.len());
        for row in rows {
            due.push(DueRound {
                key: RoundKey::new(
                    &row.try_get::<String, _>("market").map_err(db_err)?,
                    row.try_get("round_id").map_err(db_err)?,
                ),
                end_ts: row.try_get("end_ts").map_err(db_err)?,
            });
        }
        Ok(due)
    }

    async fn add_entry(&self, entry: &Entry) -> Result<bool, EngineError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let inserted = sqlx::query(
            "INSERT INTO entries (id, market, round_id, wallet, side, stake_units, joined_at_ms)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(&entry.id)
        .bind(&entry.market)
        .bind(entry.round_id)
        .bind(&entry.wallet)
        .bind(entry.side.as_str())
        .bind(entry.stake_units as i64)
        .bind(entry.joined_at_ms)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await.map_err(db_err)?;
            return Ok(false);
        }

        let column = match entry.side {
            Side::Up => "up_total",
            Side::Down => "down_total",
        };
        let updated = sqlx::query(&format!(
            "UPDATE rounds SET {column} = {column} + $3
             WHERE market = $1 AND round_id = $2"
        ))
        .bind(&entry.market)
        .bind(entry.round_id)
        .bind(entry.stake_units as i64)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        if updated.rows_affected() == 0 {
            tx.rollback().await.map_err(db_err)?;
            return Err(EngineError::validation(format!(
                "no round {}-{}",
                entry.market, entry.round_id
            )));
        }

        sqlx::query(
            "INSERT INTO positions (market, round_id, wallet, side, amount_units)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (market, round_id, wallet, side)
             DO UPDATE SET amount_units = positions.amount_units + EXCLUDED.amount_units",
        )
        .bind(&entry.market)
        .bind(entry.round_id)
        .bind(&entry.wallet)
        .bind(entry.side.as_str())
        .bind(entry.stake_units as i64)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(true)
    }

    async fn has_entry(&self, id: &str) -> Result<bool, EngineError> {
        let row = sqlx::query("SELECT 1 AS one FROM entries WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.is_some())
    }

    async fn entries_for_round(&self, key: &RoundKey) -> Result<Vec<Entry>, EngineError> {
        let rows = sqlx::query(
            "SELECT id, market, round_id, wallet, side, stake_units, joined_at_ms
             FROM entries
             WHERE market = $1 AND round_id = $2
             ORDER BY joined_at_ms ASC, id ASC",
        )
        .bind(&key.market)
        .bind(key.round_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn record_join_attempt(
        &self,
        wallet: &str,
        ip: &str,
        at_ms: i64,
    ) -> Result<(), EngineError> {
        sqlx::query("INSERT INTO join_attempts (wallet, ip, at_ms) VALUES ($1, $2, $3)")
            .bind(wallet)
            .bind(ip)
            .bind(at_ms)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        // Prune anything outside the largest window anyone can configure.
        sqlx::query("DELETE FROM join_attempts WHERE at_ms < $1")
            .bind(at_ms - 3_600_000)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn count_recent_attempts(
        &self,
        scope: RateScope,
        key: &str,
        window: Duration,
        now_ms: i64,
    ) -> Result<u64, EngineError> {
        let column = match scope {
            RateScope::Ip => "ip",
            RateScope::Wallet => "wallet",
        };
        let row = sqlx::query(&format!(
            "SELECT COUNT(*)::BIGINT AS n FROM join_attempts
             WHERE {column} = $1 AND at_ms >= $2"
        ))
        .bind(key)
        .bind(now_ms - window.as_millis() as i64)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.try_get::<i64, _>("n").map_err(db_err)?.max(0) as u64)
    }

    async fn try_acquire_round_lock(
        &self,
        key: &RoundKey,
        stale_after: Duration,
    ) -> Result<bool, EngineError> {
        let result = sqlx::query(
            "INSERT INTO round_locks (market, round_id, acquired_at)
             VALUES ($1, $2, NOW())
             ON CONFLICT (market, round_id)
             DO UPDATE SET acquired_at = NOW()
             WHERE round_locks.acquired_at <= NOW() - make_interval(secs => $3)",
        )
        .bind(&key.market)
        .bind(key.round_id)
        .bind(stale_after.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn release_round_lock(&self, key: &RoundKey) -> Result<(), EngineError> {
        sqlx::query("DELETE FROM round_locks WHERE market = $1 AND round_id = $2")
            .bind(&key.market)
            .bind(key.round_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn add_settlement(&self, plan: &SettlementPlan) -> Result<bool, EngineError> {
        let transfers =
            serde_json::to_value(&plan.transfers).map_err(|_| corrupt("unencodable plan"))?;
        let result = sqlx::query(
            "INSERT INTO settlements (market, round_id, mode, winner_side,
                start_price, start_expo, end_price, end_expo,
                fee_units, distributable_units, transfers, state)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
             ON CONFLICT (market, round_id) DO NOTHING",
        )
        .bind(&plan.market)
        .bind(plan.round_id)
        .bind(plan.mode.as_str())
        .bind(winner_to_str(plan.winner_side))
        .bind(plan.start_price.map(|p| p.price))
        .bind(plan.start_price.map(|p| p.expo))
        .bind(plan.end_price.map(|p| p.price))
        .bind(plan.end_price.map(|p| p.expo))
        .bind(plan.fee_units as i64)
        .bind(plan.distributable_units as i64)
        .bind(transfers)
        .bind(plan.state.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert_settlement(&self, plan: &SettlementPlan) -> Result<(), EngineError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let row = sqlx::query(
            "SELECT COUNT(*)::BIGINT AS n FROM transfer_receipts
             WHERE market = $1 AND round_id = $2",
        )
        .bind(&plan.market)
        .bind(plan.round_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        if row.try_get::<i64, _>("n").map_err(db_err)? > 0 {
            return Err(EngineError::fatal(format!(
                "refusing to replace plan for {}-{} after execution started",
                plan.market, plan.round_id
            )));
        }

        let transfers =
            serde_json::to_value(&plan.transfers).map_err(|_| corrupt("unencodable plan"))?;
        sqlx::query(
            "INSERT INTO settlements (market, round_id, mode, winner_side,
                start_price, start_expo, end_price, end_expo,
                fee_units, distributable_units, transfers, state)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
             ON CONFLICT (market, round_id) DO UPDATE SET
                mode = EXCLUDED.mode,
                winner_side = EXCLUDED.winner_side,
                start_price = EXCLUDED.start_price,
                start_expo = EXCLUDED.start_expo,
                end_price = EXCLUDED.end_price,
                end_expo = EXCLUDED.end_expo,
                fee_units = EXCLUDED.fee_units,
                distributable_units = EXCLUDED.distributable_units,
                transfers = EXCLUDED.transfers,
                state = EXCLUDED.state",
        )
        .bind(&plan.market)
        .bind(plan.round_id)
        .bind(plan.mode.as_str())
        .bind(winner_to_str(plan.winner_side))
        .bind(plan.start_price.map(|p| p.price))
        .bind(plan.start_price.map(|p| p.expo))
        .bind(plan.end_price.map(|p| p.price))
        .bind(plan.end_price.map(|p| p.expo))
        .bind(plan.fee_units as i64)
        .bind(plan.distributable_units as i64)
        .bind(transfers)
        .bind(plan.state.as_str())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn get_settlement(
        &self,
        key: &RoundKey,
    ) -> Result<Option<SettlementPlan>, EngineError> {
        let row = sqlx::query("SELECT * FROM settlements WHERE market = $1 AND round_id = $2")
            .bind(&key.market)
            .bind(key.round_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        let Some(row) = row else { return Ok(None) };

        let mode: String = row.try_get("mode").map_err(db_err)?;
        let winner: String = row.try_get("winner_side").map_err(db_err)?;
        let state: String = row.try_get("state").map_err(db_err)?;
        let transfers: serde_json::Value = row.try_get("transfers").map_err(db_err)?;
        let transfers: Vec<PlannedTransfer> =
            serde_json::from_value(transfers).map_err(|_| corrupt("undecodable plan"))?;

        Ok(Some(SettlementPlan {
            market: row.try_get("market").map_err(db_err)?,
            round_id: row.try_get("round_id").map_err(db_err)?,
            mode: SettleMode::parse(&mode).ok_or_else(|| corrupt("unknown settle mode"))?,
            winner_side: winner_from_str(&winner)?,
            start_price: price_point(
                row.try_get("start_price").map_err(db_err)?,
                row.try_get("start_expo").map_err(db_err)?,
            ),
            end_price: price_point(
                row.try_get("end_price").map_err(db_err)?,
                row.try_get("end_expo").map_err(db_err)?,
            ),
            fee_units: row.try_get::<i64, _>("fee_units").map_err(db_err)?.max(0) as u64,
            distributable_units: row
                .try_get::<i64, _>("distributable_units")
                .map_err(db_err)?
                .max(0) as u64,
            transfers,
            state: SettlementState::parse(&state)
                .ok_or_else(|| corrupt("unknown settlement state"))?,
        }))
    }

    async fn append_transfer_receipt(
        &self,
        receipt: &TransferReceipt,
    ) -> Result<bool, EngineError> {
        let result = sqlx::query(
            "INSERT INTO transfer_receipts
                (market, round_id, transfer_id, signature, units, executed_at_ms)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (market, round_id, transfer_id) DO NOTHING",
        )
        .bind(&receipt.market)
        .bind(receipt.round_id)
        .bind(&receipt.transfer_id)
        .bind(&receipt.signature)
        .bind(receipt.units as i64)
        .bind(receipt.executed_at_ms)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => Ok(done.rows_affected() > 0),
            Err(err) => {
                let reused_signature = err
                    .as_database_error()
                    .and_then(|db| db.constraint())
                    .map(|c| c.contains("signature"))
                    .unwrap_or(false);
                if reused_signature {
                    Err(EngineError::fatal(format!(
                        "receipt signature {} reused across transfers",
                        receipt.signature
                    )))
                } else {
                    Err(db_err(err))
                }
            }
        }
    }

    async fn receipts_for_round(
        &self,
        key: &RoundKey,
    ) -> Result<Vec<TransferReceipt>, EngineError> {
        let rows = sqlx::query(
            "SELECT market, round_id, transfer_id, signature, units, executed_at_ms
             FROM transfer_receipts
             WHERE market = $1 AND round_id = $2
             ORDER BY executed_at_ms ASC, transfer_id ASC",
        )
        .bind(&key.market)
        .bind(key.round_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut receipts = Vec::with_capacity(rows.len());
        for row in rows {
            receipts.push(TransferReceipt {
                market: row.try_get("market").map_err(db_err)?,
                round_id: row.try_get("round_id").map_err(db_err)?,
                transfer_id: row.try_get("transfer_id").map_err(db_err)?,
                signature: row.try_get("signature").map_err(db_err)?,
                units: row.try_get::<i64, _>("units").map_err(db_err)?.max(0) as u64,
                executed_at_ms: row.try_get("executed_at_ms").map_err(db_err)?,
            });
        }
        Ok(receipts)
    }

    async fn mark_settlement_completed(&self, key: &RoundKey) -> Result<(), EngineError> {
        let result = sqlx::query(
            "UPDATE settlements SET state = 'COMPLETED'
             WHERE market = $1 AND round_id = $2",
        )
        .bind(&key.market)
        .bind(key.round_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(EngineError::validation(format!(
                "no settlement for {}",
                key.id_string()
            )));
        }
        Ok(())
    }

    async fn get_position(
        &self,
        key: &RoundKey,
        wallet: &str,
        side: Side,
    ) -> Result<Option<Position>, EngineError> {
        let row = sqlx::query(
            "SELECT market, round_id, wallet, side, amount_units, claimed
             FROM positions
             WHERE market = $1 AND round_id = $2 AND wallet = $3 AND side = $4",
        )
        .bind(&key.market)
        .bind(key.round_id)
        .bind(wallet)
        .bind(side.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        let Some(row) = row else { return Ok(None) };
        Ok(Some(Position {
            market: row.try_get("market").map_err(db_err)?,
            round_id: row.try_get("round_id").map_err(db_err)?,
            wallet: row.try_get("wallet").map_err(db_err)?,
            side,
            amount_units: row.try_get::<i64, _>("amount_units").map_err(db_err)?.max(0) as u64,
            claimed: row.try_get("claimed").map_err(db_err)?,
        }))
    }

    async fn mark_position_claimed(
        &self,
        key: &RoundKey,
        wallet: &str,
        side: Side,
    ) -> Result<bool, EngineError> {
        let result = sqlx::query(
            "UPDATE positions SET claimed = TRUE
             WHERE market = $1 AND round_id = $2 AND wallet = $3 AND side = $4
               AND claimed = FALSE",
        )
        .bind(&key.market)
        .bind(key.round_id)
        .bind(wallet)
        .bind(side.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() > 0 {
            return Ok(true);
        }
        match self.get_position(key, wallet, side).await? {
            Some(_) => Ok(false),
            None => Err(EngineError::validation("no such position")),
        }
    }
}
