//! External settlement-chain surface: the transfer facility the engine
//! submits planned transfers through, deposit lookup for join
//! verification, and the deterministic account keys the custody program
//! derives from its seeds. Account-layout serialization beyond what the
//! engine asserts is the program's business, not ours.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    errors::EngineError,
    ledger::TransferKind,
    market::{round_id_string, Side},
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferIntent {
    pub market: String,
    pub round_id: i64,
    pub transfer_id: String,
    pub source: String,
    pub recipient: String,
    pub units: u64,
    pub kind: TransferKind,
}

impl TransferIntent {
    /// Memo attached to the external transfer; the signature index is
    /// keyed by it, which is what makes crash recovery possible.
    pub fn memo(&self) -> String {
        format!(
            "{}:{}",
            round_id_string(&self.market, self.round_id),
            self.transfer_id
        )
    }

    /// Custody-program instruction a relayer would invoke for this
    /// transfer. Settlement transfers ride `settle_round`; position
    /// claims ride `claim`.
    pub fn instruction(&self) -> &'static str {
        if self.transfer_id.starts_with("claim:") {
            "claim"
        } else {
            "settle_round"
        }
    }
}

/// A confirmed inbound transfer, as reported by the external ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deposit {
    pub signature: String,
    pub to: String,
    pub lamports: u64,
    pub memo: Option<String>,
    pub block_time: i64,
}

#[derive(Debug, Clone, Error)]
pub enum TransferError {
    #[error("transfer facility: {0}")]
    Transient(String),

    #[error("transfer rejected: {0}")]
    Fatal(String),
}

impl From<TransferError> for EngineError {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::Transient(msg) => EngineError::TransientExternal(msg),
            TransferError::Fatal(msg) => EngineError::Fatal(msg),
        }
    }
}

#[async_trait]
pub trait TransferFacility: Send + Sync {
    /// Submit a transfer; returns the external signature on confirmation.
    async fn submit_transfer(&self, intent: &TransferIntent) -> Result<String, TransferError>;

    /// Look up an already-confirmed transfer by memo. Consulted before
    /// every submission so a crash between submit and receipt append
    /// never duplicates a payout.
    async fn find_signature(&self, memo: &str) -> Result<Option<String>, TransferError>;

    /// Look up a confirmed deposit by signature for join verification.
    async fn find_deposit(&self, signature: &str) -> Result<Option<Deposit>, TransferError>;
}

/// HTTP relayer client. The relayer owns the signing key; this service
/// only ever sees signatures.
pub struct RpcTransferClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    signature: String,
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    signature: Option<String>,
}

impl RpcTransferClient {
    pub fn new(base_url: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self { http, base_url: base_url.trim_end_matches('/').to_string() }
    }

    fn classify(status: reqwest::StatusCode, body: String) -> TransferError {
        if status.is_client_error() {
            TransferError::Fatal(format!("{status}: {body}"))
        } else {
            TransferError::Transient(format!("{status}: {body}"))
        }
    }
}

#[async_trait]
impl TransferFacility for RpcTransferClient {
    async fn submit_transfer(&self, intent: &TransferIntent) -> Result<String, TransferError> {
        let url = format!("{}/transfers", self.base_url);
        let payload = serde_json::json!({
            "instruction": intent.instruction(),
            "source": intent.source,
            "recipient": intent.recipient,
            "lamports": intent.units,
            "memo": intent.memo(),
        });
        let response = self
            .http
            .post(url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| TransferError::Transient(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify(status, body));
        }
        let body: SubmitResponse = response
            .json()
            .await
            .map_err(|e| TransferError::Transient(e.to_string()))?;
        Ok(body.signature)
    }

    async fn find_signature(&self, memo: &str) -> Result<Option<String>, TransferError> {
        let url = format!("{}/transfers/by-memo", self.base_url);
        let response = self
            .http
            .get(url)
            .query(&[("memo", memo)])
            .send()
            .await
            .map_err(|e| TransferError::Transient(e.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify(status, body));
        }
        let body: LookupResponse = response
            .json()
            .await
            .map_err(|e| TransferError::Transient(e.to_string()))?;
        Ok(body.signature)
    }

    async fn find_deposit(&self, signature: &str) -> Result<Option<Deposit>, TransferError> {
        let url = format!("{}/deposits/{}", self.base_url, signature);
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| TransferError::Transient(e.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify(status, body));
        }
        let body: Deposit = response
            .json()
            .await
            .map_err(|e| TransferError::Transient(e.to_string()))?;
        Ok(Some(body))
    }
}

/// Deterministic account keys for the custody program, derived from the
/// same seed tuples the program uses. The engine only needs agreement on
/// the keys, so a length-prefixed SHA-256 over program id and seeds is the
/// whole derivation.
pub mod pda {
    use sha2::{Digest, Sha256};

    use super::Side;

    pub const CONFIG_SEED: &[u8] = b"config";
    pub const ROUND_SEED: &[u8] = b"round";
    pub const VAULT_SEED: &[u8] = b"vault";
    pub const POSITION_SEED: &[u8] = b"position";

    pub fn derive(program_id: &str, seeds: &[&[u8]]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(program_id.as_bytes());
        for seed in seeds {
            hasher.update((seed.len() as u64).to_le_bytes());
            hasher.update(seed);
        }
        hex::encode(hasher.finalize())
    }

    pub fn config_key(program_id: &str) -> String {
        derive(program_id, &[CONFIG_SEED])
    }

    pub fn round_key(program_id: &str, market_code: &str, round_id: i64) -> String {
        derive(
            program_id,
            &[ROUND_SEED, market_code.as_bytes(), &round_id.to_le_bytes()],
        )
    }

    pub fn vault_key(program_id: &str, round_key: &str, side: Side) -> String {
        derive(program_id, &[VAULT_SEED, round_key.as_bytes(), &[side.as_u8()]])
    }

    pub fn position_key(program_id: &str, round_key: &str, wallet: &str, side: Side) -> String {
        derive(
            program_id,
            &[POSITION_SEED, round_key.as_bytes(), wallet.as_bytes(), &[side.as_u8()]],
        )
    }
}
