use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

/// Suffix baked into the wire round identity. The format is bit-stable:
/// `"{MARKET}-{start_ts_seconds}-5m"`.
pub const ROUND_SUFFIX: &str = "5m";

/// Pyth price-feed program on Solana mainnet; the default expected owner
/// for every built-in market binding.
pub const DEFAULT_ORACLE_OWNER: &str = "FsJ3A3u2vn5cTVofAjvy6y5kwABJAqYWpe4975bi2epH";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Side {
    Up,
    Down,
}

impl Side {
    /// Wire encoding used by the custody program: 0 = UP, 1 = DOWN.
    pub fn as_u8(self) -> u8 {
        match self {
            Side::Up => 0,
            Side::Down => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Up => "UP",
            Side::Down => "DOWN",
        }
    }

    pub fn parse(value: &str) -> Option<Side> {
        match value {
            "UP" => Some(Side::Up),
            "DOWN" => Some(Side::Down),
            _ => None,
        }
    }

    pub fn opposite(self) -> Side {
        match self {
            Side::Up => Side::Down,
            Side::Down => Side::Up,
        }
    }
}

/// One tradable market: symbol, oracle feed binding, and the program that
/// must own the feed account. Immutable per deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketSpec {
    pub symbol: String,
    pub asset: String,
    pub feed_id: String,
    pub oracle_owner: String,
}

pub fn default_markets() -> Vec<MarketSpec> {
    vec![
        MarketSpec {
            symbol: "SOL".into(),
            asset: "Solana".into(),
            feed_id: "ef0d8b6fda2ceba41da15d4095d1da392a0d2f8ed0c6c7bc0f4cfac8c280b56d".into(),
            oracle_owner: DEFAULT_ORACLE_OWNER.into(),
        },
        MarketSpec {
            symbol: "BTC".into(),
            asset: "Bitcoin".into(),
            feed_id: "e62df6c8b4a85fe1a67db44dc12de5db330f7ac66b72dc658afedf0f4a415b43".into(),
            oracle_owner: DEFAULT_ORACLE_OWNER.into(),
        },
        MarketSpec {
            symbol: "ETH".into(),
            asset: "Ethereum".into(),
            feed_id: "ff61491a931112ddf1bd8147cd1b641375f79f5825126d665480874634fd0ace".into(),
            oracle_owner: DEFAULT_ORACLE_OWNER.into(),
        },
    ]
}

/// Render the wire round identity for a market and its start second.
pub fn round_id_string(market: &str, start_sec: i64) -> String {
    format!("{market}-{start_sec}-{ROUND_SUFFIX}")
}

/// Parse a wire round identity back into `(market, start_sec)`. Strict:
/// exactly three dash-separated parts and the fixed suffix.
pub fn parse_round_id(value: &str) -> Result<(String, i64), EngineError> {
    let mut parts = value.split('-');
    let (market, start, suffix) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(s), Some(x), None) => (m, s, x),
        _ => return Err(EngineError::validation(format!("malformed round id: {value}"))),
    };
    if suffix != ROUND_SUFFIX {
        return Err(EngineError::validation(format!(
            "round id suffix must be {ROUND_SUFFIX}: {value}"
        )));
    }
    if market.is_empty() || !market.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()) {
        return Err(EngineError::validation(format!("bad market in round id: {value}")));
    }
    let start_sec = start
        .parse::<i64>()
        .map_err(|_| EngineError::validation(format!("bad start second in round id: {value}")))?;
    if start_sec < 0 {
        return Err(EngineError::validation(format!("negative start in round id: {value}")));
    }
    Ok((market.to_string(), start_sec))
}

const BASE58_ALPHABET: &str = "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

/// Solana-shaped wallet check: base58 alphabet, 32..=44 chars.
pub fn is_well_formed_wallet(wallet: &str) -> bool {
    (32..=44).contains(&wallet.len()) && wallet.chars().all(|c| BASE58_ALPHABET.contains(c))
}
