mod common;

use common::*;

use updown_api::{
    chain::Deposit,
    config::{CustodyMode, RateBucket},
    errors::EngineError,
    ledger::{Ledger, RoundKey},
};

const IP: &str = "203.0.113.7";

/// In-window submission at second 1030 of the round starting at 1000.
const NOW_MS: i64 = 1_030_000;

fn key() -> RoundKey {
    RoundKey::new("SOL", 1000)
}

#[tokio::test]
async fn join_creates_entry_with_server_time() {
    let h = harness(test_config());
    h.seed_round(1000).await;

    let mut req = join_request(&h.cfg, 1000, ALICE, "UP", 50);
    // Client-supplied time must be ignored.
    req.joined_at_ms = Some(1);

    let outcome = h.join.submit(&req, IP, NOW_MS).await.unwrap();
    assert!(outcome.created);

    let entries = h.ledger_dyn.entries_for_round(&key()).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].wallet, ALICE);
    assert_eq!(entries[0].stake_units, 50);
    assert_eq!(entries[0].joined_at_ms, NOW_MS);

    let round = h.ledger_dyn.get_round(&key()).await.unwrap().unwrap();
    assert_eq!(round.up_total, 50);
}

#[tokio::test]
async fn replayed_signature_is_a_noop() {
    let h = harness(test_config());
    h.seed_round(1000).await;

    let mut req = join_request(&h.cfg, 1000, ALICE, "UP", 50);
    req.signature = Some("dup-sig".into());

    assert!(h.join.submit(&req, IP, NOW_MS).await.unwrap().created);
    assert!(h.ledger_dyn.has_entry("dup-sig").await.unwrap());
    assert!(!h.join.submit(&req, IP, NOW_MS + 1000).await.unwrap().created);

    let entries = h.ledger_dyn.entries_for_round(&key()).await.unwrap();
    assert_eq!(entries.len(), 1);
    let round = h.ledger_dyn.get_round(&key()).await.unwrap().unwrap();
    assert_eq!(round.up_total, 50);
}

/// Pre-on-chain mode: the first join materializes the round.
#[tokio::test]
async fn first_join_creates_round_lazily() {
    let h = harness(test_config());
    assert!(h.ledger_dyn.get_round(&key()).await.unwrap().is_none());

    let req = join_request(&h.cfg, 1000, ALICE, "DOWN", 30);
    assert!(h.join.submit(&req, IP, NOW_MS).await.unwrap().created);

    let round = h.ledger_dyn.get_round(&key()).await.unwrap().unwrap();
    assert_eq!(round.down_total, 30);
}

/// Scenario F: a submission at exactly the lock point is rejected and
/// nothing is written.
#[tokio::test]
async fn join_at_lock_point_is_rejected() {
    let h = harness(test_config());
    h.seed_round(1000).await;

    let req = join_request(&h.cfg, 1000, ALICE, "UP", 50);
    let lock_ms = 1_060_000;
    let err = h.join.submit(&req, IP, lock_ms).await.unwrap_err();
    assert!(is_validation(&err));
    assert!(h.ledger_dyn.entries_for_round(&key()).await.unwrap().is_empty());
}

#[tokio::test]
async fn join_before_start_is_rejected() {
    let h = harness(test_config());
    h.seed_round(1000).await;
    let req = join_request(&h.cfg, 1000, ALICE, "UP", 50);
    assert!(is_validation(&h.join.submit(&req, IP, 999_000).await.unwrap_err()));
}

#[tokio::test]
async fn validation_matrix() {
    let h = harness(test_config());
    h.seed_round(1000).await;

    let cases: Vec<(&str, Box<dyn Fn(&mut updown_api::join::JoinRequest)>)> = vec![
        ("unknown market", Box::new(|r| {
            r.market = "DOGE".into();
            r.round_id = "DOGE-1000-5m".into();
        })),
        ("wrong feed", Box::new(|r| r.feed_id = "feed-other".into())),
        ("stake outside tiers", Box::new(|r| r.stake_lamports = 33)),
        ("bad direction", Box::new(|r| r.direction = "SIDEWAYS".into())),
        ("round id market mismatch", Box::new(|r| r.round_id = "BTC-1000-5m".into())),
        ("round id start mismatch", Box::new(|r| r.round_start_ms = 1_100_000)),
        ("misaligned start", Box::new(|r| {
            r.round_id = "SOL-1050-5m".into();
            r.round_start_ms = 1_050_000;
            r.round_end_ms = 1_410_000;
        })),
        ("wrong end", Box::new(|r| r.round_end_ms += 1000)),
        ("malformed wallet", Box::new(|r| r.wallet = "not-a-wallet".into())),
        ("bad suffix", Box::new(|r| r.round_id = "SOL-1000-1h".into())),
    ];

    for (name, mutate) in cases {
        let mut req = join_request(&h.cfg, 1000, ALICE, "UP", 50);
        mutate(&mut req);
        let err = h.join.submit(&req, IP, NOW_MS).await.unwrap_err();
        assert!(is_validation(&err), "case {name:?} got {err:?}");
    }
    assert!(h.ledger_dyn.entries_for_round(&key()).await.unwrap().is_empty());
}

#[tokio::test]
async fn paused_joins_return_service_unavailable() {
    let mut cfg = test_config();
    cfg.pause.joins = true;
    let h = harness(cfg);
    h.seed_round(1000).await;

    let req = join_request(&h.cfg, 1000, ALICE, "UP", 50);
    let err = h.join.submit(&req, IP, NOW_MS).await.unwrap_err();
    assert!(matches!(err, EngineError::Paused("joins")));
}

#[tokio::test]
async fn ip_rate_limit_applies_before_wallet() {
    let mut cfg = test_config();
    cfg.entries_ip_bucket = RateBucket {
        limit: 2,
        window: std::time::Duration::from_secs(60),
    };
    let h = harness(cfg);
    h.seed_round(1000).await;

    for (wallet, at) in [(ALICE, NOW_MS), (BOB, NOW_MS + 1000)] {
        let req = join_request(&h.cfg, 1000, wallet, "UP", 50);
        h.join.submit(&req, IP, at).await.unwrap();
    }

    let req = join_request(&h.cfg, 1000, CAROL, "DOWN", 30);
    let err = h.join.submit(&req, IP, NOW_MS + 2000).await.unwrap_err();
    assert!(matches!(err, EngineError::RateLimited { .. }));
    assert_eq!(err.retry_after_secs(), Some(60));

    // A different IP still goes through.
    h.join.submit(&req, "198.51.100.9", NOW_MS + 2000).await.unwrap();
}

#[tokio::test]
async fn wallet_rate_limit_counts_across_ips() {
    let mut cfg = test_config();
    cfg.entries_wallet_bucket = RateBucket {
        limit: 2,
        window: std::time::Duration::from_secs(60),
    };
    let h = harness(cfg);
    h.seed_round(1000).await;

    for (ip, at) in [("10.0.0.1", NOW_MS), ("10.0.0.2", NOW_MS + 1000)] {
        let req = join_request(&h.cfg, 1000, ALICE, "UP", 50);
        h.join.submit(&req, ip, at).await.unwrap();
    }

    let req = join_request(&h.cfg, 1000, ALICE, "UP", 50);
    let err = h.join.submit(&req, "10.0.0.3", NOW_MS + 2000).await.unwrap_err();
    assert!(matches!(err, EngineError::RateLimited { .. }));
}

// ---------------------------------------------------------------------------
// Server-custody mode
// ---------------------------------------------------------------------------

fn server_config() -> updown_api::config::Config {
    let mut cfg = test_config();
    cfg.custody_mode = CustodyMode::Server;
    cfg
}

fn escrow_deposit(cfg: &updown_api::config::Config, signature: &str, stake: u64) -> Deposit {
    Deposit {
        signature: signature.into(),
        to: cfg.escrow_wallet.clone(),
        lamports: stake,
        memo: Some(format!("SOL-1000-5m:{ALICE}:UP")),
        block_time: 1_030,
    }
}

#[tokio::test]
async fn server_custody_accepts_verified_deposit() {
    let h = harness(server_config());
    h.seed_round(1000).await;
    h.chain.add_deposit(escrow_deposit(&h.cfg, "dep-1", 50));

    let mut req = join_request(&h.cfg, 1000, ALICE, "UP", 50);
    req.signature = Some("dep-1".into());

    assert!(h.join.submit(&req, IP, NOW_MS).await.unwrap().created);
    let entries = h.ledger_dyn.entries_for_round(&key()).await.unwrap();
    assert_eq!(entries[0].id, "dep-1");
}

#[tokio::test]
async fn server_custody_rejects_bad_deposits() {
    let h = harness(server_config());
    h.seed_round(1000).await;

    // No signature at all.
    let req = join_request(&h.cfg, 1000, ALICE, "UP", 50);
    assert!(is_validation(&h.join.submit(&req, IP, NOW_MS).await.unwrap_err()));

    // Unknown signature.
    let mut req = join_request(&h.cfg, 1000, ALICE, "UP", 50);
    req.signature = Some("missing".into());
    assert!(is_validation(&h.join.submit(&req, IP, NOW_MS).await.unwrap_err()));

    // Wrong destination.
    let mut deposit = escrow_deposit(&h.cfg, "dep-to", 50);
    deposit.to = "SomeOtherWa11etSomeOtherWa11etSomeO".into();
    h.chain.add_deposit(deposit);
    let mut req = join_request(&h.cfg, 1000, ALICE, "UP", 50);
    req.signature = Some("dep-to".into());
    assert!(is_validation(&h.join.submit(&req, IP, NOW_MS).await.unwrap_err()));

    // Amount mismatch.
    h.chain.add_deposit(escrow_deposit(&h.cfg, "dep-amt", 25));
    let mut req = join_request(&h.cfg, 1000, ALICE, "UP", 50);
    req.signature = Some("dep-amt".into());
    assert!(is_validation(&h.join.submit(&req, IP, NOW_MS).await.unwrap_err()));

    // Memo mismatch.
    let mut deposit = escrow_deposit(&h.cfg, "dep-memo", 50);
    deposit.memo = Some(format!("SOL-1000-5m:{ALICE}:DOWN"));
    h.chain.add_deposit(deposit);
    let mut req = join_request(&h.cfg, 1000, ALICE, "UP", 50);
    req.signature = Some("dep-memo".into());
    assert!(is_validation(&h.join.submit(&req, IP, NOW_MS).await.unwrap_err()));

    // Block time outside the open window, even though the request came in
    // during it.
    let mut deposit = escrow_deposit(&h.cfg, "dep-late", 50);
    deposit.block_time = 1_061;
    h.chain.add_deposit(deposit);
    let mut req = join_request(&h.cfg, 1000, ALICE, "UP", 50);
    req.signature = Some("dep-late".into());
    assert!(is_validation(&h.join.submit(&req, IP, NOW_MS).await.unwrap_err()));

    assert!(h.ledger_dyn.entries_for_round(&key()).await.unwrap().is_empty());
}

#[tokio::test]
async fn server_custody_requires_existing_round() {
    let h = harness(server_config());
    h.chain.add_deposit(escrow_deposit(&h.cfg, "dep-1", 50));

    let mut req = join_request(&h.cfg, 1000, ALICE, "UP", 50);
    req.signature = Some("dep-1".into());
    assert!(is_validation(&h.join.submit(&req, IP, NOW_MS).await.unwrap_err()));
    assert!(h.ledger_dyn.get_round(&key()).await.unwrap().is_none());
}
