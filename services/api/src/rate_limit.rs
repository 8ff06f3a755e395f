use std::sync::Arc;

use crate::{
    config::RateBucket,
    errors::EngineError,
    ledger::{Ledger, RateScope},
};

/// Check one rolling-window bucket against the ledger's join-attempt
/// counters. Counters are eventually consistent across replicas; a lost
/// update only makes the limit slightly lax, never unsafe.
pub async fn check_bucket(
    ledger: &Arc<dyn Ledger>,
    scope: RateScope,
    key: &str,
    bucket: &RateBucket,
    now_ms: i64,
) -> Result<(), EngineError> {
    let seen = ledger
        .count_recent_attempts(scope, key, bucket.window, now_ms)
        .await?;
    if seen >= bucket.limit {
        return Err(EngineError::RateLimited { retry_after: bucket.window });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::ledger::memory::MemoryLedger;

    #[tokio::test]
    async fn bucket_rejects_at_limit() {
        let ledger: Arc<dyn Ledger> = Arc::new(MemoryLedger::new());
        let bucket = RateBucket { limit: 2, window: Duration::from_secs(60) };

        for at in [1_000, 2_000] {
            check_bucket(&ledger, RateScope::Ip, "1.1.1.1", &bucket, at).await.unwrap();
            ledger.record_join_attempt("w", "1.1.1.1", at).await.unwrap();
        }

        let err = check_bucket(&ledger, RateScope::Ip, "1.1.1.1", &bucket, 3_000)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::RateLimited { .. }));
        assert_eq!(err.retry_after_secs(), Some(60));

        // Another key is unaffected.
        check_bucket(&ledger, RateScope::Ip, "2.2.2.2", &bucket, 3_000).await.unwrap();
    }
}
