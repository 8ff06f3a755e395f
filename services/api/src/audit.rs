use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditLevel {
    Warn,
    Error,
}

/// Best-effort operator audit stream. Sinks must never let a logging
/// failure block business logic; implementations swallow their own
/// errors.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, level: AuditLevel, code: &str, detail: &str);
}

/// Default sink: structured tracing events, picked up by whatever
/// subscriber the deployment ships logs with.
pub struct TracingAudit;

#[async_trait]
impl AuditSink for TracingAudit {
    async fn record(&self, level: AuditLevel, code: &str, detail: &str) {
        match level {
            AuditLevel::Warn => tracing::warn!(code, "{detail}"),
            AuditLevel::Error => tracing::error!(code, "{detail}"),
        }
    }
}
