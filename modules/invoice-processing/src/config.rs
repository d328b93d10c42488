use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::env;

/// Process configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Concurrent handler invocations per event type.
    pub consumer_pool_size: usize,
    /// Seconds to wait for in-flight work on shutdown.
    pub shutdown_grace_secs: u64,
    /// Newest messages kept per event-type stream.
    pub stream_retention: usize,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let consumer_pool_size: usize = env::var("CONSUMER_POOL_SIZE")
            .unwrap_or_else(|_| "1".to_string())
            .parse()
            .map_err(|_| "CONSUMER_POOL_SIZE must be a positive integer".to_string())?;

        let shutdown_grace_secs: u64 = env::var("SHUTDOWN_GRACE_SECS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .map_err(|_| "SHUTDOWN_GRACE_SECS must be a non-negative integer".to_string())?;

        let stream_retention: usize = env::var("STREAM_RETENTION")
            .unwrap_or_else(|_| "10000".to_string())
            .parse()
            .map_err(|_| "STREAM_RETENTION must be a positive integer".to_string())?;

        Ok(Config {
            consumer_pool_size,
            shutdown_grace_secs,
            stream_retention,
        })
    }
}

/// Per-tenant pipeline policy. Every field is overridable per tenant; the
/// defaults below apply to tenants without an explicit entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantConfig {
    pub ocr_confidence_threshold: f64,
    pub auto_approve_enabled: bool,
    pub auto_approve_max_amount: Decimal,
    pub duplicate_detection_enabled: bool,
    pub duplicate_hash_window_days: i64,
    /// Window for the same-vendor similar-amount duplicate check. Kept
    /// separate from `duplicate_hash_window_days`; the two windows answer
    /// different questions.
    pub similar_window_days: i64,
    pub sla_warning_hours: i64,
    pub sla_breach_hours: i64,
    pub retention_days: i64,
    /// Approval tier boundaries in ascending order.
    pub approval_tiers: Vec<Decimal>,
    /// Thresholds scanned by the threshold-splitting risk check.
    pub risk_thresholds: Vec<Decimal>,
    /// Composite score at or above which an invoice requires review.
    pub review_threshold: f64,
}

impl Default for TenantConfig {
    fn default() -> Self {
        Self {
            ocr_confidence_threshold: 0.85,
            auto_approve_enabled: false,
            auto_approve_max_amount: Decimal::new(1000, 0),
            duplicate_detection_enabled: true,
            duplicate_hash_window_days: 90,
            similar_window_days: 7,
            sla_warning_hours: 24,
            sla_breach_hours: 48,
            retention_days: 2555,
            approval_tiers: vec![
                Decimal::new(500, 0),
                Decimal::new(5_000, 0),
                Decimal::new(25_000, 0),
            ],
            risk_thresholds: vec![
                Decimal::new(1_000, 0),
                Decimal::new(5_000, 0),
                Decimal::new(10_000, 0),
                Decimal::new(25_000, 0),
            ],
            review_threshold: 0.5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_defaults_match_policy() {
        let cfg = TenantConfig::default();
        assert_eq!(cfg.ocr_confidence_threshold, 0.85);
        assert!(!cfg.auto_approve_enabled);
        assert_eq!(cfg.auto_approve_max_amount, Decimal::new(1000, 0));
        assert!(cfg.duplicate_detection_enabled);
        assert_eq!(cfg.duplicate_hash_window_days, 90);
        assert_eq!(cfg.similar_window_days, 7);
        assert_eq!(cfg.retention_days, 2555);
        assert_eq!(cfg.approval_tiers.len(), 3);
        assert_eq!(cfg.risk_thresholds.len(), 4);
    }
}
