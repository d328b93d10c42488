//! Vendor behavioral profiles.
//!
//! Statistics are recomputed from the full ingest history on every new
//! invoice, through the single ingest-time write path. The anomaly check
//! compares a candidate amount against the vendor's established pattern and
//! stays silent until at least three invoices of history exist.

use crate::error::ProcessingResult;
use crate::models::{Invoice, VendorProfile, VendorStatistics};
use crate::repos::VendorRepo;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

#[derive(Debug, Clone)]
struct HistoryEntry {
    amount: Decimal,
    date: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    AmountDeviation,
    ExceedsHistoricalMax,
    UnusualTiming,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyFlag {
    pub kind: AnomalyKind,
    pub severity: String,
    pub detail: String,
}

/// Result of comparing a candidate invoice against vendor history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyReport {
    pub is_anomaly: bool,
    pub flags: Vec<AnomalyFlag>,
    pub confidence: f64,
}

impl AnomalyReport {
    fn quiet() -> Self {
        Self {
            is_anomaly: false,
            flags: Vec::new(),
            confidence: 0.0,
        }
    }

    pub fn has(&self, kind: AnomalyKind) -> bool {
        self.flags.iter().any(|f| f.kind == kind)
    }
}

/// Builds and maintains vendor profiles from the invoices that land.
pub struct VendorProfiler {
    repo: Arc<dyn VendorRepo>,
    history: Mutex<HashMap<String, Vec<HistoryEntry>>>,
}

impl VendorProfiler {
    pub fn new(repo: Arc<dyn VendorRepo>) -> Self {
        Self {
            repo,
            history: Mutex::new(HashMap::new()),
        }
    }

    pub async fn profile(&self, vendor_id: &str) -> ProcessingResult<Option<VendorProfile>> {
        self.repo.get(vendor_id).await
    }

    /// Fold a newly extracted invoice into the vendor's profile.
    pub async fn ingest(
        &self,
        vendor_id: &str,
        vendor_name: &str,
        invoice: &Invoice,
    ) -> ProcessingResult<VendorProfile> {
        let date = invoice
            .invoice_date
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc())
            .unwrap_or(invoice.created_at);

        let statistics = {
            let mut history = self.history.lock().unwrap();
            let entries = history.entry(vendor_id.to_string()).or_default();
            entries.push(HistoryEntry {
                amount: invoice.total_amount,
                date,
            });
            compute_statistics(entries)
        };

        let mut profile = self
            .repo
            .get(vendor_id)
            .await?
            .unwrap_or_else(|| VendorProfile::new(vendor_id, vendor_name, &invoice.currency));
        profile.statistics = statistics;

        if let Some(terms) = invoice.payment_terms.as_deref() {
            if !terms.is_empty() && !profile.payment_terms_history.iter().any(|t| t == terms) {
                profile.payment_terms_history.push(terms.to_string());
            }
        }

        self.repo.upsert(profile.clone()).await?;
        debug!(
            vendor_id,
            total_invoices = profile.statistics.total_invoices,
            "Vendor profile updated"
        );
        Ok(profile)
    }

    /// Compare a candidate amount against the vendor's history.
    pub async fn check_anomaly(
        &self,
        vendor_id: &str,
        amount: Decimal,
    ) -> ProcessingResult<AnomalyReport> {
        self.check_anomaly_at(vendor_id, amount, Utc::now()).await
    }

    pub async fn check_anomaly_at(
        &self,
        vendor_id: &str,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> ProcessingResult<AnomalyReport> {
        let Some(profile) = self.repo.get(vendor_id).await? else {
            return Ok(AnomalyReport::quiet());
        };
        let stats = &profile.statistics;
        if stats.total_invoices < 3 {
            return Ok(AnomalyReport::quiet());
        }

        let mut flags = Vec::new();
        let amount_f = amount.to_f64().unwrap_or(0.0);
        let avg_f = stats.average_amount.to_f64().unwrap_or(0.0);

        if stats.std_deviation > 0.0 {
            let z_score = (amount_f - avg_f).abs() / stats.std_deviation;
            if z_score > 2.0 {
                flags.push(AnomalyFlag {
                    kind: AnomalyKind::AmountDeviation,
                    severity: if z_score > 3.0 { "high" } else { "medium" }.to_string(),
                    detail: format!("Z-score: {z_score:.2}"),
                });
            }
        }

        if amount > stats.max_amount * Decimal::new(15, 1) {
            flags.push(AnomalyFlag {
                kind: AnomalyKind::ExceedsHistoricalMax,
                severity: "medium".to_string(),
                detail: format!("Amount {amount} exceeds max {}", stats.max_amount),
            });
        }

        if let Some(last) = stats.last_invoice_date {
            let days_since_last = (now - last).num_days() as f64;
            if stats.invoice_frequency_days > 0.0
                && days_since_last < stats.invoice_frequency_days * 0.3
            {
                flags.push(AnomalyFlag {
                    kind: AnomalyKind::UnusualTiming,
                    severity: "low".to_string(),
                    detail: format!("Only {days_since_last:.0} days since last invoice"),
                });
            }
        }

        Ok(AnomalyReport {
            is_anomaly: !flags.is_empty(),
            confidence: (0.5 + flags.len() as f64 * 0.2).min(0.9),
            flags,
        })
    }
}

fn compute_statistics(entries: &[HistoryEntry]) -> VendorStatistics {
    let mut stats = VendorStatistics {
        total_invoices: entries.len() as u64,
        ..Default::default()
    };
    if entries.is_empty() {
        return stats;
    }

    let amounts: Vec<Decimal> = entries.iter().map(|e| e.amount).collect();
    stats.total_amount = amounts.iter().copied().sum();
    stats.average_amount = stats.total_amount / Decimal::from(amounts.len() as u64);
    stats.min_amount = amounts.iter().copied().min().unwrap_or(Decimal::ZERO);
    stats.max_amount = amounts.iter().copied().max().unwrap_or(Decimal::ZERO);

    if amounts.len() > 1 {
        let mean = stats.average_amount.to_f64().unwrap_or(0.0);
        let variance: f64 = amounts
            .iter()
            .map(|a| {
                let diff = a.to_f64().unwrap_or(0.0) - mean;
                diff * diff
            })
            .sum::<f64>()
            / (amounts.len() - 1) as f64;
        stats.std_deviation = variance.sqrt();
    }

    let mut dates: Vec<DateTime<Utc>> = entries.iter().map(|e| e.date).collect();
    dates.sort();
    stats.first_invoice_date = dates.first().copied();
    stats.last_invoice_date = dates.last().copied();
    if dates.len() > 1 {
        let span_days = (dates[dates.len() - 1] - dates[0]).num_days() as f64;
        stats.invoice_frequency_days = span_days / (dates.len() - 1) as f64;
    }

    stats
}
