//! Composite risk scoring for extracted invoices.
//!
//! Each check contributes at most one indicator. The overall score is the
//! weight-normalized mean of the produced indicators, so an invoice that
//! trips only low-weight checks stays low even with several indicators.

use crate::models::{RiskLevel, VendorRiskLevel, VendorStatistics};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskFactor {
    AmountDeviation,
    NewVendor,
    UnusualTiming,
    DuplicateSuspected,
    MissingPo,
    RoundAmount,
    RushPayment,
    ThresholdSplitting,
    VendorRisk,
}

impl fmt::Display for RiskFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AmountDeviation => "amount_deviation",
            Self::NewVendor => "new_vendor",
            Self::UnusualTiming => "unusual_timing",
            Self::DuplicateSuspected => "duplicate_suspected",
            Self::MissingPo => "missing_po",
            Self::RoundAmount => "round_amount",
            Self::RushPayment => "rush_payment",
            Self::ThresholdSplitting => "threshold_splitting",
            Self::VendorRisk => "vendor_risk",
        };
        f.write_str(s)
    }
}

/// A single risk indicator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskIndicator {
    pub factor: RiskFactor,
    pub weight: f64,
    pub score: f64,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
}

/// Complete risk assessment for one invoice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub overall_score: f64,
    pub level: RiskLevel,
    pub indicators: Vec<RiskIndicator>,
    pub recommendations: Vec<String>,
    pub requires_review: bool,
}

/// Everything the scorer looks at. Duplicate confidence and unusual-timing
/// come from the duplicate detector and the vendor profiler; the
/// orchestrator injects them before scoring.
#[derive(Debug, Clone, Default)]
pub struct RiskInput {
    pub total_amount: Decimal,
    pub po_number: Option<String>,
    pub payment_terms: Option<String>,
    pub vendor_history: Option<VendorStatistics>,
    pub vendor_risk: Option<VendorRiskLevel>,
    pub duplicate_confidence: Option<f64>,
    pub unusual_timing: bool,
    pub approval_thresholds: Vec<Decimal>,
}

const RUSH_TERMS: [&str; 5] = ["immediate", "due upon receipt", "urgent", "asap", "net 0"];

/// Ascending level buckets: the chosen level is the smallest bucket whose
/// threshold is at or above the score.
const LEVEL_THRESHOLDS: [(RiskLevel, f64); 4] = [
    (RiskLevel::Low, 0.3),
    (RiskLevel::Medium, 0.5),
    (RiskLevel::High, 0.7),
    (RiskLevel::Critical, 1.0),
];

pub struct RiskScorer {
    weights: HashMap<RiskFactor, f64>,
    review_threshold: f64,
}

impl RiskScorer {
    pub fn new() -> Self {
        Self::with_review_threshold(0.5)
    }

    pub fn with_review_threshold(review_threshold: f64) -> Self {
        let weights = HashMap::from([
            (RiskFactor::AmountDeviation, 0.20),
            (RiskFactor::NewVendor, 0.15),
            (RiskFactor::UnusualTiming, 0.10),
            (RiskFactor::DuplicateSuspected, 0.25),
            (RiskFactor::MissingPo, 0.10),
            (RiskFactor::RoundAmount, 0.05),
            (RiskFactor::RushPayment, 0.10),
            (RiskFactor::ThresholdSplitting, 0.20),
            (RiskFactor::VendorRisk, 0.15),
        ]);
        Self {
            weights,
            review_threshold,
        }
    }

    /// Override individual factor weights, e.g. from tenant policy.
    pub fn with_weights(mut self, overrides: HashMap<RiskFactor, f64>) -> Self {
        self.weights.extend(overrides);
        self
    }

    fn weight(&self, factor: RiskFactor) -> f64 {
        *self.weights.get(&factor).unwrap_or(&0.1)
    }

    /// Perform a complete risk assessment.
    pub fn assess(&self, input: &RiskInput) -> RiskAssessment {
        let mut indicators = Vec::new();

        if let Some(i) = self.check_amount_deviation(input) {
            indicators.push(i);
        }
        if let Some(i) = self.check_new_vendor(input) {
            indicators.push(i);
        }
        if let Some(i) = self.check_unusual_timing(input) {
            indicators.push(i);
        }
        if let Some(i) = self.check_missing_po(input) {
            indicators.push(i);
        }
        if let Some(i) = self.check_round_amount(input) {
            indicators.push(i);
        }
        if let Some(i) = self.check_rush_payment(input) {
            indicators.push(i);
        }
        if let Some(i) = self.check_threshold_splitting(input) {
            indicators.push(i);
        }
        if let Some(i) = self.check_duplicate(input) {
            indicators.push(i);
        }
        if let Some(i) = self.check_vendor_risk(input) {
            indicators.push(i);
        }

        let overall_score = if indicators.is_empty() {
            0.0
        } else {
            let total_weight: f64 = indicators.iter().map(|i| i.weight).sum();
            let weighted: f64 = indicators.iter().map(|i| i.score * i.weight).sum();
            (weighted / total_weight * 1000.0).round() / 1000.0
        };

        let level = LEVEL_THRESHOLDS
            .iter()
            .find(|(_, threshold)| overall_score <= *threshold)
            .map(|(level, _)| *level)
            .unwrap_or(RiskLevel::Critical);

        let recommendations = self.recommendations(&indicators, level);

        RiskAssessment {
            overall_score,
            level,
            indicators,
            recommendations,
            requires_review: overall_score >= self.review_threshold,
        }
    }

    fn check_amount_deviation(&self, input: &RiskInput) -> Option<RiskIndicator> {
        let history = input.vendor_history.as_ref()?;
        let avg = history.average_amount;
        if avg <= Decimal::ZERO || input.total_amount <= Decimal::ZERO {
            return None;
        }

        let deviation = ((input.total_amount - avg).abs() / avg)
            .to_f64()
            .unwrap_or(0.0);
        if deviation <= 0.5 {
            return None;
        }

        Some(RiskIndicator {
            factor: RiskFactor::AmountDeviation,
            weight: self.weight(RiskFactor::AmountDeviation),
            score: deviation.min(1.0),
            description: format!("Amount {:.0}% different from average", deviation * 100.0),
            evidence: Some(format!("Invoice: {}, Avg: {}", input.total_amount, avg)),
        })
    }

    fn check_new_vendor(&self, input: &RiskInput) -> Option<RiskIndicator> {
        let invoice_count = input
            .vendor_history
            .as_ref()
            .map(|h| h.total_invoices)
            .unwrap_or(0);
        if invoice_count >= 3 {
            return None;
        }

        Some(RiskIndicator {
            factor: RiskFactor::NewVendor,
            weight: self.weight(RiskFactor::NewVendor),
            score: if invoice_count == 0 { 0.7 } else { 0.4 },
            description: "New or limited vendor history".to_string(),
            evidence: Some(format!("Only {invoice_count} prior invoices")),
        })
    }

    fn check_unusual_timing(&self, input: &RiskInput) -> Option<RiskIndicator> {
        if !input.unusual_timing {
            return None;
        }
        Some(RiskIndicator {
            factor: RiskFactor::UnusualTiming,
            weight: self.weight(RiskFactor::UnusualTiming),
            score: 0.4,
            description: "Invoice arrived much sooner than this vendor's cadence".to_string(),
            evidence: None,
        })
    }

    fn check_missing_po(&self, input: &RiskInput) -> Option<RiskIndicator> {
        if input.po_number.as_deref().is_some_and(|po| !po.is_empty()) {
            return None;
        }
        if input.total_amount <= Decimal::new(1000, 0) {
            return None;
        }

        Some(RiskIndicator {
            factor: RiskFactor::MissingPo,
            weight: self.weight(RiskFactor::MissingPo),
            score: 0.6,
            description: "No PO number for significant amount".to_string(),
            evidence: Some(format!("Amount: {}", input.total_amount)),
        })
    }

    fn check_round_amount(&self, input: &RiskInput) -> Option<RiskIndicator> {
        let thousand = Decimal::new(1000, 0);
        if input.total_amount < thousand || input.total_amount % thousand != Decimal::ZERO {
            return None;
        }

        Some(RiskIndicator {
            factor: RiskFactor::RoundAmount,
            weight: self.weight(RiskFactor::RoundAmount),
            score: 0.3,
            description: "Exact round amount".to_string(),
            evidence: Some(format!("Amount: {}", input.total_amount)),
        })
    }

    fn check_rush_payment(&self, input: &RiskInput) -> Option<RiskIndicator> {
        let terms = input.payment_terms.as_deref()?.to_lowercase();
        if !RUSH_TERMS.iter().any(|needle| terms.contains(needle)) {
            return None;
        }

        Some(RiskIndicator {
            factor: RiskFactor::RushPayment,
            weight: self.weight(RiskFactor::RushPayment),
            score: 0.5,
            description: "Rush payment requested".to_string(),
            evidence: input.payment_terms.clone().map(|t| format!("Terms: {t}")),
        })
    }

    fn check_threshold_splitting(&self, input: &RiskInput) -> Option<RiskIndicator> {
        let amount = input.total_amount;
        if amount <= Decimal::ZERO {
            return None;
        }

        // Fires in the window just below an approval threshold, where a
        // deliberately split invoice would land.
        let lower_factor = Decimal::new(85, 2);
        let threshold = input.approval_thresholds.iter().find(|t| {
            let lower = **t * lower_factor;
            amount >= lower && amount < **t
        })?;

        Some(RiskIndicator {
            factor: RiskFactor::ThresholdSplitting,
            weight: self.weight(RiskFactor::ThresholdSplitting),
            score: 0.6,
            description: format!("Amount suspiciously close to {threshold} threshold"),
            evidence: Some(format!("Amount: {amount}, Threshold: {threshold}")),
        })
    }

    fn check_duplicate(&self, input: &RiskInput) -> Option<RiskIndicator> {
        let confidence = input.duplicate_confidence?;

        Some(RiskIndicator {
            factor: RiskFactor::DuplicateSuspected,
            weight: self.weight(RiskFactor::DuplicateSuspected),
            score: confidence.clamp(0.0, 1.0),
            description: "Possible duplicate of a prior invoice".to_string(),
            evidence: Some(format!("Match confidence: {confidence:.2}")),
        })
    }

    fn check_vendor_risk(&self, input: &RiskInput) -> Option<RiskIndicator> {
        let score = match input.vendor_risk? {
            VendorRiskLevel::High => 0.7,
            VendorRiskLevel::Critical => 1.0,
            VendorRiskLevel::Low | VendorRiskLevel::Normal => return None,
        };

        Some(RiskIndicator {
            factor: RiskFactor::VendorRisk,
            weight: self.weight(RiskFactor::VendorRisk),
            score,
            description: "Vendor profile carries elevated risk".to_string(),
            evidence: None,
        })
    }

    fn recommendations(&self, indicators: &[RiskIndicator], level: RiskLevel) -> Vec<String> {
        let mut recommendations = Vec::new();

        for indicator in indicators {
            let text = match indicator.factor {
                RiskFactor::AmountDeviation => {
                    "Verify pricing with vendor or check for volume changes"
                }
                RiskFactor::NewVendor => "Complete vendor verification before payment",
                RiskFactor::MissingPo => "Obtain retroactive PO approval",
                RiskFactor::DuplicateSuspected => "Confirm this is not a duplicate payment",
                RiskFactor::ThresholdSplitting => "Review for potential threshold avoidance",
                _ => continue,
            };
            recommendations.push(text.to_string());
        }

        if matches!(level, RiskLevel::High | RiskLevel::Critical) {
            recommendations.push("Consider escalation to management review".to_string());
        }

        recommendations
    }
}

impl Default for RiskScorer {
    fn default() -> Self {
        Self::new()
    }
}
