//! Purchase order matching with variance detection.
//!
//! Locates the PO by normalized number (fuzzy fallback across the store),
//! compares header fields, greedily matches line items by description
//! similarity, and classifies every discrepancy by severity. The result
//! feeds the validation stage; a critical variance makes the overall status
//! MISMATCH regardless of how well the lines matched.

use crate::error::ProcessingResult;
use crate::models::Invoice;
use crate::repos::PurchaseOrderRepo;
use crate::text::similarity_ratio;
use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    Matched,
    Partial,
    Mismatch,
    NoPo,
    PoNotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarianceKind {
    Amount,
    Quantity,
    Price,
    Tax,
    Vendor,
    Currency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Purchase Order line item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoLineItem {
    pub line_number: u32,
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub total: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sku: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoStatus {
    Open,
    Partial,
    Fulfilled,
    Cancelled,
}

/// Purchase Order header plus lines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurchaseOrder {
    pub po_number: String,
    pub vendor_id: String,
    pub vendor_name: String,
    pub order_date: NaiveDate,
    pub currency: String,
    pub subtotal: Decimal,
    pub tax_amount: Decimal,
    pub total_amount: Decimal,
    pub line_items: Vec<PoLineItem>,
    pub status: PoStatus,
}

/// A detected discrepancy between an invoice field and its PO counterpart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variance {
    pub kind: VarianceKind,
    pub field: String,
    pub invoice_value: serde_json::Value,
    pub po_value: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub difference: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percentage: Option<f64>,
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineMatchStatus {
    Matched,
    Partial,
    Mismatch,
}

/// Match result for a single invoice line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItemMatch {
    /// 1-based invoice line number.
    pub invoice_line: usize,
    pub po_line: u32,
    pub confidence: f64,
    pub variances: Vec<Variance>,
    pub status: LineMatchStatus,
}

/// Complete PO matching result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchResult {
    pub invoice_id: String,
    pub po_number: String,
    pub status: MatchStatus,
    pub overall_confidence: f64,
    pub header_variances: Vec<Variance>,
    pub line_matches: Vec<LineItemMatch>,
    pub unmatched_invoice_lines: Vec<usize>,
    pub unmatched_po_lines: Vec<u32>,
    pub total_variance_amount: Decimal,
    pub matched_at: DateTime<Utc>,
    pub recommendation: String,
}

impl MatchResult {
    fn lookup_failure(invoice_id: &str, po_number: &str, status: MatchStatus, why: String) -> Self {
        Self {
            invoice_id: invoice_id.to_string(),
            po_number: po_number.to_string(),
            status,
            overall_confidence: 0.0,
            header_variances: Vec::new(),
            line_matches: Vec::new(),
            unmatched_invoice_lines: Vec::new(),
            unmatched_po_lines: Vec::new(),
            total_variance_amount: Decimal::ZERO,
            matched_at: Utc::now(),
            recommendation: why,
        }
    }
}

fn po_prefix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(PO|P\.O\.|PURCHASE\s*ORDER)[:\s#-]*").expect("static regex is valid")
    })
}

fn po_charset_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^A-Z0-9-]").expect("static regex is valid"))
}

/// Normalize a PO reference for comparison: uppercase, collapse the common
/// prefixes to `PO-`, strip everything but alphanumerics and hyphens.
pub fn normalize_po_number(reference: &str) -> String {
    let upper = reference.trim().to_uppercase();
    let prefixed = po_prefix_re().replace(&upper, "PO-");
    po_charset_re().replace_all(&prefixed, "").into_owned()
}

/// Purchase Order matching engine.
pub struct PoMatcher {
    repo: Arc<dyn PurchaseOrderRepo>,
    /// Relative total-amount difference tolerated without a variance.
    amount_tolerance: f64,
    quantity_tolerance: f64,
    price_tolerance: f64,
    description_threshold: f64,
}

impl PoMatcher {
    pub fn new(repo: Arc<dyn PurchaseOrderRepo>) -> Self {
        Self {
            repo,
            amount_tolerance: 0.05,
            quantity_tolerance: 0.10,
            price_tolerance: 0.02,
            description_threshold: 0.7,
        }
    }

    pub fn with_amount_tolerance(mut self, tolerance: f64) -> Self {
        self.amount_tolerance = tolerance;
        self
    }

    /// Find a PO by reference, tolerating format variations like
    /// `PO-2024-001`, `PO2024001`, `P.O. 2024-001`.
    pub async fn find_po(&self, reference: &str) -> ProcessingResult<Option<PurchaseOrder>> {
        if reference.is_empty() {
            return Ok(None);
        }

        let normalized = normalize_po_number(reference);
        if let Some(po) = self.repo.get(&normalized).await? {
            return Ok(Some(po));
        }
        if let Some(po) = self.repo.get(reference).await? {
            return Ok(Some(po));
        }

        let mut best: Option<(f64, PurchaseOrder)> = None;
        for po in self.repo.all().await? {
            let score = similarity_ratio(&normalized, &normalize_po_number(&po.po_number));
            if score >= 0.8 && best.as_ref().is_none_or(|(s, _)| score > *s) {
                best = Some((score, po));
            }
        }
        Ok(best.map(|(_, po)| po))
    }

    /// Match an invoice to its purchase order.
    pub async fn match_invoice(&self, invoice: &Invoice) -> ProcessingResult<MatchResult> {
        let po_reference = invoice.po_number.as_deref().unwrap_or("").trim();

        if po_reference.is_empty() {
            return Ok(MatchResult::lookup_failure(
                &invoice.id,
                "",
                MatchStatus::NoPo,
                "No PO reference found on invoice".to_string(),
            ));
        }

        let Some(po) = self.find_po(po_reference).await? else {
            return Ok(MatchResult::lookup_failure(
                &invoice.id,
                po_reference,
                MatchStatus::PoNotFound,
                format!("PO '{po_reference}' not found in system"),
            ));
        };

        let header_variances = self.compare_headers(invoice, &po);

        let (line_matches, unmatched_invoice_lines, unmatched_po_lines) =
            self.match_line_items(invoice, &po);

        let mut total_variance_amount: Decimal = header_variances
            .iter()
            .filter_map(|v| v.difference)
            .map(|d| d.abs())
            .sum();
        for m in &line_matches {
            total_variance_amount += m
                .variances
                .iter()
                .filter_map(|v| v.difference)
                .map(|d| d.abs())
                .sum::<Decimal>();
        }

        let has_critical = header_variances
            .iter()
            .any(|v| v.severity == Severity::Critical);
        let fully_matched = unmatched_invoice_lines.is_empty()
            && unmatched_po_lines.is_empty()
            && line_matches.iter().all(|m| m.status == LineMatchStatus::Matched)
            && header_variances.is_empty();

        let status = if has_critical {
            MatchStatus::Mismatch
        } else if fully_matched {
            MatchStatus::Matched
        } else {
            MatchStatus::Partial
        };

        let overall_confidence = self.confidence(
            &header_variances,
            &line_matches,
            invoice.line_items.len(),
            po.line_items.len(),
        );

        let recommendation = recommendation(
            status,
            overall_confidence,
            &header_variances,
            &line_matches,
            total_variance_amount,
        );

        info!(
            invoice_id = %invoice.id,
            po_number = %po.po_number,
            status = ?status,
            confidence = overall_confidence,
            variance = %total_variance_amount,
            "PO matching completed"
        );

        Ok(MatchResult {
            invoice_id: invoice.id.clone(),
            po_number: po.po_number.clone(),
            status,
            overall_confidence,
            header_variances,
            line_matches,
            unmatched_invoice_lines,
            unmatched_po_lines,
            total_variance_amount,
            matched_at: Utc::now(),
            recommendation,
        })
    }

    fn compare_headers(&self, invoice: &Invoice, po: &PurchaseOrder) -> Vec<Variance> {
        let mut variances = Vec::new();

        if let Some(inv_vendor) = invoice.vendor_name.as_deref().filter(|v| !v.is_empty()) {
            if !po.vendor_name.is_empty() {
                let similarity = similarity_ratio(inv_vendor, &po.vendor_name);
                if similarity < 0.9 {
                    variances.push(Variance {
                        kind: VarianceKind::Vendor,
                        field: "vendor_name".into(),
                        invoice_value: serde_json::json!(inv_vendor),
                        po_value: serde_json::json!(po.vendor_name),
                        difference: None,
                        percentage: None,
                        severity: if similarity > 0.7 {
                            Severity::Warning
                        } else {
                            Severity::Critical
                        },
                        message: format!(
                            "Vendor name mismatch ({:.0}% similar)",
                            similarity * 100.0
                        ),
                    });
                }
            }
        }

        if invoice.total_amount > Decimal::ZERO && po.total_amount > Decimal::ZERO {
            let diff = invoice.total_amount - po.total_amount;
            let pct = (diff.abs() / po.total_amount).to_f64().unwrap_or(0.0);
            if pct > self.amount_tolerance {
                variances.push(Variance {
                    kind: VarianceKind::Amount,
                    field: "total_amount".into(),
                    invoice_value: serde_json::json!(invoice.total_amount.to_f64()),
                    po_value: serde_json::json!(po.total_amount.to_f64()),
                    difference: Some(diff),
                    percentage: Some(pct * 100.0),
                    severity: if pct > 0.10 {
                        Severity::Critical
                    } else {
                        Severity::Warning
                    },
                    message: format!("Total amount variance: {diff} ({:.1}%)", pct * 100.0),
                });
            }
        }

        let tax_diff = invoice.tax_amount - po.tax_amount;
        if tax_diff.abs() > Decimal::ONE {
            variances.push(Variance {
                kind: VarianceKind::Tax,
                field: "tax_amount".into(),
                invoice_value: serde_json::json!(invoice.tax_amount.to_f64()),
                po_value: serde_json::json!(po.tax_amount.to_f64()),
                difference: Some(tax_diff),
                percentage: None,
                severity: Severity::Info,
                message: format!("Tax variance: {tax_diff}"),
            });
        }

        if invoice.currency != po.currency {
            variances.push(Variance {
                kind: VarianceKind::Currency,
                field: "currency".into(),
                invoice_value: serde_json::json!(invoice.currency),
                po_value: serde_json::json!(po.currency),
                difference: None,
                percentage: None,
                severity: Severity::Critical,
                message: format!(
                    "Currency mismatch: invoice is {}, PO is {}",
                    invoice.currency, po.currency
                ),
            });
        }

        variances
    }

    /// Greedy best-first matching: each invoice line takes the most similar
    /// still-unclaimed PO line above the description threshold.
    fn match_line_items(
        &self,
        invoice: &Invoice,
        po: &PurchaseOrder,
    ) -> (Vec<LineItemMatch>, Vec<usize>, Vec<u32>) {
        let mut matches = Vec::new();
        let mut claimed: Vec<bool> = vec![false; po.line_items.len()];
        let mut unmatched_invoice = Vec::new();

        for (inv_idx, inv_line) in invoice.line_items.iter().enumerate() {
            let mut best: Option<(usize, f64)> = None;
            for (po_idx, po_line) in po.line_items.iter().enumerate() {
                if claimed[po_idx] {
                    continue;
                }
                let score = similarity_ratio(&inv_line.description, &po_line.description);
                if score >= self.description_threshold
                    && best.is_none_or(|(_, s)| score > s)
                {
                    best = Some((po_idx, score));
                }
            }

            match best {
                Some((po_idx, score)) => {
                    claimed[po_idx] = true;
                    let po_line = &po.line_items[po_idx];
                    let variances = self.compare_line(inv_line, po_line);
                    let status = if variances.is_empty() {
                        LineMatchStatus::Matched
                    } else if variances.iter().all(|v| v.severity == Severity::Info) {
                        LineMatchStatus::Partial
                    } else {
                        LineMatchStatus::Mismatch
                    };
                    matches.push(LineItemMatch {
                        invoice_line: inv_idx + 1,
                        po_line: po_line.line_number,
                        confidence: score,
                        variances,
                        status,
                    });
                }
                None => unmatched_invoice.push(inv_idx + 1),
            }
        }

        let unmatched_po = po
            .line_items
            .iter()
            .enumerate()
            .filter(|(idx, _)| !claimed[*idx])
            .map(|(_, line)| line.line_number)
            .collect();

        (matches, unmatched_invoice, unmatched_po)
    }

    fn compare_line(
        &self,
        inv_line: &crate::models::LineItem,
        po_line: &PoLineItem,
    ) -> Vec<Variance> {
        let mut variances = Vec::new();

        if inv_line.quantity > Decimal::ZERO && po_line.quantity > Decimal::ZERO {
            let diff = inv_line.quantity - po_line.quantity;
            let pct = (diff.abs() / po_line.quantity).to_f64().unwrap_or(0.0);
            if pct > self.quantity_tolerance {
                variances.push(Variance {
                    kind: VarianceKind::Quantity,
                    field: "quantity".into(),
                    invoice_value: serde_json::json!(inv_line.quantity.to_f64()),
                    po_value: serde_json::json!(po_line.quantity.to_f64()),
                    difference: Some(diff),
                    percentage: Some(pct * 100.0),
                    severity: Severity::Warning,
                    message: format!("Quantity variance: {diff}"),
                });
            }
        }

        if inv_line.unit_price > Decimal::ZERO && po_line.unit_price > Decimal::ZERO {
            let diff = inv_line.unit_price - po_line.unit_price;
            let pct = (diff.abs() / po_line.unit_price).to_f64().unwrap_or(0.0);
            if pct > self.price_tolerance {
                variances.push(Variance {
                    kind: VarianceKind::Price,
                    field: "unit_price".into(),
                    invoice_value: serde_json::json!(inv_line.unit_price.to_f64()),
                    po_value: serde_json::json!(po_line.unit_price.to_f64()),
                    difference: Some(diff),
                    percentage: Some(pct * 100.0),
                    severity: if pct < 0.10 {
                        Severity::Warning
                    } else {
                        Severity::Critical
                    },
                    message: format!("Price variance: {diff}"),
                });
            }
        }

        variances
    }

    fn confidence(
        &self,
        header_variances: &[Variance],
        line_matches: &[LineItemMatch],
        invoice_line_count: usize,
        po_line_count: usize,
    ) -> f64 {
        let mut score: f64 = 1.0;

        for v in header_variances {
            score -= match v.severity {
                Severity::Critical => 0.3,
                Severity::Warning => 0.1,
                Severity::Info => 0.0,
            };
        }

        if invoice_line_count > 0 {
            let matched = line_matches
                .iter()
                .filter(|m| m.status == LineMatchStatus::Matched)
                .count();
            let line_score = matched as f64 / invoice_line_count.max(po_line_count) as f64;
            score = score.min(line_score + 0.3);
        }

        score.clamp(0.0, 1.0)
    }
}

fn recommendation(
    status: MatchStatus,
    confidence: f64,
    header_variances: &[Variance],
    line_matches: &[LineItemMatch],
    total_variance: Decimal,
) -> String {
    match status {
        MatchStatus::Matched if confidence > 0.9 => {
            "Invoice matches PO. Ready for automatic approval.".to_string()
        }
        MatchStatus::Matched => {
            "Invoice matches PO with minor variances. Review recommended.".to_string()
        }
        MatchStatus::Partial => {
            let mut issues = Vec::new();
            if header_variances
                .iter()
                .any(|v| v.severity == Severity::Warning)
            {
                issues.push("header field variances");
            }
            if line_matches
                .iter()
                .any(|m| m.status != LineMatchStatus::Matched)
            {
                issues.push("line item discrepancies");
            }
            if issues.is_empty() {
                issues.push("unmatched line items");
            }
            format!(
                "Partial match detected: {}. Manual review required.",
                issues.join(", ")
            )
        }
        MatchStatus::Mismatch => {
            match header_variances
                .iter()
                .find(|v| v.severity == Severity::Critical)
            {
                Some(critical) => {
                    format!("Critical mismatch: {}. Approval blocked.", critical.message)
                }
                None => format!(
                    "Significant variance ({total_variance}). Escalation recommended."
                ),
            }
        }
        MatchStatus::NoPo => "No PO reference found on invoice".to_string(),
        MatchStatus::PoNotFound => "Unable to verify. Manual review required.".to_string(),
    }
}
