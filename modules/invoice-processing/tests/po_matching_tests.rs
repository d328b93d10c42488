//! PO matcher behavior: lookup normalization, header and line variances,
//! status classification, and confidence.

use chrono::{NaiveDate, Utc};
use invoice_processing::models::{Invoice, InvoiceState, LineItem};
use invoice_processing::repos::{InMemoryPurchaseOrderRepo, PurchaseOrderRepo};
use invoice_processing::services::po_matcher::{
    normalize_po_number, LineMatchStatus, MatchStatus, PoLineItem, PoMatcher, PoStatus,
    PurchaseOrder, Severity,
};
use rust_decimal::Decimal;
use std::sync::Arc;

fn dec(n: i64) -> Decimal {
    Decimal::new(n, 0)
}

fn acme_po() -> PurchaseOrder {
    PurchaseOrder {
        po_number: "PO-2024-001".into(),
        vendor_id: "v-001".into(),
        vendor_name: "Acme Corporation".into(),
        order_date: NaiveDate::from_ymd_opt(2026, 7, 1).unwrap(),
        currency: "USD".into(),
        subtotal: dec(10_500),
        tax_amount: dec(1_680),
        total_amount: dec(12_180),
        line_items: vec![
            PoLineItem {
                line_number: 1,
                description: "Software License - Enterprise".into(),
                quantity: dec(1),
                unit_price: dec(8_000),
                total: dec(8_000),
                sku: None,
            },
            PoLineItem {
                line_number: 2,
                description: "Implementation Services".into(),
                quantity: dec(10),
                unit_price: dec(150),
                total: dec(1_500),
                sku: None,
            },
            PoLineItem {
                line_number: 3,
                description: "Training Hours".into(),
                quantity: dec(5),
                unit_price: dec(200),
                total: dec(1_000),
                sku: None,
            },
        ],
        status: PoStatus::Open,
    }
}

fn invoice_for(po_ref: Option<&str>, total: Decimal, lines: Vec<LineItem>) -> Invoice {
    Invoice {
        id: "inv-1".into(),
        document_id: "doc-1".into(),
        tenant_id: "t1".into(),
        state: InvoiceState::Extracted,
        vendor_id: Some("v-001".into()),
        vendor_name: Some("Acme Corporation".into()),
        vendor_address: None,
        invoice_number: Some("INV-100".into()),
        invoice_date: None,
        due_date: None,
        currency: "USD".into(),
        subtotal: total - dec(1_680),
        tax_amount: dec(1_680),
        total_amount: total,
        line_items: lines,
        po_number: po_ref.map(str::to_string),
        payment_terms: None,
        risk_score: 0.0,
        risk_level: None,
        anomalies: Vec::new(),
        extraction_confidence: 0.9,
        requires_review: false,
        content_hash: String::new(),
        source_filename: "scan.pdf".into(),
        source_size: 1024,
        storage_path: "t1/2026/08/01/doc-1.pdf".into(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
        created_by: "u1".into(),
    }
}

fn matching_lines() -> Vec<LineItem> {
    vec![
        LineItem {
            description: "Software License - Enterprise".into(),
            quantity: dec(1),
            unit_price: dec(8_000),
            line_total: dec(8_000),
            tax_rate: None,
        },
        LineItem {
            description: "Implementation Services".into(),
            quantity: dec(10),
            unit_price: dec(150),
            line_total: dec(1_500),
            tax_rate: None,
        },
        LineItem {
            description: "Training Hours".into(),
            quantity: dec(5),
            unit_price: dec(200),
            line_total: dec(1_000),
            tax_rate: None,
        },
    ]
}

async fn matcher_with_acme() -> PoMatcher {
    let repo = Arc::new(InMemoryPurchaseOrderRepo::new());
    repo.insert(acme_po()).await.unwrap();
    PoMatcher::new(repo)
}

#[test]
fn po_number_normalization() {
    assert_eq!(normalize_po_number("PO-2024-001"), "PO-2024-001");
    assert_eq!(normalize_po_number("po-2024-001"), "PO-2024-001");
    assert_eq!(normalize_po_number("P.O. 2024-001"), "PO-2024-001");
    assert_eq!(normalize_po_number("Purchase Order #2024-001"), "PO-2024-001");
    assert_eq!(normalize_po_number("PO 2024 001"), "PO-2024001");
}

#[tokio::test]
async fn finds_po_despite_format_variations() {
    let matcher = matcher_with_acme().await;

    for reference in ["PO-2024-001", "po-2024-001", "P.O. 2024-001", "PO2024001"] {
        let found = matcher.find_po(reference).await.unwrap();
        assert!(found.is_some(), "should find PO via {reference:?}");
    }
    assert!(matcher.find_po("PO-9999-999").await.unwrap().is_none());
}

#[tokio::test]
async fn perfect_match_is_ready_for_approval() {
    let matcher = matcher_with_acme().await;
    let invoice = invoice_for(Some("PO-2024-001"), dec(12_180), matching_lines());

    let result = matcher.match_invoice(&invoice).await.unwrap();
    assert_eq!(result.status, MatchStatus::Matched);
    assert!(result.header_variances.is_empty());
    assert_eq!(result.line_matches.len(), 3);
    assert!(result
        .line_matches
        .iter()
        .all(|m| m.status == LineMatchStatus::Matched));
    assert!(result.overall_confidence > 0.9);
    assert_eq!(result.total_variance_amount, Decimal::ZERO);
    assert!(result.recommendation.contains("automatic approval"));
}

#[tokio::test]
async fn missing_po_reference() {
    let matcher = matcher_with_acme().await;
    let invoice = invoice_for(None, dec(12_180), matching_lines());

    let result = matcher.match_invoice(&invoice).await.unwrap();
    assert_eq!(result.status, MatchStatus::NoPo);
    assert_eq!(result.overall_confidence, 0.0);
}

#[tokio::test]
async fn unknown_po_reference() {
    let matcher = matcher_with_acme().await;
    let invoice = invoice_for(Some("PO-1900-404"), dec(12_180), matching_lines());

    let result = matcher.match_invoice(&invoice).await.unwrap();
    assert_eq!(result.status, MatchStatus::PoNotFound);
    assert_eq!(result.po_number, "PO-1900-404");
}

#[tokio::test]
async fn amount_variance_severity_scales_with_size() {
    let matcher = matcher_with_acme().await;

    // ~7% over: warning, partial match
    let slightly_over = invoice_for(Some("PO-2024-001"), dec(13_030), matching_lines());
    let result = matcher.match_invoice(&slightly_over).await.unwrap();
    let amount_variance = result
        .header_variances
        .iter()
        .find(|v| v.field == "total_amount")
        .expect("7% over tolerance");
    assert_eq!(amount_variance.severity, Severity::Warning);
    assert_eq!(result.status, MatchStatus::Partial);

    // ~15% over: critical, mismatch
    let way_over = invoice_for(Some("PO-2024-001"), dec(14_000), matching_lines());
    let result = matcher.match_invoice(&way_over).await.unwrap();
    let amount_variance = result
        .header_variances
        .iter()
        .find(|v| v.field == "total_amount")
        .unwrap();
    assert_eq!(amount_variance.severity, Severity::Critical);
    assert_eq!(result.status, MatchStatus::Mismatch);
    assert!(result.recommendation.contains("blocked"));
}

#[tokio::test]
async fn currency_mismatch_is_critical() {
    let matcher = matcher_with_acme().await;
    let mut invoice = invoice_for(Some("PO-2024-001"), dec(12_180), matching_lines());
    invoice.currency = "EUR".into();

    let result = matcher.match_invoice(&invoice).await.unwrap();
    assert_eq!(result.status, MatchStatus::Mismatch);
    assert!(result
        .header_variances
        .iter()
        .any(|v| v.field == "currency" && v.severity == Severity::Critical));
}

#[tokio::test]
async fn line_price_variance_is_flagged() {
    let matcher = matcher_with_acme().await;
    let mut lines = matching_lines();
    lines[1].unit_price = dec(160); // ~6.7% over the PO's 150

    let invoice = invoice_for(Some("PO-2024-001"), dec(12_180), lines);
    let result = matcher.match_invoice(&invoice).await.unwrap();

    let line = result
        .line_matches
        .iter()
        .find(|m| m.po_line == 2)
        .expect("line 2 still matches by description");
    assert_eq!(line.status, LineMatchStatus::Mismatch);
    assert!(line
        .variances
        .iter()
        .any(|v| v.field == "unit_price" && v.severity == Severity::Warning));
    assert_eq!(result.status, MatchStatus::Partial);
    assert_eq!(result.total_variance_amount, dec(10));
}

#[tokio::test]
async fn unmatched_lines_lower_confidence() {
    let matcher = matcher_with_acme().await;
    let lines = vec![LineItem {
        description: "Completely unrelated consulting".into(),
        quantity: dec(1),
        unit_price: dec(12_180),
        line_total: dec(12_180),
        tax_rate: None,
    }];

    let invoice = invoice_for(Some("PO-2024-001"), dec(12_180), lines);
    let result = matcher.match_invoice(&invoice).await.unwrap();

    assert_eq!(result.status, MatchStatus::Partial);
    assert_eq!(result.unmatched_invoice_lines, vec![1]);
    assert_eq!(result.unmatched_po_lines.len(), 3);
    assert!(
        result.overall_confidence <= 0.3,
        "no matched lines caps confidence at the floor offset"
    );
}

#[tokio::test]
async fn each_po_line_matches_at_most_once() {
    let matcher = matcher_with_acme().await;
    let mut lines = matching_lines();
    // Two invoice lines competing for the same PO line
    lines.push(LineItem {
        description: "Training Hours".into(),
        quantity: dec(5),
        unit_price: dec(200),
        line_total: dec(1_000),
        tax_rate: None,
    });

    let invoice = invoice_for(Some("PO-2024-001"), dec(12_180), lines);
    let result = matcher.match_invoice(&invoice).await.unwrap();

    let mut claimed: Vec<u32> = result.line_matches.iter().map(|m| m.po_line).collect();
    claimed.sort_unstable();
    claimed.dedup();
    assert_eq!(claimed.len(), result.line_matches.len());
    assert_eq!(result.unmatched_invoice_lines.len(), 1);
}
