//! Duplicate detector behavior across the three strategies.

use chrono::{Duration, Utc};
use invoice_processing::services::duplicate_detector::{
    content_hash, DuplicateCandidate, DuplicateDetector, DuplicateMatchType,
};
use rust_decimal::Decimal;

fn dec(n: i64, scale: u32) -> Decimal {
    Decimal::new(n, scale)
}

fn full_candidate(hash: &str, vendor: &str, number: &str, amount: Decimal) -> DuplicateCandidate {
    DuplicateCandidate {
        content_hash: hash.to_string(),
        vendor_name: Some(vendor.to_string()),
        vendor_id: None,
        invoice_number: Some(number.to_string()),
        amount: Some(amount),
    }
}

#[test]
fn exact_hash_match_has_full_confidence() {
    let detector = DuplicateDetector::default();
    let hash = content_hash(b"original scan bytes");

    let first = full_candidate(&hash, "Acme Corporation", "INV-100", dec(120_00, 2));
    detector.register("inv-1", "t1", &first);

    let matches = detector.check_all("t1", &first);
    let exact = matches
        .iter()
        .find(|m| m.match_type == DuplicateMatchType::ExactHash)
        .expect("same bytes must match");
    assert_eq!(exact.confidence, 1.0);
    assert_eq!(exact.original_id, "inv-1");
}

#[test]
fn tenants_are_isolated() {
    let detector = DuplicateDetector::default();
    let hash = content_hash(b"shared bytes");
    let candidate = full_candidate(&hash, "Acme", "INV-1", dec(100, 0));

    detector.register("inv-1", "tenant-a", &candidate);
    assert!(detector.check_all("tenant-b", &candidate).is_empty());
    assert!(!detector.check_all("tenant-a", &candidate).is_empty());
}

#[test]
fn vendor_and_invoice_number_match() {
    let detector = DuplicateDetector::default();
    let first = full_candidate(&content_hash(b"a"), "Acme Corporation", "INV-42", dec(500, 0));
    detector.register("inv-1", "t1", &first);

    // Different file, same vendor + number
    let resubmission = full_candidate(&content_hash(b"b"), "Acme Corporation", "INV-42", dec(990, 0));
    let matches = detector.check_all("t1", &resubmission);
    let vendor_match = matches
        .iter()
        .find(|m| m.match_type == DuplicateMatchType::VendorInvoiceNumber)
        .expect("same invoice number from same vendor");
    assert_eq!(vendor_match.confidence, 0.95);

    // A different invoice number stays quiet
    let other = full_candidate(&content_hash(b"c"), "Acme Corporation", "INV-43", dec(990, 0));
    assert!(detector
        .check_all("t1", &other)
        .iter()
        .all(|m| m.match_type != DuplicateMatchType::VendorInvoiceNumber));
}

#[test]
fn similar_amount_boundary_is_one_percent() {
    let detector = DuplicateDetector::default();
    let now = Utc::now();

    let first = full_candidate(&content_hash(b"x"), "CloudServices Ltd", "INV-1", dec(10_000_00, 2));
    detector.register_at("inv-1", "t1", &first, now);

    // 1.00% difference: 10000.00 vs 9900.00 → |diff|/max = 0.01
    let within = DuplicateCandidate {
        content_hash: content_hash(b"y"),
        vendor_name: Some("CloudServices Ltd".to_string()),
        amount: Some(dec(9_900_00, 2)),
        ..Default::default()
    };
    let matches = detector.check_all_at("t1", &within, now);
    assert!(
        matches
            .iter()
            .any(|m| m.match_type == DuplicateMatchType::SimilarAmount && m.confidence == 0.7),
        "a 1% difference is within tolerance"
    );

    // 1.01% difference stays quiet
    let outside = DuplicateCandidate {
        amount: Some(dec(9_899_00, 2)),
        ..within.clone()
    };
    assert!(detector
        .check_all_at("t1", &outside, now)
        .iter()
        .all(|m| m.match_type != DuplicateMatchType::SimilarAmount));
}

#[test]
fn similar_amount_window_expires() {
    let detector = DuplicateDetector::default();
    let now = Utc::now();

    let old = full_candidate(&content_hash(b"x"), "Acme", "INV-1", dec(5000, 0));
    detector.register_at("inv-1", "t1", &old, now - Duration::days(8));

    let candidate = DuplicateCandidate {
        content_hash: content_hash(b"y"),
        vendor_name: Some("Acme".to_string()),
        amount: Some(dec(5000, 0)),
        ..Default::default()
    };
    assert!(
        detector
            .check_all_at("t1", &candidate, now)
            .iter()
            .all(|m| m.match_type != DuplicateMatchType::SimilarAmount),
        "matches older than the window do not count"
    );

    detector.register_at("inv-2", "t1", &old, now - Duration::days(6));
    assert!(detector
        .check_all_at("t1", &candidate, now)
        .iter()
        .any(|m| m.match_type == DuplicateMatchType::SimilarAmount));
}

#[test]
fn results_sorted_by_confidence_descending() {
    let detector = DuplicateDetector::default();
    let hash = content_hash(b"bytes");
    let first = full_candidate(&hash, "Acme", "INV-9", dec(750, 0));
    detector.register("inv-1", "t1", &first);

    let matches = detector.check_all("t1", &first);
    assert!(matches.len() >= 2, "hash, vendor-number (and amount) all hit");
    for pair in matches.windows(2) {
        assert!(pair[0].confidence >= pair[1].confidence);
    }
    assert_eq!(matches[0].match_type, DuplicateMatchType::ExactHash);
}

#[test]
fn missing_fields_disable_strategies_without_errors() {
    let detector = DuplicateDetector::default();

    // Candidate with nothing but a hash: no vendor strategies, no panic
    let bare = DuplicateCandidate {
        content_hash: content_hash(b"only hash"),
        ..Default::default()
    };
    detector.register("inv-1", "t1", &bare);
    let matches = detector.check_all("t1", &bare);
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].match_type, DuplicateMatchType::ExactHash);

    // Zero amounts never participate in the similarity check
    let zero_amount = DuplicateCandidate {
        content_hash: String::new(),
        vendor_name: Some("Acme".to_string()),
        amount: Some(Decimal::ZERO),
        ..Default::default()
    };
    assert!(detector.check_all("t1", &zero_amount).is_empty());
}

#[test]
fn detection_disabled_fields_do_not_index() {
    let detector = DuplicateDetector::default();

    // Empty invoice number must not create a vendor-number entry
    let candidate = DuplicateCandidate {
        content_hash: content_hash(b"z"),
        vendor_name: Some("Acme".to_string()),
        invoice_number: Some(String::new()),
        amount: Some(dec(100, 0)),
        ..Default::default()
    };
    detector.register("inv-1", "t1", &candidate);

    let probe = DuplicateCandidate {
        content_hash: String::new(),
        vendor_name: Some("Acme".to_string()),
        invoice_number: Some(String::new()),
        amount: None,
        ..Default::default()
    };
    assert!(detector
        .check_all("t1", &probe)
        .iter()
        .all(|m| m.match_type != DuplicateMatchType::VendorInvoiceNumber));
}
