//! Rule engine behavior: operators, dotted-path resolution, priority order,
//! and terminal short-circuiting.

use invoice_processing::models::TaskPriority;
use invoice_processing::services::approval_rules::{
    resolve, ApprovalRule, ApprovalRulesEngine, ConditionLogic, RuleAction, RuleCondition,
    RuleOperator,
};
use serde_json::json;

fn record(total: f64, verified: bool, risk_level: &str) -> serde_json::Value {
    json!({
        "total_amount": total,
        "invoice_number": "INV-100",
        "vendor_name": "Acme Corporation",
        "vendor": {
            "name": "Acme Corporation",
            "is_verified": verified,
            "risk_level": risk_level,
        },
    })
}

#[test]
fn dotted_paths_resolve_nested_fields() {
    let r = record(450.0, true, "normal");
    assert_eq!(resolve(&r, "total_amount"), Some(&json!(450.0)));
    assert_eq!(resolve(&r, "vendor.is_verified"), Some(&json!(true)));
    assert_eq!(resolve(&r, "vendor.risk_level"), Some(&json!("normal")));
    assert_eq!(resolve(&r, "vendor.missing"), None);
    assert_eq!(resolve(&r, "total_amount.too_deep"), None);
}

#[test]
fn operators_cover_numbers_strings_and_lists() {
    let r = record(450.0, true, "high");

    let check = |field: &str, op: RuleOperator, value: serde_json::Value| {
        RuleCondition::new(field, op, value).evaluate(&r)
    };

    assert!(check("total_amount", RuleOperator::Equals, json!(450)));
    assert!(check("total_amount", RuleOperator::NotEquals, json!(451)));
    assert!(check("total_amount", RuleOperator::GreaterThan, json!(449.9)));
    assert!(check("total_amount", RuleOperator::LessThan, json!(500)));
    assert!(check("total_amount", RuleOperator::GreaterOrEqual, json!(450)));
    assert!(check("total_amount", RuleOperator::LessOrEqual, json!(450)));
    assert!(check("vendor_name", RuleOperator::Contains, json!("acme")));
    assert!(check(
        "vendor.risk_level",
        RuleOperator::InList,
        json!(["high", "critical"])
    ));
    assert!(check(
        "invoice_number",
        RuleOperator::MatchesRegex,
        json!("^INV-\\d+$")
    ));
    assert!(!check(
        "invoice_number",
        RuleOperator::MatchesRegex,
        json!("^PO-")
    ));
    // Missing field is simply false
    assert!(!check("no_such_field", RuleOperator::Equals, json!(1)));
}

#[test]
fn condition_logic_and_or() {
    let rule_and = ApprovalRule {
        id: "r1".into(),
        name: "and".into(),
        description: String::new(),
        conditions: vec![
            RuleCondition::new("total_amount", RuleOperator::GreaterThan, json!(100)),
            RuleCondition::new("vendor.is_verified", RuleOperator::Equals, json!(false)),
        ],
        condition_logic: ConditionLogic::And,
        actions: vec![RuleAction::SendNotification],
        priority: 0,
        active: true,
    };
    let mut rule_or = rule_and.clone();
    rule_or.condition_logic = ConditionLogic::Or;

    let r = record(450.0, true, "normal");
    assert!(!rule_and.matches(&r), "second condition fails under AND");
    assert!(rule_or.matches(&r), "first condition passes under OR");
}

#[test]
fn default_rules_auto_approve_small_verified_invoices() {
    let engine = ApprovalRulesEngine::new();

    let actions = engine.evaluate(&record(450.0, true, "normal"));
    assert!(actions
        .iter()
        .any(|a| a.action == RuleAction::AutoApprove));
    // Terminal action stops evaluation before the tier rules
    assert!(actions
        .iter()
        .all(|a| !matches!(a.action, RuleAction::RequireApproval { .. })));
}

#[test]
fn default_rules_route_by_amount_tier() {
    let engine = ApprovalRulesEngine::new();

    assert_eq!(
        engine.required_approvers(&record(4900.0, false, "normal")),
        vec!["manager".to_string()]
    );
    assert_eq!(
        engine.required_approvers(&record(12_000.0, false, "normal")),
        vec!["director".to_string()]
    );
    assert_eq!(
        engine.required_approvers(&record(40_000.0, false, "normal")),
        vec!["executive".to_string()]
    );
    // Small but unverified: no tier rule matches
    assert!(engine
        .required_approvers(&record(120.0, false, "normal"))
        .is_empty());
}

#[test]
fn high_risk_vendor_escalates_and_still_routes() {
    let engine = ApprovalRulesEngine::new();
    let actions = engine.evaluate(&record(4900.0, false, "high"));

    assert!(actions
        .iter()
        .any(|a| matches!(&a.action, RuleAction::Escalate { to } if to == "finance_manager")));
    assert!(actions
        .iter()
        .any(|a| matches!(&a.action, RuleAction::AddTag { tag } if tag == "high_risk_vendor")));
    // Non-terminal, so the manager tier still applies
    assert!(actions
        .iter()
        .any(|a| matches!(&a.action, RuleAction::RequireApproval { level } if level == "manager")));
}

#[test]
fn executive_tier_sets_priority() {
    let engine = ApprovalRulesEngine::new();
    let actions = engine.evaluate(&record(40_000.0, false, "normal"));
    assert!(actions.iter().any(|a| matches!(
        a.action,
        RuleAction::SetPriority {
            priority: TaskPriority::High
        }
    )));
}

#[test]
fn priority_order_and_terminal_short_circuit() {
    let engine = ApprovalRulesEngine::empty();
    engine.add_rule(ApprovalRule {
        id: "late".into(),
        name: "low priority tagger".into(),
        description: String::new(),
        conditions: Vec::new(),
        condition_logic: ConditionLogic::And,
        actions: vec![RuleAction::AddTag { tag: "late".into() }],
        priority: 1,
        active: true,
    });
    engine.add_rule(ApprovalRule {
        id: "early".into(),
        name: "terminal approver".into(),
        description: String::new(),
        conditions: Vec::new(),
        condition_logic: ConditionLogic::And,
        actions: vec![RuleAction::AutoApprove],
        priority: 10,
        active: true,
    });

    let actions = engine.evaluate(&json!({}));
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].rule_id, "early");
}

#[test]
fn inactive_rules_are_skipped() {
    let engine = ApprovalRulesEngine::empty();
    engine.add_rule(ApprovalRule {
        id: "off".into(),
        name: "disabled".into(),
        description: String::new(),
        conditions: Vec::new(),
        condition_logic: ConditionLogic::And,
        actions: vec![RuleAction::AutoReject],
        priority: 100,
        active: false,
    });

    assert!(engine.evaluate(&json!({})).is_empty());
    assert!(engine.remove_rule("off"));
    assert!(!engine.remove_rule("off"));
}

#[test]
fn rules_load_from_json_documents() {
    let engine = ApprovalRulesEngine::empty();
    let loaded = engine
        .load_rules_from_json(
            r#"{
                "rules": [{
                    "id": "weekend_block",
                    "name": "Block unusual invoices",
                    "conditions": [
                        {"field": "total_amount", "operator": "greater_than", "value": 100000}
                    ],
                    "condition_logic": "AND",
                    "actions": [{"type": "auto_reject"}],
                    "priority": 200
                }]
            }"#,
        )
        .unwrap();
    assert_eq!(loaded, 1);

    let actions = engine.evaluate(&json!({"total_amount": 250000}));
    assert!(actions.iter().any(|a| a.action == RuleAction::AutoReject));

    assert!(engine.load_rules_from_json("not json").is_err());
}
