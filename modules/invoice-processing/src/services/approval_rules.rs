//! Programmable approval routing rules.
//!
//! Rules are evaluated against a JSON record of the invoice (plus vendor
//! profile), so conditions can address nested fields with dotted paths like
//! `vendor.risk_level` without any reflection. Evaluation walks active rules
//! by descending priority and stops at the first matched rule that carries a
//! terminal action (`auto_approve` / `auto_reject`); non-terminal actions
//! aggregate across all matched rules.

use crate::error::{ProcessingError, ProcessingResult};
use crate::models::{Invoice, TaskPriority, VendorProfile};
use regex::Regex;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Comparison operators for rule conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleOperator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    GreaterOrEqual,
    LessOrEqual,
    Contains,
    InList,
    MatchesRegex,
}

/// Resolve a dotted path against a JSON record.
///
/// Returns `None` when any segment is missing or the intermediate value is
/// not an object; a failed resolution simply makes the condition false.
pub fn resolve<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = record;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn as_number(value: &Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// A single condition in a rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleCondition {
    /// Dotted field path, e.g. `total_amount` or `vendor.risk_level`.
    pub field: String,
    pub operator: RuleOperator,
    pub value: Value,
}

impl RuleCondition {
    pub fn new(field: &str, operator: RuleOperator, value: Value) -> Self {
        Self {
            field: field.to_string(),
            operator,
            value,
        }
    }

    pub fn evaluate(&self, record: &Value) -> bool {
        let Some(actual) = resolve(record, &self.field) else {
            return false;
        };

        match self.operator {
            RuleOperator::Equals => values_equal(actual, &self.value),
            RuleOperator::NotEquals => !values_equal(actual, &self.value),
            RuleOperator::GreaterThan => match (as_number(actual), as_number(&self.value)) {
                (Some(a), Some(b)) => a > b,
                _ => false,
            },
            RuleOperator::LessThan => match (as_number(actual), as_number(&self.value)) {
                (Some(a), Some(b)) => a < b,
                _ => false,
            },
            RuleOperator::GreaterOrEqual => match (as_number(actual), as_number(&self.value)) {
                (Some(a), Some(b)) => a >= b,
                _ => false,
            },
            RuleOperator::LessOrEqual => match (as_number(actual), as_number(&self.value)) {
                (Some(a), Some(b)) => a <= b,
                _ => false,
            },
            RuleOperator::Contains => match (actual.as_str(), self.value.as_str()) {
                (Some(haystack), Some(needle)) => {
                    haystack.to_lowercase().contains(&needle.to_lowercase())
                }
                _ => false,
            },
            RuleOperator::InList => self
                .value
                .as_array()
                .map(|list| list.iter().any(|v| values_equal(actual, v)))
                .unwrap_or(false),
            RuleOperator::MatchesRegex => {
                let (Some(text), Some(pattern)) = (actual.as_str(), self.value.as_str()) else {
                    return false;
                };
                match Regex::new(pattern) {
                    Ok(re) => re.is_match(text),
                    Err(e) => {
                        warn!(pattern, error = %e, "Invalid rule regex, condition is false");
                        false
                    }
                }
            }
        }
    }
}

/// Actions a matched rule emits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleAction {
    RequireApproval { level: String },
    AssignTo { actor: String },
    AutoApprove,
    AutoReject,
    Escalate { to: String },
    AddTag { tag: String },
    SetPriority { priority: TaskPriority },
    SendNotification,
}

impl RuleAction {
    /// Terminal actions short-circuit further rule evaluation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::AutoApprove | Self::AutoReject)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionLogic {
    #[serde(rename = "AND")]
    And,
    #[serde(rename = "OR")]
    Or,
}

fn default_logic() -> ConditionLogic {
    ConditionLogic::And
}

fn default_active() -> bool {
    true
}

/// A complete approval rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub conditions: Vec<RuleCondition>,
    #[serde(default = "default_logic")]
    pub condition_logic: ConditionLogic,
    pub actions: Vec<RuleAction>,
    /// Higher priority rules evaluate first.
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_active")]
    pub active: bool,
}

impl ApprovalRule {
    /// A rule with no conditions matches every invoice.
    pub fn matches(&self, record: &Value) -> bool {
        if self.conditions.is_empty() {
            return true;
        }
        match self.condition_logic {
            ConditionLogic::And => self.conditions.iter().all(|c| c.evaluate(record)),
            ConditionLogic::Or => self.conditions.iter().any(|c| c.evaluate(record)),
        }
    }
}

/// One action emitted during evaluation, tagged with its source rule.
#[derive(Debug, Clone, Serialize)]
pub struct TriggeredAction {
    pub rule_id: String,
    pub rule_name: String,
    pub action: RuleAction,
}

/// Engine for evaluating and applying approval rules.
pub struct ApprovalRulesEngine {
    rules: Mutex<HashMap<String, ApprovalRule>>,
}

impl ApprovalRulesEngine {
    /// An engine pre-loaded with the stock routing rules.
    pub fn new() -> Self {
        let engine = Self::empty();
        for rule in default_rules() {
            engine.add_rule(rule);
        }
        engine
    }

    pub fn empty() -> Self {
        Self {
            rules: Mutex::new(HashMap::new()),
        }
    }

    /// Add or replace a rule.
    pub fn add_rule(&self, rule: ApprovalRule) {
        info!(rule_id = %rule.id, name = %rule.name, "Rule added");
        let mut rules = self.rules.lock().unwrap();
        rules.insert(rule.id.clone(), rule);
    }

    pub fn remove_rule(&self, rule_id: &str) -> bool {
        let mut rules = self.rules.lock().unwrap();
        rules.remove(rule_id).is_some()
    }

    /// Load rules from a JSON document `{"rules": [...]}`; returns how many
    /// were added.
    pub fn load_rules_from_json(&self, json: &str) -> ProcessingResult<usize> {
        #[derive(Deserialize)]
        struct RuleFile {
            rules: Vec<ApprovalRule>,
        }

        let file: RuleFile = serde_json::from_str(json)
            .map_err(|e| ProcessingError::InvalidInput(format!("invalid rules document: {e}")))?;

        let count = file.rules.len();
        for rule in file.rules {
            self.add_rule(rule);
        }
        Ok(count)
    }

    /// Evaluate all active rules against the record.
    pub fn evaluate(&self, record: &Value) -> Vec<TriggeredAction> {
        let mut active: Vec<ApprovalRule> = {
            let rules = self.rules.lock().unwrap();
            rules.values().filter(|r| r.active).cloned().collect()
        };
        active.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));

        let mut triggered = Vec::new();
        for rule in active {
            if !rule.matches(record) {
                continue;
            }
            debug!(rule_id = %rule.id, rule_name = %rule.name, "Rule matched");

            let terminal = rule.actions.iter().any(RuleAction::is_terminal);
            for action in rule.actions {
                triggered.push(TriggeredAction {
                    rule_id: rule.id.clone(),
                    rule_name: rule.name.clone(),
                    action,
                });
            }
            if terminal {
                break;
            }
        }
        triggered
    }

    /// Required approver levels in rule order, deduplicated.
    pub fn required_approvers(&self, record: &Value) -> Vec<String> {
        let mut approvers = Vec::new();
        for triggered in self.evaluate(record) {
            if let RuleAction::RequireApproval { level } = triggered.action {
                if !approvers.contains(&level) {
                    approvers.push(level);
                }
            }
        }
        approvers
    }
}

impl Default for ApprovalRulesEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the JSON record the rules address. Monetary fields are plain
/// numbers here so numeric operators work without string coercion.
pub fn rules_record(invoice: &Invoice, vendor: Option<&VendorProfile>) -> Value {
    let mut record = serde_json::json!({
        "id": invoice.id,
        "tenant_id": invoice.tenant_id,
        "state": invoice.state,
        "invoice_number": invoice.invoice_number,
        "vendor_name": invoice.vendor_name,
        "po_number": invoice.po_number,
        "payment_terms": invoice.payment_terms,
        "currency": invoice.currency,
        "subtotal": invoice.subtotal.to_f64(),
        "tax_amount": invoice.tax_amount.to_f64(),
        "total_amount": invoice.total_amount.to_f64(),
        "line_count": invoice.line_items.len(),
        "risk_score": invoice.risk_score,
        "risk_level": invoice.risk_level,
        "anomalies": invoice.anomalies,
        "requires_review": invoice.requires_review,
        "extraction_confidence": invoice.extraction_confidence,
    });

    if let Some(vendor) = vendor {
        record["vendor"] = serde_json::json!({
            "id": vendor.vendor_id,
            "name": vendor.vendor_name,
            "risk_level": vendor.risk_level,
            "is_verified": vendor.is_verified,
            "total_invoices": vendor.statistics.total_invoices,
            "average_amount": vendor.statistics.average_amount.to_f64(),
        });
    }

    record
}

/// Stock routing rules: tiered amount approval, auto-approval for small
/// verified-vendor invoices, and high-risk vendor escalation.
pub fn default_rules() -> Vec<ApprovalRule> {
    vec![
        ApprovalRule {
            id: "high_risk_vendor".into(),
            name: "High risk vendor escalation".into(),
            description: "Escalate invoices from high-risk vendors".into(),
            conditions: vec![RuleCondition::new(
                "vendor.risk_level",
                RuleOperator::Equals,
                serde_json::json!("high"),
            )],
            condition_logic: ConditionLogic::And,
            actions: vec![
                RuleAction::Escalate {
                    to: "finance_manager".into(),
                },
                RuleAction::AddTag {
                    tag: "high_risk_vendor".into(),
                },
            ],
            priority: 150,
            active: true,
        },
        ApprovalRule {
            id: "auto_approve_low".into(),
            name: "Auto-approve small amounts".into(),
            description: "Auto-approve invoices under 500 from verified vendors".into(),
            conditions: vec![
                RuleCondition::new(
                    "total_amount",
                    RuleOperator::LessThan,
                    serde_json::json!(500),
                ),
                RuleCondition::new(
                    "vendor.is_verified",
                    RuleOperator::Equals,
                    serde_json::json!(true),
                ),
            ],
            condition_logic: ConditionLogic::And,
            actions: vec![RuleAction::AutoApprove],
            priority: 100,
            active: true,
        },
        ApprovalRule {
            id: "manager_approval".into(),
            name: "Manager approval required".into(),
            description: "Require manager approval for amounts 500-5000".into(),
            conditions: vec![
                RuleCondition::new(
                    "total_amount",
                    RuleOperator::GreaterOrEqual,
                    serde_json::json!(500),
                ),
                RuleCondition::new(
                    "total_amount",
                    RuleOperator::LessThan,
                    serde_json::json!(5000),
                ),
            ],
            condition_logic: ConditionLogic::And,
            actions: vec![RuleAction::RequireApproval {
                level: "manager".into(),
            }],
            priority: 90,
            active: true,
        },
        ApprovalRule {
            id: "director_approval".into(),
            name: "Director approval required".into(),
            description: "Require director approval for amounts 5000-25000".into(),
            conditions: vec![
                RuleCondition::new(
                    "total_amount",
                    RuleOperator::GreaterOrEqual,
                    serde_json::json!(5000),
                ),
                RuleCondition::new(
                    "total_amount",
                    RuleOperator::LessThan,
                    serde_json::json!(25000),
                ),
            ],
            condition_logic: ConditionLogic::And,
            actions: vec![RuleAction::RequireApproval {
                level: "director".into(),
            }],
            priority: 80,
            active: true,
        },
        ApprovalRule {
            id: "executive_approval".into(),
            name: "Executive approval required".into(),
            description: "Require VP/CFO approval for amounts over 25000".into(),
            conditions: vec![RuleCondition::new(
                "total_amount",
                RuleOperator::GreaterOrEqual,
                serde_json::json!(25000),
            )],
            condition_logic: ConditionLogic::And,
            actions: vec![
                RuleAction::RequireApproval {
                    level: "executive".into(),
                },
                RuleAction::SetPriority {
                    priority: TaskPriority::High,
                },
            ],
            priority: 70,
            active: true,
        },
    ]
}
