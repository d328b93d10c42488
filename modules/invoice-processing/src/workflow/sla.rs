//! SLA tracking and escalation for invoice processing stages.
//!
//! Status is recomputed on every query, never on a timer: a record is
//! BREACHED once its deadline passes and WARNING once 75% (configurable) of
//! its budget has elapsed. The escalation ladder is monotone; a record's
//! level never goes back down.
//!
//! Methods come in pairs: the plain form evaluates at `Utc::now()`, the
//! `*_at` form at an explicit instant, which is what deterministic tests use.

use crate::models::{EscalationLevel, SlaStatus};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use tracing::{info, warn};

/// Deadline and escalation timing configuration.
#[derive(Debug, Clone)]
pub struct SlaConfig {
    pub processing_hours: i64,
    pub review_hours: i64,
    pub approval_hours: i64,
    /// Fraction of the budget after which a record is in the warning zone.
    pub warning_threshold: f64,
    pub first_reminder_hours: i64,
    pub manager_escalation_hours: i64,
    pub director_escalation_hours: i64,
    pub max_reminders: u32,
}

impl Default for SlaConfig {
    fn default() -> Self {
        Self {
            processing_hours: 24,
            review_hours: 48,
            approval_hours: 72,
            warning_threshold: 0.75,
            first_reminder_hours: 4,
            manager_escalation_hours: 8,
            director_escalation_hours: 24,
            max_reminders: 3,
        }
    }
}

/// Processing stage an SLA record tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlaStage {
    Processing,
    Review,
    Approval,
}

impl fmt::Display for SlaStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Processing => "processing",
            Self::Review => "review",
            Self::Approval => "approval",
        };
        f.write_str(s)
    }
}

/// SLA tracking record for one invoice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaRecord {
    pub invoice_id: String,
    pub stage: SlaStage,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub status: SlaStatus,
    pub current_escalation: EscalationLevel,
    pub reminder_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_reminder_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breached_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationKind {
    Reminder,
    Escalate,
}

/// A single new escalation step produced by [`SlaManager::next_escalation`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationAction {
    pub invoice_id: String,
    pub kind: EscalationKind,
    pub level: EscalationLevel,
    pub reason: String,
}

/// Metrics returned when an SLA completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaCompletion {
    pub invoice_id: String,
    pub processing_time_hours: f64,
    pub was_breached: bool,
    pub final_escalation_level: EscalationLevel,
    pub reminder_count: u32,
}

/// Aggregate SLA counters for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct SlaStats {
    pub total_active: usize,
    pub on_track: usize,
    pub warning: usize,
    pub breached: usize,
    pub compliance_rate: f64,
}

/// Tracks per-invoice deadlines and drives the escalation ladder.
pub struct SlaManager {
    config: SlaConfig,
    records: Mutex<HashMap<String, SlaRecord>>,
}

impl SlaManager {
    pub fn new(config: SlaConfig) -> Self {
        Self {
            config,
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SlaConfig {
        &self.config
    }

    pub fn create(
        &self,
        invoice_id: &str,
        stage: SlaStage,
        assigned_to: Option<&str>,
    ) -> SlaRecord {
        self.create_at(invoice_id, stage, assigned_to, Utc::now())
    }

    pub fn create_at(
        &self,
        invoice_id: &str,
        stage: SlaStage,
        assigned_to: Option<&str>,
        now: DateTime<Utc>,
    ) -> SlaRecord {
        let hours = match stage {
            SlaStage::Processing => self.config.processing_hours,
            SlaStage::Review => self.config.review_hours,
            SlaStage::Approval => self.config.approval_hours,
        };
        let record = SlaRecord {
            invoice_id: invoice_id.to_string(),
            stage,
            created_at: now,
            deadline: now + Duration::hours(hours),
            status: SlaStatus::OnTrack,
            current_escalation: EscalationLevel::None,
            reminder_count: 0,
            last_reminder_at: None,
            breached_at: None,
            assigned_to: assigned_to.map(str::to_string),
        };

        let mut records = self.records.lock().unwrap();
        records.insert(invoice_id.to_string(), record.clone());

        info!(
            invoice_id,
            stage = %stage,
            deadline = %record.deadline,
            "SLA created"
        );
        record
    }

    /// Recompute and return the record's status.
    pub fn check(&self, invoice_id: &str) -> Option<SlaRecord> {
        self.check_at(invoice_id, Utc::now())
    }

    pub fn check_at(&self, invoice_id: &str, now: DateTime<Utc>) -> Option<SlaRecord> {
        let mut records = self.records.lock().unwrap();
        let record = records.get_mut(invoice_id)?;
        Self::refresh_status(record, now, self.config.warning_threshold);
        Some(record.clone())
    }

    fn refresh_status(record: &mut SlaRecord, now: DateTime<Utc>, warning_threshold: f64) {
        let total_secs = (record.deadline - record.created_at).num_seconds() as f64;
        let remaining_secs = (record.deadline - now).num_seconds() as f64;

        if remaining_secs <= 0.0 {
            if record.status != SlaStatus::Breached {
                record.status = SlaStatus::Breached;
                record.breached_at = Some(now);
                warn!(invoice_id = %record.invoice_id, "SLA breached");
            }
        } else if remaining_secs <= total_secs * (1.0 - warning_threshold)
            && record.status == SlaStatus::OnTrack
        {
            record.status = SlaStatus::Warning;
            info!(invoice_id = %record.invoice_id, "SLA warning");
        }
    }

    /// Return at most one new escalation step. Monotone: the returned level
    /// is never below the record's current escalation level.
    pub fn next_escalation(&self, invoice_id: &str) -> Option<EscalationAction> {
        self.next_escalation_at(invoice_id, Utc::now())
    }

    pub fn next_escalation_at(
        &self,
        invoice_id: &str,
        now: DateTime<Utc>,
    ) -> Option<EscalationAction> {
        let mut records = self.records.lock().unwrap();
        let record = records.get_mut(invoice_id)?;
        Self::refresh_status(record, now, self.config.warning_threshold);

        let elapsed_hours = (now - record.created_at).num_seconds() as f64 / 3600.0;

        if record.status == SlaStatus::Breached
            && record.current_escalation < EscalationLevel::Executive
        {
            record.current_escalation = EscalationLevel::Executive;
            return Some(EscalationAction {
                invoice_id: invoice_id.to_string(),
                kind: EscalationKind::Escalate,
                level: EscalationLevel::Executive,
                reason: "deadline breached".to_string(),
            });
        }

        if elapsed_hours >= self.config.director_escalation_hours as f64
            && record.current_escalation < EscalationLevel::Director
        {
            record.current_escalation = EscalationLevel::Director;
            return Some(EscalationAction {
                invoice_id: invoice_id.to_string(),
                kind: EscalationKind::Escalate,
                level: EscalationLevel::Director,
                reason: format!("{elapsed_hours:.0}h elapsed without a decision"),
            });
        }

        if elapsed_hours >= self.config.manager_escalation_hours as f64
            && record.current_escalation < EscalationLevel::Manager
        {
            record.current_escalation = EscalationLevel::Manager;
            return Some(EscalationAction {
                invoice_id: invoice_id.to_string(),
                kind: EscalationKind::Escalate,
                level: EscalationLevel::Manager,
                reason: format!("{elapsed_hours:.0}h elapsed without a decision"),
            });
        }

        if elapsed_hours >= self.config.first_reminder_hours as f64
            && record.current_escalation <= EscalationLevel::Reminder
            && record.reminder_count < self.config.max_reminders
        {
            record.current_escalation = EscalationLevel::Reminder;
            record.reminder_count += 1;
            record.last_reminder_at = Some(now);
            return Some(EscalationAction {
                invoice_id: invoice_id.to_string(),
                kind: EscalationKind::Reminder,
                level: EscalationLevel::Reminder,
                reason: format!("reminder {} of {}", record.reminder_count, self.config.max_reminders),
            });
        }

        None
    }

    /// Remove the record and return completion metrics.
    pub fn complete(&self, invoice_id: &str) -> Option<SlaCompletion> {
        self.complete_at(invoice_id, Utc::now())
    }

    pub fn complete_at(&self, invoice_id: &str, now: DateTime<Utc>) -> Option<SlaCompletion> {
        let mut records = self.records.lock().unwrap();
        let record = records.remove(invoice_id)?;

        Some(SlaCompletion {
            invoice_id: invoice_id.to_string(),
            processing_time_hours: (now - record.created_at).num_seconds() as f64 / 3600.0,
            was_breached: record.status == SlaStatus::Breached,
            final_escalation_level: record.current_escalation,
            reminder_count: record.reminder_count,
        })
    }

    /// Records in the warning or breached zone, most urgent first.
    pub fn all_at_risk(&self) -> Vec<SlaRecord> {
        self.all_at_risk_at(Utc::now())
    }

    pub fn all_at_risk_at(&self, now: DateTime<Utc>) -> Vec<SlaRecord> {
        let mut records = self.records.lock().unwrap();
        let mut at_risk: Vec<SlaRecord> = records
            .values_mut()
            .map(|r| {
                Self::refresh_status(r, now, self.config.warning_threshold);
                r.clone()
            })
            .filter(|r| matches!(r.status, SlaStatus::Warning | SlaStatus::Breached))
            .collect();
        at_risk.sort_by(|a, b| a.deadline.cmp(&b.deadline));
        at_risk
    }

    pub fn stats(&self) -> SlaStats {
        self.stats_at(Utc::now())
    }

    pub fn stats_at(&self, now: DateTime<Utc>) -> SlaStats {
        let mut records = self.records.lock().unwrap();
        for record in records.values_mut() {
            Self::refresh_status(record, now, self.config.warning_threshold);
        }

        let total = records.len();
        let on_track = records
            .values()
            .filter(|r| r.status == SlaStatus::OnTrack)
            .count();
        let warning = records
            .values()
            .filter(|r| r.status == SlaStatus::Warning)
            .count();
        let breached = records
            .values()
            .filter(|r| r.status == SlaStatus::Breached)
            .count();

        SlaStats {
            total_active: total,
            on_track,
            warning,
            breached,
            compliance_rate: if total == 0 {
                1.0
            } else {
                on_track as f64 / total as f64
            },
        }
    }
}

impl Default for SlaManager {
    fn default() -> Self {
        Self::new(SlaConfig::default())
    }
}
