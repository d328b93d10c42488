//! Approval task storage.
//!
//! Two invariants are enforced here rather than left to callers: at most one
//! pending task per invoice, and terminal task statuses are immutable.

use crate::error::{ProcessingError, ProcessingResult};
use crate::models::{ApprovalTask, TaskStatus};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

#[async_trait]
pub trait ApprovalTaskRepo: Send + Sync {
    async fn insert(&self, task: ApprovalTask) -> ProcessingResult<()>;
    async fn get(&self, task_id: &str) -> ProcessingResult<Option<ApprovalTask>>;
    async fn update(&self, task: ApprovalTask) -> ProcessingResult<()>;
    async fn pending_for_invoice(&self, invoice_id: &str) -> ProcessingResult<Option<ApprovalTask>>;
    async fn list_for_invoice(&self, invoice_id: &str) -> ProcessingResult<Vec<ApprovalTask>>;
}

#[derive(Default)]
pub struct InMemoryApprovalTaskRepo {
    rows: Mutex<HashMap<String, ApprovalTask>>,
}

impl InMemoryApprovalTaskRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ApprovalTaskRepo for InMemoryApprovalTaskRepo {
    async fn insert(&self, task: ApprovalTask) -> ProcessingResult<()> {
        let mut rows = self.rows.lock().unwrap();
        if rows.contains_key(&task.id) {
            return Err(ProcessingError::Integrity(format!(
                "approval task {} already exists",
                task.id
            )));
        }
        if task.status == TaskStatus::Pending
            && rows
                .values()
                .any(|t| t.invoice_id == task.invoice_id && t.status == TaskStatus::Pending)
        {
            return Err(ProcessingError::Integrity(format!(
                "invoice {} already has a pending approval task",
                task.invoice_id
            )));
        }
        rows.insert(task.id.clone(), task);
        Ok(())
    }

    async fn get(&self, task_id: &str) -> ProcessingResult<Option<ApprovalTask>> {
        let rows = self.rows.lock().unwrap();
        Ok(rows.get(task_id).cloned())
    }

    async fn update(&self, task: ApprovalTask) -> ProcessingResult<()> {
        let mut rows = self.rows.lock().unwrap();
        match rows.get_mut(&task.id) {
            Some(existing) => {
                if existing.status.is_terminal() {
                    return Err(ProcessingError::Integrity(format!(
                        "approval task {} is {:?} and cannot change",
                        task.id, existing.status
                    )));
                }
                *existing = task;
                Ok(())
            }
            None => Err(ProcessingError::NotFound(format!(
                "approval task {}",
                task.id
            ))),
        }
    }

    async fn pending_for_invoice(&self, invoice_id: &str) -> ProcessingResult<Option<ApprovalTask>> {
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .values()
            .find(|t| t.invoice_id == invoice_id && t.status == TaskStatus::Pending)
            .cloned())
    }

    async fn list_for_invoice(&self, invoice_id: &str) -> ProcessingResult<Vec<ApprovalTask>> {
        let rows = self.rows.lock().unwrap();
        let mut tasks: Vec<ApprovalTask> = rows
            .values()
            .filter(|t| t.invoice_id == invoice_id)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SlaStatus, TaskPriority};
    use chrono::Utc;

    fn task(id: &str, invoice_id: &str, status: TaskStatus) -> ApprovalTask {
        ApprovalTask {
            id: id.into(),
            invoice_id: invoice_id.into(),
            status,
            priority: TaskPriority::Normal,
            required_approvers: vec!["manager".into()],
            assigned_to: None,
            assigned_role: Some("manager".into()),
            due_date: Utc::now() + chrono::Duration::hours(48),
            sla_status: SlaStatus::OnTrack,
            action_taken: None,
            decided_by: None,
            decided_at: None,
            comments: None,
            delegated_to: None,
            summary: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn rejects_second_pending_task_for_same_invoice() {
        let repo = InMemoryApprovalTaskRepo::new();
        repo.insert(task("task-1", "inv-1", TaskStatus::Pending))
            .await
            .unwrap();

        let err = repo
            .insert(task("task-2", "inv-1", TaskStatus::Pending))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessingError::Integrity(_)));

        // A decided task frees the slot
        let mut decided = task("task-1", "inv-1", TaskStatus::Pending);
        decided.status = TaskStatus::Approved;
        repo.update(decided).await.unwrap();
        repo.insert(task("task-2", "inv-1", TaskStatus::Pending))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn terminal_tasks_are_immutable() {
        let repo = InMemoryApprovalTaskRepo::new();
        repo.insert(task("task-1", "inv-1", TaskStatus::Rejected))
            .await
            .unwrap();

        let mut tampered = task("task-1", "inv-1", TaskStatus::Approved);
        tampered.decided_by = Some("intruder".into());
        let err = repo.update(tampered).await.unwrap_err();
        assert!(matches!(err, ProcessingError::Integrity(_)));
    }

    #[tokio::test]
    async fn pending_lookup_finds_only_pending() {
        let repo = InMemoryApprovalTaskRepo::new();
        repo.insert(task("task-1", "inv-1", TaskStatus::Approved))
            .await
            .unwrap();
        repo.insert(task("task-2", "inv-1", TaskStatus::Pending))
            .await
            .unwrap();

        let pending = repo.pending_for_invoice("inv-1").await.unwrap().unwrap();
        assert_eq!(pending.id, "task-2");
        assert!(repo.pending_for_invoice("inv-2").await.unwrap().is_none());
    }
}
