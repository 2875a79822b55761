//! 工作列表管理
//!
//! 放射科工作项的创建、查询、完成与取消。任务以关联ID为主键，
//! 重复投递的 `ExaminationRequested` 不会产生第二个任务；
//! 所有状态变更都是“状态匹配才写入”的条件更新。

use crate::state_machine::{TaskEvent, TaskStateMachine};
use async_trait::async_trait;
use chrono::Utc;
use pacs_core::{ExaminationRequested, ExaminationTask, PacsError, Result, TaskStatus};
use pacs_database::TaskRepository;
use pacs_integration::{Message, MessageHandler};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// 任务创建结果
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    Created(ExaminationTask),
    /// 重复投递，返回已存在的任务
    Duplicate(ExaminationTask),
}

impl CreateOutcome {
    pub fn task(&self) -> &ExaminationTask {
        match self {
            Self::Created(task) | Self::Duplicate(task) => task,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }
}

/// 工作列表管理器
pub struct WorklistManager {
    tasks: Arc<dyn TaskRepository>,
    state_machine: TaskStateMachine,
}

impl WorklistManager {
    pub fn new(tasks: Arc<dyn TaskRepository>) -> Self {
        Self {
            tasks,
            state_machine: TaskStateMachine::for_tasks(),
        }
    }

    /// 为检查申请创建待处理任务（按 requestId 幂等）
    pub async fn create_task(&self, event: &ExaminationRequested) -> Result<CreateOutcome> {
        let task = ExaminationTask {
            id: event.request_id,
            patient_id: event.patient_id,
            patient_full_name: event.patient_name.clone(),
            expected_modality: event.modality.clone(),
            doctor_notes: event.notes.clone(),
            is_urgent: event.is_urgent,
            status: TaskStatus::Pending,
            result_object_key: None,
            requested_at: event.requested_at,
            created_at: Utc::now(),
            completed_at: None,
        };

        if self.tasks.insert_if_absent(&task).await? {
            info!(
                request_id = %task.id,
                patient_id = %task.patient_id,
                urgent = task.is_urgent,
                "Created worklist task for modality {}",
                task.expected_modality
            );
            return Ok(CreateOutcome::Created(task));
        }

        let existing = self.tasks.find(task.id).await?.ok_or_else(|| {
            PacsError::Database(format!("Task {} vanished after conflicting insert", task.id))
        })?;
        info!(request_id = %task.id, "Duplicate examination request ignored");
        Ok(CreateOutcome::Duplicate(existing))
    }

    /// 工作列表：待处理任务，最早创建的在前
    pub async fn get_pending_tasks(&self) -> Result<Vec<ExaminationTask>> {
        self.tasks.find_by_status(TaskStatus::Pending).await
    }

    pub async fn get_task(&self, task_id: Uuid) -> Result<ExaminationTask> {
        self.tasks
            .find(task_id)
            .await?
            .ok_or_else(|| PacsError::NotFound(format!("Task {} not found", task_id)))
    }

    /// 确定扫描结果对应的任务
    ///
    /// 给出 requestId 时按关联ID定位并核对患者与状态；否则要求该患者恰有一个待处理任务。
    pub async fn resolve_pending_task(
        &self,
        patient_id: Uuid,
        request_id: Option<Uuid>,
    ) -> Result<ExaminationTask> {
        if let Some(request_id) = request_id {
            let task = self.get_task(request_id).await?;
            if task.patient_id != patient_id {
                return Err(PacsError::Validation(format!(
                    "Task {} does not belong to patient {}",
                    request_id, patient_id
                )));
            }
            self.state_machine.transition(task.status, TaskEvent::ScanCaptured)?;
            return Ok(task);
        }

        let mut pending = self
            .tasks
            .find_by_patient_and_status(patient_id, TaskStatus::Pending)
            .await?;
        match pending.len() {
            0 => Err(PacsError::NotFound(format!(
                "No pending task found for patient {}",
                patient_id
            ))),
            1 => Ok(pending.remove(0)),
            count => Err(PacsError::AmbiguousMatch(format!(
                "Patient {} has {} pending tasks; specify the requestId",
                patient_id, count
            ))),
        }
    }

    /// 按患者完成唯一的待处理任务
    pub async fn complete_task(&self, patient_id: Uuid, result_object_key: &str) -> Result<ExaminationTask> {
        let task = self.resolve_pending_task(patient_id, None).await?;
        self.apply(task, TaskEvent::ScanCaptured, Some(result_object_key)).await
    }

    /// 按关联ID完成任务
    pub async fn complete_task_by_request(
        &self,
        request_id: Uuid,
        result_object_key: &str,
    ) -> Result<ExaminationTask> {
        let task = self.get_task(request_id).await?;
        self.apply(task, TaskEvent::ScanCaptured, Some(result_object_key)).await
    }

    /// 取消任务，只允许从 PENDING 取消
    pub async fn cancel_task(&self, task_id: Uuid) -> Result<ExaminationTask> {
        let task = self.get_task(task_id).await?;
        self.apply(task, TaskEvent::Cancel, None).await
    }

    async fn apply(
        &self,
        task: ExaminationTask,
        event: TaskEvent,
        result_object_key: Option<&str>,
    ) -> Result<ExaminationTask> {
        let next = self.state_machine.transition(task.status, event)?;

        let mut updated = task.clone();
        updated.status = next;
        // 取消时间同样记在 completed_at
        updated.completed_at = Some(Utc::now());
        if event == TaskEvent::ScanCaptured {
            updated.result_object_key = result_object_key.map(str::to_string);
        }

        if !self.tasks.update_if_status(&updated, task.status).await? {
            // 读取与写入之间被其他请求抢先转换
            let current = self.get_task(task.id).await?;
            warn!(
                request_id = %task.id,
                "Task changed concurrently to {}",
                current.status.as_str()
            );
            return Err(PacsError::InvalidStateTransition {
                from: format!("{:?}", current.status),
                event: format!("{:?}", event),
            });
        }

        info!(
            request_id = %updated.id,
            patient_id = %updated.patient_id,
            "Task {} -> {}",
            task.status.as_str(),
            updated.status.as_str()
        );
        Ok(updated)
    }
}

#[async_trait]
impl MessageHandler for WorklistManager {
    async fn handle_message(&self, message: &Message) -> Result<()> {
        let event: ExaminationRequested = message.decode()?;
        info!(
            request_id = %event.request_id,
            patient_id = %event.patient_id,
            "Received examination request"
        );
        self.create_task(&event).await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "worklist-manager"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pacs_database::InMemoryTaskRepository;

    fn manager() -> WorklistManager {
        WorklistManager::new(Arc::new(InMemoryTaskRepository::new()))
    }

    fn request(patient_id: Uuid) -> ExaminationRequested {
        ExaminationRequested {
            request_id: Uuid::new_v4(),
            patient_id,
            patient_name: "Jane Doe".into(),
            modality: "CT".into(),
            notes: Some("persistent cough".into()),
            requested_at: Utc::now(),
            is_urgent: true,
        }
    }

    #[tokio::test]
    async fn test_duplicate_request_creates_one_task() {
        let worklist = manager();
        let event = request(Uuid::new_v4());

        let first = worklist.create_task(&event).await.unwrap();
        let second = worklist.create_task(&event).await.unwrap();

        assert!(!first.is_duplicate());
        assert!(second.is_duplicate());
        assert_eq!(first.task().id, second.task().id);
        assert_eq!(worklist.get_pending_tasks().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_pending_tasks_are_fifo() {
        let worklist = manager();
        let first = request(Uuid::new_v4());
        let mut second = request(Uuid::new_v4());
        second.is_urgent = true;

        worklist.create_task(&first).await.unwrap();
        worklist.create_task(&second).await.unwrap();

        let pending = worklist.get_pending_tasks().await.unwrap();
        let ids: Vec<Uuid> = pending.iter().map(|task| task.id).collect();
        assert_eq!(ids, vec![first.request_id, second.request_id]);
    }

    #[tokio::test]
    async fn test_complete_task_records_result() {
        let worklist = manager();
        let patient = Uuid::new_v4();
        let event = request(patient);
        worklist.create_task(&event).await.unwrap();

        let task = worklist.complete_task(patient, "abc.png").await.unwrap();

        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result_object_key.as_deref(), Some("abc.png"));
        assert!(task.completed_at.is_some());
        assert!(worklist.get_pending_tasks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_complete_without_pending_task_is_not_found() {
        let worklist = manager();
        let patient = Uuid::new_v4();
        let event = request(patient);
        worklist.create_task(&event).await.unwrap();
        worklist.cancel_task(event.request_id).await.unwrap();

        let err = worklist.complete_task(patient, "abc.png").await.unwrap_err();
        assert!(matches!(err, PacsError::NotFound(_)));
        assert_eq!(
            worklist.get_task(event.request_id).await.unwrap().status,
            TaskStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_ambiguous_completion_is_rejected() {
        let worklist = manager();
        let patient = Uuid::new_v4();
        let first = request(patient);
        let second = request(patient);
        worklist.create_task(&first).await.unwrap();
        worklist.create_task(&second).await.unwrap();

        let err = worklist.complete_task(patient, "abc.png").await.unwrap_err();
        assert!(matches!(err, PacsError::AmbiguousMatch(_)));
        assert_eq!(worklist.get_pending_tasks().await.unwrap().len(), 2);

        let task = worklist
            .complete_task_by_request(second.request_id, "abc.png")
            .await
            .unwrap();
        assert_eq!(task.id, second.request_id);
        assert_eq!(worklist.get_pending_tasks().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_twice_fails_and_keeps_state() {
        let worklist = manager();
        let event = request(Uuid::new_v4());
        worklist.create_task(&event).await.unwrap();

        let cancelled = worklist.cancel_task(event.request_id).await.unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert!(cancelled.completed_at.is_some());

        let err = worklist.cancel_task(event.request_id).await.unwrap_err();
        assert!(matches!(err, PacsError::InvalidStateTransition { .. }));
        let stored = worklist.get_task(event.request_id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Cancelled);
        assert_eq!(stored.completed_at, cancelled.completed_at);
        assert!(stored.result_object_key.is_none());
    }

    #[tokio::test]
    async fn test_completed_task_cannot_be_cancelled() {
        let worklist = manager();
        let patient = Uuid::new_v4();
        let event = request(patient);
        worklist.create_task(&event).await.unwrap();
        worklist.complete_task(patient, "abc.png").await.unwrap();

        assert!(matches!(
            worklist.cancel_task(event.request_id).await,
            Err(PacsError::InvalidStateTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_request_id_must_match_patient() {
        let worklist = manager();
        let event = request(Uuid::new_v4());
        worklist.create_task(&event).await.unwrap();

        let err = worklist
            .resolve_pending_task(Uuid::new_v4(), Some(event.request_id))
            .await
            .unwrap_err();
        assert!(matches!(err, PacsError::Validation(_)));
    }

    #[tokio::test]
    async fn test_request_id_of_terminal_task_is_rejected() {
        let worklist = manager();
        let patient = Uuid::new_v4();
        let event = request(patient);
        worklist.create_task(&event).await.unwrap();
        worklist.cancel_task(event.request_id).await.unwrap();

        let err = worklist
            .resolve_pending_task(patient, Some(event.request_id))
            .await
            .unwrap_err();
        assert!(matches!(err, PacsError::InvalidStateTransition { .. }));
    }
}
