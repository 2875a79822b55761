//! 结果对账
//!
//! 把分析结果写回检查申请（REQUESTED → COMPLETED 只发生一次），
//! 触发影像归档，并发布通知。重复的 `RiskAssessed` 不会覆盖已完成的检查；
//! 通知发出后记录 `notified_at`，此后的重复结果不再产生任何下游事件。
//! 通知尚未发出（上次处理中途失败）时，按库中已保存的结果补发。

use crate::archive::ImageArchiver;
use crate::state_machine::{ExaminationEvent, ExaminationStateMachine};
use async_trait::async_trait;
use chrono::Utc;
use pacs_core::{
    ArchiveCompleted, ArchiveRequested, Examination, NotificationReady, PacsError, Result,
    RiskAssessed, Topic,
};
use pacs_database::ExaminationRepository;
use pacs_integration::{EventPublisher, Message, MessageBus, MessageHandler};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

const SOURCE: &str = "reconciler";

/// 归档方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveMode {
    /// 发布 `ArchiveRequested`，由归档工作者异步完成
    #[default]
    Deferred,
    /// 在对账过程中直接调用归档服务
    Inline,
}

/// 对账结果
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    Completed(Examination),
    /// 检查此前已完成，结果未被覆盖
    Duplicate(Examination),
}

impl ReconcileOutcome {
    pub fn examination(&self) -> &Examination {
        match self {
            Self::Completed(exam) | Self::Duplicate(exam) => exam,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }
}

/// 结果对账器
pub struct ResultReconciler {
    examinations: Arc<dyn ExaminationRepository>,
    bus: Arc<dyn MessageBus>,
    inline_archiver: Option<ImageArchiver>,
    state_machine: ExaminationStateMachine,
}

impl ResultReconciler {
    /// 延迟归档
    pub fn deferred(examinations: Arc<dyn ExaminationRepository>, bus: Arc<dyn MessageBus>) -> Self {
        Self {
            examinations,
            bus,
            inline_archiver: None,
            state_machine: ExaminationStateMachine::for_examinations(),
        }
    }

    /// 同步归档
    pub fn inline(
        examinations: Arc<dyn ExaminationRepository>,
        bus: Arc<dyn MessageBus>,
        archiver: ImageArchiver,
    ) -> Self {
        Self {
            inline_archiver: Some(archiver),
            ..Self::deferred(examinations, bus)
        }
    }

    pub fn archive_mode(&self) -> ArchiveMode {
        if self.inline_archiver.is_some() {
            ArchiveMode::Inline
        } else {
            ArchiveMode::Deferred
        }
    }

    pub async fn process_analysis_result(&self, result: &RiskAssessed) -> Result<ReconcileOutcome> {
        if !(0.0..=1.0).contains(&result.risk_score) {
            return Err(PacsError::Validation(format!(
                "Risk score {} for examination {} is outside [0, 1]",
                result.risk_score, result.request_id
            )));
        }

        let outcome = self.complete_examination(result).await?;
        let stored = outcome.examination();

        if outcome.is_duplicate() && stored.notified_at.is_some() {
            info!(
                request_id = %stored.id,
                "Duplicate analysis result ignored, notification already sent"
            );
            return Ok(outcome);
        }

        if let Some(object_key) = &result.object_key {
            if stored.archived_image_id.is_none() {
                self.archive(stored, object_key).await?;
            }
        }

        let diagnosis = stored
            .diagnosis
            .clone()
            .unwrap_or_else(|| result.diagnosis_label.clone());
        let notification = NotificationReady::from_result(
            stored.id,
            stored.patient_id,
            &diagnosis,
            stored.risk_score.unwrap_or(result.risk_score),
            stored.is_critical.unwrap_or(result.is_critical),
        );
        self.bus.publish_event(&notification, SOURCE).await?;
        self.examinations.mark_notified_if_unset(stored.id, Utc::now()).await?;

        info!(
            request_id = %stored.id,
            patient_id = %stored.patient_id,
            duplicate = outcome.is_duplicate(),
            "Notification queued: {:?}",
            notification.notification_type
        );
        Ok(outcome)
    }

    /// 记录归档回执，已有归档ID时忽略
    pub async fn record_archive(&self, receipt: &ArchiveCompleted) -> Result<bool> {
        let recorded = self
            .examinations
            .set_archived_image_if_absent(receipt.request_id, receipt.archive_id)
            .await?;
        if recorded {
            info!(
                request_id = %receipt.request_id,
                "Linked archived image {}",
                receipt.archive_id
            );
        } else {
            warn!(
                request_id = %receipt.request_id,
                "Examination already linked to an archived image, ignoring {}",
                receipt.archive_id
            );
        }
        Ok(recorded)
    }

    async fn complete_examination(&self, result: &RiskAssessed) -> Result<ReconcileOutcome> {
        let examination = self
            .examinations
            .find(result.request_id)
            .await?
            .ok_or_else(|| {
                PacsError::NotFound(format!("Examination {} not found", result.request_id))
            })?;

        if examination.is_completed() {
            info!(request_id = %examination.id, "Duplicate analysis result, examination already completed");
            return Ok(ReconcileOutcome::Duplicate(examination));
        }

        let mut completed = examination.clone();
        completed.status = self
            .state_machine
            .transition(examination.status, ExaminationEvent::AnalysisCompleted)?;
        completed.risk_score = Some(result.risk_score);
        completed.diagnosis = Some(result.diagnosis_label.clone());
        completed.is_critical = Some(result.is_critical);
        completed.completed_at = Some(Utc::now());

        if self.examinations.complete_if_requested(&completed).await? {
            info!(
                request_id = %completed.id,
                patient_id = %completed.patient_id,
                "Examination completed: {} ({:.3})",
                result.diagnosis_label,
                result.risk_score
            );
            return Ok(ReconcileOutcome::Completed(completed));
        }

        // 并发投递的另一份结果先完成了
        let stored = self
            .examinations
            .find(result.request_id)
            .await?
            .ok_or_else(|| {
                PacsError::NotFound(format!("Examination {} not found", result.request_id))
            })?;
        Ok(ReconcileOutcome::Duplicate(stored))
    }

    async fn archive(&self, examination: &Examination, object_key: &str) -> Result<()> {
        match &self.inline_archiver {
            Some(archiver) => {
                let archived = archiver
                    .archive(examination.patient_id, object_key, &examination.modality)
                    .await?;
                self.record_archive(&ArchiveCompleted {
                    request_id: examination.id,
                    patient_id: examination.patient_id,
                    archive_id: archived.id,
                    archived_at: archived.uploaded_at,
                })
                .await?;
            }
            None => {
                let request = ArchiveRequested {
                    request_id: examination.id,
                    patient_id: examination.patient_id,
                    object_key: object_key.to_string(),
                    modality: examination.modality.clone(),
                };
                self.bus.publish_event(&request, SOURCE).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for ResultReconciler {
    async fn handle_message(&self, message: &Message) -> Result<()> {
        match message.topic {
            Topic::RiskAssessed => {
                let result: RiskAssessed = message.decode()?;
                self.process_analysis_result(&result).await?;
            }
            Topic::ArchiveCompleted => {
                let receipt: ArchiveCompleted = message.decode()?;
                self.record_archive(&receipt).await?;
            }
            other => {
                return Err(PacsError::Validation(format!(
                    "Result reconciler does not consume {}",
                    other
                )))
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "result-reconciler"
    }
}
