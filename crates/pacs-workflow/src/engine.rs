//! 工作流引擎
//!
//! 根据配置组装五个组件，并把所选服务角色的处理器挂到消息总线上。
//! 各角色可以在同一进程内运行，也可以分别部署。

use crate::analysis::{AnalysisWorker, RiskScorer};
use crate::archive::{ArchiveWorker, ImageArchiver};
use crate::intake::IntakeCoordinator;
use crate::radiology::ScanCapture;
use crate::reconciler::{ArchiveMode, ResultReconciler};
use crate::worklist::WorklistManager;
use pacs_core::{Result, Topic};
use pacs_database::{ExaminationRepository, PatientRepository, TaskRepository};
use pacs_integration::{MessageBus, MessageHandler, NotificationHub, RetryPolicy};
use pacs_storage::{BlobStore, ImageArchive};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// 服务角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceRole {
    /// 检查受理（仅对外接口，不消费消息）
    Intake,
    /// 工作列表与扫描采集
    Radiology,
    Analysis,
    Reconciler,
    Archive,
    Notifications,
}

impl ServiceRole {
    pub fn all() -> [ServiceRole; 6] {
        [
            Self::Intake,
            Self::Radiology,
            Self::Analysis,
            Self::Reconciler,
            Self::Archive,
            Self::Notifications,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Intake => "intake",
            Self::Radiology => "radiology",
            Self::Analysis => "analysis",
            Self::Reconciler => "reconciler",
            Self::Archive => "archive",
            Self::Notifications => "notifications",
        }
    }

    /// 该角色消费的主题
    pub fn consumes(&self) -> &'static [Topic] {
        match self {
            Self::Intake => &[],
            Self::Radiology => &[Topic::ExaminationRequested],
            Self::Analysis => &[Topic::AnalysisRequested],
            Self::Reconciler => &[Topic::RiskAssessed, Topic::ArchiveCompleted],
            Self::Archive => &[Topic::ArchiveRequested],
            Self::Notifications => &[Topic::NotificationReady],
        }
    }
}

impl std::fmt::Display for ServiceRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 工作流参数
#[derive(Debug, Clone)]
pub struct WorkflowSettings {
    pub archive_mode: ArchiveMode,
    pub archive_timeout: Duration,
    pub inference_timeout: Duration,
    /// 归档前下载影像的就地重试
    pub download_retry: RetryPolicy,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            archive_mode: ArchiveMode::Deferred,
            archive_timeout: Duration::from_secs(10),
            inference_timeout: Duration::from_secs(30),
            download_retry: RetryPolicy::default()
                .with_max_attempts(3)
                .with_backoff(Duration::from_millis(100), Duration::from_secs(1)),
        }
    }
}

/// 组件依赖
#[derive(Clone)]
pub struct WorkflowDependencies {
    pub patients: Arc<dyn PatientRepository>,
    pub examinations: Arc<dyn ExaminationRepository>,
    pub tasks: Arc<dyn TaskRepository>,
    pub blobs: Arc<dyn BlobStore>,
    pub image_archive: Arc<dyn ImageArchive>,
    pub scorer: Arc<dyn RiskScorer>,
    pub bus: Arc<dyn MessageBus>,
    pub notifications: NotificationHub,
}

/// 工作流引擎
pub struct WorkflowEngine {
    bus: Arc<dyn MessageBus>,
    intake: Arc<IntakeCoordinator>,
    worklist: Arc<WorklistManager>,
    scans: Arc<ScanCapture>,
    analysis: Arc<AnalysisWorker>,
    reconciler: Arc<ResultReconciler>,
    archive_worker: Arc<ArchiveWorker>,
    notifications: NotificationHub,
}

impl WorkflowEngine {
    pub fn new(deps: WorkflowDependencies, settings: &WorkflowSettings) -> Self {
        let archiver = ImageArchiver::new(
            deps.blobs.clone(),
            deps.image_archive.clone(),
            settings.archive_timeout,
        )
        .with_download_retry(settings.download_retry.clone());
        let worklist = Arc::new(WorklistManager::new(deps.tasks.clone()));

        let reconciler = match settings.archive_mode {
            ArchiveMode::Deferred => ResultReconciler::deferred(deps.examinations.clone(), deps.bus.clone()),
            ArchiveMode::Inline => {
                ResultReconciler::inline(deps.examinations.clone(), deps.bus.clone(), archiver.clone())
            }
        };

        Self {
            intake: Arc::new(IntakeCoordinator::new(
                deps.patients.clone(),
                deps.examinations.clone(),
                deps.bus.clone(),
            )),
            scans: Arc::new(ScanCapture::new(worklist.clone(), deps.blobs.clone(), deps.bus.clone())),
            worklist,
            analysis: Arc::new(AnalysisWorker::new(
                deps.blobs.clone(),
                deps.scorer.clone(),
                deps.bus.clone(),
                settings.inference_timeout,
            )),
            reconciler: Arc::new(reconciler),
            archive_worker: Arc::new(ArchiveWorker::new(archiver, deps.bus.clone())),
            notifications: deps.notifications,
            bus: deps.bus,
        }
    }

    /// 为所选角色订阅各自的主题
    pub async fn start(&self, roles: &[ServiceRole]) -> Result<()> {
        for role in roles {
            if let Some(handler) = self.handler_for(*role) {
                for topic in role.consumes() {
                    self.bus.subscribe(*topic, handler.clone()).await?;
                }
            }
            info!("Service role started: {}", role);
        }
        Ok(())
    }

    fn handler_for(&self, role: ServiceRole) -> Option<Arc<dyn MessageHandler>> {
        let handler: Arc<dyn MessageHandler> = match role {
            ServiceRole::Intake => return None,
            ServiceRole::Radiology => self.worklist.clone(),
            ServiceRole::Analysis => self.analysis.clone(),
            ServiceRole::Reconciler => self.reconciler.clone(),
            ServiceRole::Archive => self.archive_worker.clone(),
            ServiceRole::Notifications => Arc::new(self.notifications.clone()),
        };
        Some(handler)
    }

    pub fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.bus
    }

    pub fn intake(&self) -> &Arc<IntakeCoordinator> {
        &self.intake
    }

    pub fn worklist(&self) -> &Arc<WorklistManager> {
        &self.worklist
    }

    pub fn scans(&self) -> &Arc<ScanCapture> {
        &self.scans
    }

    pub fn analysis(&self) -> &Arc<AnalysisWorker> {
        &self.analysis
    }

    pub fn reconciler(&self) -> &Arc<ResultReconciler> {
        &self.reconciler
    }

    pub fn notifications(&self) -> &NotificationHub {
        &self.notifications
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::DigestScorer;
    use pacs_database::{InMemoryExaminationRepository, InMemoryPatientRepository, InMemoryTaskRepository};
    use pacs_integration::{InMemoryBus, RetryPolicy, WorkflowMetrics};
    use pacs_storage::{LocalImageArchive, StorageManager};

    #[test]
    fn test_every_workflow_topic_has_a_consumer_role() {
        let consumed: Vec<Topic> = ServiceRole::all()
            .iter()
            .flat_map(|role| role.consumes().iter().copied())
            .collect();
        for topic in Topic::workflow_topics() {
            assert!(consumed.contains(&topic), "{} has no consumer", topic);
        }
    }

    #[tokio::test]
    async fn test_roles_subscribe_once() {
        let bus = Arc::new(InMemoryBus::new(
            RetryPolicy::default(),
            1,
            Arc::new(WorkflowMetrics::new().unwrap()),
        ));
        let engine = WorkflowEngine::new(
            WorkflowDependencies {
                patients: Arc::new(InMemoryPatientRepository::new()),
                examinations: Arc::new(InMemoryExaminationRepository::new()),
                tasks: Arc::new(InMemoryTaskRepository::new()),
                blobs: Arc::new(StorageManager::in_memory()),
                image_archive: Arc::new(LocalImageArchive::new()),
                scorer: Arc::new(DigestScorer::default()),
                bus: bus.clone(),
                notifications: NotificationHub::new(),
            },
            &WorkflowSettings::default(),
        );

        engine.start(&ServiceRole::all()).await.unwrap();
        assert_eq!(engine.reconciler().archive_mode(), ArchiveMode::Deferred);
        // 同一主题不能有第二个消费者
        assert!(engine.start(&[ServiceRole::Analysis]).await.is_err());
    }
}
