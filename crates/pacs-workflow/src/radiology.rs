//! 扫描采集
//!
//! 上传影像、完成对应的工作项、请求自动分析。

use crate::worklist::WorklistManager;
use bytes::Bytes;
use pacs_core::{
    utils::{normalize_modality, require_non_blank},
    AnalysisRequested, ExaminationTask, PacsError, Result,
};
use pacs_integration::{EventPublisher, MessageBus};
use pacs_storage::BlobStore;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

const SOURCE: &str = "radiology";

/// 扫描上传
#[derive(Debug, Clone)]
pub struct ScanUpload {
    pub patient_id: Uuid,
    pub modality: String,
    /// 指定关联ID时按它定位任务，否则按患者唯一的待处理任务
    pub request_id: Option<Uuid>,
    pub image: Bytes,
}

/// 扫描采集服务
pub struct ScanCapture {
    worklist: Arc<WorklistManager>,
    blobs: Arc<dyn BlobStore>,
    bus: Arc<dyn MessageBus>,
}

impl ScanCapture {
    pub fn new(worklist: Arc<WorklistManager>, blobs: Arc<dyn BlobStore>, bus: Arc<dyn MessageBus>) -> Self {
        Self { worklist, blobs, bus }
    }

    pub async fn process_scan(&self, upload: ScanUpload) -> Result<ExaminationTask> {
        require_non_blank("modality", &upload.modality)?;
        if upload.image.is_empty() {
            return Err(PacsError::Validation("Scan file is empty".to_string()));
        }
        let modality = normalize_modality(&upload.modality);

        // 先定位任务，找不到或不唯一时不上传
        let pending = self
            .worklist
            .resolve_pending_task(upload.patient_id, upload.request_id)
            .await?;
        if normalize_modality(&pending.expected_modality) != modality {
            warn!(
                request_id = %pending.id,
                "Modality mismatch: Expected {}, Got {}",
                pending.expected_modality, modality
            );
        }

        let object_key = self.blobs.upload(upload.image, "png").await?;
        let task = self
            .worklist
            .complete_task_by_request(pending.id, &object_key)
            .await?;

        let event = AnalysisRequested {
            request_id: task.id,
            patient_id: task.patient_id,
            object_key,
            modality,
        };
        if let Err(e) = self.bus.publish_event(&event, SOURCE).await {
            error!(
                request_id = %task.id,
                error = %e,
                "Task completed but analysis request could not be published"
            );
            return Err(PacsError::OrphanedExamination {
                request_id: task.id,
                reason: e.to_string(),
            });
        }

        info!(
            request_id = %task.id,
            patient_id = %task.patient_id,
            "Scan captured, analysis requested for {}",
            event.object_key
        );
        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pacs_core::{ExaminationRequested, TaskStatus, Topic};
    use pacs_database::InMemoryTaskRepository;
    use pacs_integration::{InMemoryBus, RetryPolicy, WorkflowMetrics};
    use async_trait::async_trait;
    use pacs_storage::StorageManager;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 记录上传次数的对象存储
    struct CountingStore {
        uploads: AtomicUsize,
        inner: StorageManager,
    }

    #[async_trait]
    impl BlobStore for CountingStore {
        async fn upload(&self, data: Bytes, extension: &str) -> Result<String> {
            self.uploads.fetch_add(1, Ordering::SeqCst);
            self.inner.upload(data, extension).await
        }

        async fn download(&self, key: &str) -> Result<Bytes> {
            self.inner.download(key).await
        }
    }

    struct Fixture {
        capture: ScanCapture,
        worklist: Arc<WorklistManager>,
        bus: Arc<InMemoryBus>,
        storage: Arc<StorageManager>,
    }

    fn fixture() -> Fixture {
        let worklist = Arc::new(WorklistManager::new(Arc::new(InMemoryTaskRepository::new())));
        let storage = Arc::new(StorageManager::in_memory());
        let bus = Arc::new(InMemoryBus::new(
            RetryPolicy::default(),
            1,
            Arc::new(WorkflowMetrics::new().unwrap()),
        ));
        let capture = ScanCapture::new(worklist.clone(), storage.clone(), bus.clone());
        Fixture {
            capture,
            worklist,
            bus,
            storage,
        }
    }

    fn request(patient_id: Uuid) -> ExaminationRequested {
        ExaminationRequested {
            request_id: Uuid::new_v4(),
            patient_id,
            patient_name: "Jane Doe".into(),
            modality: "CT".into(),
            notes: None,
            requested_at: Utc::now(),
            is_urgent: false,
        }
    }

    #[tokio::test]
    async fn test_scan_completes_task_and_requests_analysis() {
        let fx = fixture();
        let patient = Uuid::new_v4();
        let event = request(patient);
        fx.worklist.create_task(&event).await.unwrap();

        let task = fx
            .capture
            .process_scan(ScanUpload {
                patient_id: patient,
                modality: "ct".into(),
                request_id: None,
                image: Bytes::from_static(b"\x89PNG scan"),
            })
            .await
            .unwrap();

        assert_eq!(task.status, TaskStatus::Completed);
        let key = task.result_object_key.clone().unwrap();
        assert!(key.ends_with(".png"));
        assert_eq!(&fx.storage.download(&key).await.unwrap()[..], b"\x89PNG scan");

        let published = fx.bus.published(Topic::AnalysisRequested).await;
        assert_eq!(published.len(), 1);
        let analysis: AnalysisRequested = published[0].decode().unwrap();
        assert_eq!(analysis.request_id, event.request_id);
        assert_eq!(analysis.object_key, key);
        assert_eq!(analysis.modality, "CT");
    }

    #[tokio::test]
    async fn test_scan_without_pending_task_uploads_nothing() {
        let fx = fixture();
        let err = fx
            .capture
            .process_scan(ScanUpload {
                patient_id: Uuid::new_v4(),
                modality: "CT".into(),
                request_id: None,
                image: Bytes::from_static(b"scan"),
            })
            .await
            .unwrap_err();

        assert!(matches!(err, PacsError::NotFound(_)));
        assert!(fx.bus.published(Topic::AnalysisRequested).await.is_empty());
    }

    #[tokio::test]
    async fn test_scan_for_cancelled_task_uploads_nothing() {
        let worklist = Arc::new(WorklistManager::new(Arc::new(InMemoryTaskRepository::new())));
        let store = Arc::new(CountingStore {
            uploads: AtomicUsize::new(0),
            inner: StorageManager::in_memory(),
        });
        let bus = Arc::new(InMemoryBus::new(
            RetryPolicy::default(),
            1,
            Arc::new(WorkflowMetrics::new().unwrap()),
        ));
        let capture = ScanCapture::new(worklist.clone(), store.clone(), bus.clone());

        let patient = Uuid::new_v4();
        let event = request(patient);
        worklist.create_task(&event).await.unwrap();
        worklist.cancel_task(event.request_id).await.unwrap();

        let err = capture
            .process_scan(ScanUpload {
                patient_id: patient,
                modality: "CT".into(),
                request_id: Some(event.request_id),
                image: Bytes::from_static(b"scan"),
            })
            .await
            .unwrap_err();

        assert!(matches!(err, PacsError::InvalidStateTransition { .. }));
        assert_eq!(store.uploads.load(Ordering::SeqCst), 0);
        assert!(bus.published(Topic::AnalysisRequested).await.is_empty());
        assert_eq!(
            worklist.get_task(event.request_id).await.unwrap().status,
            TaskStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_empty_scan_is_rejected() {
        let fx = fixture();
        let err = fx
            .capture
            .process_scan(ScanUpload {
                patient_id: Uuid::new_v4(),
                modality: "CT".into(),
                request_id: None,
                image: Bytes::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PacsError::Validation(_)));
    }
}
