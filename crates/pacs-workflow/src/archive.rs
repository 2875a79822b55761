//! 影像归档
//!
//! 从对象存储取出影像（瞬时失败按策略就地重试），交给归档服务保存到患者长期档案。
//! 延迟归档模式下由 `ArchiveWorker` 消费 `ArchiveRequested` 并回执 `ArchiveCompleted`。

use async_trait::async_trait;
use pacs_core::{ArchiveCompleted, ArchiveRequested, Result};
use pacs_integration::{
    retry_with_backoff, with_timeout, EventPublisher, Message, MessageBus, MessageHandler, RetryPolicy,
};
use pacs_storage::{ArchivedImage, BlobStore, ImageArchive};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

const SOURCE: &str = "archive";

/// 归档调用：下载影像并在超时内完成归档
#[derive(Clone)]
pub struct ImageArchiver {
    blobs: Arc<dyn BlobStore>,
    archive: Arc<dyn ImageArchive>,
    timeout: Duration,
    download_retry: RetryPolicy,
}

impl ImageArchiver {
    pub fn new(blobs: Arc<dyn BlobStore>, archive: Arc<dyn ImageArchive>, timeout: Duration) -> Self {
        Self {
            blobs,
            archive,
            timeout,
            download_retry: RetryPolicy::no_retry(),
        }
    }

    pub fn with_download_retry(mut self, policy: RetryPolicy) -> Self {
        self.download_retry = policy;
        self
    }

    pub async fn archive(&self, patient_id: Uuid, object_key: &str, modality: &str) -> Result<ArchivedImage> {
        let image = retry_with_backoff(&self.download_retry, "blob download", || {
            self.blobs.download(object_key)
        })
        .await?;
        with_timeout(
            self.timeout,
            "image archive",
            self.archive.archive_image(patient_id, image, modality),
        )
        .await
    }
}

/// 归档工作者
pub struct ArchiveWorker {
    archiver: ImageArchiver,
    bus: Arc<dyn MessageBus>,
}

impl ArchiveWorker {
    pub fn new(archiver: ImageArchiver, bus: Arc<dyn MessageBus>) -> Self {
        Self { archiver, bus }
    }

    pub async fn process(&self, request: &ArchiveRequested) -> Result<ArchiveCompleted> {
        let archived = self
            .archiver
            .archive(request.patient_id, &request.object_key, &request.modality)
            .await?;

        let completed = ArchiveCompleted {
            request_id: request.request_id,
            patient_id: request.patient_id,
            archive_id: archived.id,
            archived_at: archived.uploaded_at,
        };
        self.bus.publish_event(&completed, SOURCE).await?;

        info!(
            request_id = %request.request_id,
            patient_id = %request.patient_id,
            "Image {} archived as {}",
            request.object_key,
            archived.id
        );
        Ok(completed)
    }
}

#[async_trait]
impl MessageHandler for ArchiveWorker {
    async fn handle_message(&self, message: &Message) -> Result<()> {
        let request: ArchiveRequested = message.decode()?;
        self.process(&request).await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "archive-worker"
    }
}
