//! 处理器共享状态

use crate::error::{ApiError, ApiResult};
use pacs_core::PacsError;
use pacs_integration::WorkflowMetrics;
use pacs_storage::LocalImageArchive;
use pacs_workflow::WorkflowEngine;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<WorkflowEngine>,
    pub metrics: Arc<WorkflowMetrics>,
    /// 进程内归档服务，配置为远端归档时为空
    pub image_archive: Option<Arc<LocalImageArchive>>,
    /// 通知流保活间隔
    pub keep_alive: Duration,
}

impl AppState {
    pub fn new(engine: Arc<WorkflowEngine>, metrics: Arc<WorkflowMetrics>) -> Self {
        Self {
            engine,
            metrics,
            image_archive: None,
            keep_alive: Duration::from_secs(15),
        }
    }

    pub fn with_image_archive(mut self, archive: Arc<LocalImageArchive>) -> Self {
        self.image_archive = Some(archive);
        self
    }

    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive = interval;
        self
    }

    pub(crate) fn local_archive(&self) -> ApiResult<&Arc<LocalImageArchive>> {
        self.image_archive
            .as_ref()
            .ok_or_else(|| ApiError(PacsError::NotFound("No local image archive on this node".to_string())))
    }
}
