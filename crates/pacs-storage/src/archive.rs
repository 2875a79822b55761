//! 影像长期归档
//!
//! 归档服务是外部协作方：接收 (患者ID, 影像数据, 检查类型)，返回归档ID。
//! 生产环境通过HTTP调用（见 `pacs-integration` 的连接器），
//! 单机部署和测试使用本模块的进程内实现。

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use pacs_core::{PacsError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

/// 归档后的影像元数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchivedImage {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub modality: String,
    pub format: String,
    pub size_bytes: u64,
    pub uploaded_at: DateTime<Utc>,
}

/// 影像归档服务接口
#[async_trait]
pub trait ImageArchive: Send + Sync {
    /// 归档影像，返回归档记录
    async fn archive_image(&self, patient_id: Uuid, image: Bytes, modality: &str) -> Result<ArchivedImage>;
}

/// 进程内影像归档
#[derive(Debug, Default)]
pub struct LocalImageArchive {
    images: RwLock<HashMap<Uuid, (ArchivedImage, Bytes)>>,
}

impl LocalImageArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// 读取归档影像数据
    pub async fn get_image_data(&self, image_id: Uuid) -> Result<Bytes> {
        self.images
            .read()
            .await
            .get(&image_id)
            .map(|(_, data)| data.clone())
            .ok_or_else(|| PacsError::NotFound(format!("Archived image {} not found", image_id)))
    }

    /// 列出某患者的全部归档影像
    pub async fn images_by_patient(&self, patient_id: Uuid) -> Vec<ArchivedImage> {
        let images = self.images.read().await;
        let mut result: Vec<ArchivedImage> = images
            .values()
            .filter(|(meta, _)| meta.patient_id == patient_id)
            .map(|(meta, _)| meta.clone())
            .collect();
        result.sort_by_key(|meta| meta.uploaded_at);
        result
    }
}

#[async_trait]
impl ImageArchive for LocalImageArchive {
    async fn archive_image(&self, patient_id: Uuid, image: Bytes, modality: &str) -> Result<ArchivedImage> {
        let metadata = ArchivedImage {
            id: Uuid::new_v4(),
            patient_id,
            modality: modality.to_string(),
            format: "PNG".to_string(),
            size_bytes: image.len() as u64,
            uploaded_at: Utc::now(),
        };

        self.images
            .write()
            .await
            .insert(metadata.id, (metadata.clone(), image));

        info!(
            "Image archived locally. Image ID: {}, PatientId: {}",
            metadata.id, patient_id
        );
        Ok(metadata)
    }
}
