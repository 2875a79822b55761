//! 影像对象存储

use async_trait::async_trait;
use bytes::Bytes;
use object_store::{
    aws::AmazonS3Builder, local::LocalFileSystem, memory::InMemory, path::Path, ObjectStore,
};
use pacs_core::{utils::generate_object_key, PacsError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// 对象存储接口
///
/// 键对调用方不透明，任何格式的键都原样接受。
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// 上传数据，返回新生成的对象键
    async fn upload(&self, data: Bytes, extension: &str) -> Result<String>;

    /// 按键下载数据
    async fn download(&self, key: &str) -> Result<Bytes>;
}

/// 存储后端类型
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Memory,
    Local,
    S3,
}

/// 存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub storage_type: StorageType,
    /// 本地存储根目录
    pub root_path: String,
    /// S3桶名
    pub bucket: Option<String>,
    pub region: String,
    /// 自建S3兼容服务的端点（如MinIO）
    pub endpoint: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_type: StorageType::Memory,
            root_path: "./data/blobs".to_string(),
            bucket: None,
            region: "us-east-1".to_string(),
            endpoint: None,
            access_key: None,
            secret_key: None,
        }
    }
}

/// 基于object_store的存储管理器
#[derive(Debug, Clone)]
pub struct StorageManager {
    store: Arc<dyn ObjectStore>,
}

impl StorageManager {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// 内存存储，用于单机部署与测试
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemory::new()))
    }

    /// 根据配置创建存储后端
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        let store: Arc<dyn ObjectStore> = match config.storage_type {
            StorageType::Memory => Arc::new(InMemory::new()),
            StorageType::Local => {
                std::fs::create_dir_all(&config.root_path)?;
                let fs = LocalFileSystem::new_with_prefix(&config.root_path)
                    .map_err(|e| PacsError::Config(format!("Invalid storage root: {}", e)))?;
                Arc::new(fs)
            }
            StorageType::S3 => {
                let bucket = config
                    .bucket
                    .as_deref()
                    .ok_or_else(|| PacsError::Config("S3 storage requires a bucket".to_string()))?;

                let mut builder = AmazonS3Builder::new()
                    .with_bucket_name(bucket)
                    .with_region(&config.region);
                if let Some(endpoint) = &config.endpoint {
                    builder = builder
                        .with_endpoint(endpoint)
                        .with_allow_http(endpoint.starts_with("http://"));
                }
                if let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key) {
                    builder = builder
                        .with_access_key_id(access_key)
                        .with_secret_access_key(secret_key);
                }

                let s3 = builder
                    .build()
                    .map_err(|e| PacsError::Config(format!("Invalid S3 configuration: {}", e)))?;
                Arc::new(s3)
            }
        };

        info!("Blob storage initialized: {:?}", config.storage_type);
        Ok(Self::new(store))
    }

    /// 以指定键写入数据
    pub async fn store_file(&self, key: &str, data: Bytes) -> Result<()> {
        self.store
            .put(&Path::from(key), data)
            .await
            .map_err(map_store_error)?;
        Ok(())
    }

    /// 按键读取数据
    pub async fn get_file(&self, key: &str) -> Result<Bytes> {
        let result = self.store.get(&Path::from(key)).await.map_err(map_store_error)?;
        result.bytes().await.map_err(map_store_error)
    }
}

#[async_trait]
impl BlobStore for StorageManager {
    async fn upload(&self, data: Bytes, extension: &str) -> Result<String> {
        let key = generate_object_key(extension);
        let size = data.len();
        self.store_file(&key, data).await?;

        info!("Uploaded blob {} ({} bytes)", key, size);
        Ok(key)
    }

    async fn download(&self, key: &str) -> Result<Bytes> {
        let data = self.get_file(key).await?;
        debug!("Downloaded blob {} ({} bytes)", key, data.len());
        Ok(data)
    }
}

/// 对象不存在不可重试，其余存储错误按瞬时故障处理
fn map_store_error(err: object_store::Error) -> PacsError {
    match err {
        object_store::Error::NotFound { path, .. } => {
            PacsError::NotFound(format!("Blob {} not found", path))
        }
        other => PacsError::Storage(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upload_then_download() {
        let storage = StorageManager::in_memory();
        let key = storage
            .upload(Bytes::from_static(b"\x89PNG fake scan"), "png")
            .await
            .unwrap();

        assert!(key.ends_with(".png"));
        let data = storage.download(&key).await.unwrap();
        assert_eq!(&data[..], b"\x89PNG fake scan");
    }

    #[tokio::test]
    async fn test_missing_blob_is_not_found() {
        let storage = StorageManager::in_memory();
        let err = storage.download("does-not-exist.png").await.unwrap_err();
        assert!(matches!(err, PacsError::NotFound(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_opaque_keys_accepted() {
        let storage = StorageManager::in_memory();
        storage
            .store_file("legacy/abc.png", Bytes::from_static(b"scan"))
            .await
            .unwrap();
        assert_eq!(&storage.download("legacy/abc.png").await.unwrap()[..], b"scan");
    }

    #[test]
    fn test_s3_requires_bucket() {
        let config = StorageConfig {
            storage_type: StorageType::S3,
            ..Default::default()
        };
        assert!(matches!(StorageManager::from_config(&config), Err(PacsError::Config(_))));
    }
}
