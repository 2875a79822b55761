//! 外部系统连接器
//!
//! 影像归档服务的HTTP客户端：以 multipart 表单上传影像，
//! 字段为 `file`、`patientId`、`modality`，返回归档记录。

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use pacs_core::{PacsError, Result};
use pacs_storage::{ArchivedImage, ImageArchive};
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// 认证配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthenticationConfig {
    None,
    ApiKey { key: String, header: Option<String> },
    BearerToken { token: String },
}

impl Default for AuthenticationConfig {
    fn default() -> Self {
        Self::None
    }
}

/// 归档服务返回的影像元数据
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArchiveResponse {
    id: Uuid,
    patient_id: Option<Uuid>,
    modality: Option<String>,
    format: Option<String>,
}

/// 影像归档服务HTTP客户端
#[derive(Debug, Clone)]
pub struct HttpImageArchive {
    client: reqwest::Client,
    url: String,
    authentication: AuthenticationConfig,
}

impl HttpImageArchive {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PacsError::Config(format!("Invalid archive client: {}", e)))?;
        Ok(Self {
            client,
            url: url.to_string(),
            authentication: AuthenticationConfig::None,
        })
    }

    pub fn with_authentication(mut self, authentication: AuthenticationConfig) -> Self {
        self.authentication = authentication;
        self
    }

    fn apply_authentication(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.authentication {
            AuthenticationConfig::None => request,
            AuthenticationConfig::ApiKey { key, header } => {
                request.header(header.as_deref().unwrap_or("X-API-Key"), key)
            }
            AuthenticationConfig::BearerToken { token } => request.bearer_auth(token),
        }
    }
}

#[async_trait]
impl ImageArchive for HttpImageArchive {
    async fn archive_image(&self, patient_id: Uuid, image: Bytes, modality: &str) -> Result<ArchivedImage> {
        let size_bytes = image.len() as u64;
        let file = Part::bytes(image.to_vec())
            .file_name("archived-scan.png")
            .mime_str("image/png")
            .map_err(|e| PacsError::Internal(e.to_string()))?;
        let form = Form::new()
            .part("file", file)
            .text("patientId", patient_id.to_string())
            .text("modality", modality.to_string());

        debug!("Sending image for patient {} to archive {}", patient_id, self.url);
        let response = self
            .apply_authentication(self.client.post(&self.url))
            .multipart(form)
            .send()
            .await
            .map_err(map_request_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let reason = format!("Archive service returned {}: {}", status, body);
            // 5xx 与 429 可重试，其余 4xx 是请求本身的问题
            return if status.is_server_error() || status.as_u16() == 429 {
                Err(PacsError::Collaborator(reason))
            } else {
                Err(PacsError::Validation(reason))
            };
        }

        let body: ArchiveResponse = response.json().await.map_err(map_request_error)?;
        let archived = ArchivedImage {
            id: body.id,
            patient_id: body.patient_id.unwrap_or(patient_id),
            modality: body.modality.unwrap_or_else(|| modality.to_string()),
            format: body.format.unwrap_or_else(|| "PNG".to_string()),
            size_bytes,
            uploaded_at: Utc::now(),
        };

        info!(
            "Image archived successfully. Image ID: {}, PatientId: {}",
            archived.id, patient_id
        );
        Ok(archived)
    }
}

fn map_request_error(err: reqwest::Error) -> PacsError {
    if err.is_timeout() {
        PacsError::Timeout(format!("Archive service: {}", err))
    } else if err.is_decode() {
        PacsError::Collaborator(format!("Archive service returned an unreadable body: {}", err))
    } else {
        PacsError::Collaborator(format!("Archive service unreachable: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Multipart;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};

    async fn spawn_archive(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/api/images", addr)
    }

    async fn accept_upload(mut multipart: Multipart) -> Json<serde_json::Value> {
        let mut patient_id = String::new();
        let mut modality = String::new();
        let mut file_name = String::new();
        while let Some(field) = multipart.next_field().await.unwrap() {
            let name = field.name().unwrap_or_default().to_string();
            match name.as_str() {
                "patientId" => patient_id = field.text().await.unwrap(),
                "modality" => modality = field.text().await.unwrap(),
                "file" => {
                    file_name = field.file_name().unwrap_or_default().to_string();
                    field.bytes().await.unwrap();
                }
                _ => {}
            }
        }
        assert_eq!(file_name, "archived-scan.png");
        Json(serde_json::json!({
            "id": Uuid::new_v4(),
            "patientId": patient_id,
            "modality": modality,
            "format": "PNG",
        }))
    }

    #[tokio::test]
    async fn test_archive_over_http() {
        let url = spawn_archive(Router::new().route("/api/images", post(accept_upload))).await;
        let archive = HttpImageArchive::new(&url, Duration::from_secs(5)).unwrap();
        let patient_id = Uuid::new_v4();

        let archived = archive
            .archive_image(patient_id, Bytes::from_static(b"png-bytes"), "XRAY")
            .await
            .unwrap();

        assert_eq!(archived.patient_id, patient_id);
        assert_eq!(archived.modality, "XRAY");
        assert_eq!(archived.size_bytes, 9);
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let app = Router::new().route(
            "/api/images",
            post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "maintenance") }),
        );
        let url = spawn_archive(app).await;
        let archive = HttpImageArchive::new(&url, Duration::from_secs(5)).unwrap();

        let err = archive
            .archive_image(Uuid::new_v4(), Bytes::from_static(b"png"), "CT")
            .await
            .unwrap_err();
        assert!(matches!(err, PacsError::Collaborator(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_client_error_is_fatal() {
        let app = Router::new().route(
            "/api/images",
            post(|| async { (StatusCode::BAD_REQUEST, "missing modality") }),
        );
        let url = spawn_archive(app).await;
        let archive = HttpImageArchive::new(&url, Duration::from_secs(5)).unwrap();

        let err = archive
            .archive_image(Uuid::new_v4(), Bytes::from_static(b"png"), "CT")
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_slow_archive_times_out() {
        let app = Router::new().route(
            "/api/images",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                StatusCode::OK
            }),
        );
        let url = spawn_archive(app).await;
        let archive = HttpImageArchive::new(&url, Duration::from_millis(100)).unwrap();

        let err = archive
            .archive_image(Uuid::new_v4(), Bytes::from_static(b"png"), "CT")
            .await
            .unwrap_err();
        assert!(matches!(err, PacsError::Timeout(_)));
    }
}
