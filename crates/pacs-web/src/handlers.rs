//! HTTP处理器

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::{
    body::Bytes,
    extract::{Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json,
    },
};
use futures::{Stream, StreamExt};
use pacs_core::{Examination, ExaminationTask};
use pacs_integration::{DeadLetter, Message};
use pacs_storage::{ArchivedImage, ImageArchive};
use pacs_workflow::{ExaminationRequest, ScanUpload};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use tracing::{debug, info};
use uuid::Uuid;

/// 健康检查处理器
pub async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Prometheus指标
pub async fn metrics(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    state
        .metrics
        .set_subscribers(state.engine.notifications().subscriber_count());
    let body = state.metrics.render()?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}

/// 受理检查申请
pub async fn initiate_examination(
    State(state): State<AppState>,
    Json(request): Json<ExaminationRequest>,
) -> ApiResult<(StatusCode, Json<Examination>)> {
    let examination = state.engine.intake().initiate_examination(request).await?;
    Ok((StatusCode::CREATED, Json(examination)))
}

pub async fn get_examination(
    State(state): State<AppState>,
    Path(examination_id): Path<Uuid>,
) -> ApiResult<Json<Examination>> {
    Ok(Json(state.engine.intake().get_examination(examination_id).await?))
}

/// 上传扫描影像
///
/// 表单字段：`patientId`、`modality`、`file`，可选 `requestId`。
pub async fn upload_scan(State(state): State<AppState>, multipart: Multipart) -> ApiResult<Json<ExaminationTask>> {
    let mut form = UploadForm::read(multipart).await?;
    let upload = ScanUpload {
        patient_id: form.uuid("patientId")?,
        modality: form.text("modality")?,
        request_id: form.optional_uuid("requestId")?,
        image: form.file()?,
    };

    let task = state.engine.scans().process_scan(upload).await?;
    Ok(Json(task))
}

/// 待处理工作项
pub async fn get_pending_tasks(State(state): State<AppState>) -> ApiResult<Json<Vec<ExaminationTask>>> {
    Ok(Json(state.engine.worklist().get_pending_tasks().await?))
}

pub async fn get_task(State(state): State<AppState>, Path(task_id): Path<Uuid>) -> ApiResult<Json<ExaminationTask>> {
    Ok(Json(state.engine.worklist().get_task(task_id).await?))
}

pub async fn cancel_task(State(state): State<AppState>, Path(task_id): Path<Uuid>) -> ApiResult<Json<ExaminationTask>> {
    Ok(Json(state.engine.worklist().cancel_task(task_id).await?))
}

/// 通知推送流
///
/// 每个 `NotificationReady` 作为名为 `notification` 的事件下发；连接断开时订阅随流一起释放。
pub async fn notification_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let subscription = state.engine.notifications().subscribe();
    let subscribers = state.engine.notifications().subscriber_count();
    state.metrics.set_subscribers(subscribers);
    info!("Notification subscriber {} connected ({} active)", subscription.id(), subscribers);

    let stream = subscription.map(|notification| Event::default().event("notification").json_data(notification));
    Sse::new(stream).keep_alive(KeepAlive::new().interval(state.keep_alive).text("keep-alive"))
}

pub async fn list_dead_letters(State(state): State<AppState>) -> Json<Vec<DeadLetter>> {
    Json(state.engine.bus().dead_letters().await)
}

/// 重新发布死信中的原始消息
pub async fn replay_dead_letter(
    State(state): State<AppState>,
    Path(dead_letter_id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<Message>)> {
    let message = state.engine.bus().replay_dead_letter(dead_letter_id).await?;
    Ok((StatusCode::ACCEPTED, Json(message)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageQuery {
    pub patient_id: Uuid,
}

/// 归档影像（进程内归档服务）
pub async fn archive_image(
    State(state): State<AppState>,
    multipart: Multipart,
) -> ApiResult<(StatusCode, Json<ArchivedImage>)> {
    let archive = state.local_archive()?;
    let mut form = UploadForm::read(multipart).await?;
    let patient_id = form.uuid("patientId")?;
    let modality = form.text("modality")?;
    let image = form.file()?;

    let archived = archive.archive_image(patient_id, image, &modality).await?;
    Ok((StatusCode::CREATED, Json(archived)))
}

pub async fn list_images(
    State(state): State<AppState>,
    Query(query): Query<ImageQuery>,
) -> ApiResult<Json<Vec<ArchivedImage>>> {
    let archive = state.local_archive()?;
    Ok(Json(archive.images_by_patient(query.patient_id).await))
}

pub async fn get_image(State(state): State<AppState>, Path(image_id): Path<Uuid>) -> ApiResult<impl IntoResponse> {
    let archive = state.local_archive()?;
    let data = archive.get_image_data(image_id).await?;
    Ok(([(header::CONTENT_TYPE, "image/png")], data))
}

/// 多段表单：文本字段与单个文件
struct UploadForm {
    fields: HashMap<String, String>,
    file: Option<Bytes>,
}

impl UploadForm {
    async fn read(mut multipart: Multipart) -> ApiResult<Self> {
        let mut fields = HashMap::new();
        let mut file = None;

        while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
            let name = field.name().unwrap_or_default().to_string();
            if name == "file" {
                file = Some(field.bytes().await.map_err(multipart_error)?);
            } else if !name.is_empty() {
                let value = field.text().await.map_err(multipart_error)?;
                fields.insert(name, value);
            } else {
                debug!("Ignoring unnamed multipart field");
            }
        }

        Ok(Self { fields, file })
    }

    fn text(&mut self, name: &str) -> ApiResult<String> {
        self.fields
            .remove(name)
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| ApiError::bad_request(format!("Missing form field: {}", name)))
    }

    fn uuid(&mut self, name: &str) -> ApiResult<Uuid> {
        let value = self.text(name)?;
        parse_uuid(name, &value)
    }

    fn optional_uuid(&mut self, name: &str) -> ApiResult<Option<Uuid>> {
        match self.fields.remove(name) {
            Some(value) if !value.trim().is_empty() => parse_uuid(name, &value).map(Some),
            _ => Ok(None),
        }
    }

    fn file(&mut self) -> ApiResult<Bytes> {
        self.file
            .take()
            .filter(|data| !data.is_empty())
            .ok_or_else(|| ApiError::bad_request("Missing or empty file"))
    }
}

fn parse_uuid(name: &str, value: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(value.trim()).map_err(|e| ApiError::bad_request(format!("Invalid {}: {}", name, e)))
}

fn multipart_error(err: axum::extract::multipart::MultipartError) -> ApiError {
    ApiError::bad_request(format!("Malformed multipart body: {}", err))
}
