//! Web服务器

use crate::handlers::{
    archive_image, cancel_task, get_examination, get_image, get_pending_tasks, get_task, health, initiate_examination,
    list_dead_letters, list_images, metrics, notification_stream, replay_dead_letter, upload_scan,
};
use crate::state::AppState;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use pacs_core::{PacsError, Result};
use pacs_workflow::ServiceRole;
use std::future::Future;
use std::net::SocketAddr;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

/// 上传影像的大小上限
const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

pub struct WebServer {
    addr: SocketAddr,
    app: Router,
}

impl WebServer {
    pub fn new(addr: SocketAddr, state: AppState, roles: &[ServiceRole]) -> Self {
        let app = create_app(state, roles);
        Self { addr, app }
    }

    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// 运行直到 `shutdown` 完成，已建立的请求处理完再退出
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!("Starting web server on {}", self.addr);

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| PacsError::Internal(format!("Web server failed: {}", e)))?;

        info!("Web server stopped");
        Ok(())
    }
}

/// 按本进程承担的角色组装路由
pub fn create_app(state: AppState, roles: &[ServiceRole]) -> Router {
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/api/dead-letters", get(list_dead_letters))
        .route("/api/dead-letters/:id/replay", post(replay_dead_letter));

    if roles.contains(&ServiceRole::Intake) {
        router = router.merge(intake_routes());
    }
    if roles.contains(&ServiceRole::Radiology) {
        router = router.merge(radiology_routes());
    }
    if roles.contains(&ServiceRole::Notifications) {
        router = router.route("/api/notifications/stream", get(notification_stream));
    }
    if state.image_archive.is_some() {
        router = router.merge(image_routes());
    }

    router
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(
            ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            ),
        )
        .with_state(state)
}

/// 检查受理路由
fn intake_routes() -> Router<AppState> {
    Router::new()
        .route("/api/patient/examine", post(initiate_examination))
        .route("/api/examinations/:id", get(get_examination))
}

/// 放射科工作列表与扫描路由
fn radiology_routes() -> Router<AppState> {
    Router::new()
        .route("/api/radiology/scan", post(upload_scan))
        .route("/api/radiology/tasks", get(get_pending_tasks))
        .route("/api/radiology/tasks/:id", get(get_task).delete(cancel_task))
}

/// 进程内归档服务路由
fn image_routes() -> Router<AppState> {
    Router::new()
        .route("/api/images", post(archive_image).get(list_images))
        .route("/api/images/:id", get(get_image))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::{to_bytes, Body},
        http::{header, Request, StatusCode},
    };
    use pacs_core::{Examination, ExaminationStatus, ExaminationTask, TaskStatus};
    use pacs_database::{InMemoryExaminationRepository, InMemoryPatientRepository, InMemoryTaskRepository};
    use pacs_integration::{InMemoryBus, NotificationHub, RetryPolicy, WorkflowMetrics};
    use pacs_storage::{ArchivedImage, LocalImageArchive, StorageManager};
    use pacs_workflow::{DigestScorer, WorkflowDependencies, WorkflowEngine, WorkflowSettings};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;
    use uuid::Uuid;

    const BOUNDARY: &str = "pacs-test-boundary";

    struct TestApp {
        router: Router,
        bus: Arc<InMemoryBus>,
    }

    async fn test_app() -> TestApp {
        let metrics = Arc::new(WorkflowMetrics::new().unwrap());
        let bus = Arc::new(InMemoryBus::new(RetryPolicy::no_retry(), 2, metrics.clone()));
        let archive = Arc::new(LocalImageArchive::new());
        let engine = Arc::new(WorkflowEngine::new(
            WorkflowDependencies {
                patients: Arc::new(InMemoryPatientRepository::new()),
                examinations: Arc::new(InMemoryExaminationRepository::new()),
                tasks: Arc::new(InMemoryTaskRepository::new()),
                blobs: Arc::new(StorageManager::in_memory()),
                image_archive: archive.clone(),
                scorer: Arc::new(DigestScorer::default()),
                bus: bus.clone(),
                notifications: NotificationHub::new(),
            },
            &WorkflowSettings::default(),
        ));
        engine.start(&ServiceRole::all()).await.unwrap();

        let state = AppState::new(engine, metrics).with_image_archive(archive);
        TestApp {
            router: create_app(state, &ServiceRole::all()),
            bus,
        }
    }

    fn multipart_body(fields: &[(&str, &str)], file: Option<&[u8]>) -> Body {
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(
                format!(
                    "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                    BOUNDARY, name, value
                )
                .as_bytes(),
            );
        }
        if let Some(data) = file {
            body.extend_from_slice(
                format!(
                    "--{}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"scan.png\"\r\nContent-Type: image/png\r\n\r\n",
                    BOUNDARY
                )
                .as_bytes(),
            );
            body.extend_from_slice(data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
        Body::from(body)
    }

    fn multipart_request(uri: &str, body: Body) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={}", BOUNDARY))
            .body(body)
            .unwrap()
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn empty_request(method: &str, uri: &str) -> Request<Body> {
        Request::builder().method(method).uri(uri).body(Body::empty()).unwrap()
    }

    async fn send(app: &TestApp, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = app.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn test_examine_then_scan_completes_examination() {
        let app = test_app().await;

        let (status, body) = send(
            &app,
            json_request(
                "POST",
                "/api/patient/examine",
                json!({"fullName": "Jane Doe", "modality": "CT", "isUrgent": true}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let exam: Examination = serde_json::from_slice(&body).unwrap();
        assert!(app.bus.wait_idle(Duration::from_secs(5)).await);

        let (status, body) = send(&app, empty_request("GET", "/api/radiology/tasks")).await;
        assert_eq!(status, StatusCode::OK);
        let tasks: Vec<ExaminationTask> = serde_json::from_slice(&body).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, exam.id);
        assert!(tasks[0].is_urgent);

        let patient_id = exam.patient_id.to_string();
        let (status, body) = send(
            &app,
            multipart_request(
                "/api/radiology/scan",
                multipart_body(&[("patientId", &patient_id), ("modality", "CT")], Some(b"\x89PNG fake")),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let task: ExaminationTask = serde_json::from_slice(&body).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(app.bus.wait_idle(Duration::from_secs(5)).await);

        let (status, body) = send(&app, empty_request("GET", &format!("/api/examinations/{}", exam.id))).await;
        assert_eq!(status, StatusCode::OK);
        let exam: Examination = serde_json::from_slice(&body).unwrap();
        assert_eq!(exam.status, ExaminationStatus::Completed);
        assert!(exam.diagnosis.is_some());
        assert!(exam.archived_image_id.is_some());
    }

    #[tokio::test]
    async fn test_unknown_task_is_not_found() {
        let app = test_app().await;
        let (status, body) = send(&app, empty_request("GET", &format!("/api/radiology/tasks/{}", Uuid::new_v4()))).await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        let error: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(error["error"], "not_found");
    }

    #[tokio::test]
    async fn test_second_cancel_conflicts() {
        let app = test_app().await;
        send(
            &app,
            json_request("POST", "/api/patient/examine", json!({"fullName": "John Roe", "modality": "MR"})),
        )
        .await;
        assert!(app.bus.wait_idle(Duration::from_secs(5)).await);

        let (_, body) = send(&app, empty_request("GET", "/api/radiology/tasks")).await;
        let tasks: Vec<ExaminationTask> = serde_json::from_slice(&body).unwrap();
        let uri = format!("/api/radiology/tasks/{}", tasks[0].id);

        let (status, body) = send(&app, empty_request("DELETE", &uri)).await;
        assert_eq!(status, StatusCode::OK);
        let cancelled: ExaminationTask = serde_json::from_slice(&body).unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);

        let (status, _) = send(&app, empty_request("DELETE", &uri)).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_scan_without_file_is_bad_request() {
        let app = test_app().await;
        let patient_id = Uuid::new_v4().to_string();
        let (status, _) = send(
            &app,
            multipart_request(
                "/api/radiology/scan",
                multipart_body(&[("patientId", &patient_id), ("modality", "CT")], None),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_image_archive_round_trip() {
        let app = test_app().await;
        let patient_id = Uuid::new_v4();
        let (status, body) = send(
            &app,
            multipart_request(
                "/api/images",
                multipart_body(&[("patientId", &patient_id.to_string()), ("modality", "XR")], Some(b"pixels")),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let archived: ArchivedImage = serde_json::from_slice(&body).unwrap();

        let (_, body) = send(&app, empty_request("GET", &format!("/api/images?patientId={}", patient_id))).await;
        let listed: Vec<ArchivedImage> = serde_json::from_slice(&body).unwrap();
        assert_eq!(listed, vec![archived.clone()]);

        let (status, body) = send(&app, empty_request("GET", &format!("/api/images/{}", archived.id))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"pixels");
    }

    #[tokio::test]
    async fn test_notification_stream_is_event_stream() {
        let app = test_app().await;
        let response = app
            .router
            .clone()
            .oneshot(empty_request("GET", "/api/notifications/stream"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");
    }

    #[tokio::test]
    async fn test_metrics_and_dead_letters() {
        let app = test_app().await;
        let (status, body) = send(&app, empty_request("GET", "/metrics")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(String::from_utf8(body).unwrap().contains("pacs_notification_subscribers"));

        let (status, body) = send(&app, empty_request("GET", "/api/dead-letters")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"[]");

        let (status, _) = send(
            &app,
            empty_request("POST", &format!("/api/dead-letters/{}/replay", Uuid::new_v4())),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_routes_follow_roles() {
        let metrics = Arc::new(WorkflowMetrics::new().unwrap());
        let bus = Arc::new(InMemoryBus::new(RetryPolicy::no_retry(), 1, metrics.clone()));
        let engine = Arc::new(WorkflowEngine::new(
            WorkflowDependencies {
                patients: Arc::new(InMemoryPatientRepository::new()),
                examinations: Arc::new(InMemoryExaminationRepository::new()),
                tasks: Arc::new(InMemoryTaskRepository::new()),
                blobs: Arc::new(StorageManager::in_memory()),
                image_archive: Arc::new(LocalImageArchive::new()),
                scorer: Arc::new(DigestScorer::default()),
                bus,
                notifications: NotificationHub::new(),
            },
            &WorkflowSettings::default(),
        ));
        let router = create_app(AppState::new(engine, metrics), &[ServiceRole::Analysis]);

        let response = router
            .oneshot(empty_request("GET", "/api/radiology/tasks"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
