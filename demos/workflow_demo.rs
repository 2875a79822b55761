//! 工作流演示程序
//!
//! 在单进程内运行全部服务角色：受理三份检查申请，上传扫描影像，
//! 等待分析、对账、归档完成，并打印推送给在线客户端的通知。

use bytes::Bytes;
use pacs_admin::{init_logging, LoggingConfig};
use pacs_database::{InMemoryExaminationRepository, InMemoryPatientRepository, InMemoryTaskRepository};
use pacs_integration::{InMemoryBus, MessageBus, NotificationHub, RetryPolicy, WorkflowMetrics};
use pacs_storage::{LocalImageArchive, StorageManager};
use pacs_workflow::{
    DigestScorer, ExaminationRequest, ScanUpload, ServiceRole, WorkflowDependencies, WorkflowEngine,
    WorkflowSettings,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging(&LoggingConfig {
        level: "warn".to_string(),
        json: false,
    })?;

    let metrics = Arc::new(WorkflowMetrics::new()?);
    let bus = Arc::new(InMemoryBus::new(RetryPolicy::default(), 2, metrics.clone()));
    let archive = Arc::new(LocalImageArchive::new());
    let engine = WorkflowEngine::new(
        WorkflowDependencies {
            patients: Arc::new(InMemoryPatientRepository::new()),
            examinations: Arc::new(InMemoryExaminationRepository::new()),
            tasks: Arc::new(InMemoryTaskRepository::new()),
            blobs: Arc::new(StorageManager::in_memory()),
            image_archive: archive.clone(),
            scorer: Arc::new(DigestScorer::new(Duration::from_millis(50))),
            bus: bus.clone(),
            notifications: NotificationHub::new(),
        },
        &WorkflowSettings::default(),
    );
    engine.start(&ServiceRole::all()).await?;

    println!("🚀 医学影像检查工作流演示\n");
    let mut subscription = engine.notifications().subscribe();

    // 1. 受理检查申请
    let requests = [
        ("Jane Doe", "CT", true),
        ("John Roe", "XR", false),
        ("Mary Major", "MR", false),
    ];
    let mut examinations = Vec::new();
    for (name, modality, urgent) in requests {
        let exam = engine
            .intake()
            .initiate_examination(ExaminationRequest {
                full_name: name.to_string(),
                modality: modality.to_string(),
                is_urgent: urgent,
                ..Default::default()
            })
            .await?;
        println!("📋 {} 申请 {} 检查 (ID: {})", name, modality, exam.id);
        examinations.push(exam);
    }
    bus.wait_idle(Duration::from_secs(5)).await;

    // 2. 查看工作列表
    let pending = engine.worklist().get_pending_tasks().await?;
    println!("\n🗂️  待处理工作项: {}", pending.len());
    for task in &pending {
        let urgent = if task.is_urgent { " [加急]" } else { "" };
        println!("  - {} {}{}", task.patient_full_name, task.expected_modality, urgent);
    }

    // 3. 上传扫描影像
    println!();
    for exam in &examinations {
        let image = Bytes::from(format!("scan-of-{}", exam.id));
        let task = engine
            .scans()
            .process_scan(ScanUpload {
                patient_id: exam.patient_id,
                modality: exam.modality.clone(),
                request_id: Some(exam.id),
                image,
            })
            .await?;
        println!("📷 影像已上传: {}", task.result_object_key.unwrap_or_default());
    }

    // 4. 等待分析、对账与归档
    bus.wait_idle(Duration::from_secs(10)).await;

    println!("\n🔔 推送通知:");
    for _ in 0..examinations.len() {
        match tokio::time::timeout(Duration::from_secs(1), subscription.recv()).await {
            Ok(Some(notification)) => println!(
                "  [{:?}] {} (score {:.3})",
                notification.notification_type, notification.message, notification.risk_score
            ),
            _ => break,
        }
    }

    println!("\n📊 检查结果:");
    for exam in &examinations {
        let stored = engine.intake().get_examination(exam.id).await?;
        println!(
            "  {} {:?} 诊断={} 危急={} 归档={}",
            stored.id,
            stored.status,
            stored.diagnosis.as_deref().unwrap_or("-"),
            stored.is_critical.unwrap_or(false),
            stored
                .archived_image_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".to_string())
        );
    }

    let dead_letters = bus.dead_letters().await;
    println!("\n☠️  死信: {}", dead_letters.len());

    println!("\n✅ 演示完成");
    Ok(())
}
