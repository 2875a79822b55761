//! PACS工作流服务器主程序
//!
//! 一个进程可以承担任意服务角色的组合；使用RabbitMQ总线时，各角色可分开部署。

use anyhow::{Context, Result};
use clap::Parser;
use pacs_admin::{init_logging, ArchiveCollaborator, BusKind, ConfigManager, ConfigValidator, DatabaseConfig, DatabaseKind, PacsConfig};
use pacs_database::{
    DatabasePool, DatabaseQueries, ExaminationRepository, InMemoryExaminationRepository, InMemoryPatientRepository,
    InMemoryTaskRepository, PatientRepository, PgExaminationRepository, PgPatientRepository, PgTaskRepository,
    TaskRepository,
};
use pacs_integration::{
    AuthenticationConfig, HttpImageArchive, InMemoryBus, MessageBus, NotificationHub, RabbitMqBus, WorkflowMetrics,
};
use pacs_storage::{ImageArchive, LocalImageArchive, StorageManager};
use pacs_web::{AppState, WebServer};
use pacs_workflow::{DigestScorer, ServiceRole, WorkflowDependencies, WorkflowEngine};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// 服务器命令行参数
#[derive(Parser, Debug)]
#[command(name = "pacs-server")]
#[command(about = "医学影像检查工作流服务器")]
struct Args {
    /// 配置文件路径
    #[arg(short, long)]
    config: Option<String>,

    /// 承担的服务角色，逗号分隔（intake,radiology,analysis,reconciler,archive,notifications）
    #[arg(short, long, value_delimiter = ',', value_parser = parse_role)]
    services: Option<Vec<ServiceRole>>,

    /// 监听端口
    #[arg(short, long)]
    port: Option<u16>,

    /// 日志级别
    #[arg(short, long)]
    log_level: Option<String>,
}

fn parse_role(value: &str) -> std::result::Result<ServiceRole, String> {
    ServiceRole::all()
        .into_iter()
        .find(|role| role.as_str().eq_ignore_ascii_case(value.trim()))
        .ok_or_else(|| format!("unknown service role: {}", value))
}

type Repositories = (
    Arc<dyn PatientRepository>,
    Arc<dyn ExaminationRepository>,
    Arc<dyn TaskRepository>,
);

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_logging(&config.logging)?;

    info!("Starting {} with roles: {:?}", config.server.name, config.server.services);

    let metrics = Arc::new(WorkflowMetrics::new()?);
    let policy = config.retry_policy();
    let mut rabbit = None;
    let bus: Arc<dyn MessageBus> = match config.bus.kind {
        BusKind::Memory => Arc::new(InMemoryBus::new(policy, config.bus.workers_per_topic, metrics.clone())),
        BusKind::RabbitMq => {
            let connected = Arc::new(
                RabbitMqBus::connect(config.queue_config(), policy, metrics.clone())
                    .await
                    .context("Failed to connect to RabbitMQ")?,
            );
            rabbit = Some(connected.clone());
            connected
        }
    };

    let (patients, examinations, tasks) = build_repositories(&config.database).await?;
    let blobs = Arc::new(StorageManager::from_config(&config.storage)?);

    let mut local_archive = None;
    let image_archive: Arc<dyn ImageArchive> = match config.archive.collaborator {
        ArchiveCollaborator::Local => {
            let archive = Arc::new(LocalImageArchive::new());
            local_archive = Some(archive.clone());
            archive
        }
        ArchiveCollaborator::Http => {
            let url = config
                .archive
                .url
                .as_deref()
                .context("HTTP archive requires archive.url")?;
            let mut client = HttpImageArchive::new(url, Duration::from_secs(config.archive.timeout_secs))?;
            if let Some(key) = &config.archive.api_key {
                client = client.with_authentication(AuthenticationConfig::ApiKey {
                    key: key.clone(),
                    header: None,
                });
            }
            Arc::new(client)
        }
    };

    let engine = Arc::new(WorkflowEngine::new(
        WorkflowDependencies {
            patients,
            examinations,
            tasks,
            blobs,
            image_archive,
            scorer: Arc::new(DigestScorer::new(Duration::from_millis(
                config.analysis.simulated_latency_ms,
            ))),
            bus,
            notifications: NotificationHub::new(),
        },
        &config.workflow_settings(),
    ));
    engine.start(&config.server.services).await?;

    let mut state =
        AppState::new(engine, metrics).with_keep_alive(Duration::from_secs(config.server.keep_alive_secs));
    if let Some(archive) = local_archive {
        state = state.with_image_archive(archive);
    }

    let addr: SocketAddr = config
        .bind_address()
        .parse()
        .with_context(|| format!("Invalid bind address {}", config.bind_address()))?;
    WebServer::new(addr, state, &config.server.services)
        .run_until(shutdown_signal())
        .await?;

    if let Some(bus) = rabbit {
        if let Err(e) = bus.disconnect().await {
            warn!("Failed to close message queue connection: {}", e);
        }
    }
    info!("Server stopped");
    Ok(())
}

/// 读取配置并应用命令行覆盖
fn load_config(args: &Args) -> Result<PacsConfig> {
    let mut config = ConfigManager::load_config(args.config.as_deref())?;
    if let Some(services) = &args.services {
        config.server.services = services.clone();
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    ConfigValidator::new().validate(&config)?;
    Ok(config)
}

async fn build_repositories(config: &DatabaseConfig) -> Result<Repositories> {
    match config.kind {
        DatabaseKind::Memory => {
            let patients: Arc<dyn PatientRepository> = Arc::new(InMemoryPatientRepository::new());
            let examinations: Arc<dyn ExaminationRepository> = Arc::new(InMemoryExaminationRepository::new());
            let tasks: Arc<dyn TaskRepository> = Arc::new(InMemoryTaskRepository::new());
            Ok((patients, examinations, tasks))
        }
        DatabaseKind::Postgres => {
            let pool = DatabasePool::connect(
                &config.url,
                config.max_connections,
                Duration::from_secs(config.acquire_timeout_secs),
            )
            .await
            .context("Failed to connect to database")?;
            DatabaseQueries::new(&pool).create_tables().await?;
            let patients: Arc<dyn PatientRepository> = Arc::new(PgPatientRepository::new(&pool));
            let examinations: Arc<dyn ExaminationRepository> = Arc::new(PgExaminationRepository::new(&pool));
            let tasks: Arc<dyn TaskRepository> = Arc::new(PgTaskRepository::new(&pool));
            Ok((patients, examinations, tasks))
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    info!("Shutdown signal received");
}
