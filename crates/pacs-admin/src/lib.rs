//! # PACS管理模块
//!
//! 运行配置的加载与校验，以及日志初始化。

pub mod config;
pub mod logging;

pub use config::{
    AnalysisConfig, ArchiveCollaborator, ArchiveConfig, BusConfig, BusKind, ConfigManager, ConfigValidator,
    DatabaseConfig, DatabaseKind, LoggingConfig, PacsConfig, RetryConfig, ServerConfig,
};
pub use logging::{build_filter, init_logging};
