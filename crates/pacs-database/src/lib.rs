//! # PACS数据库模块
//!
//! 患者、检查申请与检查任务的持久化。工作流只依赖 [`repository`] 中的仓储接口，
//! 提供内存实现（单机部署与测试）和基于sqlx的PostgreSQL实现。

pub mod connection;
pub mod memory;
pub mod models;
pub mod queries;
pub mod repository;

// 重新导出主要类型
pub use connection::DatabasePool;
pub use memory::{InMemoryExaminationRepository, InMemoryPatientRepository, InMemoryTaskRepository};
pub use queries::{DatabaseQueries, PgExaminationRepository, PgPatientRepository, PgTaskRepository};
pub use repository::{ExaminationRepository, PatientRepository, TaskRepository};
