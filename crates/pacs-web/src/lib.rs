//! # PACS Web模块
//!
//! 工作流的HTTP入口：检查受理、扫描上传、工作列表、通知推送流、死信查看与重放、
//! 健康检查与指标。

pub mod error;
pub mod handlers;
pub mod server;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use server::{create_app, WebServer};
pub use state::AppState;
