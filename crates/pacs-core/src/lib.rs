//! # PACS Core
//!
//! 检查工作流的核心模块，提供领域数据结构、事件契约、错误定义和通用工具。

pub mod error;
pub mod events;
pub mod models;
pub mod utils;

pub use error::{PacsError, Result};
pub use events::*;
pub use models::*;
