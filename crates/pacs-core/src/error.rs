//! 错误定义模块

use thiserror::Error;
use uuid::Uuid;

/// PACS系统统一错误类型
#[derive(Error, Debug)]
pub enum PacsError {
    #[error("配置错误: {0}")]
    Config(String),

    #[error("数据库错误: {0}")]
    Database(String),

    #[error("存储错误: {0}")]
    Storage(String),

    #[error("消息总线错误: {0}")]
    Bus(String),

    #[error("外部服务调用失败: {0}")]
    Collaborator(String),

    #[error("操作超时: {0}")]
    Timeout(String),

    #[error("网络错误: {0}")]
    Network(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("验证错误: {0}")]
    Validation(String),

    #[error("系统内部错误: {0}")]
    Internal(String),

    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("匹配不唯一: {0}")]
    AmbiguousMatch(String),

    #[error("无效状态转换: 从 {from} 到 {event}")]
    InvalidStateTransition { from: String, event: String },

    #[error("检查 {request_id} 已保存但事件发布失败: {reason}")]
    OrphanedExamination { request_id: Uuid, reason: String },
}

impl PacsError {
    /// 是否为可重试的瞬时错误
    ///
    /// 未找到、状态冲突、校验失败之类的错误重投也不会成功，直接进入死信。
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Database(_)
                | Self::Storage(_)
                | Self::Bus(_)
                | Self::Collaborator(_)
                | Self::Timeout(_)
                | Self::Network(_)
        )
    }

    /// 错误分类标签，用于日志和HTTP响应
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Database(_) => "database",
            Self::Storage(_) => "storage",
            Self::Bus(_) => "bus",
            Self::Collaborator(_) => "collaborator",
            Self::Timeout(_) => "timeout",
            Self::Network(_) => "network",
            Self::Serialization(_) => "serialization",
            Self::Validation(_) => "validation",
            Self::Internal(_) => "internal",
            Self::NotFound(_) => "not_found",
            Self::AmbiguousMatch(_) => "ambiguous_match",
            Self::InvalidStateTransition { .. } => "invalid_state_transition",
            Self::OrphanedExamination { .. } => "orphaned_examination",
        }
    }
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for PacsError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => PacsError::NotFound(err.to_string()),
            other => PacsError::Database(other.to_string()),
        }
    }
}

/// PACS系统统一结果类型
pub type Result<T> = std::result::Result<T, PacsError>;
