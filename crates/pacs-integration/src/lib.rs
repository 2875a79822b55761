//! # PACS集成模块
//!
//! 服务之间以及与外部系统之间的全部集成：
//! - 消息总线：RabbitMQ实现与进程内实现，至少一次投递，重试与死信
//! - 通知推送：在线客户端订阅表与广播
//! - 外部系统连接器：影像归档服务HTTP客户端
//! - 工作流指标

pub mod connectors;
pub mod dead_letter;
pub mod memory_bus;
pub mod message_queue;
pub mod metrics;
pub mod notification;
pub mod retry;

pub use connectors::{AuthenticationConfig, HttpImageArchive};
pub use dead_letter::{DeadLetter, DeadLetterQueue};
pub use memory_bus::InMemoryBus;
pub use message_queue::{
    deliver, Disposition, EventPublisher, Message, MessageBus, MessageHandler, MessageQueueConfig,
    QueueConfig, RabbitMqBus,
};
pub use metrics::{DeliveryOutcome, WorkflowMetrics};
pub use notification::{BroadcastReport, NotificationHub, PushChannel, Subscription, DEFAULT_SUBSCRIBER_BUFFER};
pub use retry::{retry_with_backoff, with_timeout, RetryPolicy};
