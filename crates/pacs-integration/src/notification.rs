//! 通知推送
//!
//! 维护在线客户端的订阅表，把 `NotificationReady` 事件推送给当前全部订阅者。
//! 推送失败的订阅者被移出订阅表，不影响其余订阅者；通知不做离线补发。
//! 每个流式订阅者的缓冲有上限，读取跟不上、缓冲已满的订阅者按推送失败处理。

use crate::message_queue::{Message, MessageHandler};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::Stream;
use pacs_core::{NotificationReady, PacsError, Result};
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 推送通道
pub trait PushChannel: Send + Sync {
    fn push(&self, notification: &NotificationReady) -> Result<()>;
}

/// 单个订阅者默认可积压的通知数
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

struct StreamChannel {
    sender: mpsc::Sender<NotificationReady>,
}

impl PushChannel for StreamChannel {
    fn push(&self, notification: &NotificationReady) -> Result<()> {
        self.sender.try_send(notification.clone()).map_err(|e| match e {
            TrySendError::Full(_) => PacsError::Bus("subscriber buffer full".to_string()),
            TrySendError::Closed(_) => PacsError::Bus("subscriber disconnected".to_string()),
        })
    }
}

type Registry = DashMap<Uuid, Arc<dyn PushChannel>>;

/// 一次广播的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub removed: usize,
}

/// 通知中心
#[derive(Clone)]
pub struct NotificationHub {
    subscribers: Arc<Registry>,
    buffer: usize,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::with_buffer(DEFAULT_SUBSCRIBER_BUFFER)
    }

    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            subscribers: Arc::new(DashMap::new()),
            buffer: buffer.max(1),
        }
    }

    /// 注册一个流式订阅者，订阅在 `Subscription` 被丢弃时自动注销
    pub fn subscribe(&self) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.buffer);
        let id = self.register(Arc::new(StreamChannel { sender }));
        Subscription {
            id,
            receiver,
            registry: Arc::downgrade(&self.subscribers),
        }
    }

    /// 注册任意推送通道
    pub fn register(&self, channel: Arc<dyn PushChannel>) -> Uuid {
        let id = Uuid::new_v4();
        self.subscribers.insert(id, channel);
        info!(
            "Notification subscriber {} connected ({} online)",
            id,
            self.subscribers.len()
        );
        id
    }

    pub fn unsubscribe(&self, id: Uuid) -> bool {
        self.subscribers.remove(&id).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// 推送给发送时刻在线的全部订阅者
    pub fn send_notification(&self, notification: &NotificationReady) -> BroadcastReport {
        // 先取快照，推送期间不持有分片锁
        let snapshot: Vec<(Uuid, Arc<dyn PushChannel>)> = self
            .subscribers
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        let mut report = BroadcastReport::default();
        for (id, channel) in snapshot {
            match channel.push(notification) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!("Dropping notification subscriber {}: {}", id, e);
                    if self.subscribers.remove(&id).is_some() {
                        report.removed += 1;
                    }
                }
            }
        }

        debug!(
            request_id = %notification.request_id,
            delivered = report.delivered,
            removed = report.removed,
            "Notification broadcast"
        );
        report
    }
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NotificationHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationHub")
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

#[async_trait]
impl MessageHandler for NotificationHub {
    async fn handle_message(&self, message: &Message) -> Result<()> {
        let notification: NotificationReady = message.decode()?;
        let report = self.send_notification(&notification);
        info!(
            request_id = %notification.request_id,
            patient_id = %notification.patient_id,
            "Notification pushed to {} subscribers",
            report.delivered
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "notification-hub"
    }
}

/// 流式订阅
pub struct Subscription {
    id: Uuid,
    receiver: mpsc::Receiver<NotificationReady>,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn recv(&mut self) -> Option<NotificationReady> {
        self.receiver.recv().await
    }
}

impl Stream for Subscription {
    type Item = NotificationReady;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            if registry.remove(&self.id).is_some() {
                debug!("Notification subscriber {} disconnected", self.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pacs_core::{Topic, NotificationType};

    struct BrokenChannel;

    impl PushChannel for BrokenChannel {
        fn push(&self, _notification: &NotificationReady) -> Result<()> {
            Err(PacsError::Bus("socket closed".into()))
        }
    }

    fn notification(critical: bool) -> NotificationReady {
        NotificationReady::from_result(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "HIGH_RISK_PNEUMONIA",
            0.91,
            critical,
        )
    }

    #[tokio::test]
    async fn test_every_subscriber_receives_notification() {
        let hub = NotificationHub::new();
        let mut first = hub.subscribe();
        let mut second = hub.subscribe();

        let report = hub.send_notification(&notification(true));
        assert_eq!(report.delivered, 2);

        let received = first.recv().await.unwrap();
        assert_eq!(received.notification_type, NotificationType::Critical);
        assert_eq!(received.message, "Analysis complete. Diagnosis: HIGH_RISK_PNEUMONIA");
        assert!(second.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_failed_subscriber_is_removed_without_affecting_others() {
        let hub = NotificationHub::new();
        let mut healthy = hub.subscribe();
        hub.register(Arc::new(BrokenChannel));
        assert_eq!(hub.subscriber_count(), 2);

        let report = hub.send_notification(&notification(false));
        assert_eq!(report, BroadcastReport { delivered: 1, removed: 1 });
        assert_eq!(hub.subscriber_count(), 1);
        assert!(healthy.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_stalled_subscriber_is_removed_when_buffer_fills() {
        let hub = NotificationHub::with_buffer(2);
        let mut reader = hub.subscribe();
        let _stalled = hub.subscribe();

        for _ in 0..2 {
            assert_eq!(hub.send_notification(&notification(false)).delivered, 2);
            assert!(reader.recv().await.is_some());
        }

        let report = hub.send_notification(&notification(true));
        assert_eq!(report, BroadcastReport { delivered: 1, removed: 1 });
        assert_eq!(hub.subscriber_count(), 1);
        assert_eq!(reader.recv().await.unwrap().notification_type, NotificationType::Critical);
    }

    #[tokio::test]
    async fn test_dropped_subscription_unregisters() {
        let hub = NotificationHub::new();
        let subscription = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 1);
        drop(subscription);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_no_subscribers_is_not_an_error() {
        let hub = NotificationHub::new();
        let message = Message::from_event(&notification(false), "test").unwrap();
        assert_eq!(message.topic, Topic::NotificationReady);
        hub.handle_message(&message).await.unwrap();
    }
}
