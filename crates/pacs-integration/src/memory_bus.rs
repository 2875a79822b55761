//! 进程内消息总线
//!
//! 每个主题一条无界通道，由固定数量的工作任务竞争消费；
//! 重投与死信规则与 RabbitMQ 实现一致。消息不落盘，进程退出即丢失，
//! 仅适用于单进程部署和测试。

use crate::dead_letter::{DeadLetter, DeadLetterQueue};
use crate::message_queue::{deliver, Disposition, Message, MessageBus, MessageHandler};
use crate::metrics::WorkflowMetrics;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use pacs_core::{PacsError, Result, Topic};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 发布记录保留条数
const JOURNAL_CAPACITY: usize = 4096;

struct TopicQueue {
    sender: mpsc::UnboundedSender<Message>,
    receiver: Option<mpsc::UnboundedReceiver<Message>>,
    /// 已发布但尚未确认或死信的消息数（含等待重投的）
    in_flight: Arc<AtomicUsize>,
    subscribed: bool,
}

impl TopicQueue {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Some(receiver),
            in_flight: Arc::new(AtomicUsize::new(0)),
            subscribed: false,
        }
    }
}

/// 进程内消息总线
pub struct InMemoryBus {
    queues: Mutex<HashMap<Topic, TopicQueue>>,
    journal: RwLock<VecDeque<Message>>,
    dead_letters: Arc<DeadLetterQueue>,
    policy: RetryPolicy,
    workers_per_topic: usize,
    metrics: Arc<WorkflowMetrics>,
}

impl InMemoryBus {
    pub fn new(policy: RetryPolicy, workers_per_topic: usize, metrics: Arc<WorkflowMetrics>) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            journal: RwLock::new(VecDeque::new()),
            dead_letters: Arc::new(DeadLetterQueue::new()),
            policy,
            workers_per_topic: workers_per_topic.max(1),
            metrics,
        }
    }

    pub fn metrics(&self) -> &Arc<WorkflowMetrics> {
        &self.metrics
    }

    /// 最近发布到某主题的消息（按发布顺序）
    pub async fn published(&self, topic: Topic) -> Vec<Message> {
        self.journal
            .read()
            .await
            .iter()
            .filter(|message| message.topic == topic)
            .cloned()
            .collect()
    }

    /// 等待所有已订阅主题处理完毕
    ///
    /// 未订阅主题上的积压不计入。超时返回 `false`。
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let pending: usize = {
                let queues = self.queues.lock().await;
                queues
                    .values()
                    .filter(|queue| queue.subscribed)
                    .map(|queue| queue.in_flight.load(Ordering::SeqCst))
                    .sum()
            };
            if pending == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                warn!("Bus still has {} messages in flight after {:?}", pending, timeout);
                return false;
            }
            sleep(Duration::from_millis(5)).await;
        }
    }

    async fn record(&self, message: &Message) {
        let mut journal = self.journal.write().await;
        if journal.len() == JOURNAL_CAPACITY {
            journal.pop_front();
        }
        journal.push_back(message.clone());
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, message: Message) -> Result<()> {
        {
            let mut queues = self.queues.lock().await;
            let queue = queues.entry(message.topic).or_insert_with(TopicQueue::new);
            queue.in_flight.fetch_add(1, Ordering::SeqCst);
            if queue.sender.send(message.clone()).is_err() {
                queue.in_flight.fetch_sub(1, Ordering::SeqCst);
                return Err(PacsError::Bus(format!("Queue {} is closed", message.topic)));
            }
        }

        debug!(
            message_id = %message.id,
            correlation_id = %message.correlation_id,
            "Message published to {}",
            message.topic
        );
        self.metrics.record_published(message.topic);
        self.record(&message).await;
        Ok(())
    }

    async fn subscribe(&self, topic: Topic, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let mut queues = self.queues.lock().await;
        let queue = queues.entry(topic).or_insert_with(TopicQueue::new);
        let receiver = queue.receiver.take().ok_or_else(|| {
            PacsError::Bus(format!("Queue {} already has a consumer", topic))
        })?;
        queue.subscribed = true;

        let receiver = Arc::new(Mutex::new(receiver));
        for worker_id in 0..self.workers_per_topic {
            let worker = Worker {
                receiver: receiver.clone(),
                redelivery: queue.sender.downgrade(),
                in_flight: queue.in_flight.clone(),
                handler: handler.clone(),
                policy: self.policy.clone(),
                dead_letters: self.dead_letters.clone(),
                metrics: self.metrics.clone(),
            };
            tokio::spawn(worker.run(worker_id));
        }

        info!(
            "Started {} workers on {} ({})",
            self.workers_per_topic,
            topic,
            handler.name()
        );
        Ok(())
    }

    async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.list().await
    }

    async fn replay_dead_letter(&self, id: Uuid) -> Result<Message> {
        let letter = self
            .dead_letters
            .take(id)
            .await
            .ok_or_else(|| PacsError::NotFound(format!("Dead letter {} not found", id)))?;
        let message = letter.message.clone().reset_attempts();
        if let Err(e) = self.publish(message.clone()).await {
            self.dead_letters.push(letter).await;
            return Err(e);
        }
        info!(
            dead_letter_id = %id,
            message_id = %message.id,
            topic = %message.topic,
            "Dead letter replayed"
        );
        Ok(message)
    }
}

struct Worker {
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<Message>>>,
    redelivery: mpsc::WeakUnboundedSender<Message>,
    in_flight: Arc<AtomicUsize>,
    handler: Arc<dyn MessageHandler>,
    policy: RetryPolicy,
    dead_letters: Arc<DeadLetterQueue>,
    metrics: Arc<WorkflowMetrics>,
}

impl Worker {
    async fn run(self, worker_id: usize) {
        loop {
            let next = { self.receiver.lock().await.recv().await };
            let Some(message) = next else {
                break;
            };

            match deliver(self.handler.clone(), message, &self.policy, &self.metrics).await {
                Disposition::Ack => {
                    self.in_flight.fetch_sub(1, Ordering::SeqCst);
                }
                Disposition::Retry { message, delay } => {
                    let redelivery = self.redelivery.clone();
                    let in_flight = self.in_flight.clone();
                    tokio::spawn(async move {
                        sleep(delay).await;
                        let sent = redelivery
                            .upgrade()
                            .map(|sender| sender.send(message).is_ok())
                            .unwrap_or(false);
                        if !sent {
                            in_flight.fetch_sub(1, Ordering::SeqCst);
                        }
                    });
                }
                Disposition::DeadLetter(letter) => {
                    self.dead_letters.push(letter).await;
                    self.in_flight.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }
        debug!("Worker {} for {} stopped", worker_id, self.handler.name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct CountingHandler {
        calls: AtomicU32,
        fail_first: u32,
        error: fn() -> PacsError,
    }

    impl CountingHandler {
        fn new(fail_first: u32, error: fn() -> PacsError) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                fail_first,
                error,
            })
        }
    }

    #[async_trait]
    impl MessageHandler for CountingHandler {
        async fn handle_message(&self, _message: &Message) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err((self.error)());
            }
            Ok(())
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    fn bus(max_attempts: u32) -> InMemoryBus {
        let policy = RetryPolicy::default()
            .with_max_attempts(max_attempts)
            .with_backoff(Duration::from_millis(1), Duration::from_millis(5));
        InMemoryBus::new(policy, 2, Arc::new(WorkflowMetrics::new().unwrap()))
    }

    fn message() -> Message {
        Message::new(
            Topic::NotificationReady,
            Uuid::new_v4(),
            "test",
            serde_json::json!({"hello": "world"}),
        )
    }

    #[tokio::test]
    async fn test_messages_published_before_subscribe_are_buffered() {
        let bus = bus(3);
        bus.publish(message()).await.unwrap();
        bus.publish(message()).await.unwrap();

        let handler = CountingHandler::new(0, || PacsError::Bus("unused".into()));
        bus.subscribe(Topic::NotificationReady, handler.clone()).await.unwrap();

        assert!(bus.wait_idle(Duration::from_secs(2)).await);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert_eq!(bus.published(Topic::NotificationReady).await.len(), 2);
    }

    #[tokio::test]
    async fn test_transient_failures_are_redelivered() {
        let bus = bus(3);
        let handler = CountingHandler::new(2, || PacsError::Storage("blob store down".into()));
        bus.subscribe(Topic::NotificationReady, handler.clone()).await.unwrap();

        bus.publish(message()).await.unwrap();

        assert!(bus.wait_idle(Duration::from_secs(2)).await);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert!(bus.dead_letters().await.is_empty());
    }

    #[tokio::test]
    async fn test_dead_letter_and_replay() {
        let bus = bus(2);
        let handler = CountingHandler::new(2, || PacsError::Collaborator("archive 503".into()));
        bus.subscribe(Topic::NotificationReady, handler.clone()).await.unwrap();

        bus.publish(message()).await.unwrap();
        assert!(bus.wait_idle(Duration::from_secs(2)).await);

        let letters = bus.dead_letters().await;
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].message.attempt, 2);
        assert_eq!(letters[0].consumer, "counting");

        let replayed = bus.replay_dead_letter(letters[0].id).await.unwrap();
        assert_eq!(replayed.attempt, 0);
        assert!(bus.wait_idle(Duration::from_secs(2)).await);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert!(bus.dead_letters().await.is_empty());
    }

    #[tokio::test]
    async fn test_second_consumer_is_rejected() {
        let bus = bus(1);
        let handler = CountingHandler::new(0, || PacsError::Bus("unused".into()));
        bus.subscribe(Topic::RiskAssessed, handler.clone()).await.unwrap();
        assert!(matches!(
            bus.subscribe(Topic::RiskAssessed, handler).await,
            Err(PacsError::Bus(_))
        ));
    }

    #[tokio::test]
    async fn test_replay_unknown_dead_letter() {
        let bus = bus(1);
        assert!(matches!(
            bus.replay_dead_letter(Uuid::new_v4()).await,
            Err(PacsError::NotFound(_))
        ));
    }
}
