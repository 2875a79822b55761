//! 消息总线
//!
//! 服务间的全部协作都经由持久化队列完成：
//! - 统一的消息信封（主题、关联ID、投递次数）
//! - 至少一次投递：处理成功才确认
//! - 瞬时错误按退避策略重投，其余错误进入死信
//! - RabbitMQ实现（跨进程部署）与进程内实现（单机部署与测试，见 `memory_bus`）

use crate::dead_letter::{DeadLetter, DeadLetterQueue};
use crate::metrics::{DeliveryOutcome, WorkflowMetrics};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use lapin::{
    options::*, publisher_confirm::Confirmation, types::AMQPValue, types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use pacs_core::{PacsError, Result, Topic, WorkflowEvent};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 消息封装
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub topic: Topic,
    pub correlation_id: Uuid,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
    /// 此前已失败的投递次数
    pub attempt: u32,
    pub last_error: Option<String>,
}

impl Message {
    pub fn new(topic: Topic, correlation_id: Uuid, source: &str, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic,
            correlation_id,
            source: source.to_string(),
            timestamp: Utc::now(),
            payload,
            attempt: 0,
            last_error: None,
        }
    }

    /// 由工作流事件构造消息
    pub fn from_event<E: WorkflowEvent>(event: &E, source: &str) -> Result<Self> {
        let payload = serde_json::to_value(event)?;
        Ok(Self::new(E::TOPIC, event.correlation_id(), source, payload))
    }

    /// 解码为具体事件，主题不符视为不可重试错误
    pub fn decode<E: WorkflowEvent>(&self) -> Result<E> {
        if self.topic != E::TOPIC {
            return Err(PacsError::Validation(format!(
                "Message {} belongs to {}, expected {}",
                self.id,
                self.topic,
                E::TOPIC
            )));
        }
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// 生成下一次投递的副本
    pub fn next_attempt(&self, error: &PacsError) -> Self {
        Self {
            attempt: self.attempt + 1,
            last_error: Some(error.to_string()),
            ..self.clone()
        }
    }

    /// 重放时清空失败记录
    pub fn reset_attempts(mut self) -> Self {
        self.attempt = 0;
        self.last_error = None;
        self
    }
}

/// 消息处理器接口
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// 处理消息，返回错误时由总线决定重投或进入死信
    async fn handle_message(&self, message: &Message) -> Result<()>;

    /// 获取处理器名称
    fn name(&self) -> &str;
}

/// 消息总线接口
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// 发布消息；返回成功即表示消息已持久化入队
    async fn publish(&self, message: Message) -> Result<()>;

    /// 为主题注册消费者
    async fn subscribe(&self, topic: Topic, handler: Arc<dyn MessageHandler>) -> Result<()>;

    /// 当前留存的死信
    async fn dead_letters(&self) -> Vec<DeadLetter>;

    /// 重放死信：以全新的投递次数重新发布原消息
    async fn replay_dead_letter(&self, id: Uuid) -> Result<Message>;
}

/// 按事件类型发布的便捷接口
#[async_trait]
pub trait EventPublisher {
    async fn publish_event<E: WorkflowEvent + 'static>(&self, event: &E, source: &str) -> Result<Uuid>;
}

#[async_trait]
impl<T: MessageBus + ?Sized> EventPublisher for T {
    async fn publish_event<E: WorkflowEvent + 'static>(&self, event: &E, source: &str) -> Result<Uuid> {
        let message = Message::from_event(event, source)?;
        let message_id = message.id;
        self.publish(message).await?;
        Ok(message_id)
    }
}

/// 单次投递的处理结论
#[derive(Debug)]
pub enum Disposition {
    Ack,
    Retry { message: Message, delay: Duration },
    DeadLetter(DeadLetter),
}

/// 把消息交给处理器，并根据结果决定确认、重投或死信
///
/// 处理器在独立任务中运行，panic 只影响当前消息。
pub async fn deliver(
    handler: Arc<dyn MessageHandler>,
    message: Message,
    policy: &RetryPolicy,
    metrics: &WorkflowMetrics,
) -> Disposition {
    let topic = message.topic;
    let task_handler = handler.clone();
    let task_message = message.clone();
    let outcome =
        tokio::spawn(async move { task_handler.handle_message(&task_message).await }).await;

    let failure = match outcome {
        Ok(Ok(())) => {
            debug!(
                message_id = %message.id,
                correlation_id = %message.correlation_id,
                consumer = handler.name(),
                "Message processed"
            );
            metrics.record_delivery(topic, DeliveryOutcome::Ack);
            return Disposition::Ack;
        }
        Ok(Err(err)) => err,
        Err(join_err) => PacsError::Internal(format!("handler aborted: {}", join_err)),
    };

    let failed_attempts = message.attempt + 1;
    if failure.is_transient() && policy.allows_retry(failed_attempts) {
        let delay = policy.backoff_for(failed_attempts);
        warn!(
            message_id = %message.id,
            correlation_id = %message.correlation_id,
            consumer = handler.name(),
            attempt = failed_attempts,
            max_attempts = policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %failure,
            "Message handling failed, scheduling redelivery"
        );
        metrics.record_delivery(topic, DeliveryOutcome::Retry);
        Disposition::Retry {
            message: message.next_attempt(&failure),
            delay,
        }
    } else {
        error!(
            message_id = %message.id,
            correlation_id = %message.correlation_id,
            consumer = handler.name(),
            attempt = failed_attempts,
            error_kind = failure.kind(),
            error = %failure,
            "Message dead-lettered"
        );
        metrics.record_delivery(topic, DeliveryOutcome::DeadLetter);
        let failed = message.next_attempt(&failure);
        Disposition::DeadLetter(DeadLetter::new(
            failed,
            handler.name(),
            failure.kind(),
            failure.to_string(),
        ))
    }
}

/// 消息队列配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageQueueConfig {
    pub url: String,
    /// 每个消费者通道的未确认消息上限
    pub prefetch_count: u16,
    /// 每个主题并发处理的消息数
    pub consumers_per_topic: usize,
}

impl Default for MessageQueueConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672/%2f".to_string(),
            prefetch_count: 10,
            consumers_per_topic: 4,
        }
    }
}

/// 队列配置
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub name: String,
    pub durable: bool,
    pub arguments: FieldTable,
}

impl QueueConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            durable: true,
            arguments: FieldTable::default(),
        }
    }

    /// 设置死信队列
    pub fn with_dead_letter_exchange(mut self, exchange: &str, routing_key: Option<&str>) -> Self {
        self.arguments.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(exchange.to_string().into()),
        );
        if let Some(key) = routing_key {
            self.arguments.insert(
                "x-dead-letter-routing-key".into(),
                AMQPValue::LongString(key.to_string().into()),
            );
        }
        self
    }

    /// 工作流主题的队列：无法解析的消息由 broker 转入死信队列
    pub fn for_topic(topic: Topic) -> Self {
        let config = Self::new(topic.as_str());
        if topic == Topic::DeadLetter {
            config
        } else {
            config.with_dead_letter_exchange("", Some(Topic::DeadLetter.as_str()))
        }
    }
}

/// RabbitMQ消息总线
pub struct RabbitMqBus {
    connection: Connection,
    channel: Channel,
    config: MessageQueueConfig,
    policy: RetryPolicy,
    dead_letters: Arc<DeadLetterQueue>,
    metrics: Arc<WorkflowMetrics>,
}

impl RabbitMqBus {
    /// 连接并声明全部持久化队列
    pub async fn connect(
        config: MessageQueueConfig,
        policy: RetryPolicy,
        metrics: Arc<WorkflowMetrics>,
    ) -> Result<Self> {
        let connection = Connection::connect(
            &config.url,
            ConnectionProperties::default().with_connection_name("pacs-workflow".into()),
        )
        .await
        .map_err(bus_error)?;
        let channel = connection.create_channel().await.map_err(bus_error)?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(bus_error)?;

        let bus = Self {
            connection,
            channel,
            config,
            policy,
            dead_letters: Arc::new(DeadLetterQueue::new()),
            metrics,
        };

        bus.declare_queue(QueueConfig::for_topic(Topic::DeadLetter)).await?;
        for topic in Topic::workflow_topics() {
            bus.declare_queue(QueueConfig::for_topic(topic)).await?;
        }

        info!("Connected to message queue: {}", bus.config.url);
        Ok(bus)
    }

    /// 声明队列
    pub async fn declare_queue(&self, queue_config: QueueConfig) -> Result<()> {
        self.channel
            .queue_declare(
                &queue_config.name,
                QueueDeclareOptions {
                    durable: queue_config.durable,
                    ..QueueDeclareOptions::default()
                },
                queue_config.arguments,
            )
            .await
            .map_err(bus_error)?;
        debug!("Queue declared: {}", queue_config.name);
        Ok(())
    }

    /// 断开连接
    pub async fn disconnect(&self) -> Result<()> {
        self.connection.close(200, "shutdown").await.map_err(bus_error)?;
        info!("Disconnected from message queue");
        Ok(())
    }
}

#[async_trait]
impl MessageBus for RabbitMqBus {
    async fn publish(&self, message: Message) -> Result<()> {
        publish_confirmed(&self.channel, message.topic.as_str(), &message).await?;
        self.metrics.record_published(message.topic);
        Ok(())
    }

    async fn subscribe(&self, topic: Topic, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let channel = self.connection.create_channel().await.map_err(bus_error)?;
        channel
            .basic_qos(self.config.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(bus_error)?;

        let consumer_tag = format!("{}-{}", handler.name(), Uuid::new_v4());
        let mut consumer = channel
            .basic_consume(
                topic.as_str(),
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(bus_error)?;

        info!(
            "Started consuming messages from queue: {} ({})",
            topic,
            handler.name()
        );

        let permits = Arc::new(Semaphore::new(self.config.consumers_per_topic.max(1)));
        let context = ConsumerContext {
            publisher: self.channel.clone(),
            handler,
            policy: self.policy.clone(),
            dead_letters: self.dead_letters.clone(),
            metrics: self.metrics.clone(),
        };

        tokio::spawn(async move {
            // 消费者通道须与消费循环同生命周期
            let _channel = channel;
            while let Some(delivery) = consumer.next().await {
                let delivery = match delivery {
                    Ok(delivery) => delivery,
                    Err(e) => {
                        error!("Consumer {} failed: {}", consumer_tag, e);
                        break;
                    }
                };
                let Ok(permit) = permits.clone().acquire_owned().await else {
                    break;
                };
                let context = context.clone();
                tokio::spawn(async move {
                    context.process(delivery).await;
                    drop(permit);
                });
            }
            warn!("Consumer {} stopped", consumer_tag);
        });

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

#[derive(Clone)]
struct ConsumerContext {
    publisher: Channel,
    handler: Arc<dyn MessageHandler>,
    policy: RetryPolicy,
    dead_letters: Arc<DeadLetterQueue>,
    metrics: Arc<WorkflowMetrics>,
}

impl ConsumerContext {
    async fn process(&self, delivery: lapin::message::Delivery) {
        let message: Message = match serde_json::from_slice(&delivery.data) {
            Ok(message) => message,
            Err(e) => {
                error!(
                    "Discarding malformed message on {}: {}",
                    delivery.routing_key.as_str(),
                    e
                );
                let rejected = delivery
                    .nack(BasicNackOptions {
                        requeue: false,
                        ..BasicNackOptions::default()
                    })
                    .await;
                if let Err(e) = rejected {
                    error!("Failed to reject malformed message: {}", e);
                }
                return;
            }
        };

        match deliver(self.handler.clone(), message, &self.policy, &self.metrics).await {
            Disposition::Ack => {}
            Disposition::Retry { message, delay } => {
                tokio::time::sleep(delay).await;
                if let Err(e) = publish_confirmed(&self.publisher, message.topic.as_str(), &message).await {
                    // 重投失败时让 broker 重新投递原消息
                    error!("Failed to schedule redelivery of {}: {}", message.id, e);
                    let requeued = delivery
                        .nack(BasicNackOptions {
                            requeue: true,
                            ..BasicNackOptions::default()
                        })
                        .await;
                    if let Err(e) = requeued {
                        error!("Failed to requeue message: {}", e);
                    }
                    return;
                }
            }
            Disposition::DeadLetter(letter) => {
                let archived = serde_json::to_vec(&letter)
                    .map_err(PacsError::from)
                    .map(|payload| (payload, letter.message.correlation_id));
                match archived {
                    Ok((payload, correlation_id)) => {
                        let properties = message_properties(letter.id, correlation_id);
                        if let Err(e) =
                            publish_raw(&self.publisher, Topic::DeadLetter.as_str(), &payload, properties).await
                        {
                            error!("Failed to publish dead letter {}: {}", letter.id, e);
                        }
                    }
                    Err(e) => error!("Failed to encode dead letter {}: {}", letter.id, e),
                }
                self.dead_letters.push(letter).await;
            }
        }

        if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
            error!("Failed to acknowledge message: {}", e);
        }
    }
}

fn message_properties(message_id: Uuid, correlation_id: Uuid) -> BasicProperties {
    BasicProperties::default()
        .with_content_type("application/json".into())
        .with_delivery_mode(2)
        .with_message_id(message_id.to_string().into())
        .with_correlation_id(correlation_id.to_string().into())
        .with_timestamp(Utc::now().timestamp() as u64)
}

async fn publish_confirmed(channel: &Channel, queue: &str, message: &Message) -> Result<()> {
    let payload = serde_json::to_vec(message)?;
    publish_raw(
        channel,
        queue,
        &payload,
        message_properties(message.id, message.correlation_id),
    )
    .await?;
    debug!(
        message_id = %message.id,
        correlation_id = %message.correlation_id,
        "Message published to {}",
        queue
    );
    Ok(())
}

async fn publish_raw(channel: &Channel, queue: &str, payload: &[u8], properties: BasicProperties) -> Result<()> {
    let confirm = channel
        .basic_publish("", queue, BasicPublishOptions::default(), payload, properties)
        .await
        .map_err(bus_error)?
        .await
        .map_err(bus_error)?;

    match confirm {
        Confirmation::Nack(nack) => {
            error!("Message publish rejected: {:?}", nack);
            Err(PacsError::Bus(format!("Publish to {} rejected by broker", queue)))
        }
        _ => Ok(()),
    }
}

fn bus_error(err: lapin::Error) -> PacsError {
    PacsError::Bus(err.to_string())
}
