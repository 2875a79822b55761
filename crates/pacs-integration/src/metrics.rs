//! 工作流指标（Prometheus）

use pacs_core::{PacsError, Result, Topic};
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// 消息处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Ack,
    Retry,
    DeadLetter,
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::Retry => "retry",
            Self::DeadLetter => "dead_letter",
        }
    }
}

/// 工作流指标集合
#[derive(Clone)]
pub struct WorkflowMetrics {
    registry: Registry,
    published: IntCounterVec,
    handled: IntCounterVec,
    subscribers: IntGauge,
}

impl WorkflowMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let published = IntCounterVec::new(
            Opts::new("pacs_messages_published_total", "Messages published per topic"),
            &["topic"],
        )
        .map_err(metrics_error)?;
        let handled = IntCounterVec::new(
            Opts::new(
                "pacs_messages_handled_total",
                "Message deliveries per topic and outcome",
            ),
            &["topic", "outcome"],
        )
        .map_err(metrics_error)?;
        let subscribers = IntGauge::new(
            "pacs_notification_subscribers",
            "Currently connected notification subscribers",
        )
        .map_err(metrics_error)?;

        registry.register(Box::new(published.clone())).map_err(metrics_error)?;
        registry.register(Box::new(handled.clone())).map_err(metrics_error)?;
        registry.register(Box::new(subscribers.clone())).map_err(metrics_error)?;

        Ok(Self {
            registry,
            published,
            handled,
            subscribers,
        })
    }

    pub fn record_published(&self, topic: Topic) {
        self.published.with_label_values(&[topic.as_str()]).inc();
    }

    pub fn record_delivery(&self, topic: Topic, outcome: DeliveryOutcome) {
        self.handled
            .with_label_values(&[topic.as_str(), outcome.as_str()])
            .inc();
    }

    pub fn set_subscribers(&self, count: usize) {
        self.subscribers.set(count as i64);
    }

    pub fn delivery_count(&self, topic: Topic, outcome: DeliveryOutcome) -> u64 {
        self.handled
            .with_label_values(&[topic.as_str(), outcome.as_str()])
            .get()
    }

    pub fn published_count(&self, topic: Topic) -> u64 {
        self.published.with_label_values(&[topic.as_str()]).get()
    }

    /// 以Prometheus文本格式导出
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| PacsError::Internal(e.to_string()))
    }
}

impl std::fmt::Debug for WorkflowMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowMetrics")
            .field("subscribers", &self.subscribers.get())
            .finish()
    }
}

fn metrics_error(err: prometheus::Error) -> PacsError {
    PacsError::Internal(format!("metrics: {}", err))
}
