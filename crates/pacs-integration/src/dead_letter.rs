//! 死信队列
//!
//! 重试用尽或遇到不可重试错误的消息在这里留档，可供运维查询和重放。

use crate::message_queue::Message;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

/// 死信记录
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub id: Uuid,
    pub message: Message,
    /// 处理失败的消费者名称
    pub consumer: String,
    pub error_kind: String,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(message: Message, consumer: &str, error_kind: &str, reason: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            message,
            consumer: consumer.to_string(),
            error_kind: error_kind.to_string(),
            reason,
            failed_at: Utc::now(),
        }
    }
}

/// 死信存档
#[derive(Debug, Default)]
pub struct DeadLetterQueue {
    letters: RwLock<Vec<DeadLetter>>,
}

impl DeadLetterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, letter: DeadLetter) {
        self.letters.write().await.push(letter);
    }

    /// 按失败时间排列的全部死信
    pub async fn list(&self) -> Vec<DeadLetter> {
        self.letters.read().await.clone()
    }

    /// 取出一条死信（重放前调用）
    pub async fn take(&self, id: Uuid) -> Option<DeadLetter> {
        let mut letters = self.letters.write().await;
        let index = letters.iter().position(|letter| letter.id == id)?;
        Some(letters.remove(index))
    }

    pub async fn len(&self) -> usize {
        self.letters.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.letters.read().await.is_empty()
    }
}
