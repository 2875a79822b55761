//! 自动风险分析
//!
//! 下载影像、调用评分策略、发布 `RiskAssessed`。
//! 评分在阻塞线程池上执行并受超时约束，超时按瞬时错误处理。

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use pacs_core::{AnalysisRequested, PacsError, Result, RiskAssessed};
use pacs_integration::{EventPublisher, Message, MessageBus, MessageHandler};
use pacs_storage::BlobStore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

const SOURCE: &str = "analysis";

/// 危急阈值：分数严格大于该值即为危急
pub const CRITICAL_THRESHOLD: f64 = 0.70;

/// 诊断标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiagnosisLabel {
    HighRiskPneumonia,
    ModerateRisk,
    NoPathology,
}

impl DiagnosisLabel {
    pub fn from_score(score: f64) -> Self {
        if score > 0.85 {
            Self::HighRiskPneumonia
        } else if score > 0.50 {
            Self::ModerateRisk
        } else {
            Self::NoPathology
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HighRiskPneumonia => "HIGH_RISK_PNEUMONIA",
            Self::ModerateRisk => "MODERATE_RISK",
            Self::NoPathology => "NO_PATHOLOGY",
        }
    }
}

/// 一次评估的结论
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Assessment {
    pub risk_score: f64,
    pub diagnosis: DiagnosisLabel,
    pub is_critical: bool,
}

impl Assessment {
    pub fn from_score(score: f64) -> Result<Self> {
        if !score.is_finite() {
            return Err(PacsError::Internal(format!("Scorer returned {}", score)));
        }
        let risk_score = score.clamp(0.0, 1.0);
        Ok(Self {
            risk_score,
            diagnosis: DiagnosisLabel::from_score(risk_score),
            is_critical: risk_score > CRITICAL_THRESHOLD,
        })
    }
}

/// 评分策略，可能阻塞
pub trait RiskScorer: Send + Sync {
    fn score(&self, image: &[u8]) -> f64;
}

/// 默认评分策略：影像内容的 SHA-256 摘要映射到 [0, 1]，同一影像得分恒定
#[derive(Debug, Clone, Default)]
pub struct DigestScorer {
    latency: Duration,
}

impl DigestScorer {
    pub fn new(latency: Duration) -> Self {
        Self { latency }
    }
}

impl RiskScorer for DigestScorer {
    fn score(&self, image: &[u8]) -> f64 {
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        let digest = Sha256::digest(image);
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(prefix) as f64 / u64::MAX as f64
    }
}

/// 分析工作者
pub struct AnalysisWorker {
    blobs: Arc<dyn BlobStore>,
    scorer: Arc<dyn RiskScorer>,
    bus: Arc<dyn MessageBus>,
    inference_timeout: Duration,
}

impl AnalysisWorker {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        scorer: Arc<dyn RiskScorer>,
        bus: Arc<dyn MessageBus>,
        inference_timeout: Duration,
    ) -> Self {
        Self {
            blobs,
            scorer,
            bus,
            inference_timeout,
        }
    }

    /// 对一幅影像评分
    ///
    /// 超时后阻塞线程上的评分不会被中断，其结果被丢弃。
    pub async fn analyze(
        &self,
        request_id: Uuid,
        patient_id: Uuid,
        object_key: &str,
        image: Bytes,
    ) -> Result<RiskAssessed> {
        let scorer = self.scorer.clone();
        let inference = tokio::task::spawn_blocking(move || scorer.score(&image));

        let score = match tokio::time::timeout(self.inference_timeout, inference).await {
            Ok(Ok(score)) => score,
            Ok(Err(e)) => return Err(PacsError::Internal(format!("Inference task failed: {}", e))),
            Err(_) => {
                return Err(PacsError::Timeout(format!(
                    "Inference for {} exceeded {} ms",
                    request_id,
                    self.inference_timeout.as_millis()
                )))
            }
        };

        let assessment = Assessment::from_score(score)?;
        Ok(RiskAssessed {
            request_id,
            patient_id,
            object_key: Some(object_key.to_string()),
            risk_score: assessment.risk_score,
            diagnosis_label: assessment.diagnosis.as_str().to_string(),
            is_critical: assessment.is_critical,
            analyzed_at: Utc::now(),
        })
    }

    /// 处理分析请求并发布结果
    pub async fn process(&self, request: &AnalysisRequested) -> Result<RiskAssessed> {
        let image = self.blobs.download(&request.object_key).await?;
        let result = self
            .analyze(request.request_id, request.patient_id, &request.object_key, image)
            .await?;
        self.bus.publish_event(&result, SOURCE).await?;

        info!(
            request_id = %result.request_id,
            patient_id = %result.patient_id,
            critical = result.is_critical,
            "Analysis finished: {} ({:.3})",
            result.diagnosis_label,
            result.risk_score
        );
        Ok(result)
    }
}

#[async_trait]
impl MessageHandler for AnalysisWorker {
    async fn handle_message(&self, message: &Message) -> Result<()> {
        let request: AnalysisRequested = message.decode()?;
        self.process(&request).await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "analysis-worker"
    }
}
