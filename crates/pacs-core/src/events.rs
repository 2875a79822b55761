//! 事件契约
//!
//! 服务之间只通过这些不可变事件通信。每个事件都携带同一个关联ID
//! （`requestId`），它在受理时生成一次，之后各环节原样传递。

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

/// 消息主题（持久化队列）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    ExaminationRequested,
    AnalysisRequested,
    RiskAssessed,
    NotificationReady,
    ArchiveRequested,
    ArchiveCompleted,
    DeadLetter,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExaminationRequested => "examination_requests_queue",
            Self::AnalysisRequested => "analysis_queue",
            Self::RiskAssessed => "risk_assessment_queue",
            Self::NotificationReady => "notification_queue",
            Self::ArchiveRequested => "archive_requests_queue",
            Self::ArchiveCompleted => "archive_results_queue",
            Self::DeadLetter => "dead_letter_queue",
        }
    }

    /// 所有业务主题（不含死信队列）
    pub fn workflow_topics() -> [Topic; 6] {
        [
            Self::ExaminationRequested,
            Self::AnalysisRequested,
            Self::RiskAssessed,
            Self::NotificationReady,
            Self::ArchiveRequested,
            Self::ArchiveCompleted,
        ]
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 工作流事件：知道自己属于哪个主题，以及自己的关联ID
pub trait WorkflowEvent: Serialize + DeserializeOwned + Send + Sync {
    const TOPIC: Topic;

    fn correlation_id(&self) -> Uuid;
}

/// 医生发起检查申请
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExaminationRequested {
    pub request_id: Uuid,
    pub patient_id: Uuid,
    pub patient_name: String,
    pub modality: String,
    pub notes: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub is_urgent: bool,
}

impl WorkflowEvent for ExaminationRequested {
    const TOPIC: Topic = Topic::ExaminationRequested;

    fn correlation_id(&self) -> Uuid {
        self.request_id
    }
}

/// 影像已采集，请求自动分析
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRequested {
    pub request_id: Uuid,
    pub patient_id: Uuid,
    pub object_key: String,
    pub modality: String,
}

impl WorkflowEvent for AnalysisRequested {
    const TOPIC: Topic = Topic::AnalysisRequested;

    fn correlation_id(&self) -> Uuid {
        self.request_id
    }
}

/// 风险评估结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskAssessed {
    pub request_id: Uuid,
    pub patient_id: Uuid,
    pub object_key: Option<String>,
    /// 取值范围 [0, 1]
    pub risk_score: f64,
    pub diagnosis_label: String,
    pub is_critical: bool,
    pub analyzed_at: DateTime<Utc>,
}

impl WorkflowEvent for RiskAssessed {
    const TOPIC: Topic = Topic::RiskAssessed;

    fn correlation_id(&self) -> Uuid {
        self.request_id
    }
}

/// 通知级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationType {
    Info,
    Critical,
}

impl NotificationType {
    pub fn from_critical(is_critical: bool) -> Self {
        if is_critical {
            Self::Critical
        } else {
            Self::Info
        }
    }
}

/// 推送给在线客户端的通知
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationReady {
    pub patient_id: Uuid,
    pub request_id: Uuid,
    pub message: String,
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    pub diagnosis: String,
    pub risk_score: f64,
}

impl NotificationReady {
    /// 根据诊断结果生成通知，消息文本由诊断标签模板化
    pub fn from_result(
        request_id: Uuid,
        patient_id: Uuid,
        diagnosis: &str,
        risk_score: f64,
        is_critical: bool,
    ) -> Self {
        Self {
            patient_id,
            request_id,
            message: format!("Analysis complete. Diagnosis: {}", diagnosis),
            notification_type: NotificationType::from_critical(is_critical),
            diagnosis: diagnosis.to_string(),
            risk_score,
        }
    }
}

impl WorkflowEvent for NotificationReady {
    const TOPIC: Topic = Topic::NotificationReady;

    fn correlation_id(&self) -> Uuid {
        self.request_id
    }
}

/// 请求将影像归档到患者长期档案
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveRequested {
    pub request_id: Uuid,
    pub patient_id: Uuid,
    pub object_key: String,
    pub modality: String,
}

impl WorkflowEvent for ArchiveRequested {
    const TOPIC: Topic = Topic::ArchiveRequested;

    fn correlation_id(&self) -> Uuid {
        self.request_id
    }
}

/// 影像归档完成回执
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveCompleted {
    pub request_id: Uuid,
    pub patient_id: Uuid,
    pub archive_id: Uuid,
    pub archived_at: DateTime<Utc>,
}

impl WorkflowEvent for ArchiveCompleted {
    const TOPIC: Topic = Topic::ArchiveCompleted;

    fn correlation_id(&self) -> Uuid {
        self.request_id
    }
}
