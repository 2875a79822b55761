//! 核心数据模型定义

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 患者基本信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Patient {
    pub id: Uuid,
    pub full_name: String,
    pub email: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
}

impl Patient {
    pub fn new(full_name: String, email: Option<String>, date_of_birth: Option<NaiveDate>) -> Self {
        Self {
            id: Uuid::new_v4(),
            full_name,
            email,
            date_of_birth,
            created_at: Utc::now(),
        }
    }
}

/// 检查状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExaminationStatus {
    Requested, // 已申请
    Completed, // 已完成
}

impl ExaminationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "REQUESTED",
            Self::Completed => "COMPLETED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "REQUESTED" => Some(Self::Requested),
            "COMPLETED" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// 检查申请
///
/// `id` 即整个工作流的关联ID（requestId）。只有结果对账会修改它，
/// 并且 REQUESTED → COMPLETED 只发生一次。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Examination {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub modality: String,
    pub doctor_notes: Option<String>,
    pub status: ExaminationStatus,
    pub risk_score: Option<f64>,
    pub diagnosis: Option<String>,
    pub is_critical: Option<bool>,
    pub archived_image_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// 结果通知已发出的时间，重复结果据此判断是否还需补发
    pub notified_at: Option<DateTime<Utc>>,
}

impl Examination {
    pub fn new(patient_id: Uuid, modality: String, doctor_notes: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            patient_id,
            modality,
            doctor_notes,
            status: ExaminationStatus::Requested,
            risk_score: None,
            diagnosis: None,
            is_critical: None,
            archived_image_id: None,
            created_at: Utc::now(),
            completed_at: None,
            notified_at: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == ExaminationStatus::Completed
    }
}

/// 检查任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,   // 待处理
    Completed, // 已完成
    Cancelled, // 已取消
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(Self::Pending),
            "COMPLETED" => Some(Self::Completed),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// 已完成和已取消都是终态
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// 放射科工作项，与检查申请一一对应（同一个关联ID）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExaminationTask {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub patient_full_name: String,
    pub expected_modality: String,
    pub doctor_notes: Option<String>,
    pub is_urgent: bool,
    pub status: TaskStatus,
    pub result_object_key: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}
