//! 数据库模型

use chrono::{DateTime, NaiveDate, Utc};
use pacs_core::{Examination, ExaminationStatus, ExaminationTask, PacsError, Patient, TaskStatus};
use sqlx::FromRow;
use uuid::Uuid;

// 数据库表模型 - 使用FromRow trait用于SQL查询

/// 数据库患者表
#[derive(Debug, FromRow)]
pub struct DbPatient {
    pub id: Uuid,
    pub full_name: String,
    pub email: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
}

impl From<DbPatient> for Patient {
    fn from(db_patient: DbPatient) -> Self {
        Patient {
            id: db_patient.id,
            full_name: db_patient.full_name,
            email: db_patient.email,
            date_of_birth: db_patient.date_of_birth,
            created_at: db_patient.created_at,
        }
    }
}

/// 数据库检查申请表
#[derive(Debug, FromRow)]
pub struct DbExamination {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub modality: String,
    pub doctor_notes: Option<String>,
    pub status: String, // 存储为字符串，转换为ExaminationStatus枚举
    pub risk_score: Option<f64>,
    pub diagnosis: Option<String>,
    pub is_critical: Option<bool>,
    pub archived_image_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub notified_at: Option<DateTime<Utc>>,
}

impl TryFrom<DbExamination> for Examination {
    type Error = PacsError;

    fn try_from(row: DbExamination) -> Result<Self, Self::Error> {
        let status = ExaminationStatus::parse(&row.status).ok_or_else(|| {
            PacsError::Database(format!(
                "Examination {} has unknown status '{}'",
                row.id, row.status
            ))
        })?;

        Ok(Examination {
            id: row.id,
            patient_id: row.patient_id,
            modality: row.modality,
            doctor_notes: row.doctor_notes,
            status,
            risk_score: row.risk_score,
            diagnosis: row.diagnosis,
            is_critical: row.is_critical,
            archived_image_id: row.archived_image_id,
            created_at: row.created_at,
            completed_at: row.completed_at,
            notified_at: row.notified_at,
        })
    }
}

/// 数据库检查任务表
#[derive(Debug, FromRow)]
pub struct DbExaminationTask {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub patient_full_name: String,
    pub expected_modality: String,
    pub doctor_notes: Option<String>,
    pub is_urgent: bool,
    pub status: String,
    pub result_object_key: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<DbExaminationTask> for ExaminationTask {
    type Error = PacsError;

    fn try_from(row: DbExaminationTask) -> Result<Self, Self::Error> {
        let status = TaskStatus::parse(&row.status).ok_or_else(|| {
            PacsError::Database(format!("Task {} has unknown status '{}'", row.id, row.status))
        })?;

        Ok(ExaminationTask {
            id: row.id,
            patient_id: row.patient_id,
            patient_full_name: row.patient_full_name,
            expected_modality: row.expected_modality,
            doctor_notes: row.doctor_notes,
            is_urgent: row.is_urgent,
            status,
            result_object_key: row.result_object_key,
            requested_at: row.requested_at,
            created_at: row.created_at,
            completed_at: row.completed_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_status_is_rejected() {
        let row = DbExaminationTask {
            id: Uuid::new_v4(),
            patient_id: Uuid::new_v4(),
            patient_full_name: "Jane Doe".into(),
            expected_modality: "CT".into(),
            doctor_notes: None,
            is_urgent: true,
            status: "ARCHIVED".into(),
            result_object_key: None,
            requested_at: Utc::now(),
            created_at: Utc::now(),
            completed_at: None,
        };
        assert!(matches!(ExaminationTask::try_from(row), Err(PacsError::Database(_))));
    }

    #[test]
    fn test_examination_row_conversion() {
        let row = DbExamination {
            id: Uuid::new_v4(),
            patient_id: Uuid::new_v4(),
            modality: "CT".into(),
            doctor_notes: Some("chest pain".into()),
            status: "COMPLETED".into(),
            risk_score: Some(0.92),
            diagnosis: Some("HIGH_RISK_PNEUMONIA".into()),
            is_critical: Some(true),
            archived_image_id: None,
            created_at: Utc::now(),
            completed_at: Some(Utc::now()),
            notified_at: None,
        };
        let exam = Examination::try_from(row).unwrap();
        assert!(exam.is_completed());
        assert_eq!(exam.is_critical, Some(true));
    }
}
