//! 检查受理
//!
//! 先持久化患者与检查申请，再发布 `ExaminationRequested`。
//! 写入失败则不发布；写入成功而发布失败时返回 `OrphanedExamination`，
//! 检查申请保持 REQUESTED 状态，可查询。

use chrono::NaiveDate;
use pacs_core::{
    utils::{normalize_modality, require_non_blank},
    Examination, ExaminationRequested, PacsError, Patient, Result,
};
use pacs_database::{ExaminationRepository, PatientRepository};
use pacs_integration::{EventPublisher, MessageBus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

const SOURCE: &str = "intake";

/// 检查申请
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExaminationRequest {
    /// 已有患者的ID；为空时按下列信息登记新患者
    pub patient_id: Option<Uuid>,
    #[serde(default)]
    pub full_name: String,
    pub email: Option<String>,
    #[serde(alias = "dob")]
    pub date_of_birth: Option<NaiveDate>,
    pub modality: String,
    pub notes: Option<String>,
    #[serde(default)]
    pub is_urgent: bool,
}

/// 检查受理协调器
pub struct IntakeCoordinator {
    patients: Arc<dyn PatientRepository>,
    examinations: Arc<dyn ExaminationRepository>,
    bus: Arc<dyn MessageBus>,
}

impl IntakeCoordinator {
    pub fn new(
        patients: Arc<dyn PatientRepository>,
        examinations: Arc<dyn ExaminationRepository>,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        Self {
            patients,
            examinations,
            bus,
        }
    }

    pub async fn initiate_examination(&self, request: ExaminationRequest) -> Result<Examination> {
        require_non_blank("modality", &request.modality)?;
        let modality = normalize_modality(&request.modality);

        let patient = match request.patient_id {
            Some(patient_id) => self
                .patients
                .find(patient_id)
                .await?
                .ok_or_else(|| PacsError::NotFound(format!("Patient {} not found", patient_id)))?,
            None => {
                require_non_blank("fullName", &request.full_name)?;
                let patient = Patient::new(
                    request.full_name.trim().to_string(),
                    request.email.clone(),
                    request.date_of_birth,
                );
                self.patients.insert(&patient).await?;
                info!(patient_id = %patient.id, "Registered new patient");
                patient
            }
        };

        let examination = Examination::new(patient.id, modality.clone(), request.notes.clone());
        self.examinations.insert(&examination).await?;

        let event = ExaminationRequested {
            request_id: examination.id,
            patient_id: patient.id,
            patient_name: patient.full_name.clone(),
            modality,
            notes: request.notes,
            requested_at: examination.created_at,
            is_urgent: request.is_urgent,
        };

        if let Err(e) = self.bus.publish_event(&event, SOURCE).await {
            error!(
                request_id = %examination.id,
                patient_id = %patient.id,
                error = %e,
                "Examination persisted but request event was not published"
            );
            return Err(PacsError::OrphanedExamination {
                request_id: examination.id,
                reason: e.to_string(),
            });
        }

        info!(
            request_id = %examination.id,
            patient_id = %patient.id,
            urgent = event.is_urgent,
            "Examination requested: {}",
            event.modality
        );
        Ok(examination)
    }

    pub async fn get_examination(&self, examination_id: Uuid) -> Result<Examination> {
        self.examinations
            .find(examination_id)
            .await?
            .ok_or_else(|| PacsError::NotFound(format!("Examination {} not found", examination_id)))
    }
}
