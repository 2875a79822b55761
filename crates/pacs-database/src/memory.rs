//! 内存仓储实现

use crate::repository::{ExaminationRepository, PatientRepository, TaskRepository};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pacs_core::{Examination, ExaminationStatus, ExaminationTask, PacsError, Patient, Result, TaskStatus};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// 内存患者仓储
#[derive(Debug, Default)]
pub struct InMemoryPatientRepository {
    patients: RwLock<HashMap<Uuid, Patient>>,
}

impl InMemoryPatientRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PatientRepository for InMemoryPatientRepository {
    async fn insert(&self, patient: &Patient) -> Result<()> {
        let mut patients = self.patients.write().await;
        if patients.contains_key(&patient.id) {
            return Err(PacsError::Database(format!("Patient {} already exists", patient.id)));
        }
        patients.insert(patient.id, patient.clone());
        Ok(())
    }

    async fn find(&self, id: Uuid) -> Result<Option<Patient>> {
        Ok(self.patients.read().await.get(&id).cloned())
    }
}

/// 内存检查申请仓储
#[derive(Debug, Default)]
pub struct InMemoryExaminationRepository {
    examinations: RwLock<HashMap<Uuid, Examination>>,
}

impl InMemoryExaminationRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.examinations.read().await.len()
    }
}

#[async_trait]
impl ExaminationRepository for InMemoryExaminationRepository {
    async fn insert(&self, examination: &Examination) -> Result<()> {
        let mut examinations = self.examinations.write().await;
        if examinations.contains_key(&examination.id) {
            return Err(PacsError::Database(format!(
                "Examination {} already exists",
                examination.id
            )));
        }
        examinations.insert(examination.id, examination.clone());
        Ok(())
    }

    async fn find(&self, id: Uuid) -> Result<Option<Examination>> {
        Ok(self.examinations.read().await.get(&id).cloned())
    }

    async fn complete_if_requested(&self, examination: &Examination) -> Result<bool> {
        let mut examinations = self.examinations.write().await;
        match examinations.get_mut(&examination.id) {
            Some(stored) if stored.status == ExaminationStatus::Requested => {
                *stored = examination.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(PacsError::NotFound(format!(
                "Examination {} not found",
                examination.id
            ))),
        }
    }

    async fn set_archived_image_if_absent(&self, id: Uuid, archive_id: Uuid) -> Result<bool> {
        let mut examinations = self.examinations.write().await;
        let stored = examinations
            .get_mut(&id)
            .ok_or_else(|| PacsError::NotFound(format!("Examination {} not found", id)))?;

        if stored.archived_image_id.is_some() {
            return Ok(false);
        }
        stored.archived_image_id = Some(archive_id);
        Ok(true)
    }

    async fn mark_notified_if_unset(&self, id: Uuid, notified_at: DateTime<Utc>) -> Result<bool> {
        let mut examinations = self.examinations.write().await;
        let stored = examinations
            .get_mut(&id)
            .ok_or_else(|| PacsError::NotFound(format!("Examination {} not found", id)))?;

        if stored.notified_at.is_some() {
            return Ok(false);
        }
        stored.notified_at = Some(notified_at);
        Ok(true)
    }
}

/// 内存检查任务仓储
///
/// 额外记录插入序号，创建时间相同时仍能保证先进先出。
#[derive(Debug, Default)]
pub struct InMemoryTaskRepository {
    tasks: RwLock<HashMap<Uuid, (u64, ExaminationTask)>>,
    sequence: std::sync::atomic::AtomicU64,
}

impl InMemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    async fn select<F>(&self, predicate: F) -> Vec<ExaminationTask>
    where
        F: Fn(&ExaminationTask) -> bool,
    {
        let tasks = self.tasks.read().await;
        let mut selected: Vec<&(u64, ExaminationTask)> =
            tasks.values().filter(|(_, task)| predicate(task)).collect();
        selected.sort_by(|(seq_a, a), (seq_b, b)| {
            a.created_at.cmp(&b.created_at).then(seq_a.cmp(seq_b))
        });
        selected.into_iter().map(|(_, task)| task.clone()).collect()
    }
}

#[async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn insert_if_absent(&self, task: &ExaminationTask) -> Result<bool> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Ok(false);
        }
        let seq = self
            .sequence
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        tasks.insert(task.id, (seq, task.clone()));
        Ok(true)
    }

    async fn find(&self, id: Uuid) -> Result<Option<ExaminationTask>> {
        Ok(self.tasks.read().await.get(&id).map(|(_, task)| task.clone()))
    }

    async fn find_by_status(&self, status: TaskStatus) -> Result<Vec<ExaminationTask>> {
        Ok(self.select(|task| task.status == status).await)
    }

    async fn find_by_patient_and_status(
        &self,
        patient_id: Uuid,
        status: TaskStatus,
    ) -> Result<Vec<ExaminationTask>> {
        Ok(self
            .select(|task| task.patient_id == patient_id && task.status == status)
            .await)
    }

    async fn update_if_status(&self, task: &ExaminationTask, expected: TaskStatus) -> Result<bool> {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(&task.id) {
            Some((_, stored)) if stored.status == expected => {
                *stored = task.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(PacsError::NotFound(format!("Task {} not found", task.id))),
        }
    }
}
