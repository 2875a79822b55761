//! 数据库查询操作

use crate::connection::DatabasePool;
use crate::models::*;
use crate::repository::{ExaminationRepository, PatientRepository, TaskRepository};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pacs_core::{Examination, ExaminationStatus, ExaminationTask, Patient, Result, TaskStatus};
use sqlx::PgPool;
use uuid::Uuid;

/// 数据库结构管理
pub struct DatabaseQueries<'a> {
    pool: &'a DatabasePool,
}

impl<'a> DatabaseQueries<'a> {
    pub fn new(pool: &'a DatabasePool) -> Self {
        Self { pool }
    }

    /// 创建数据库表
    pub async fn create_tables(&self) -> Result<()> {
        let pool = self.pool.pool();

        // 患者表
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS patients (
                id UUID PRIMARY KEY,
                full_name VARCHAR(255) NOT NULL,
                email VARCHAR(255),
                date_of_birth DATE,
                created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
            )
        "#,
        )
        .execute(pool)
        .await?;

        // 检查申请表
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS examinations (
                id UUID PRIMARY KEY,
                patient_id UUID NOT NULL REFERENCES patients(id),
                modality VARCHAR(16) NOT NULL,
                doctor_notes TEXT,
                status VARCHAR(20) NOT NULL DEFAULT 'REQUESTED',
                risk_score DOUBLE PRECISION,
                diagnosis VARCHAR(64),
                is_critical BOOLEAN,
                archived_image_id UUID,
                created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                completed_at TIMESTAMP WITH TIME ZONE,
                notified_at TIMESTAMP WITH TIME ZONE
            )
        "#,
        )
        .execute(pool)
        .await?;

        // 早期建的表没有通知时间列
        sqlx::query("ALTER TABLE examinations ADD COLUMN IF NOT EXISTS notified_at TIMESTAMP WITH TIME ZONE")
            .execute(pool)
            .await?;

        // 检查任务表（放射科服务独立部署时不与上面两张表同库，因此不建外键）
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS examination_tasks (
                id UUID PRIMARY KEY,
                patient_id UUID NOT NULL,
                patient_full_name VARCHAR(255) NOT NULL,
                expected_modality VARCHAR(16) NOT NULL,
                doctor_notes TEXT,
                is_urgent BOOLEAN NOT NULL DEFAULT FALSE,
                status VARCHAR(20) NOT NULL DEFAULT 'PENDING',
                result_object_key VARCHAR(255),
                requested_at TIMESTAMP WITH TIME ZONE NOT NULL,
                created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                completed_at TIMESTAMP WITH TIME ZONE
            )
        "#,
        )
        .execute(pool)
        .await?;

        self.create_indexes().await?;

        tracing::info!("Database tables created successfully");
        Ok(())
    }

    /// 创建数据库索引
    async fn create_indexes(&self) -> Result<()> {
        let pool = self.pool.pool();

        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_examinations_patient_id ON examinations(patient_id)",
            "CREATE INDEX IF NOT EXISTS idx_tasks_status_created ON examination_tasks(status, created_at)",
            "CREATE INDEX IF NOT EXISTS idx_tasks_patient_status ON examination_tasks(patient_id, status)",
        ];

        for index_sql in indexes {
            sqlx::query(index_sql).execute(pool).await?;
        }

        tracing::info!("Database indexes created successfully");
        Ok(())
    }
}

// ========== 患者 ==========

/// PostgreSQL患者仓储
#[derive(Debug, Clone)]
pub struct PgPatientRepository {
    pool: PgPool,
}

impl PgPatientRepository {
    pub fn new(pool: &DatabasePool) -> Self {
        Self { pool: pool.pool().clone() }
    }
}

#[async_trait]
impl PatientRepository for PgPatientRepository {
    async fn insert(&self, patient: &Patient) -> Result<()> {
        sqlx::query(
            "INSERT INTO patients (id, full_name, email, date_of_birth, created_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(patient.id)
        .bind(&patient.full_name)
        .bind(&patient.email)
        .bind(patient.date_of_birth)
        .bind(patient.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find(&self, id: Uuid) -> Result<Option<Patient>> {
        let row = sqlx::query_as::<_, DbPatient>(
            "SELECT id, full_name, email, date_of_birth, created_at FROM patients WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Patient::from))
    }
}

// ========== 检查申请 ==========

const EXAMINATION_COLUMNS: &str = "id, patient_id, modality, doctor_notes, status, risk_score, \
     diagnosis, is_critical, archived_image_id, created_at, completed_at, notified_at";

/// PostgreSQL检查申请仓储
#[derive(Debug, Clone)]
pub struct PgExaminationRepository {
    pool: PgPool,
}

impl PgExaminationRepository {
    pub fn new(pool: &DatabasePool) -> Self {
        Self { pool: pool.pool().clone() }
    }
}

#[async_trait]
impl ExaminationRepository for PgExaminationRepository {
    async fn insert(&self, examination: &Examination) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO examinations (id, patient_id, modality, doctor_notes, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
        "#,
        )
        .bind(examination.id)
        .bind(examination.patient_id)
        .bind(&examination.modality)
        .bind(&examination.doctor_notes)
        .bind(examination.status.as_str())
        .bind(examination.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find(&self, id: Uuid) -> Result<Option<Examination>> {
        let sql = format!("SELECT {} FROM examinations WHERE id = $1", EXAMINATION_COLUMNS);
        let row = sqlx::query_as::<_, DbExamination>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Examination::try_from).transpose()
    }

    async fn complete_if_requested(&self, examination: &Examination) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE examinations
               SET status = $2, risk_score = $3, diagnosis = $4, is_critical = $5, completed_at = $6
             WHERE id = $1 AND status = $7
        "#,
        )
        .bind(examination.id)
        .bind(examination.status.as_str())
        .bind(examination.risk_score)
        .bind(&examination.diagnosis)
        .bind(examination.is_critical)
        .bind(examination.completed_at)
        .bind(ExaminationStatus::Requested.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 && self.find(examination.id).await?.is_none() {
            return Err(pacs_core::PacsError::NotFound(format!(
                "Examination {} not found",
                examination.id
            )));
        }
        Ok(result.rows_affected() == 1)
    }

    async fn set_archived_image_if_absent(&self, id: Uuid, archive_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE examinations SET archived_image_id = $2 WHERE id = $1 AND archived_image_id IS NULL",
        )
        .bind(id)
        .bind(archive_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 && self.find(id).await?.is_none() {
            return Err(pacs_core::PacsError::NotFound(format!("Examination {} not found", id)));
        }
        Ok(result.rows_affected() == 1)
    }

    async fn mark_notified_if_unset(&self, id: Uuid, notified_at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query("UPDATE examinations SET notified_at = $2 WHERE id = $1 AND notified_at IS NULL")
            .bind(id)
            .bind(notified_at)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 && self.find(id).await?.is_none() {
            return Err(pacs_core::PacsError::NotFound(format!("Examination {} not found", id)));
        }
        Ok(result.rows_affected() == 1)
    }
}

// ========== 检查任务 ==========

const TASK_COLUMNS: &str = "id, patient_id, patient_full_name, expected_modality, doctor_notes, \
     is_urgent, status, result_object_key, requested_at, created_at, completed_at";

/// PostgreSQL检查任务仓储
#[derive(Debug, Clone)]
pub struct PgTaskRepository {
    pool: PgPool,
}

impl PgTaskRepository {
    pub fn new(pool: &DatabasePool) -> Self {
        Self { pool: pool.pool().clone() }
    }

    async fn fetch_tasks(&self, sql: &str, patient_id: Option<Uuid>, status: TaskStatus) -> Result<Vec<ExaminationTask>> {
        let mut query = sqlx::query_as::<_, DbExaminationTask>(sql);
        if let Some(patient_id) = patient_id {
            query = query.bind(patient_id);
        }
        let rows = query.bind(status.as_str()).fetch_all(&self.pool).await?;
        rows.into_iter().map(ExaminationTask::try_from).collect()
    }
}

#[async_trait]
impl TaskRepository for PgTaskRepository {
    async fn insert_if_absent(&self, task: &ExaminationTask) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO examination_tasks (
                id, patient_id, patient_full_name, expected_modality, doctor_notes,
                is_urgent, status, result_object_key, requested_at, created_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO NOTHING
        "#,
        )
        .bind(task.id)
        .bind(task.patient_id)
        .bind(&task.patient_full_name)
        .bind(&task.expected_modality)
        .bind(&task.doctor_notes)
        .bind(task.is_urgent)
        .bind(task.status.as_str())
        .bind(&task.result_object_key)
        .bind(task.requested_at)
        .bind(task.created_at)
        .bind(task.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn find(&self, id: Uuid) -> Result<Option<ExaminationTask>> {
        let sql = format!("SELECT {} FROM examination_tasks WHERE id = $1", TASK_COLUMNS);
        let row = sqlx::query_as::<_, DbExaminationTask>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(ExaminationTask::try_from).transpose()
    }

    async fn find_by_status(&self, status: TaskStatus) -> Result<Vec<ExaminationTask>> {
        let sql = format!(
            "SELECT {} FROM examination_tasks WHERE status = $1 ORDER BY created_at ASC",
            TASK_COLUMNS
        );
        self.fetch_tasks(&sql, None, status).await
    }

    async fn find_by_patient_and_status(
        &self,
        patient_id: Uuid,
        status: TaskStatus,
    ) -> Result<Vec<ExaminationTask>> {
        let sql = format!(
            "SELECT {} FROM examination_tasks WHERE patient_id = $1 AND status = $2 ORDER BY created_at ASC",
            TASK_COLUMNS
        );
        self.fetch_tasks(&sql, Some(patient_id), status).await
    }

    async fn update_if_status(&self, task: &ExaminationTask, expected: TaskStatus) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE examination_tasks
               SET status = $2, result_object_key = $3, completed_at = $4
             WHERE id = $1 AND status = $5
        "#,
        )
        .bind(task.id)
        .bind(task.status.as_str())
        .bind(&task.result_object_key)
        .bind(task.completed_at)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 && self.find(task.id).await?.is_none() {
            return Err(pacs_core::PacsError::NotFound(format!("Task {} not found", task.id)));
        }
        Ok(result.rows_affected() == 1)
    }
}
