//! 仓储接口
//!
//! 所有会被重复投递触发的写操作都以条件写的形式给出（不存在才插入、
//! 状态匹配才更新），幂等性由存储层的原子性保证。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pacs_core::{Examination, ExaminationTask, Patient, Result, TaskStatus};
use uuid::Uuid;

/// 患者仓储
#[async_trait]
pub trait PatientRepository: Send + Sync {
    async fn insert(&self, patient: &Patient) -> Result<()>;

    async fn find(&self, id: Uuid) -> Result<Option<Patient>>;
}

/// 检查申请仓储
#[async_trait]
pub trait ExaminationRepository: Send + Sync {
    async fn insert(&self, examination: &Examination) -> Result<()>;

    async fn find(&self, id: Uuid) -> Result<Option<Examination>>;

    /// 仅当库中记录仍为 REQUESTED 时写入完成结果，返回是否写入
    async fn complete_if_requested(&self, examination: &Examination) -> Result<bool>;

    /// 仅当尚未记录归档ID时写入，返回是否写入
    async fn set_archived_image_if_absent(&self, id: Uuid, archive_id: Uuid) -> Result<bool>;

    /// 仅当尚未记录通知时间时写入，返回是否写入
    async fn mark_notified_if_unset(&self, id: Uuid, notified_at: DateTime<Utc>) -> Result<bool>;
}

/// 检查任务仓储
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// 以任务ID为键，不存在才插入，返回是否插入
    async fn insert_if_absent(&self, task: &ExaminationTask) -> Result<bool>;

    async fn find(&self, id: Uuid) -> Result<Option<ExaminationTask>>;

    /// 按创建时间升序返回指定状态的任务
    async fn find_by_status(&self, status: TaskStatus) -> Result<Vec<ExaminationTask>>;

    /// 按创建时间升序返回某患者指定状态的任务
    async fn find_by_patient_and_status(
        &self,
        patient_id: Uuid,
        status: TaskStatus,
    ) -> Result<Vec<ExaminationTask>>;

    /// 仅当库中状态等于 `expected` 时整体更新任务，返回是否更新
    async fn update_if_status(&self, task: &ExaminationTask, expected: TaskStatus) -> Result<bool>;
}
