//! # PACS工作流模块
//!
//! 检查申请跨服务工作流的五个组件：
//! - 检查受理：持久化患者与检查申请，发布检查请求
//! - 工作列表：幂等创建放射科任务，扫描采集后完成任务并请求分析
//! - 自动分析：对影像评分并发布风险评估
//! - 结果对账：单次完成检查申请、触发归档、发布通知
//! - 工作流引擎：按服务角色把上述组件挂到消息总线

pub mod analysis;
pub mod archive;
pub mod engine;
pub mod intake;
pub mod radiology;
pub mod reconciler;
pub mod state_machine;
pub mod worklist;

// 重新导出主要类型
pub use analysis::{AnalysisWorker, Assessment, DiagnosisLabel, DigestScorer, RiskScorer, CRITICAL_THRESHOLD};
pub use archive::{ArchiveWorker, ImageArchiver};
pub use engine::{ServiceRole, WorkflowDependencies, WorkflowEngine, WorkflowSettings};
pub use intake::{ExaminationRequest, IntakeCoordinator};
pub use radiology::{ScanCapture, ScanUpload};
pub use reconciler::{ArchiveMode, ReconcileOutcome, ResultReconciler};
pub use state_machine::{ExaminationEvent, ExaminationStateMachine, StateMachine, TaskEvent, TaskStateMachine};
pub use worklist::{CreateOutcome, WorklistManager};
