//! 状态机
//!
//! 检查任务与检查申请的合法状态转换

use pacs_core::{ExaminationStatus, PacsError, Result, TaskStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

/// 检查任务状态转换事件
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskEvent {
    ScanCaptured,
    Cancel,
}

/// 检查申请状态转换事件
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ExaminationEvent {
    AnalysisCompleted,
}

/// 通用状态机：(当前状态, 事件) → 目标状态
#[derive(Debug)]
pub struct StateMachine<S, E> {
    transitions: HashMap<(S, E), S>,
}

impl<S, E> StateMachine<S, E>
where
    S: Copy + Eq + Hash + Debug,
    E: Copy + Eq + Hash + Debug,
{
    pub fn new(rules: &[(S, E, S)]) -> Self {
        let transitions = rules
            .iter()
            .map(|(from, event, to)| ((*from, *event), *to))
            .collect();
        Self { transitions }
    }

    /// 检查状态转换是否有效
    pub fn can_transition(&self, from: S, event: E) -> bool {
        self.transitions.contains_key(&(from, event))
    }

    /// 执行状态转换
    pub fn transition(&self, from: S, event: E) -> Result<S> {
        self.transitions
            .get(&(from, event))
            .copied()
            .ok_or_else(|| PacsError::InvalidStateTransition {
                from: format!("{:?}", from),
                event: format!("{:?}", event),
            })
    }

    /// 获取状态的所有可能事件
    pub fn possible_events(&self, current: S) -> Vec<E> {
        self.transitions
            .keys()
            .filter(|(state, _)| *state == current)
            .map(|(_, event)| *event)
            .collect()
    }
}

pub type TaskStateMachine = StateMachine<TaskStatus, TaskEvent>;

pub type ExaminationStateMachine = StateMachine<ExaminationStatus, ExaminationEvent>;

impl TaskStateMachine {
    /// PENDING → COMPLETED | CANCELLED，两者皆为终态
    pub fn for_tasks() -> Self {
        Self::new(&[
            (TaskStatus::Pending, TaskEvent::ScanCaptured, TaskStatus::Completed),
            (TaskStatus::Pending, TaskEvent::Cancel, TaskStatus::Cancelled),
        ])
    }
}

impl ExaminationStateMachine {
    /// REQUESTED → COMPLETED，仅一次
    pub fn for_examinations() -> Self {
        Self::new(&[(
            ExaminationStatus::Requested,
            ExaminationEvent::AnalysisCompleted,
            ExaminationStatus::Completed,
        )])
    }
}
