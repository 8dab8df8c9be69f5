//! 状态定义：Agent 标识、状态机与只读快照
//!
//! 状态只允许 Pending -> Working -> {Success | Failed | Cancelled}，终态不可再变。

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Agent 标识：进程内单调递增，数值越小创建越早
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct AgentId(u64);

static NEXT_AGENT_ID: AtomicU64 = AtomicU64::new(1);

impl AgentId {
    pub fn next() -> Self {
        Self(NEXT_AGENT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for AgentId {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Agent 状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Pending,
    Working,
    Success,
    Failed,
    Cancelled,
}

impl AgentStatus {
    pub const ALL: [AgentStatus; 5] = [
        AgentStatus::Pending,
        AgentStatus::Working,
        AgentStatus::Success,
        AgentStatus::Failed,
        AgentStatus::Cancelled,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentStatus::Success | AgentStatus::Failed | AgentStatus::Cancelled
        )
    }

    /// 状态机允许的唯一迁移集合
    pub fn can_transition_to(&self, next: AgentStatus) -> bool {
        matches!(
            (self, next),
            (AgentStatus::Pending, AgentStatus::Working)
                | (AgentStatus::Working, AgentStatus::Success)
                | (AgentStatus::Working, AgentStatus::Failed)
                | (AgentStatus::Working, AgentStatus::Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Pending => "PENDING",
            AgentStatus::Working => "WORKING",
            AgentStatus::Success => "SUCCESS",
            AgentStatus::Failed => "FAILED",
            AgentStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一次状态迁移（回调与事件携带）
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StatusChange {
    pub agent_id: AgentId,
    pub from: AgentStatus,
    pub to: AgentStatus,
    pub at: DateTime<Utc>,
}

/// 轻量只读快照，供查询与 UI 投影
#[derive(Clone, Debug, Serialize)]
pub struct AgentSnapshot {
    pub id: AgentId,
    pub name: String,
    pub description: String,
    pub status: AgentStatus,
    pub progress: u8,
    pub iterations: usize,
    pub tool_calls: usize,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl AgentSnapshot {
    /// 执行耗时（秒），未结束时为 None
    pub fn execution_secs(&self) -> Option<f64> {
        match (self.started_at, self.ended_at) {
            (Some(s), Some(e)) => Some((e - s).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }
}

/// 各状态计数
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub total: usize,
    pub pending: usize,
    pub working: usize,
    pub success: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl StatusCounts {
    pub fn add(&mut self, status: AgentStatus) {
        self.total += 1;
        match status {
            AgentStatus::Pending => self.pending += 1,
            AgentStatus::Working => self.working += 1,
            AgentStatus::Success => self.success += 1,
            AgentStatus::Failed => self.failed += 1,
            AgentStatus::Cancelled => self.cancelled += 1,
        }
    }

    pub fn get(&self, status: AgentStatus) -> usize {
        match status {
            AgentStatus::Pending => self.pending,
            AgentStatus::Working => self.working,
            AgentStatus::Success => self.success,
            AgentStatus::Failed => self.failed,
            AgentStatus::Cancelled => self.cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_forward_transitions_allowed() {
        let allowed: Vec<(AgentStatus, AgentStatus)> = AgentStatus::ALL
            .iter()
            .flat_map(|a| AgentStatus::ALL.iter().map(move |b| (*a, *b)))
            .filter(|(a, b)| a.can_transition_to(*b))
            .collect();
        assert_eq!(
            allowed,
            vec![
                (AgentStatus::Pending, AgentStatus::Working),
                (AgentStatus::Working, AgentStatus::Success),
                (AgentStatus::Working, AgentStatus::Failed),
                (AgentStatus::Working, AgentStatus::Cancelled),
            ]
        );
    }

    #[test]
    fn test_terminal_states_are_sinks() {
        for s in AgentStatus::ALL.iter().filter(|s| s.is_terminal()) {
            assert!(AgentStatus::ALL.iter().all(|n| !s.can_transition_to(*n)));
        }
    }

    #[test]
    fn test_agent_ids_are_monotonic() {
        let a = AgentId::next();
        let b = AgentId::next();
        assert!(b > a);
    }

    #[test]
    fn test_status_counts() {
        let mut c = StatusCounts::default();
        c.add(AgentStatus::Working);
        c.add(AgentStatus::Working);
        c.add(AgentStatus::Failed);
        assert_eq!(c.total, 3);
        assert_eq!(c.get(AgentStatus::Working), 2);
        assert_eq!(c.get(AgentStatus::Failed), 1);
    }
}
