//! 结果记录持久化
//!
//! Agent 结束后把完整记录（状态、结果或错误、工具使用日志、完整对话）写成 JSON 文件，可再读回。
//! 文件名：`agent_<id>_<时间戳>_<运行 id 前 8 位>.json`。

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::agent::AgentOutcome;
use crate::core::state::{AgentId, AgentStatus};
use crate::memory::Message;
use crate::tools::ToolUsage;

/// 持久化的 Agent 记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AgentRecord {
    pub id: AgentId,
    /// 进程级运行 id，区分不同进程中同号的 Agent
    pub run_id: Uuid,
    pub name: String,
    pub description: String,
    pub status: AgentStatus,
    pub progress: u8,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub execution_secs: Option<f64>,
    pub result: Option<AgentOutcome>,
    pub error: Option<String>,
    pub tool_usage: Vec<ToolUsage>,
    pub conversation: Vec<Message>,
}

/// 目录式记录存储
#[derive(Debug, Clone)]
pub struct RecordStore {
    dir: PathBuf,
    run_id: Uuid,
}

impl RecordStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            run_id: Uuid::new_v4(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 写入一条记录，返回文件路径；目录不存在时自动创建
    pub fn save(&self, record: &AgentRecord) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("create results dir {}", self.dir.display()))?;
        let run = record.run_id.simple().to_string();
        let file = format!(
            "agent_{}_{}_{}.json",
            record.id,
            Utc::now().format("%Y%m%d_%H%M%S"),
            &run[..8]
        );
        let path = self.dir.join(file);
        let json = serde_json::to_string_pretty(record)?;
        std::fs::write(&path, json).with_context(|| format!("write {}", path.display()))?;
        tracing::debug!(agent_id = %record.id, path = %path.display(), "agent record saved");
        Ok(path)
    }

    pub fn load(&self, path: impl AsRef<Path>) -> anyhow::Result<AgentRecord> {
        let path = path.as_ref();
        let data =
            std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        Ok(serde_json::from_str(&data)?)
    }

    /// 目录中全部记录文件（按文件名排序）
    pub fn list(&self) -> anyhow::Result<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut files: Vec<PathBuf> = std::fs::read_dir(&self.dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension().map(|x| x == "json").unwrap_or(false)
                    && p.file_name()
                        .and_then(|n| n.to_str())
                        .map(|n| n.starts_with("agent_"))
                        .unwrap_or(false)
            })
            .collect();
        files.sort();
        Ok(files)
    }
}

/// 记录的 JSON Schema（供外部消费者校验）
pub fn record_schema_json() -> String {
    let schema = schemars::schema_for!(AgentRecord);
    serde_json::to_string_pretty(&schema).unwrap_or_else(|_| "{}".to_string())
}
