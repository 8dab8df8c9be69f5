//! 任务关系图
//!
//! 每个已注册 id 有 Up / Down / Left / Right 四个槽位，各自至多指向一个邻居。
//! 设置一个方向会同时在邻居上设置反方向（Up<->Down，Left<->Right）；覆盖旧链接或删除节点时，
//! 两侧的旧边一并清除，图中不存在单向悬空边。
//!
//! 添加子任务时，第一个子任务挂在父节点上，其后每个子任务挂在前一个子任务上（兄弟链表）。

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;

use serde::Serialize;
use thiserror::Error;

use crate::core::state::AgentId;

/// 关系方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    pub const ALL: [Direction; 4] = [Direction::Up, Direction::Down, Direction::Left, Direction::Right];

    pub fn reverse(self) -> Direction {
        match self {
            Direction::Up => Direction::Down,
            Direction::Down => Direction::Up,
            Direction::Left => Direction::Right,
            Direction::Right => Direction::Left,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("task {0} cannot be related to itself")]
    SelfLoop(AgentId),
}

/// 单个节点的四个槽位
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Links {
    pub up: Option<AgentId>,
    pub down: Option<AgentId>,
    pub left: Option<AgentId>,
    pub right: Option<AgentId>,
}

impl Links {
    pub fn get(&self, dir: Direction) -> Option<AgentId> {
        match dir {
            Direction::Up => self.up,
            Direction::Down => self.down,
            Direction::Left => self.left,
            Direction::Right => self.right,
        }
    }

    fn slot(&mut self, dir: Direction) -> &mut Option<AgentId> {
        match dir {
            Direction::Up => &mut self.up,
            Direction::Down => &mut self.down,
            Direction::Left => &mut self.left,
            Direction::Right => &mut self.right,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    nodes: HashMap<AgentId, Links>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// 幂等注册
    pub fn add_task(&mut self, id: AgentId) {
        self.nodes.entry(id).or_default();
    }

    pub fn contains(&self, id: AgentId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn ids(&self) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self.nodes.keys().copied().collect();
        ids.sort();
        ids
    }

    /// 设置 from 的 dir 方向为 to，并在 to 上设置反方向；未注册的 id 自动注册
    pub fn set_relation(&mut self, from: AgentId, dir: Direction, to: AgentId) -> Result<(), GraphError> {
        if from == to {
            return Err(GraphError::SelfLoop(from));
        }
        self.link(from, dir, to);
        Ok(())
    }

    /// 调用方保证 from != to
    fn link(&mut self, from: AgentId, dir: Direction, to: AgentId) {
        debug_assert_ne!(from, to);
        self.add_task(from);
        self.add_task(to);
        self.clear_relation(from, dir);
        self.clear_relation(to, dir.reverse());
        if let Some(l) = self.links_mut(from) {
            *l.slot(dir) = Some(to);
        }
        if let Some(l) = self.links_mut(to) {
            *l.slot(dir.reverse()) = Some(from);
        }
    }

    /// 清除 id 在 dir 方向上的边（两侧都清）
    pub fn clear_relation(&mut self, id: AgentId, dir: Direction) {
        let old = self.links_mut(id).and_then(|l| l.slot(dir).take());
        if let Some(other) = old {
            if let Some(l) = self.links_mut(other) {
                let back = l.slot(dir.reverse());
                if *back == Some(id) {
                    *back = None;
                }
            }
        }
    }

    fn links_mut(&mut self, id: AgentId) -> Option<&mut Links> {
        self.nodes.get_mut(&id)
    }

    pub fn neighbors(&self, id: AgentId) -> Option<Links> {
        self.nodes.get(&id).copied()
    }

    pub fn neighbor(&self, id: AgentId, dir: Direction) -> Option<AgentId> {
        self.nodes.get(&id).and_then(|l| l.get(dir))
    }

    /// 从 start 出发沿 dir 走到空槽为止；结果包含 start，遇到环即停
    pub fn chain(&self, start: AgentId, dir: Direction) -> Vec<AgentId> {
        if !self.contains(start) {
            return Vec::new();
        }
        let mut out = vec![start];
        let mut seen: HashSet<AgentId> = HashSet::from([start]);
        let mut cur = start;
        while let Some(next) = self.neighbor(cur, dir) {
            if !seen.insert(next) {
                break;
            }
            out.push(next);
            cur = next;
        }
        out
    }

    /// 把 children 挂到 parent 的第一个空闲方向（Down 优先，其次 Right），兄弟之间沿同方向串联。
    /// 两个方向都被占用时不做任何修改并返回 None。
    pub fn add_children(&mut self, parent: AgentId, children: &[AgentId]) -> Option<Direction> {
        let children: Vec<AgentId> = children.iter().copied().filter(|c| *c != parent).collect();
        if children.is_empty() {
            return None;
        }
        self.add_task(parent);
        let dir = [Direction::Down, Direction::Right]
            .into_iter()
            .find(|d| self.neighbor(parent, *d).is_none())?;
        let mut prev = parent;
        for child in children {
            if child == prev {
                continue;
            }
            self.link(prev, dir, child);
            prev = child;
        }
        Some(dir)
    }

    /// 删除节点并清除所有相关边
    pub fn remove(&mut self, id: AgentId) -> bool {
        let Some(links) = self.nodes.remove(&id) else {
            return false;
        };
        for dir in Direction::ALL {
            if let Some(other) = links.get(dir) {
                if let Some(l) = self.links_mut(other) {
                    let back = l.slot(dir.reverse());
                    if *back == Some(id) {
                        *back = None;
                    }
                }
            }
        }
        // 兜底：清掉任何仍指向 id 的槽位
        for l in self.nodes.values_mut() {
            for dir in Direction::ALL {
                let slot = l.slot(dir);
                if *slot == Some(id) {
                    *slot = None;
                }
            }
        }
        true
    }

    /// 检查反向链接性质：每条边在邻居上都有对应的反向边
    pub fn is_consistent(&self) -> bool {
        self.nodes.iter().all(|(id, links)| {
            Direction::ALL.iter().all(|dir| match links.get(*dir) {
                None => true,
                Some(other) => self.neighbor(other, dir.reverse()) == Some(*id),
            })
        })
    }

    /// Graphviz DOT 输出（Down/Right 边）
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph tasks {\n");
        for id in self.ids() {
            let _ = writeln!(out, "  \"{id}\";");
        }
        for id in self.ids() {
            if let Some(d) = self.neighbor(id, Direction::Down) {
                let _ = writeln!(out, "  \"{id}\" -> \"{d}\" [label=\"down\"];");
            }
            if let Some(r) = self.neighbor(id, Direction::Right) {
                let _ = writeln!(out, "  \"{id}\" -> \"{r}\" [label=\"right\"];");
            }
        }
        out.push('}');
        out
    }
}
