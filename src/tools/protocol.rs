//! 文本内嵌工具协议
//!
//! 语法（大小写不敏感）：
//!
//! ```text
//! <tool name="web_search">            工具名：name 属性，或 <name>/<n>/<tool_name> 子元素
//!   <parameters>                      可选容器：parameters / params / arguments
//!     <query>site:example.com</query>                      直接标签
//!     <parameter name="region">eu</parameter>              属性命名
//!     <parameter><name>lang</name><value>en</value></parameter>   嵌套名值对
//!     <parameter_name>page</parameter_name><value>2</value>       相邻名值对
//!   </parameters>
//! </tool>
//! ```
//!
//! 检测结果是三态：NoMatch（模型在叙述）、Invalid（块指向已知工具但缺必填参数）、Matched。
//! 同一回复中多个块时取第一个完整的块。

use std::collections::BTreeMap;

use crate::core::definition::AgentSpec;
use crate::core::error::CreationError;
use crate::tools::markup::{self, Element};

/// 已解析、可执行的工具调用
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Command {
    pub tool_name: String,
    pub parameters: BTreeMap<String, String>,
}

impl Command {
    pub fn new(tool_name: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn with(mut self, k: impl Into<String>, v: impl Into<String>) -> Self {
        self.parameters.insert(k.into(), v.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }
}

/// 参数书写形式（按尝试顺序）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamForm {
    /// `<parameter name="k">v</parameter>`
    Attribute,
    /// `<parameter><name>k</name><value>v</value></parameter>`
    NamedPair,
    /// `<parameter_name>k</parameter_name><value>v</value>`
    SiblingPair,
    /// `<k>v</k>`
    Direct,
}

/// 检测结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    NoMatch,
    Invalid {
        tool: String,
        diagnostic: String,
        offset: usize,
    },
    Matched {
        command: Command,
        offset: usize,
    },
}

impl Detection {
    pub fn is_match(&self) -> bool {
        matches!(self, Detection::Matched { .. })
    }

    pub fn offset(&self) -> Option<usize> {
        match self {
            Detection::NoMatch => None,
            Detection::Invalid { offset, .. } | Detection::Matched { offset, .. } => Some(*offset),
        }
    }
}

/// 文本中的一个工具块
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolBlock {
    pub tool_name: String,
    pub parameters: BTreeMap<String, String>,
    pub forms: Vec<ParamForm>,
    pub offset: usize,
}

const NAME_TAGS: [&str; 3] = ["name", "n", "tool_name"];
const CONTAINER_TAGS: [&str; 3] = ["parameters", "params", "arguments"];
const PARAM_TAGS: [&str; 4] = ["parameter", "param", "arg", "argument"];
const PAIR_NAME_TAGS: [&str; 3] = ["parameter_name", "param_name", "arg_name"];
const KEY_TAGS: [&str; 4] = ["name", "n", "key", "parameter_name"];

/// 工具名归一化：去空白、小写、空格与连字符转下划线
pub fn normalize_name(s: &str) -> String {
    s.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '-' { '_' } else { c })
        .collect()
}

/// 按出现顺序列出全部工具块
pub fn scan_tool_blocks(text: &str) -> Vec<ToolBlock> {
    markup::find_blocks(text, "tool")
        .iter()
        .filter_map(tool_block)
        .collect()
}

fn tool_block(el: &Element) -> Option<ToolBlock> {
    let name = el
        .attr("name")
        .or_else(|| el.attr("tool"))
        .map(str::to_string)
        .or_else(|| el.child(&NAME_TAGS).map(Element::text))
        .filter(|n| !n.trim().is_empty())?;
    let (parameters, forms) = match el.child(&CONTAINER_TAGS) {
        Some(container) => extract_parameters(container, &[]),
        None => extract_parameters(el, &NAME_TAGS),
    };
    Some(ToolBlock {
        tool_name: normalize_name(&name),
        parameters,
        forms,
        offset: el.start,
    })
}

/// 从容器元素中按四种形式提取参数；同名参数以先出现者为准
pub fn extract_parameters(
    container: &Element,
    skip: &[&str],
) -> (BTreeMap<String, String>, Vec<ParamForm>) {
    let mut params = BTreeMap::new();
    let mut forms = Vec::new();
    let children: Vec<&Element> = container.elements().collect();
    let mut i = 0;
    while i < children.len() {
        let child = children[i];
        let name = child.name.as_str();
        i += 1;
        if skip.contains(&name) || CONTAINER_TAGS.contains(&name) {
            continue;
        }
        let found = if PARAM_TAGS.contains(&name) {
            if let Some(key) = child.attr("name").or_else(|| child.attr("key")) {
                let value = child
                    .attr("value")
                    .map(str::to_string)
                    .unwrap_or_else(|| child.text());
                Some((key.to_string(), value, ParamForm::Attribute))
            } else {
                match (child.child(&KEY_TAGS), child.child(&["value"])) {
                    (Some(k), Some(v)) => Some((k.text(), v.text(), ParamForm::NamedPair)),
                    _ => None,
                }
            }
        } else if PAIR_NAME_TAGS.contains(&name) {
            match children.get(i) {
                Some(next) if next.name == "value" => {
                    i += 1;
                    Some((child.text(), next.text(), ParamForm::SiblingPair))
                }
                _ => None,
            }
        } else if name == "value" {
            None
        } else {
            Some((name.to_string(), child.text(), ParamForm::Direct))
        };
        if let Some((key, value, form)) = found {
            let key = key.trim().to_lowercase();
            if key.is_empty() {
                continue;
            }
            if !params.contains_key(&key) {
                params.insert(key, value);
                forms.push(form);
            }
        }
    }
    (params, forms)
}

/// 针对单个工具的检测：返回第一个完整块；没有完整块时返回第一个缺参块
pub fn detect_for(text: &str, tool_name: &str, required: &[&str]) -> Detection {
    let wanted = normalize_name(tool_name);
    let mut invalid = None;
    for block in scan_tool_blocks(text) {
        if block.tool_name != wanted {
            continue;
        }
        let missing = required
            .iter()
            .find(|p| block.parameters.get(**p).map_or(true, |v| v.trim().is_empty()));
        match missing {
            None => {
                return Detection::Matched {
                    command: Command {
                        tool_name: tool_name.to_string(),
                        parameters: block.parameters,
                    },
                    offset: block.offset,
                }
            }
            Some(param) if invalid.is_none() => {
                let received: Vec<&str> = block.parameters.keys().map(String::as_str).collect();
                invalid = Some(Detection::Invalid {
                    tool: tool_name.to_string(),
                    diagnostic: format!(
                        "Tool '{tool_name}' request is missing required parameter '{param}' (received: [{}]). \
                         Resend it as <tool name=\"{tool_name}\"><{param}>...</{param}></tool>.",
                        received.join(", ")
                    ),
                    offset: block.offset,
                });
            }
            Some(_) => {}
        }
    }
    invalid.unwrap_or(Detection::NoMatch)
}

/// `<agent>` 块是否存在，以及其起始偏移
pub fn find_agent_block(text: &str) -> Option<(Element, usize)> {
    markup::find_blocks(text, "agent")
        .into_iter()
        .next()
        .map(|el| {
            let offset = el.start;
            (el, offset)
        })
}

/// 解析 `<agent>` 块为 AgentSpec（不做补全校验）
pub fn parse_agent_element(el: &Element) -> Result<AgentSpec, CreationError> {
    let text_of = |names: &[&str]| {
        el.child(names)
            .map(Element::text)
            .filter(|t| !t.is_empty())
    };
    let name = text_of(&["name", "n"]).ok_or(CreationError::MissingName)?;
    let mut spec = AgentSpec::new(name);
    spec.task_type = text_of(&["type", "task_type"]);
    spec.description = text_of(&["description"]);
    spec.instructions = text_of(&["instructions"]).or_else(|| {
        el.child(&["steps"]).map(|steps| {
            let items: Vec<String> = steps
                .elements()
                .filter(|s| s.name == "step")
                .map(Element::text)
                .filter(|s| !s.is_empty())
                .collect();
            if items.is_empty() {
                steps.text()
            } else {
                items
                    .iter()
                    .enumerate()
                    .map(|(i, s)| format!("{}. {s}", i + 1))
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        })
    });
    if let Some(params) = el.child(&CONTAINER_TAGS) {
        spec.parameters = extract_parameters(params, &[]).0;
    }
    if let Some(tools) = text_of(&["tools"]) {
        spec.tools = Some(
            tools
                .split(',')
                .map(normalize_name)
                .filter(|t| !t.is_empty())
                .collect(),
        );
    }
    Ok(spec)
}

/// 从文本中解析第一个 `<agent>` 块
pub fn parse_agent_block(text: &str) -> Result<AgentSpec, CreationError> {
    let (el, _) = find_agent_block(text).ok_or(CreationError::NoAgentBlock)?;
    parse_agent_element(&el)
}
