//! 宽松的标记扫描器：从自由文本中切出 `<tag ...>...</tag>` 块并解析为元素树
//!
//! 只支持 XML 的一个子集：元素、属性（双引号 / 单引号 / 无引号）、文本与五个基本实体。
//! 模型输出常常夹杂叙述文字与不完整的标签，因此：
//! - 无法闭合的子元素退化为文本；
//! - 不匹配的结束标签退化为文本；
//! - 无法闭合的顶层块整体跳过。
//!
//! 整段文本只扫描一遍，耗时与输入长度成线性。
//!
//! 元素名与属性名统一转小写。

/// 元素或文本节点
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

/// 已解析元素；start/end 为在原文中的字节偏移
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Node>,
    pub start: usize,
    pub end: usize,
}

impl Element {
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|n| match n {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    /// 第一个名字在 names 中的子元素
    pub fn child(&self, names: &[&str]) -> Option<&Element> {
        self.elements().find(|e| names.contains(&e.name.as_str()))
    }

    /// 全部后代文本拼接，去首尾空白
    pub fn text(&self) -> String {
        let mut out = String::new();
        collect_text(self, &mut out);
        out.trim().to_string()
    }
}

fn collect_text(el: &Element, out: &mut String) {
    for node in &el.children {
        match node {
            Node::Text(t) => out.push_str(t),
            Node::Element(e) => collect_text(e, out),
        }
    }
}

/// 还原基本实体
pub fn unescape(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// 元素嵌套深度上限，更深处的开始标签按文本处理
pub const MAX_DEPTH: usize = 128;

/// 按出现顺序找出所有名为 tag 的完整块（大小写不敏感），块内嵌套的同名块不单独返回
pub fn find_blocks(text: &str, tag: &str) -> Vec<Element> {
    let tag = tag.to_ascii_lowercase();
    if !text.to_ascii_lowercase().contains(&format!("<{tag}")) {
        return Vec::new();
    }
    let mut out = Vec::new();
    collect_named(parse(text), &tag, &mut out);
    out
}

fn collect_named(nodes: Vec<Node>, tag: &str, out: &mut Vec<Element>) {
    for node in nodes {
        if let Node::Element(el) = node {
            if el.name == tag {
                out.push(el);
            } else {
                collect_named(el.children, tag, out);
            }
        }
    }
}

/// 尚未闭合的元素
struct Frame {
    name: String,
    attrs: Vec<(String, String)>,
    children: Vec<Node>,
    start: usize,
    /// 开始标签之后的位置
    open_end: usize,
}

enum Tag {
    Open {
        name: String,
        attrs: Vec<(String, String)>,
        self_closing: bool,
    },
    Close(String),
}

/// 单遍扫描整段文本，返回顶层节点。
///
/// 结束标签与栈中最近的同名元素配对，其上未闭合的元素退化为文本；
/// 找不到配对的结束标签、超出深度的开始标签、文本结束时仍未闭合的元素同样退化为文本。
fn parse(src: &str) -> Vec<Node> {
    let bytes = src.as_bytes();
    let mut root = Vec::new();
    let mut stack: Vec<Frame> = Vec::new();
    let mut text_start = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'<' {
            i += 1;
            continue;
        }
        let Some((tag, next)) = read_tag(src, i) else {
            i += 1;
            continue;
        };
        match tag {
            Tag::Close(name) => {
                let Some(depth) = stack.iter().rposition(|f| f.name == name) else {
                    i += 1;
                    continue;
                };
                push_text(open_children(&mut stack, &mut root), &src[text_start..i]);
                while stack.len() > depth + 1 {
                    degrade(src, &mut stack, &mut root);
                }
                if let Some(f) = stack.pop() {
                    let el = Element {
                        name: f.name,
                        attrs: f.attrs,
                        children: f.children,
                        start: f.start,
                        end: next,
                    };
                    open_children(&mut stack, &mut root).push(Node::Element(el));
                }
            }
            Tag::Open {
                name,
                attrs,
                self_closing: true,
            } => {
                let target = open_children(&mut stack, &mut root);
                push_text(target, &src[text_start..i]);
                target.push(Node::Element(Element {
                    name,
                    attrs,
                    children: Vec::new(),
                    start: i,
                    end: next,
                }));
            }
            Tag::Open { name, attrs, .. } => {
                if stack.len() >= MAX_DEPTH {
                    i += 1;
                    continue;
                }
                push_text(open_children(&mut stack, &mut root), &src[text_start..i]);
                stack.push(Frame {
                    name,
                    attrs,
                    children: Vec::new(),
                    start: i,
                    open_end: next,
                });
            }
        }
        i = next;
        text_start = next;
    }
    push_text(open_children(&mut stack, &mut root), &src[text_start..]);
    while !stack.is_empty() {
        degrade(src, &mut stack, &mut root);
    }
    root
}

fn open_children<'a>(stack: &'a mut [Frame], root: &'a mut Vec<Node>) -> &'a mut Vec<Node> {
    match stack.last_mut() {
        Some(f) => &mut f.children,
        None => root,
    }
}

/// 弹出栈顶：开始标签原文与已收集的子节点并入上一层
fn degrade(src: &str, stack: &mut Vec<Frame>, root: &mut Vec<Node>) {
    let Some(f) = stack.pop() else {
        return;
    };
    let target = open_children(stack, root);
    push_text(target, &src[f.start..f.open_end]);
    for child in f.children {
        match child {
            Node::Text(t) => push_unescaped(target, t),
            el => target.push(el),
        }
    }
}

fn is_name_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_name_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.' | b':')
}

fn skip_ws(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    i
}

fn read_name(src: &str, i: usize) -> Option<(String, usize)> {
    let bytes = src.as_bytes();
    if i >= bytes.len() || !is_name_start(bytes[i]) {
        return None;
    }
    let mut j = i + 1;
    while j < bytes.len() && is_name_char(bytes[j]) {
        j += 1;
    }
    Some((src[i..j].to_ascii_lowercase(), j))
}

/// 读取起始于 pos（必须是 `<`）的开始或结束标签，返回标签与其后的位置。
/// 扫描不越过下一个 `<`。
fn read_tag(src: &str, pos: usize) -> Option<(Tag, usize)> {
    let bytes = src.as_bytes();
    if bytes.get(pos) != Some(&b'<') {
        return None;
    }
    if bytes.get(pos + 1) == Some(&b'/') {
        let (name, j) = read_name(src, pos + 2)?;
        let j = skip_ws(bytes, j);
        return (bytes.get(j) == Some(&b'>')).then(|| (Tag::Close(name), j + 1));
    }
    let (name, mut i) = read_name(src, pos + 1)?;
    let mut attrs = Vec::new();
    loop {
        i = skip_ws(bytes, i);
        match bytes.get(i)? {
            b'>' => {
                let tag = Tag::Open {
                    name,
                    attrs,
                    self_closing: false,
                };
                return Some((tag, i + 1));
            }
            b'/' if bytes.get(i + 1) == Some(&b'>') => {
                let tag = Tag::Open {
                    name,
                    attrs,
                    self_closing: true,
                };
                return Some((tag, i + 2));
            }
            _ => {
                let (key, j) = read_name(src, i)?;
                i = skip_ws(bytes, j);
                if bytes.get(i) != Some(&b'=') {
                    attrs.push((key, String::new()));
                    continue;
                }
                i = skip_ws(bytes, i + 1);
                let (value, j) = read_attr_value(src, i)?;
                attrs.push((key, unescape(&value)));
                i = j;
            }
        }
    }
}

fn read_attr_value(src: &str, i: usize) -> Option<(String, usize)> {
    let bytes = src.as_bytes();
    let quote = *bytes.get(i)?;
    if quote == b'"' || quote == b'\'' {
        let rel = src[i + 1..].find(|c: char| c == quote as char || c == '<')?;
        let end = i + 1 + rel;
        if bytes[end] != quote {
            return None;
        }
        return Some((src[i + 1..end].to_string(), end + 1));
    }
    let mut j = i;
    while j < bytes.len() && !bytes[j].is_ascii_whitespace() && !matches!(bytes[j], b'>' | b'<') {
        if bytes[j] == b'/' && bytes.get(j + 1) == Some(&b'>') {
            break;
        }
        j += 1;
    }
    if j == i {
        return None;
    }
    Some((src[i..j].to_string(), j))
}

fn push_text(children: &mut Vec<Node>, raw: &str) {
    if !raw.is_empty() {
        push_unescaped(children, unescape(raw));
    }
}

/// 相邻文本合并为一个节点
fn push_unescaped(children: &mut Vec<Node>, text: String) {
    match children.last_mut() {
        Some(Node::Text(prev)) => prev.push_str(&text),
        _ => children.push(Node::Text(text)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finds_block_inside_narration() {
        let text = "Let me search.\n<tool name=\"web_search\">\n  <query>a &amp; b</query>\n</tool>\nDone.";
        let blocks = find_blocks(text, "tool");
        assert_eq!(blocks.len(), 1);
        let b = &blocks[0];
        assert_eq!(b.attr("name"), Some("web_search"));
        assert_eq!(b.child(&["query"]).map(|q| q.text()), Some("a & b".to_string()));
        assert_eq!(&text[b.start..b.start + 5], "<tool");
        assert!(text[..b.end].ends_with("</tool>"));
    }

    #[test]
    fn test_case_insensitive_tags_and_attrs() {
        let blocks = find_blocks("<TOOL NAME='X'><Query>v</QUERY></Tool>", "tool");
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].attr("name"), Some("X"));
        assert_eq!(blocks[0].child(&["query"]).map(|q| q.text()).as_deref(), Some("v"));
    }

    #[test]
    fn test_unclosed_block_is_skipped() {
        let text = "<tool name=\"a\"><query>x</query> and then nothing";
        assert!(find_blocks(text, "tool").is_empty());
    }

    #[test]
    fn test_unclosed_child_degrades_to_text() {
        let blocks = find_blocks("<tool name=\"a\"><query>x</tool>", "tool");
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].child(&["query"]).is_none());
        assert_eq!(blocks[0].text(), "<query>x");
    }

    #[test]
    fn test_prefix_tag_names_do_not_match() {
        assert!(find_blocks("<tools><x>1</x></tools>", "tool").is_empty());
    }

    #[test]
    fn test_self_closing_and_stray_angle_brackets() {
        let blocks = find_blocks("if a < b then <tool name=\"t\"/> ok", "tool");
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].children.is_empty());
    }

    #[test]
    fn test_many_unclosed_children_degrade_to_text() {
        let text = format!("<tool name=\"t\"><q>x</q>{}</tool>", "<br>".repeat(64));
        let blocks = find_blocks(&text, "tool");
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].child(&["q"]).map(|q| q.text()).as_deref(), Some("x"));
        assert_eq!(blocks[0].elements().count(), 1);
        assert!(blocks[0].text().ends_with(&"<br>".repeat(64)));
        assert_eq!(blocks[0].end, text.len());
    }

    #[test]
    fn test_nesting_deeper_than_limit_is_text() {
        let depth = MAX_DEPTH + 10;
        let text = format!("{}core{}", "<d>".repeat(depth), "</d>".repeat(depth));
        let blocks = find_blocks(&text, "d");
        assert_eq!(blocks.len(), 1);
        let mut el = &blocks[0];
        let mut levels = 1;
        while let Some(inner) = el.child(&["d"]) {
            el = inner;
            levels += 1;
        }
        assert_eq!(levels, MAX_DEPTH);
        assert!(el.text().contains("core"));
    }

    #[test]
    fn test_unterminated_quote_does_not_swallow_block() {
        let text = "<a href=\"oops <tool name=\"t\"><q>1</q></tool>";
        let blocks = find_blocks(text, "tool");
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].attr("name"), Some("t"));
    }

    #[test]
    fn test_stray_closing_tags_are_text() {
        let blocks = find_blocks("<tool name=\"t\"></x>a</y></tool>", "tool");
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].text(), "</x>a</y>");
        assert!(blocks[0].elements().next().is_none());
    }

    #[test]
    fn test_two_blocks_in_order() {
        let text = "<tool name=\"a\"></tool> text <tool name=\"b\"></tool>";
        let names: Vec<_> = find_blocks(text, "tool")
            .iter()
            .filter_map(|b| b.attr("name").map(str::to_string))
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
