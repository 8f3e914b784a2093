//! LLM 输出解析：提取 JSON 代码块与带标签的文本块

use std::sync::OnceLock;

use regex::Regex;

fn fenced_json() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```json(.*?)```").expect("valid regex"))
}

fn fenced_any() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(.*?)```").expect("valid regex"))
}

/// 依次尝试 ```json 块、任意 ``` 块、整段文本
pub fn extract_json_payload(text: &str) -> &str {
    if let Some(caps) = fenced_json().captures(text) {
        if let Some(m) = caps.get(1) {
            return m.as_str().trim();
        }
    }
    if let Some(caps) = fenced_any().captures(text) {
        if let Some(m) = caps.get(1) {
            return m.as_str().trim();
        }
    }
    text.trim()
}

/// 提取形如 ```tag ... ``` 的块内容
pub fn extract_tagged_block(text: &str, tag: &str) -> Option<String> {
    let pattern = format!(r"```{}\s*([\s\S]*?)```", regex::escape(tag));
    let re = Regex::new(&pattern).ok()?;
    re.captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
}

/// "true" / "yes" / "1"（不区分大小写）为真，其余为假
pub fn parse_truthy(token: &str) -> bool {
    matches!(token.trim().to_lowercase().as_str(), "true" | "yes" | "1")
}
