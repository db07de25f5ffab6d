//! 文本生成层：后端抽象与实现（OpenAI 兼容 / Mock）

pub mod mock;
pub mod openai;
pub mod traits;

pub use mock::MockGenerator;
pub use openai::{OpenAiGenerator, TokenUsage};
pub use traits::{Message, Role, TextGenerator};

/// 从生成文本里抠出 JSON 块：优先 ```json 围栏，其次最早的 '{' 或 '['
/// 到对应的末个闭括号。对象和数组都认
pub fn extract_json(text: &str) -> Option<&str> {
    let trimmed = text.trim();

    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        let block = match rest.find("```") {
            Some(end) => &rest[..end],
            None => rest,
        };
        return Some(block.trim());
    }

    let (start, closer) = match (trimmed.find('{'), trimmed.find('[')) {
        (Some(obj), Some(arr)) if arr < obj => (arr, ']'),
        (Some(obj), _) => (obj, '}'),
        (None, Some(arr)) => (arr, ']'),
        (None, None) => return None,
    };
    let end = trimmed.rfind(closer)?;
    if end >= start {
        Some(&trimmed[start..=end])
    } else {
        None
    }
}
