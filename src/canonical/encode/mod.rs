pub mod openai_chat;
pub mod responses;
pub mod schema;

use crate::canonical::ContentBlock;
use serde_json::Value;

pub fn text_blocks(blocks: &[ContentBlock]) -> Vec<&str> {
    blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

/// Encodes a tool input the way it travels as `arguments`: compact JSON text.
pub fn json_text(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}
