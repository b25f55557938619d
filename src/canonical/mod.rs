use serde_json::{Map, Value, json};

pub mod decode;
pub mod encode;

/// An Anthropic Messages request, decoded only as far as translation needs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CanonicalRequest {
    pub model: Option<String>,
    pub system: Option<SystemPrompt>,
    pub messages: Vec<CanonicalMessage>,
    pub tools: Option<Vec<ToolSpec>>,
    pub tool_choice: Option<ToolChoice>,
    pub max_tokens: Option<u64>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub stop_sequences: Option<Vec<String>>,
    pub stream: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SystemPrompt {
    Text(String),
    Blocks(Vec<SystemBlock>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SystemBlock {
    pub block_type: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalMessage {
    pub role: Role,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text { text: String },
    Image { source: ImageSource },
    ToolUse { id: String, name: String, input: Value },
    ToolResult { tool_use_id: String, content: Option<Value> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImageSource {
    Base64 { media_type: String, data: String },
    Other(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolChoice {
    Auto,
    Any,
    Tool { name: String },
    Unsupported(Value),
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl SystemPrompt {
    /// Flattens the prompt: string passthrough, or text-typed blocks joined by newline.
    pub fn text(&self) -> String {
        match self {
            SystemPrompt::Text(s) => s.clone(),
            SystemPrompt::Blocks(blocks) => blocks
                .iter()
                .filter(|b| b.block_type == "text")
                .map(|b| b.text.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

impl CanonicalRequest {
    /// Decodes a request body without rejecting anything: a non-object yields an
    /// empty request, unknown roles and block types are dropped, and ill-typed
    /// optional fields are treated as absent.
    pub fn from_value(value: &Value) -> Self {
        let Some(obj) = value.as_object() else {
            return Self::default();
        };

        let messages = obj
            .get("messages")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(decode_message).collect())
            .unwrap_or_default();

        let tools = obj
            .get("tools")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(decode_tool).collect());

        let stop_sequences = obj
            .get("stop_sequences")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|s| s.as_str().map(|s| s.to_string()))
                    .collect()
            });

        Self {
            model: obj
                .get("model")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            system: obj.get("system").and_then(decode_system),
            messages,
            tools,
            tool_choice: obj.get("tool_choice").and_then(decode_tool_choice),
            max_tokens: obj.get("max_tokens").and_then(|v| v.as_u64()),
            temperature: obj.get("temperature").and_then(|v| v.as_f64()),
            top_p: obj.get("top_p").and_then(|v| v.as_f64()),
            stop_sequences,
            stream: obj.get("stream").and_then(|v| v.as_bool()),
        }
    }

    pub fn system_text(&self) -> String {
        self.system.as_ref().map(|s| s.text()).unwrap_or_default()
    }
}

fn decode_system(value: &Value) -> Option<SystemPrompt> {
    if let Some(s) = value.as_str() {
        if s.is_empty() {
            return None;
        }
        return Some(SystemPrompt::Text(s.to_string()));
    }
    let arr = value.as_array()?;
    let blocks = arr
        .iter()
        .filter_map(|b| {
            let obj = b.as_object()?;
            Some(SystemBlock {
                block_type: obj
                    .get("type")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
                text: obj
                    .get("text")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
            })
        })
        .collect();
    Some(SystemPrompt::Blocks(blocks))
}

fn decode_message(raw: &Value) -> Option<CanonicalMessage> {
    let obj = raw.as_object()?;
    let role = match obj.get("role").and_then(|v| v.as_str())? {
        "user" => Role::User,
        "assistant" => Role::Assistant,
        _ => return None,
    };
    let content = match obj.get("content") {
        Some(Value::String(s)) => MessageContent::Text(s.clone()),
        Some(Value::Array(blocks)) => {
            MessageContent::Blocks(blocks.iter().filter_map(decode_block).collect())
        }
        _ => MessageContent::Blocks(Vec::new()),
    };
    Some(CanonicalMessage { role, content })
}

fn decode_block(raw: &Value) -> Option<ContentBlock> {
    let obj = raw.as_object()?;
    let str_field = |key: &str| {
        obj.get(key)
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string()
    };
    match obj.get("type").and_then(|v| v.as_str())? {
        "text" => Some(ContentBlock::Text {
            text: str_field("text"),
        }),
        "image" => Some(ContentBlock::Image {
            source: decode_image_source(obj.get("source")),
        }),
        "tool_use" => Some(ContentBlock::ToolUse {
            id: str_field("id"),
            name: str_field("name"),
            input: obj.get("input").cloned().unwrap_or(Value::Null),
        }),
        "tool_result" => Some(ContentBlock::ToolResult {
            tool_use_id: str_field("tool_use_id"),
            content: obj.get("content").cloned(),
        }),
        _ => None,
    }
}

fn decode_image_source(raw: Option<&Value>) -> ImageSource {
    let Some(source) = raw else {
        return ImageSource::Other(Value::Null);
    };
    let is_base64 = source.get("type").and_then(|v| v.as_str()) == Some("base64");
    let media_type = source.get("media_type").and_then(|v| v.as_str());
    let data = source.get("data").and_then(|v| v.as_str());
    match (is_base64, media_type, data) {
        (true, Some(media_type), Some(data)) => ImageSource::Base64 {
            media_type: media_type.to_string(),
            data: data.to_string(),
        },
        _ => ImageSource::Other(source.clone()),
    }
}

fn decode_tool(raw: &Value) -> Option<ToolSpec> {
    let obj = raw.as_object()?;
    let name = obj.get("name").and_then(|v| v.as_str())?.to_string();
    Some(ToolSpec {
        name,
        description: obj
            .get("description")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        input_schema: obj.get("input_schema").cloned().unwrap_or(Value::Null),
    })
}

fn decode_tool_choice(raw: &Value) -> Option<ToolChoice> {
    let obj = raw.as_object()?;
    let choice = match obj.get("type").and_then(|v| v.as_str()) {
        Some("auto") => ToolChoice::Auto,
        Some("any") => ToolChoice::Any,
        Some("tool") => match obj.get("name").and_then(|v| v.as_str()) {
            Some(name) if !name.is_empty() => ToolChoice::Tool {
                name: name.to_string(),
            },
            _ => ToolChoice::Unsupported(raw.clone()),
        },
        _ => ToolChoice::Unsupported(raw.clone()),
    };
    Some(choice)
}

/// Serializes one canonical SSE event as `event: <type>\ndata: <json>\n\n`.
pub fn sse_event(event_type: &str, data: &Value) -> String {
    format!("event: {}\ndata: {}\n\n", event_type, data)
}

pub fn message_start_event(id: &str, model: &str, input_tokens: u64) -> String {
    sse_event(
        "message_start",
        &json!({
            "type": "message_start",
            "message": {
                "id": id,
                "type": "message",
                "role": "assistant",
                "model": model,
                "content": [],
                "stop_reason": Value::Null,
                "stop_sequence": Value::Null,
                "usage": {
                    "input_tokens": input_tokens,
                    "output_tokens": 0
                }
            }
        }),
    )
}

pub fn text_block_start_event(index: u64) -> String {
    sse_event(
        "content_block_start",
        &json!({
            "type": "content_block_start",
            "index": index,
            "content_block": { "type": "text", "text": "" }
        }),
    )
}

pub fn tool_block_start_event(index: u64, id: &str, name: &str) -> String {
    sse_event(
        "content_block_start",
        &json!({
            "type": "content_block_start",
            "index": index,
            "content_block": { "type": "tool_use", "id": id, "name": name, "input": {} }
        }),
    )
}

pub fn text_delta_event(index: u64, text: &str) -> String {
    sse_event(
        "content_block_delta",
        &json!({
            "type": "content_block_delta",
            "index": index,
            "delta": { "type": "text_delta", "text": text }
        }),
    )
}

pub fn input_json_delta_event(index: u64, partial_json: &str) -> String {
    sse_event(
        "content_block_delta",
        &json!({
            "type": "content_block_delta",
            "index": index,
            "delta": { "type": "input_json_delta", "partial_json": partial_json }
        }),
    )
}

pub fn block_stop_event(index: u64) -> String {
    sse_event(
        "content_block_stop",
        &json!({ "type": "content_block_stop", "index": index }),
    )
}

pub fn message_delta_event(stop_reason: &str, output_tokens: u64) -> String {
    sse_event(
        "message_delta",
        &json!({
            "type": "message_delta",
            "delta": { "stop_reason": stop_reason, "stop_sequence": Value::Null },
            "usage": { "output_tokens": output_tokens }
        }),
    )
}

pub fn message_stop_event() -> String {
    sse_event("message_stop", &json!({ "type": "message_stop" }))
}

pub fn fresh_message_id() -> String {
    format!("msg_{}", uuid::Uuid::new_v4().simple())
}

/// Reads a non-negative integer counter, treating anything else as zero.
pub fn map_get_u64(map: &Map<String, Value>, key: &str) -> u64 {
    map.get(key).and_then(|v| v.as_u64()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_blocks_and_drops_unknown_roles_and_types() {
        let req = CanonicalRequest::from_value(&json!({
            "model": "claude-sonnet-4-5-20250929",
            "system": [{ "type": "text", "text": "a" }, { "type": "text", "text": "b" }],
            "messages": [
                { "role": "user", "content": "hi" },
                { "role": "system", "content": "ignored" },
                { "role": "assistant", "content": [
                    { "type": "thinking", "thinking": "..." },
                    { "type": "tool_use", "id": "toolu_1", "name": "ls", "input": { "path": "/" } }
                ]}
            ],
            "max_tokens": "not a number",
            "stream": true
        }));

        assert_eq!(req.model.as_deref(), Some("claude-sonnet-4-5-20250929"));
        assert_eq!(req.system_text(), "a\nb");
        assert_eq!(req.messages.len(), 2);
        assert_eq!(
            req.messages[1].content,
            MessageContent::Blocks(vec![ContentBlock::ToolUse {
                id: "toolu_1".to_string(),
                name: "ls".to_string(),
                input: json!({ "path": "/" }),
            }])
        );
        assert_eq!(req.max_tokens, None);
        assert_eq!(req.stream, Some(true));
    }

    #[test]
    fn non_object_body_decodes_to_empty_request() {
        let req = CanonicalRequest::from_value(&json!("garbage"));
        assert_eq!(req, CanonicalRequest::default());
    }

    #[test]
    fn tool_choice_without_name_is_unsupported() {
        let req = CanonicalRequest::from_value(&json!({ "tool_choice": { "type": "tool" } }));
        assert!(matches!(req.tool_choice, Some(ToolChoice::Unsupported(_))));
    }

    #[test]
    fn sse_event_uses_wire_framing() {
        let ev = message_stop_event();
        assert_eq!(ev, "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n");
    }
}
