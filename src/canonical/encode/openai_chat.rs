use crate::canonical::encode::schema::strip_cache_control;
use crate::canonical::encode::{json_text, text_blocks};
use crate::canonical::{
    CanonicalMessage, CanonicalRequest, ContentBlock, ImageSource, MessageContent, Role,
    ToolChoice, ToolSpec,
};
use serde_json::{Map, Value, json};

/// Builds a chat-completions body. Sampling fields are written only when the
/// canonical request carries them.
pub fn encode_request(req: &CanonicalRequest) -> Value {
    let mut messages = Vec::new();
    if let Some(system) = &req.system {
        messages.push(json!({ "role": "system", "content": system.text() }));
    }
    for message in &req.messages {
        encode_message(message, &mut messages);
    }

    let mut obj = Map::new();
    obj.insert("messages".to_string(), Value::Array(messages));
    if let Some(model) = &req.model {
        obj.insert("model".to_string(), Value::String(model.clone()));
    }
    if let Some(tools) = &req.tools {
        obj.insert(
            "tools".to_string(),
            Value::Array(tools.iter().map(encode_tool).collect()),
        );
    }
    if let Some(choice) = req.tool_choice.as_ref().and_then(encode_tool_choice) {
        obj.insert("tool_choice".to_string(), choice);
    }
    if let Some(max) = req.max_tokens {
        obj.insert("max_tokens".to_string(), Value::from(max));
    }
    if let Some(temp) = req.temperature {
        obj.insert("temperature".to_string(), Value::from(temp));
    }
    if let Some(stream) = req.stream {
        obj.insert("stream".to_string(), Value::Bool(stream));
    }
    if let Some(top_p) = req.top_p {
        obj.insert("top_p".to_string(), Value::from(top_p));
    }
    if let Some(stop) = &req.stop_sequences {
        obj.insert(
            "stop".to_string(),
            Value::Array(stop.iter().cloned().map(Value::String).collect()),
        );
    }
    Value::Object(obj)
}

fn encode_message(message: &CanonicalMessage, out: &mut Vec<Value>) {
    match (&message.content, message.role) {
        (MessageContent::Text(text), role) => {
            out.push(json!({ "role": role.as_str(), "content": text }));
        }
        (MessageContent::Blocks(blocks), Role::User) => {
            let has_tool_result = blocks
                .iter()
                .any(|b| matches!(b, ContentBlock::ToolResult { .. }));
            if has_tool_result {
                encode_tool_results(blocks, out);
            } else {
                out.push(encode_user_blocks(blocks));
            }
        }
        (MessageContent::Blocks(blocks), Role::Assistant) => {
            out.push(encode_assistant_blocks(blocks));
        }
    }
}

fn encode_user_blocks(blocks: &[ContentBlock]) -> Value {
    let has_images = blocks
        .iter()
        .any(|b| matches!(b, ContentBlock::Image { .. }));
    if !has_images {
        return json!({ "role": "user", "content": text_blocks(blocks).join("\n") });
    }

    let parts: Vec<Value> = blocks
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(json!({ "type": "text", "text": text })),
            ContentBlock::Image {
                source: ImageSource::Base64 { media_type, data },
            } => Some(json!({
                "type": "image_url",
                "image_url": { "url": format!("data:{};base64,{}", media_type, data) }
            })),
            _ => None,
        })
        .collect();
    json!({ "role": "user", "content": parts })
}

// Tool results and the text that accompanies them never share a message.
fn encode_tool_results(blocks: &[ContentBlock], out: &mut Vec<Value>) {
    let mut text_parts = Vec::new();
    for block in blocks {
        match block {
            ContentBlock::ToolResult {
                tool_use_id,
                content,
            } => {
                let content = match content {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => json_text(other),
                    None => String::new(),
                };
                out.push(json!({
                    "role": "tool",
                    "tool_call_id": tool_use_id,
                    "content": content
                }));
            }
            ContentBlock::Text { text } if !text.is_empty() => text_parts.push(text.as_str()),
            _ => {}
        }
    }
    if !text_parts.is_empty() {
        out.push(json!({ "role": "user", "content": text_parts.join("\n") }));
    }
}

fn encode_assistant_blocks(blocks: &[ContentBlock]) -> Value {
    let text = text_blocks(blocks).join("\n");
    let content = if text.is_empty() {
        Value::Null
    } else {
        Value::String(text)
    };

    let tool_calls: Vec<Value> = blocks
        .iter()
        .filter_map(|block| match block {
            ContentBlock::ToolUse { id, name, input } => Some(json!({
                "id": id,
                "type": "function",
                "function": { "name": name, "arguments": json_text(input) }
            })),
            _ => None,
        })
        .collect();

    let mut m = Map::new();
    m.insert("role".to_string(), Value::String("assistant".to_string()));
    m.insert("content".to_string(), content);
    if !tool_calls.is_empty() {
        m.insert("tool_calls".to_string(), Value::Array(tool_calls));
    }
    Value::Object(m)
}

fn encode_tool(tool: &ToolSpec) -> Value {
    let mut function = Map::new();
    function.insert("name".to_string(), Value::String(tool.name.clone()));
    if let Some(desc) = &tool.description {
        function.insert("description".to_string(), Value::String(desc.clone()));
    }
    function.insert(
        "parameters".to_string(),
        strip_cache_control(&tool.input_schema),
    );
    json!({ "type": "function", "function": Value::Object(function) })
}

fn encode_tool_choice(choice: &ToolChoice) -> Option<Value> {
    match choice {
        ToolChoice::Auto => Some(Value::String("auto".to_string())),
        ToolChoice::Any => Some(Value::String("required".to_string())),
        ToolChoice::Tool { name } => Some(json!({
            "type": "function",
            "function": { "name": name }
        })),
        ToolChoice::Unsupported(_) => None,
    }
}
