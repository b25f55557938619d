use crate::canonical::encode::json_text;
use crate::canonical::encode::schema::strictify;
use crate::canonical::{CanonicalMessage, CanonicalRequest, ContentBlock, MessageContent, Role, ToolSpec};
use serde_json::{Map, Value, json};

/// Builds a Responses body. The upstream always streams and never stores.
pub fn encode_request(req: &CanonicalRequest, upstream_model: &str, strict_tools: bool) -> Value {
    let mut input = Vec::new();
    for message in &req.messages {
        encode_message(message, &mut input);
    }

    let mut obj = Map::new();
    obj.insert("model".to_string(), Value::String(upstream_model.to_string()));
    obj.insert("store".to_string(), Value::Bool(false));
    obj.insert("stream".to_string(), Value::Bool(true));
    obj.insert("input".to_string(), Value::Array(input));
    if let Some(system) = &req.system {
        obj.insert("instructions".to_string(), Value::String(system.text()));
    }
    if let Some(tools) = &req.tools {
        let tools = tools
            .iter()
            .map(|tool| encode_tool(tool, strict_tools))
            .collect();
        obj.insert("tools".to_string(), Value::Array(tools));
    }
    Value::Object(obj)
}

fn encode_message(message: &CanonicalMessage, out: &mut Vec<Value>) {
    let role = message.role.as_str();
    let blocks = match &message.content {
        MessageContent::Text(text) => {
            out.push(message_item(role, text));
            return;
        }
        MessageContent::Blocks(blocks) => blocks,
    };

    for block in blocks {
        match (block, message.role) {
            (ContentBlock::Text { text }, _) => out.push(message_item(role, text)),
            (
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                },
                Role::User,
            ) => out.push(json!({
                "type": "function_call_output",
                "call_id": tool_use_id,
                "output": tool_output_text(content.as_ref())
            })),
            (ContentBlock::ToolUse { id, name, input }, Role::Assistant) => out.push(json!({
                "type": "function_call",
                "call_id": id,
                "name": name,
                "arguments": json_text(input)
            })),
            _ => {}
        }
    }
}

fn message_item(role: &str, text: &str) -> Value {
    json!({ "type": "message", "role": role, "content": text })
}

fn tool_output_text(content: Option<&Value>) -> String {
    match content {
        None => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter(|p| p.get("type").and_then(|t| t.as_str()) == Some("text"))
            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        Some(other) => json_text(other),
    }
}

fn encode_tool(tool: &ToolSpec, strict: bool) -> Value {
    let mut obj = Map::new();
    obj.insert("type".to_string(), Value::String("function".to_string()));
    obj.insert("name".to_string(), Value::String(tool.name.clone()));
    if let Some(desc) = &tool.description {
        obj.insert("description".to_string(), Value::String(desc.clone()));
    }
    let parameters = if strict {
        strictify(&tool.input_schema)
    } else {
        tool.input_schema.clone()
    };
    obj.insert("parameters".to_string(), parameters);
    obj.insert("strict".to_string(), Value::Bool(strict));
    Value::Object(obj)
}
