use crate::canonical::decode::BlockKind;
use crate::canonical::{
    block_stop_event, fresh_message_id, input_json_delta_event, message_delta_event,
    message_start_event, message_stop_event, text_block_start_event, text_delta_event,
    tool_block_start_event,
};
use serde_json::Value;

/// Converts Responses stream events into canonical SSE events.
///
/// `block_index` starts at -1 and is incremented before a block opens.
#[derive(Debug)]
pub struct ResponsesStreamConverter {
    model: String,
    block_index: i64,
    block_type: Option<BlockKind>,
    has_tool_calls: bool,
    message_id: Option<String>,
    message_started: bool,
}

impl ResponsesStreamConverter {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            block_index: -1,
            block_type: None,
            has_tool_calls: false,
            message_id: None,
            message_started: false,
        }
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    pub fn process_event(&mut self, data: &str) -> Vec<String> {
        let Ok(event) = serde_json::from_str::<Value>(data) else {
            return Vec::new();
        };
        let mut events = Vec::new();
        match event.get("type").and_then(|v| v.as_str()).unwrap_or("") {
            "response.created" => self.on_created(&event, &mut events),
            "response.output_text.delta" => {
                let delta = event.get("delta").and_then(|v| v.as_str()).unwrap_or("");
                self.on_text_delta(delta, &mut events);
            }
            "response.output_item.added" => {
                let item = event.get("item").unwrap_or(&Value::Null);
                if item.get("type").and_then(|v| v.as_str()) == Some("function_call") {
                    self.on_function_call_added(item, &mut events);
                }
            }
            "response.function_call_arguments.delta" => {
                let delta = event.get("delta").and_then(|v| v.as_str()).unwrap_or("");
                if let Ok(index) = u64::try_from(self.block_index) {
                    events.push(input_json_delta_event(index, delta));
                }
            }
            "response.output_item.done" => self.close_block(&mut events),
            "response.completed" => self.on_completed(&event, &mut events),
            _ => {}
        }
        events
    }

    fn on_created(&mut self, event: &Value, events: &mut Vec<String>) {
        if self.message_started {
            return;
        }
        let id = event
            .get("response")
            .and_then(|r| r.get("id"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .unwrap_or_else(fresh_message_id);
        events.push(message_start_event(&id, &self.model, 0));
        self.message_id = Some(id);
        self.message_started = true;
    }

    fn on_text_delta(&mut self, delta: &str, events: &mut Vec<String>) {
        if self.block_type != Some(BlockKind::Text) {
            self.close_block(events);
            let index = self.open_block(BlockKind::Text);
            events.push(text_block_start_event(index));
        }
        events.push(text_delta_event(self.current_index(), delta));
    }

    fn on_function_call_added(&mut self, item: &Value, events: &mut Vec<String>) {
        self.close_block(events);
        let call_id = item.get("call_id").and_then(|v| v.as_str()).unwrap_or("");
        let name = item.get("name").and_then(|v| v.as_str()).unwrap_or("");
        let index = self.open_block(BlockKind::ToolUse);
        self.has_tool_calls = true;
        events.push(tool_block_start_event(index, call_id, name));
    }

    fn on_completed(&mut self, event: &Value, events: &mut Vec<String>) {
        self.close_block(events);
        let stop_reason = if self.has_tool_calls {
            "tool_use"
        } else {
            "end_turn"
        };
        let output_tokens = event
            .get("response")
            .and_then(|r| r.get("usage"))
            .and_then(|u| u.get("output_tokens"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        events.push(message_delta_event(stop_reason, output_tokens));
        events.push(message_stop_event());
    }

    fn open_block(&mut self, kind: BlockKind) -> u64 {
        self.block_index += 1;
        self.block_type = Some(kind);
        self.current_index()
    }

    fn current_index(&self) -> u64 {
        u64::try_from(self.block_index).unwrap_or(0)
    }

    fn close_block(&mut self, events: &mut Vec<String>) {
        if self.block_type.take().is_some() {
            events.push(block_stop_event(self.current_index()));
        }
    }
}
