use crate::canonical::decode::BlockKind;
use crate::canonical::{
    block_stop_event, fresh_message_id, input_json_delta_event, map_get_u64,
    message_delta_event, message_start_event, message_stop_event, text_block_start_event,
    text_delta_event, tool_block_start_event,
};
use serde_json::{Map, Value};

/// Converts chat-completions stream chunks into canonical SSE events.
///
/// Blocks use a post-increment index: a new block takes `next_index` and then
/// bumps it, so the open block is always `next_index - 1`.
#[derive(Debug)]
pub struct ChatStreamConverter {
    model: String,
    next_index: u64,
    block_type: Option<BlockKind>,
    message_started: bool,
    /// Set by `finish_reason`; the closing pair waits for `[DONE]` so late
    /// usage chunks still count.
    stop_reason: Option<&'static str>,
    finished: bool,
    input_tokens: u64,
    output_tokens: u64,
}

impl ChatStreamConverter {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            next_index: 0,
            block_type: None,
            message_started: false,
            stop_reason: None,
            finished: false,
            input_tokens: 0,
            output_tokens: 0,
        }
    }

    pub fn process_event(&mut self, data: &str) -> Vec<String> {
        if data.trim() == "[DONE]" {
            return self.finish_stream();
        }
        let Ok(chunk) = serde_json::from_str::<Value>(data) else {
            return Vec::new();
        };

        if let Some(usage) = chunk.get("usage").and_then(|v| v.as_object()) {
            self.update_usage(usage);
        }

        let mut events = Vec::new();
        if !self.message_started {
            let id = chunk
                .get("id")
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
                .unwrap_or_else(fresh_message_id);
            events.push(self.start_message(&id));
        }
        if self.finished || self.stop_reason.is_some() {
            return events;
        }

        let Some(choice) = chunk
            .get("choices")
            .and_then(|v| v.as_array())
            .and_then(|arr| arr.first())
        else {
            return events;
        };

        if let Some(delta) = choice.get("delta") {
            let text = delta.get("content").and_then(|v| v.as_str()).unwrap_or("");
            if !text.is_empty() {
                self.push_text(text, &mut events);
            }
            if let Some(calls) = delta.get("tool_calls").and_then(|v| v.as_array()) {
                for call in calls {
                    self.push_tool_call(call, &mut events);
                }
            }
        }

        let reason = choice
            .get("finish_reason")
            .and_then(|v| v.as_str())
            .filter(|r| !r.is_empty());
        if let Some(reason) = reason {
            self.close_block(&mut events);
            self.stop_reason = Some(map_finish_reason(reason));
        }

        events
    }

    fn start_message(&mut self, id: &str) -> String {
        self.message_started = true;
        message_start_event(id, &self.model, self.input_tokens)
    }

    fn update_usage(&mut self, usage: &Map<String, Value>) {
        let prompt = map_get_u64(usage, "prompt_tokens");
        if prompt > 0 {
            self.input_tokens = prompt;
        }
        let completion = map_get_u64(usage, "completion_tokens");
        if completion > 0 {
            self.output_tokens = completion;
        }
    }

    fn push_text(&mut self, text: &str, events: &mut Vec<String>) {
        if self.block_type != Some(BlockKind::Text) {
            self.close_block(events);
            events.push(text_block_start_event(self.next_index));
            self.block_type = Some(BlockKind::Text);
            self.next_index += 1;
        }
        events.push(text_delta_event(self.next_index - 1, text));
    }

    fn push_tool_call(&mut self, call: &Value, events: &mut Vec<String>) {
        let function = call.get("function");
        let id = call.get("id").and_then(|v| v.as_str()).unwrap_or("");
        if !id.is_empty() {
            self.close_block(events);
            let name = function
                .and_then(|f| f.get("name"))
                .and_then(|v| v.as_str())
                .unwrap_or("");
            events.push(tool_block_start_event(self.next_index, id, name));
            self.block_type = Some(BlockKind::ToolUse);
            self.next_index += 1;
        }

        let arguments = function
            .and_then(|f| f.get("arguments"))
            .and_then(|v| v.as_str())
            .unwrap_or("");
        if !arguments.is_empty() && self.block_type == Some(BlockKind::ToolUse) {
            events.push(input_json_delta_event(self.next_index - 1, arguments));
        }
    }

    fn close_block(&mut self, events: &mut Vec<String>) {
        if self.block_type.take().is_some() {
            events.push(block_stop_event(self.next_index - 1));
        }
    }

    fn finish_stream(&mut self) -> Vec<String> {
        if self.finished {
            return Vec::new();
        }
        let mut events = Vec::new();
        if !self.message_started {
            events.push(self.start_message(&fresh_message_id()));
        }
        self.close_block(&mut events);
        events.push(message_delta_event(
            self.stop_reason.unwrap_or("end_turn"),
            self.output_tokens,
        ));
        events.push(message_stop_event());
        self.finished = true;
        events
    }

    /// Closes a message whose `finish_reason` arrived but whose stream ended
    /// without `[DONE]`. Emits nothing otherwise.
    pub fn flush(&mut self) -> Vec<String> {
        if self.stop_reason.is_none() {
            return Vec::new();
        }
        self.finish_stream()
    }
}

fn map_finish_reason(reason: &str) -> &'static str {
    match reason {
        "tool_calls" => "tool_use",
        "length" => "max_tokens",
        _ => "end_turn",
    }
}
