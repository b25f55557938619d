pub mod openai_chat;
pub mod responses;

pub use openai_chat::ChatStreamConverter;
pub use responses::ResponsesStreamConverter;

/// Kind of the content block a stream converter currently has open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Text,
    ToolUse,
}

/// One converter per upstream response; owned by the task that drains it.
#[derive(Debug)]
pub enum UpstreamConverter {
    Chat(ChatStreamConverter),
    Responses(ResponsesStreamConverter),
}

impl UpstreamConverter {
    pub fn process_event(&mut self, data: &str) -> Vec<String> {
        match self {
            UpstreamConverter::Chat(c) => c.process_event(data),
            UpstreamConverter::Responses(c) => c.process_event(data),
        }
    }

    /// Events still owed once the upstream body has ended cleanly.
    pub fn flush(&mut self) -> Vec<String> {
        match self {
            UpstreamConverter::Chat(c) => c.flush(),
            UpstreamConverter::Responses(_) => Vec::new(),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use serde_json::Value;

    /// Parses `event: x\ndata: {...}\n\n` frames back into `(event, data)` pairs.
    pub fn parse_events(events: &[String]) -> Vec<(String, Value)> {
        events
            .iter()
            .map(|frame| {
                let mut lines = frame.lines();
                let event = lines
                    .next()
                    .and_then(|l| l.strip_prefix("event: "))
                    .expect("event line")
                    .to_string();
                let data = lines
                    .next()
                    .and_then(|l| l.strip_prefix("data: "))
                    .expect("data line");
                (event, serde_json::from_str(data).expect("json data"))
            })
            .collect()
    }

    /// Asserts block starts strictly increase and every index is stopped at most once,
    /// and only after it was started.
    pub fn assert_block_lifecycle(events: &[(String, Value)]) {
        let mut last_start: Option<u64> = None;
        let mut stopped = Vec::new();
        for (name, data) in events {
            let index = data.get("index").and_then(|v| v.as_u64());
            match name.as_str() {
                "content_block_start" => {
                    let index = index.expect("start index");
                    if let Some(prev) = last_start {
                        assert!(index > prev, "start index {index} after {prev}");
                    }
                    last_start = Some(index);
                }
                "content_block_stop" => {
                    let index = index.expect("stop index");
                    assert!(last_start.is_some_and(|s| index <= s), "stop before start");
                    assert!(!stopped.contains(&index), "index {index} stopped twice");
                    stopped.push(index);
                }
                _ => {}
            }
        }
    }
}
