use crate::canonical::map_get_u64;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UsageEntry {
    #[serde(with = "rfc3339_millis")]
    pub timestamp: DateTime<Utc>,
    pub provider: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
    pub total_tokens: u64,
}

mod rfc3339_millis {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

/// Recovers token counters from a complete canonical SSE transcript.
/// Returns `None` when the stream reported no usage at all.
pub fn extract_usage(sse_text: &str, provider: &str, model: &str) -> Option<UsageEntry> {
    let mut input_tokens = 0;
    let mut output_tokens = 0;
    let mut cache_read_tokens = 0;
    let mut cache_creation_tokens = 0;
    let mut model = model.to_string();

    for line in sse_text.lines() {
        let Some(data) = line.strip_prefix("data: ") else {
            continue;
        };
        if data == "[DONE]" {
            continue;
        }
        let Ok(event) = serde_json::from_str::<Value>(data) else {
            continue;
        };
        match event.get("type").and_then(|v| v.as_str()) {
            Some("message_start") => {
                let Some(message) = event.get("message") else {
                    continue;
                };
                if let Some(usage) = message.get("usage").and_then(|v| v.as_object()) {
                    input_tokens = map_get_u64(usage, "input_tokens");
                    cache_read_tokens = map_get_u64(usage, "cache_read_input_tokens");
                    cache_creation_tokens = map_get_u64(usage, "cache_creation_input_tokens");
                }
                if let Some(m) = message.get("model").and_then(|v| v.as_str()) {
                    if !m.is_empty() {
                        model = m.to_string();
                    }
                }
            }
            Some("message_delta") => {
                if let Some(usage) = event.get("usage").and_then(|v| v.as_object()) {
                    output_tokens = map_get_u64(usage, "output_tokens");
                }
            }
            _ => {}
        }
    }

    let total_tokens = input_tokens
        .saturating_add(output_tokens)
        .saturating_add(cache_read_tokens)
        .saturating_add(cache_creation_tokens);
    if total_tokens == 0 {
        return None;
    }
    Some(UsageEntry {
        timestamp: Utc::now(),
        provider: provider.to_string(),
        model,
        input_tokens,
        output_tokens,
        cache_read_tokens,
        cache_creation_tokens,
        total_tokens,
    })
}

/// Append-only JSON-lines usage log.
#[derive(Debug, Clone)]
pub struct UsageLogger {
    path: Arc<PathBuf>,
}

impl UsageLogger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Arc::new(path.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fire-and-forget: the append happens on a spawned task and failures are
    /// only logged.
    pub fn log(&self, entry: UsageEntry) {
        record_token_metrics(&entry);
        let path = self.path.clone();
        tokio::spawn(async move {
            if let Err(err) = append_entry(&path, &entry).await {
                tracing::warn!(path = %path.display(), error = %err, "failed to write usage entry");
            }
        });
    }

    /// All entries in file order. A missing file is an empty log; unparseable
    /// lines are skipped.
    pub async fn list(&self) -> std::io::Result<Vec<UsageEntry>> {
        let raw = match tokio::fs::read_to_string(self.path.as_path()).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        Ok(raw
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}

async fn append_entry(path: &Path, entry: &UsageEntry) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let mut line = serde_json::to_string(entry)?;
    line.push('\n');
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await
}

fn record_token_metrics(entry: &UsageEntry) {
    let counters = [
        ("input", entry.input_tokens),
        ("output", entry.output_tokens),
        ("cache_read", entry.cache_read_tokens),
        ("cache_creation", entry.cache_creation_tokens),
    ];
    for (kind, value) in counters {
        if value > 0 {
            metrics::counter!(
                "proxy_tokens_total",
                "provider" => entry.provider.clone(),
                "kind" => kind
            )
            .increment(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TRANSCRIPT: &str = concat!(
        "event: message_start\n",
        "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"model\":\"claude-sonnet-4-5-20250929\",\"usage\":{\"input_tokens\":10,\"output_tokens\":0}}}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"hi\"}}\n\n",
        "event: message_delta\n",
        "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":5}}\n\n",
        "data: [DONE]\n",
    );

    #[test]
    fn sums_counters_from_start_and_delta() {
        let entry = extract_usage(TRANSCRIPT, "anthropic", "unknown").expect("usage");
        assert_eq!(entry.input_tokens, 10);
        assert_eq!(entry.output_tokens, 5);
        assert_eq!(entry.total_tokens, 15);
        assert_eq!(entry.model, "claude-sonnet-4-5-20250929");
        assert_eq!(entry.provider, "anthropic");
    }

    #[test]
    fn cache_counters_are_included() {
        let sse = "data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":3,\"cache_read_input_tokens\":100,\"cache_creation_input_tokens\":20}}}\n";
        let entry = extract_usage(sse, "anthropic", "claude-opus-4-6").expect("usage");
        assert_eq!(entry.cache_read_tokens, 100);
        assert_eq!(entry.cache_creation_tokens, 20);
        assert_eq!(entry.total_tokens, 123);
        assert_eq!(entry.model, "claude-opus-4-6");
    }

    #[test]
    fn huge_counters_saturate_the_total() {
        let sse = concat!(
            "data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":18446744073709551615}}}\n",
            "data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":7}}\n",
        );
        let entry = extract_usage(sse, "cerebras", "gpt-oss-120b").expect("usage");
        assert_eq!(entry.input_tokens, u64::MAX);
        assert_eq!(entry.output_tokens, 7);
        assert_eq!(entry.total_tokens, u64::MAX);
    }

    #[test]
    fn no_usage_is_none() {
        let sse = "data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":0,\"output_tokens\":0}}}\ndata: {broken\ndata: [DONE]\n";
        assert!(extract_usage(sse, "cerebras", "zai-glm-4.7").is_none());
        assert!(extract_usage("", "cerebras", "zai-glm-4.7").is_none());
    }

    #[test]
    fn entry_serializes_with_camel_case_keys() {
        let entry = extract_usage(TRANSCRIPT, "codex", "gpt-5.1-codex").expect("usage");
        let value = serde_json::to_value(&entry).unwrap();
        for key in [
            "timestamp",
            "provider",
            "model",
            "inputTokens",
            "outputTokens",
            "cacheReadTokens",
            "cacheCreationTokens",
            "totalTokens",
        ] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
        assert!(value["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[tokio::test]
    async fn missing_log_lists_empty() {
        let dir = TempDir::new().unwrap();
        let logger = UsageLogger::new(dir.path().join("usage.jsonl"));
        assert!(logger.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn appended_entries_are_listed_and_bad_lines_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("usage.jsonl");
        let entry = extract_usage(TRANSCRIPT, "anthropic", "unknown").unwrap();
        append_entry(&path, &entry).await.unwrap();
        tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .unwrap()
            .write_all(b"not json\n\n")
            .await
            .unwrap();
        append_entry(&path, &entry).await.unwrap();

        let listed = UsageLogger::new(&path).list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].total_tokens, 15);
        assert_eq!(listed[0].timestamp.timestamp_millis(), entry.timestamp.timestamp_millis());
    }

    #[tokio::test]
    async fn log_appends_in_the_background() {
        let dir = TempDir::new().unwrap();
        let logger = UsageLogger::new(dir.path().join("usage.jsonl"));
        logger.log(extract_usage(TRANSCRIPT, "anthropic", "unknown").unwrap());
        for _ in 0..50 {
            if !logger.list().await.unwrap().is_empty() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        panic!("usage entry was never written");
    }
}
