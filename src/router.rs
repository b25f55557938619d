use crate::canonical::CanonicalRequest;
use crate::config::Config;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static CCR_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<CCR-SUBAGENT-MODEL>([^,]+),([^<]+)</CCR-SUBAGENT-MODEL>")
        .expect("ccr tag regex")
});

pub const UNKNOWN_MODEL: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Anthropic,
    Cerebras,
    Codex,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Provider::Anthropic => "anthropic",
            Provider::Cerebras => "cerebras",
            Provider::Codex => "codex",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteResult {
    pub provider: Provider,
    pub model: String,
}

/// Picks the backend for a request: an inline subagent tag wins, then the
/// cerebras and codex model lists, then anthropic passthrough.
pub fn route(req: &CanonicalRequest, config: &Config) -> RouteResult {
    if let Some(tagged) = tagged_route(&req.system_text()) {
        return tagged;
    }

    let model = req
        .model
        .as_deref()
        .filter(|m| !m.is_empty())
        .unwrap_or(UNKNOWN_MODEL)
        .to_string();

    let provider = if config.providers.cerebras.models.contains(&model) {
        Provider::Cerebras
    } else if config.providers.codex.models.contains(&model) {
        Provider::Codex
    } else {
        Provider::Anthropic
    };
    RouteResult { provider, model }
}

fn tagged_route(system_text: &str) -> Option<RouteResult> {
    let caps = CCR_TAG.captures(system_text)?;
    let provider = match caps.get(1)?.as_str().trim() {
        "cerebras" => Provider::Cerebras,
        "codex" => Provider::Codex,
        _ => return None,
    };
    Some(RouteResult {
        provider,
        model: caps.get(2)?.as_str().trim().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn route_body(body: serde_json::Value) -> RouteResult {
        route(&CanonicalRequest::from_value(&body), &Config::default())
    }

    #[test]
    fn subagent_tag_overrides_model() {
        let r = route_body(json!({
            "model": "claude-sonnet-4-5-20250929",
            "system": "<CCR-SUBAGENT-MODEL>cerebras,zai-glm-4.7</CCR-SUBAGENT-MODEL>"
        }));
        assert_eq!(
            r,
            RouteResult {
                provider: Provider::Cerebras,
                model: "zai-glm-4.7".to_string()
            }
        );
    }

    #[test]
    fn tag_is_found_in_system_blocks_and_trimmed() {
        let r = route_body(json!({
            "model": "claude-opus-4-6",
            "system": [
                { "type": "text", "text": "You are a helper." },
                { "type": "text", "text": "<CCR-SUBAGENT-MODEL> codex , some-unlisted-model </CCR-SUBAGENT-MODEL>" }
            ]
        }));
        assert_eq!(r.provider, Provider::Codex);
        assert_eq!(r.model, "some-unlisted-model");
    }

    #[test]
    fn only_first_tag_counts() {
        let r = route_body(json!({
            "system": "<CCR-SUBAGENT-MODEL>codex,gpt-5.1-codex</CCR-SUBAGENT-MODEL><CCR-SUBAGENT-MODEL>cerebras,gpt-oss-120b</CCR-SUBAGENT-MODEL>"
        }));
        assert_eq!(r.provider, Provider::Codex);
        assert_eq!(r.model, "gpt-5.1-codex");
    }

    #[test]
    fn unknown_tagged_provider_falls_through() {
        let r = route_body(json!({
            "model": "gpt-oss-120b",
            "system": "<CCR-SUBAGENT-MODEL>openrouter,foo</CCR-SUBAGENT-MODEL>"
        }));
        assert_eq!(r.provider, Provider::Cerebras);
        assert_eq!(r.model, "gpt-oss-120b");
    }

    #[test]
    fn model_lists_route_to_their_provider() {
        let r = route_body(json!({ "model": "gpt-5.1-codex" }));
        assert_eq!(
            r,
            RouteResult {
                provider: Provider::Codex,
                model: "gpt-5.1-codex".to_string()
            }
        );
        assert_eq!(
            route_body(json!({ "model": "qwen-3-235b-a22b-instruct-2507" })).provider,
            Provider::Cerebras
        );
    }

    #[test]
    fn everything_else_passes_through() {
        let r = route_body(json!({ "model": "claude-haiku-4-5-20251001" }));
        assert_eq!(r.provider, Provider::Anthropic);
        assert_eq!(r.model, "claude-haiku-4-5-20251001");

        let r = route_body(json!({ "messages": [] }));
        assert_eq!(r.provider, Provider::Anthropic);
        assert_eq!(r.model, UNKNOWN_MODEL);

        let r = route_body(json!({ "model": "" }));
        assert_eq!(r.model, UNKNOWN_MODEL);
    }

    #[test]
    fn provider_serializes_lowercase() {
        assert_eq!(serde_json::to_value(Provider::Codex).unwrap(), json!("codex"));
        assert_eq!(Provider::Anthropic.to_string(), "anthropic");
    }
}
