use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "~/.claude-code-router/config.json";
pub const DEFAULT_PORT: u16 = 3456;
pub const DEFAULT_ANTHROPIC_URL: &str = "https://api.anthropic.com";
pub const DEFAULT_CEREBRAS_URL: &str = "https://api.cerebras.ai/v1/chat/completions";
pub const DEFAULT_CODEX_URL: &str = "https://chatgpt.com/backend-api/codex/responses";
pub const DEFAULT_CODEX_AUTH_FILE: &str = "~/.codex/auth.json";
pub const DEFAULT_USAGE_LOG: &str = "~/.claude-code-router/usage.jsonl";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config json: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub port: u16,
    pub providers: ProvidersConfig,
    pub usage: UsageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProvidersConfig {
    pub anthropic: ProviderConfig,
    pub cerebras: ProviderConfig,
    pub codex: ProviderConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    #[serde(default)]
    pub passthrough: bool,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub auth_file: Option<String>,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub strict_tools: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UsageConfig {
    pub log_file: String,
    pub costs: BTreeMap<String, ModelCost>,
}

/// Price in dollars per million tokens.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ModelCost {
    pub input: f64,
    pub output: f64,
}

// Shape of the file on disk: every key is optional and overlays the defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigFile {
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    providers: Option<ProvidersFile>,
    #[serde(default)]
    usage: Option<UsageFile>,
}

#[derive(Debug, Default, Deserialize)]
struct ProvidersFile {
    #[serde(default)]
    anthropic: Option<ProviderConfig>,
    #[serde(default)]
    cerebras: Option<ProviderConfig>,
    #[serde(default)]
    codex: Option<ProviderConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageFile {
    #[serde(default)]
    log_file: Option<String>,
    #[serde(default)]
    costs: Option<BTreeMap<String, ModelCost>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            providers: ProvidersConfig::default(),
            usage: UsageConfig::default(),
        }
    }
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            anthropic: ProviderConfig {
                passthrough: true,
                base_url: Some(DEFAULT_ANTHROPIC_URL.to_string()),
                ..ProviderConfig::default()
            },
            cerebras: ProviderConfig {
                base_url: Some(DEFAULT_CEREBRAS_URL.to_string()),
                api_key: Some(String::new()),
                models: string_vec(&["qwen-3-235b-a22b-instruct-2507", "zai-glm-4.7", "gpt-oss-120b"]),
                ..ProviderConfig::default()
            },
            codex: ProviderConfig {
                base_url: Some(DEFAULT_CODEX_URL.to_string()),
                auth_file: Some(DEFAULT_CODEX_AUTH_FILE.to_string()),
                models: string_vec(&[
                    "gpt-5.1-codex-mini",
                    "gpt-5.1-codex",
                    "gpt-5.1-codex-max",
                    "gpt-5.2-codex",
                ]),
                ..ProviderConfig::default()
            },
        }
    }
}

impl Default for UsageConfig {
    fn default() -> Self {
        let costs = [
            ("qwen-3-235b-a22b-instruct-2507", 0.60, 1.20),
            ("zai-glm-4.7", 2.25, 2.75),
            ("gpt-oss-120b", 0.35, 0.75),
            ("claude-opus-4-6", 15.0, 75.0),
            ("claude-sonnet-4-5-20250929", 3.0, 15.0),
            ("claude-haiku-4-5-20251001", 0.80, 4.0),
        ]
        .into_iter()
        .map(|(model, input, output)| (model.to_string(), ModelCost { input, output }))
        .collect();
        Self {
            log_file: DEFAULT_USAGE_LOG.to_string(),
            costs,
        }
    }
}

impl ProviderConfig {
    /// Configured base URL, or `fallback` when the provider block omits it.
    pub fn endpoint<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.base_url
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(fallback)
    }
}

impl Config {
    /// Parses a config document and overlays it on the defaults. Top-level keys
    /// and whole provider blocks replace their defaults; usage keys merge one by one.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = serde_json::from_str(raw)?;
        let mut config = Config::default();
        if let Some(port) = file.port {
            config.port = port;
        }
        if let Some(providers) = file.providers {
            if let Some(p) = providers.anthropic {
                config.providers.anthropic = p;
            }
            if let Some(p) = providers.cerebras {
                config.providers.cerebras = p;
            }
            if let Some(p) = providers.codex {
                config.providers.codex = p;
            }
        }
        if let Some(usage) = file.usage {
            if let Some(log_file) = usage.log_file {
                config.usage.log_file = log_file;
            }
            if let Some(costs) = usage.costs {
                config.usage.costs = costs;
            }
        }
        Ok(config)
    }

    /// Reads the config file. `Ok(None)` means there is no file.
    pub fn from_file(path: &Path) -> Result<Option<Self>, ConfigError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                });
            }
        };
        Self::from_json_str(&raw).map(Some)
    }

    /// Never fails: a missing file yields the defaults, a broken one yields the
    /// defaults plus a warning.
    pub fn load(path: &Path) -> Self {
        match Self::from_file(path) {
            Ok(Some(config)) => config,
            Ok(None) => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                Config::default()
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "ignoring config file");
                Config::default()
            }
        }
    }

    pub fn usage_log_path(&self) -> PathBuf {
        resolve_home_path(&self.usage.log_file)
    }

    pub fn codex_auth_path(&self) -> PathBuf {
        resolve_home_path(
            self.providers
                .codex
                .auth_file
                .as_deref()
                .unwrap_or(DEFAULT_CODEX_AUTH_FILE),
        )
    }
}

/// Expands a leading `~/` to the user's home directory.
pub fn resolve_home_path(p: &str) -> PathBuf {
    if let Some(rest) = p.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(p)
}

fn string_vec(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
