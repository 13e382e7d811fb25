/// Config file loading and creation for the pairpoll CLI.
///
/// Config lives at ~/.config/pairpoll/config.toml.
/// All top-level fields are optional; CLI flags override config values.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_STORE: &str = "pairpoll.sqlite3";
pub const DEFAULT_LEASE_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_MAX_RETRIES: usize = 3;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("HOME environment variable not set")]
    NoHome,
    #[error("failed to read config at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("config file already exists at {0}")]
    AlreadyExists(PathBuf),
    #[error("failed to write config to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("duplicate responder name {0:?}")]
    DuplicateResponder(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Any OpenAI-schema chat completions API (OpenAI, Together, DeepSeek, vLLM, ...).
    OpenAi,
    Anthropic,
    Google,
}

impl Provider {
    pub fn default_base_url(self) -> &'static str {
        match self {
            Provider::OpenAi => "https://api.openai.com/v1",
            Provider::Anthropic => "https://api.anthropic.com",
            Provider::Google => "https://generativelanguage.googleapis.com",
        }
    }

    pub fn default_api_key_env(self) -> &'static str {
        match self {
            Provider::OpenAi => "OPENAI_API_KEY",
            Provider::Anthropic => "ANTHROPIC_API_KEY",
            Provider::Google => "GEMINI_API_KEY",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ResponderConfig {
    /// Queue and file name for this responder. Defaults to the model ID.
    pub name: Option<String>,
    pub provider: Provider,
    pub model: String,
    pub base_url: Option<String>,
    /// Name of the environment variable holding the API key.
    pub api_key_env: Option<String>,
    /// Seconds to wait between calls.
    pub pacing_secs: Option<f64>,
    pub max_tokens: Option<u32>,
}

impl ResponderConfig {
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.model)
    }

    pub fn base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .unwrap_or_else(|| self.provider.default_base_url())
    }

    pub fn api_key_env(&self) -> &str {
        self.api_key_env
            .as_deref()
            .unwrap_or_else(|| self.provider.default_api_key_env())
    }

    pub fn pacing(&self) -> Duration {
        self.pacing_secs
            .filter(|s| s.is_finite() && *s > 0.0)
            .map(Duration::from_secs_f64)
            .unwrap_or(Duration::ZERO)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct PairpollConfig {
    /// Path of the SQLite status store.
    pub store: Option<PathBuf>,
    pub lease_timeout_secs: Option<u64>,
    pub max_retries: Option<usize>,
    #[serde(default)]
    pub responders: Vec<ResponderConfig>,
}

impl PairpollConfig {
    pub fn store_path(&self) -> PathBuf {
        self.store.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_STORE))
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs.unwrap_or(DEFAULT_LEASE_TIMEOUT_SECS))
    }

    pub fn max_retries(&self) -> usize {
        self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES)
    }

    pub fn responder_names(&self) -> Vec<String> {
        self.responders.iter().map(|r| r.name().to_string()).collect()
    }

    pub fn find_responder(&self, name: &str) -> Option<&ResponderConfig> {
        self.responders.iter().find(|r| r.name() == name)
    }

    fn validate(self) -> Result<Self, ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for responder in &self.responders {
            if !seen.insert(responder.name()) {
                return Err(ConfigError::DuplicateResponder(responder.name().to_string()));
            }
        }
        Ok(self)
    }
}

const DEFAULT_CONFIG_TEMPLATE: &str = "\
# pairpoll configuration
# Top-level values here can be overridden by CLI flags.

# SQLite file holding question statuses and leases.
# Every worker process pointed at the same file shares one queue.
# store = \"pairpoll.sqlite3\"

# Seconds before an abandoned lease expires.
# lease_timeout_secs = 10

# Retries per question when a responder call fails.
# max_retries = 3

# One [[responders]] block per model to poll.
# API keys are read from the environment, never stored here.
#
# [[responders]]
# name = \"gpt-4o\"
# provider = \"openai\"            # openai | anthropic | google
# model = \"gpt-4o\"
# base_url = \"https://api.openai.com/v1\"
# api_key_env = \"OPENAI_API_KEY\"
# pacing_secs = 0.5
#
# [[responders]]
# provider = \"anthropic\"
# model = \"claude-3-5-sonnet-latest\"
# max_tokens = 1024
#
# [[responders]]
# provider = \"google\"
# model = \"gemini-1.5-pro\"
# pacing_secs = 4
";

/// Returns the default config path: ~/.config/pairpoll/config.toml
pub fn config_path() -> Result<PathBuf, ConfigError> {
    let home = std::env::var("HOME").map_err(|_| ConfigError::NoHome)?;
    Ok(PathBuf::from(home).join(".config").join("pairpoll").join("config.toml"))
}

pub fn parse_config(content: &str, path: &Path) -> Result<PairpollConfig, ConfigError> {
    let config: PairpollConfig = toml::from_str(content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    config.validate()
}

/// Load config from a file path. Returns the default (empty) config if the file doesn't exist.
pub fn load_config(path: &Path) -> Result<PairpollConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => parse_config(&content, path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PairpollConfig::default()),
        Err(source) => Err(ConfigError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Create the default config file. Errors if it already exists.
pub fn create_default_config(path: &Path) -> Result<(), ConfigError> {
    if path.exists() {
        return Err(ConfigError::AlreadyExists(path.to_path_buf()));
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    std::fs::write(path, DEFAULT_CONFIG_TEMPLATE).map_err(|source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(content: &str) -> Result<PairpollConfig, ConfigError> {
        parse_config(content, Path::new("config.toml"))
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config.store_path(), PathBuf::from("pairpoll.sqlite3"));
        assert_eq!(config.lease_timeout(), Duration::from_secs(10));
        assert_eq!(config.max_retries(), 3);
        assert!(config.responders.is_empty());
    }

    #[test]
    fn test_responders_parse_with_provider_defaults() {
        let config = parse(
            r#"
store = "/tmp/queue.sqlite3"
max_retries = 1

[[responders]]
name = "together-llama"
provider = "openai"
model = "meta-llama/Llama-3-70b"
base_url = "https://api.together.xyz/v1"
api_key_env = "TOGETHER_AI_API_KEY"
pacing_secs = 0.5

[[responders]]
provider = "anthropic"
model = "claude-3-5-sonnet-latest"
"#,
        )
        .unwrap();

        assert_eq!(config.max_retries(), 1);
        assert_eq!(config.responder_names(), vec!["together-llama", "claude-3-5-sonnet-latest"]);

        let llama = config.find_responder("together-llama").unwrap();
        assert_eq!(llama.base_url(), "https://api.together.xyz/v1");
        assert_eq!(llama.api_key_env(), "TOGETHER_AI_API_KEY");
        assert_eq!(llama.pacing(), Duration::from_millis(500));

        let claude = config.find_responder("claude-3-5-sonnet-latest").unwrap();
        assert_eq!(claude.provider, Provider::Anthropic);
        assert_eq!(claude.base_url(), "https://api.anthropic.com");
        assert_eq!(claude.api_key_env(), "ANTHROPIC_API_KEY");
        assert_eq!(claude.pacing(), Duration::ZERO);
    }

    #[test]
    fn test_unknown_provider_is_rejected() {
        let err = parse("[[responders]]\nprovider = \"cohere\"\nmodel = \"x\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_duplicate_responder_names_are_rejected() {
        let err = parse(
            "[[responders]]\nprovider = \"openai\"\nmodel = \"gpt-4o\"\n\
             [[responders]]\nprovider = \"openai\"\nmodel = \"gpt-4o\"\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateResponder(name) if name == "gpt-4o"));
    }

    #[test]
    fn test_default_template_parses_and_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pairpoll").join("config.toml");

        create_default_config(&path).unwrap();
        let config = load_config(&path).unwrap();
        assert!(config.responders.is_empty());

        assert!(matches!(create_default_config(&path), Err(ConfigError::AlreadyExists(_))));
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert!(config.store.is_none());
    }
}
