use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::backend::EngineKind;
use crate::{DeepDiveError, SecretValue, require_env};

const DEFAULT_CONFIG_PATH: &str = "deepdive.toml";
const CONFIG_PATH_ENV: &str = "DEEPDIVE_CONFIG";

/// Top-level configuration structure. Every section has defaults, so an
/// empty file is a valid configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub llm: LlmConfig,
    pub engines: EnginesConfig,
    pub research: ResearchConfig,
    pub fetch: FetchConfig,
    pub filter: FilterConfig,
    pub knowledge: KnowledgeConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Resolve the configured LLM secret, if one is referenced.
    pub fn llm_api_key(&self) -> Result<Option<SecretValue>, DeepDiveError> {
        optional_secret(self.llm.api_key_env.as_deref())
    }
}

/// Helper to load configuration with guard rails.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a provided path or discoverable defaults.
    ///
    /// Resolution order:
    /// 1. Explicit `path` argument.
    /// 2. `DEEPDIVE_CONFIG` environment variable.
    /// 3. `deepdive.toml` in the current working directory (skipped when absent).
    pub fn load(path: Option<PathBuf>) -> Result<Config, DeepDiveError> {
        let explicit = path.is_some() || env_path().is_some();
        let candidate = resolve_path(path);
        if !explicit && !candidate.exists() {
            tracing::debug!(path = %candidate.display(), "no config file found; using defaults");
            return Ok(Config::default());
        }

        let raw = fs::read_to_string(&candidate)
            .map_err(|err| DeepDiveError::config_io(candidate.clone(), err))?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Config, DeepDiveError> {
        let config: Config = toml::from_str(raw)
            .map_err(|err| DeepDiveError::InvalidConfiguration(err.to_string()))?;
        Self::validate(&config)?;
        Ok(config)
    }

    fn validate(config: &Config) -> Result<(), DeepDiveError> {
        let filter = &config.filter;
        if !(0.0..=1.0).contains(&filter.similarity_threshold) {
            return Err(DeepDiveError::InvalidConfiguration(
                "filter.similarity_threshold must be within [0, 1]".into(),
            ));
        }
        if filter.lexical_weight < 0.0 || filter.llm_weight < 0.0 {
            return Err(DeepDiveError::InvalidConfiguration(
                "filter weights must be non-negative".into(),
            ));
        }
        if (filter.lexical_weight + filter.llm_weight - 1.0).abs() > 1e-3 {
            return Err(DeepDiveError::InvalidConfiguration(
                "filter.lexical_weight + filter.llm_weight must equal 1".into(),
            ));
        }
        if config.knowledge.token_budget == 0 {
            return Err(DeepDiveError::InvalidConfiguration(
                "knowledge.token_budget must be positive".into(),
            ));
        }
        if config.research.top_urls == 0 || config.research.results_per_query == 0 {
            return Err(DeepDiveError::InvalidConfiguration(
                "research.top_urls and research.results_per_query must be positive".into(),
            ));
        }

        // Referenced secrets must exist at load time to discourage inline keys.
        optional_secret(config.llm.api_key_env.as_deref())?;
        for engine in config.engines.configured() {
            optional_secret(config.engines.api_key_env(engine))?;
        }
        Ok(())
    }
}

fn env_path() -> Option<PathBuf> {
    env::var(CONFIG_PATH_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(PathBuf::from)
}

fn resolve_path(path: Option<PathBuf>) -> PathBuf {
    path.or_else(env_path)
        .unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH).to_path_buf())
}

fn optional_secret(var: Option<&str>) -> Result<Option<SecretValue>, DeepDiveError> {
    match var {
        Some(name) if !name.trim().is_empty() => require_env(name).map(Some),
        _ => Ok(None),
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// OpenAI-compatible endpoint root (the `/chat/completions` path is appended).
    pub base_url: String,
    pub model: String,
    pub api_key_env: Option<String>,
    pub timeout_secs: u64,
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/v1".into(),
            model: "llama3.1".into(),
            api_key_env: None,
            timeout_secs: 120,
            max_tokens: 2048,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EnginesConfig {
    pub searxng: Option<EngineEndpoint>,
    pub firecrawl: Option<EngineEndpoint>,
    pub browser: Option<EngineEndpoint>,
    /// Engine tried once when the selected one reports rate limiting.
    pub fallback: Option<EngineKind>,
}

impl EnginesConfig {
    pub fn endpoint(&self, kind: EngineKind) -> Option<&EngineEndpoint> {
        match kind {
            EngineKind::Searxng => self.searxng.as_ref(),
            EngineKind::Firecrawl => self.firecrawl.as_ref(),
            EngineKind::Browser => self.browser.as_ref(),
        }
    }

    fn api_key_env(&self, kind: EngineKind) -> Option<&str> {
        self.endpoint(kind).and_then(|e| e.api_key_env.as_deref())
    }

    pub fn configured(&self) -> Vec<EngineKind> {
        EngineKind::ALL
            .into_iter()
            .filter(|kind| self.endpoint(*kind).is_some())
            .collect()
    }

    pub fn api_key(&self, kind: EngineKind) -> Result<Option<SecretValue>, DeepDiveError> {
        optional_secret(self.api_key_env(kind))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineEndpoint {
    pub base_url: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResearchConfig {
    pub max_depth: u32,
    pub max_breadth: usize,
    pub time_budget_secs: u64,
    pub results_per_query: usize,
    pub top_urls: usize,
    /// Worker-pool size for the fan-out phases; defaults to the round breadth.
    pub concurrency: Option<usize>,
    /// Total sub-queries a session may issue; defaults to depth x breadth.
    pub session_breadth_budget: Option<usize>,
    pub backoff_ms: u64,
    pub rate_limit_backoff_ms: u64,
    pub search_timeout_secs: u64,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            max_depth: 2,
            max_breadth: 4,
            time_budget_secs: 300,
            results_per_query: 5,
            top_urls: 3,
            concurrency: None,
            session_breadth_budget: None,
            backoff_ms: 500,
            rate_limit_backoff_ms: 2_000,
            search_timeout_secs: 15,
        }
    }
}

impl ResearchConfig {
    pub fn time_budget(&self) -> Duration {
        Duration::from_secs(self.time_budget_secs)
    }

    pub fn search_timeout(&self) -> Duration {
        Duration::from_secs(self.search_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub timeout_secs: u64,
    pub max_body_bytes: usize,
    pub max_passage_chars: usize,
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 20,
            max_body_bytes: 2 * 1024 * 1024,
            max_passage_chars: 4_000,
            user_agent: concat!("deepdive/", env!("CARGO_PKG_VERSION")).into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub lexical_weight: f32,
    pub llm_weight: f32,
    /// Ask the language model for a relevance judgment per passage.
    pub llm_judge: bool,
    /// Ask the language model to condense each accepted passage; the planner
    /// then sees the gist instead of a raw excerpt.
    pub condense: bool,
    pub min_relevance: f32,
    pub similarity_threshold: f32,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            lexical_weight: 0.6,
            llm_weight: 0.4,
            llm_judge: false,
            condense: false,
            min_relevance: 0.15,
            similarity_threshold: 0.85,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KnowledgeConfig {
    pub token_budget: usize,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            token_budget: 12_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = ConfigLoader::from_toml("").expect("defaults are valid");
        assert_eq!(config.research.max_depth, 2);
        assert_eq!(config.research.top_urls, 3);
        assert!((config.filter.similarity_threshold - 0.85).abs() < f32::EPSILON);
        assert!(config.engines.configured().is_empty());
    }

    #[test]
    fn engine_sections_parse() {
        let raw = r#"
            [engines]
            fallback = "searxng"

            [engines.searxng]
            base_url = "http://localhost:8080"

            [engines.firecrawl]
            base_url = "http://localhost:3002"

            [research]
            max_breadth = 3
        "#;
        let config = ConfigLoader::from_toml(raw).expect("valid config");
        assert_eq!(
            config.engines.configured(),
            vec![EngineKind::Searxng, EngineKind::Firecrawl]
        );
        assert_eq!(config.engines.fallback, Some(EngineKind::Searxng));
        assert_eq!(config.research.max_breadth, 3);
        assert_eq!(config.research.max_depth, 2);
    }

    #[test]
    fn weights_must_sum_to_one() {
        let raw = "[filter]\nlexical_weight = 0.9\nllm_weight = 0.4\n";
        let err = ConfigLoader::from_toml(raw).unwrap_err();
        assert!(matches!(err, DeepDiveError::InvalidConfiguration(_)));
    }

    #[test]
    fn referenced_secret_must_exist() {
        let raw = "[llm]\napi_key_env = \"DEEPDIVE_TEST_KEY_THAT_IS_UNSET\"\n";
        let err = ConfigLoader::from_toml(raw).unwrap_err();
        assert!(matches!(err, DeepDiveError::MissingSecret(_)));
    }
}
