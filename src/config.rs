use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::external::search_provider::SearchDepth;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(String),
    #[error("invalid value for {name}: {reason}")]
    Invalid { name: String, reason: String },
}

/// Which hosted LLM backs the research agents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProviderKind {
    OpenAi,
    Gemini,
}

impl LlmProviderKind {
    pub fn default_model(self) -> &'static str {
        match self {
            LlmProviderKind::OpenAi => "gpt-4o-mini",
            LlmProviderKind::Gemini => "gemini-1.5-flash",
        }
    }

    fn key_var(self) -> &'static str {
        match self {
            LlmProviderKind::OpenAi => "OPENAI_API_KEY",
            LlmProviderKind::Gemini => "GEMINI_API_KEY",
        }
    }
}

impl FromStr for LlmProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(LlmProviderKind::OpenAi),
            "gemini" | "google" => Ok(LlmProviderKind::Gemini),
            other => Err(format!("unknown LLM provider '{}' (expected openai or gemini)", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub database_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub provider: LlmProviderKind,
    pub api_key: String,
    pub model: String,
    pub max_tokens: usize,
    pub temperature: f32,
    pub timeout: Duration,
    pub cache_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub api_key: String,
    pub base_url: String,
}

/// Defaults and limits for a research pipeline run
#[derive(Debug, Clone, PartialEq)]
pub struct ResearchConfig {
    pub max_iterations: usize,
    pub max_questions_per_iteration: usize,
    pub max_results_per_query: usize,
    pub recency_days: u32,
    pub search_depth: SearchDepth,
    pub similarity_threshold: f64,
    pub extraction_batch_size: usize,
    pub retrieval_concurrency: usize,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            max_questions_per_iteration: 3,
            max_results_per_query: 5,
            recency_days: 30,
            search_depth: SearchDepth::Advanced,
            similarity_threshold: 0.6,
            extraction_batch_size: 8,
            retrieval_concurrency: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SecConfig {
    pub user_agent: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub llm: LlmConfig,
    pub search: SearchConfig,
    pub research: ResearchConfig,
    pub sec: SecConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from any variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup: &lookup };

        let server = ServerConfig {
            host: env.string_or("HOST", "0.0.0.0"),
            port: env.parse_or("PORT", 3000u16)?,
            database_url: env.optional("DATABASE_URL"),
        };

        let provider: LlmProviderKind = env.parse_or("LLM_PROVIDER", LlmProviderKind::OpenAi)?;
        let temperature: f32 = env.parse_or("LLM_TEMPERATURE", 0.2)?;
        if !(0.0..=2.0).contains(&temperature) {
            return Err(ConfigError::Invalid {
                name: "LLM_TEMPERATURE".to_string(),
                reason: "must be between 0.0 and 2.0".to_string(),
            });
        }
        let llm = LlmConfig {
            provider,
            api_key: env.required(provider.key_var())?,
            model: env.string_or("LLM_MODEL", provider.default_model()),
            max_tokens: env.positive_or("LLM_MAX_TOKENS", 1500)?,
            temperature,
            timeout: Duration::from_secs(env.positive_or("LLM_TIMEOUT_SECS", 60)? as u64),
            cache_ttl: Duration::from_secs(env.parse_or("LLM_CACHE_TTL_SECS", 3600u64)?),
        };

        let search = SearchConfig {
            api_key: env.required("TAVILY_API_KEY")?,
            base_url: env.string_or("TAVILY_BASE_URL", "https://api.tavily.com"),
        };
        url::Url::parse(&search.base_url).map_err(|e| ConfigError::Invalid {
            name: "TAVILY_BASE_URL".to_string(),
            reason: e.to_string(),
        })?;

        let defaults = ResearchConfig::default();
        let similarity_threshold: f64 =
            env.parse_or("RESEARCH_SIMILARITY_THRESHOLD", defaults.similarity_threshold)?;
        if !(similarity_threshold > 0.0 && similarity_threshold <= 1.0) {
            return Err(ConfigError::Invalid {
                name: "RESEARCH_SIMILARITY_THRESHOLD".to_string(),
                reason: "must be in (0, 1]".to_string(),
            });
        }
        let research = ResearchConfig {
            max_iterations: env.positive_or("RESEARCH_MAX_ITERATIONS", defaults.max_iterations)?,
            max_questions_per_iteration: env
                .positive_or("RESEARCH_MAX_QUESTIONS", defaults.max_questions_per_iteration)?,
            max_results_per_query: env
                .positive_or("RESEARCH_MAX_RESULTS", defaults.max_results_per_query)?,
            recency_days: env.positive_or("RESEARCH_RECENCY_DAYS", defaults.recency_days as usize)?
                as u32,
            search_depth: env.parse_or("RESEARCH_SEARCH_DEPTH", defaults.search_depth)?,
            similarity_threshold,
            extraction_batch_size: env
                .positive_or("RESEARCH_EXTRACTION_BATCH", defaults.extraction_batch_size)?,
            retrieval_concurrency: env
                .positive_or("RESEARCH_RETRIEVAL_CONCURRENCY", defaults.retrieval_concurrency)?,
        };

        let sec = SecConfig {
            user_agent: env.string_or("SEC_USER_AGENT", "finwire/1.0 (research@finwire.dev)"),
        };

        Ok(Self {
            server,
            llm,
            search,
            research,
            sec,
        })
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<'a, F: Fn(&str) -> Option<String>> Env<'a, F> {
    fn optional(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, name: &str) -> Result<String, ConfigError> {
        self.optional(name)
            .ok_or_else(|| ConfigError::MissingVar(name.to_string()))
    }

    fn string_or(&self, name: &str, default: &str) -> String {
        self.optional(name).unwrap_or_else(|| default.to_string())
    }

    fn parse_or<T>(&self, name: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(name) {
            None => Ok(default),
            Some(raw) => raw.parse::<T>().map_err(|e| ConfigError::Invalid {
                name: name.to_string(),
                reason: format!("'{}': {}", raw, e),
            }),
        }
    }

    fn positive_or(&self, name: &str, default: usize) -> Result<usize, ConfigError> {
        let value: usize = self.parse_or(name, default)?;
        if value == 0 {
            return Err(ConfigError::Invalid {
                name: name.to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(value)
    }
}
