use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::{LlmConfig, LlmProviderKind};
use crate::errors::LlmError;

const MAX_ATTEMPTS: u32 = 3;

/// Which research step a completion belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LlmTask {
    QueryGeneration,
    TopicExtraction,
    ImpactRanking,
}

impl fmt::Display for LlmTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmTask::QueryGeneration => write!(f, "query_generation"),
            LlmTask::TopicExtraction => write!(f, "topic_extraction"),
            LlmTask::ImpactRanking => write!(f, "impact_ranking"),
        }
    }
}

/// One completion call, fully described
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub task: LlmTask,
    pub system: String,
    pub prompt: String,
    pub max_tokens: usize,
    pub temperature: f32,
    /// Ask the provider for a JSON-only response
    pub json_output: bool,
}

impl CompletionRequest {
    pub fn json(task: LlmTask, system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            task,
            system: system.into(),
            prompt: prompt.into(),
            max_tokens: 1500,
            temperature: 0.2,
            json_output: true,
        }
    }

    pub fn with_limits(mut self, max_tokens: usize, temperature: f32) -> Self {
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        self
    }

    fn cache_key(&self) -> String {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        self.task.hash(&mut hasher);
        self.system.hash(&mut hasher);
        self.prompt.hash(&mut hasher);
        self.max_tokens.hash(&mut hasher);
        self.temperature.to_bits().hash(&mut hasher);
        self.json_output.hash(&mut hasher);
        format!("{}:{:x}", self.task, hasher.finish())
    }
}

/// Trait for hosted LLM providers
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError>;

    fn model(&self) -> &str;
}

fn map_reqwest_error(e: reqwest::Error) -> LlmError {
    if e.is_timeout() {
        LlmError::Timeout
    } else {
        LlmError::NetworkError(e.to_string())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, LlmError> {
    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(LlmError::RateLimited);
    }
    if !status.is_success() {
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        return Err(LlmError::ApiError {
            status: status.as_u16(),
            message,
        });
    }
    Ok(response)
}

/// Retry retryable failures; backoff doubles from 1s between attempts, plus jitter
async fn with_retry<T, F, Fut>(label: &str, mut call: F) -> Result<T, LlmError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    let mut attempt = 0;
    let mut delay = Duration::from_secs(1);

    loop {
        attempt += 1;
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => {
                let jitter = Duration::from_millis(rand::rng().random_range(0..250));
                warn!(
                    "{} call failed (attempt {}/{}): {}. Retrying in {:?}...",
                    label,
                    attempt,
                    MAX_ATTEMPTS,
                    e,
                    delay + jitter
                );
                tokio::time::sleep(delay + jitter).await;
                delay *= 2;
            }
            Err(e) => {
                error!("{} call failed after {} attempt(s): {}", label, attempt, e);
                return Err(e);
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAiMessage<'a>>,
    max_tokens: usize,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<OpenAiResponseFormat>,
}

#[derive(Debug, Serialize)]
struct OpenAiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct OpenAiResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

/// OpenAI chat-completions provider
pub struct OpenAiProvider {
    api_key: String,
    model: String,
    client: Client,
}

impl OpenAiProvider {
    pub fn new(api_key: String, model: String, timeout: Duration) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::NetworkError(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            api_key,
            model,
            client,
        })
    }

    async fn call_openai(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        let body = OpenAiRequest {
            model: &self.model,
            messages: vec![
                OpenAiMessage {
                    role: "system",
                    content: &request.system,
                },
                OpenAiMessage {
                    role: "user",
                    content: &request.prompt,
                },
            ],
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            response_format: request.json_output.then_some(OpenAiResponseFormat {
                kind: "json_object",
            }),
        };

        let response = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let parsed: OpenAiResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        if let Some(usage) = &parsed.usage {
            info!(
                "LLM completion generated ({}). Tokens: {} prompt + {} completion = {} total",
                request.task, usage.prompt_tokens, usage.completion_tokens, usage.total_tokens
            );
        }

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| LlmError::InvalidResponse("No choices in response".to_string()))
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        info!(
            "Generating LLM completion (task: {}, model: {}, max_tokens: {})",
            request.task, self.model, request.max_tokens
        );
        with_retry("OpenAI", || self.call_openai(request)).await
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest<'a> {
    system_instruction: GeminiContent<'a>,
    contents: Vec<GeminiContent<'a>>,
    generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Serialize)]
struct GeminiContent<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<GeminiPart<'a>>,
}

#[derive(Debug, Serialize)]
struct GeminiPart<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    max_output_tokens: usize,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<&'static str>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiResponseContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponseContent {
    #[serde(default)]
    parts: Vec<GeminiResponsePart>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponsePart {
    text: Option<String>,
}

/// Google Gemini `generateContent` provider
pub struct GeminiProvider {
    api_key: String,
    model: String,
    client: Client,
}

impl GeminiProvider {
    pub fn new(api_key: String, model: String, timeout: Duration) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::NetworkError(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            api_key,
            model,
            client,
        })
    }

    async fn call_gemini(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        let body = GeminiRequest {
            system_instruction: GeminiContent {
                role: None,
                parts: vec![GeminiPart {
                    text: &request.system,
                }],
            },
            contents: vec![GeminiContent {
                role: Some("user"),
                parts: vec![GeminiPart {
                    text: &request.prompt,
                }],
            }],
            generation_config: GeminiGenerationConfig {
                max_output_tokens: request.max_tokens,
                temperature: request.temperature,
                response_mime_type: request.json_output.then_some("application/json"),
            },
        };

        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent",
            self.model
        );

        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let parsed: GeminiResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        let text: String = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        if text.trim().is_empty() {
            return Err(LlmError::InvalidResponse("Empty Gemini response".to_string()));
        }
        Ok(text)
    }
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        info!(
            "Generating LLM completion (task: {}, model: {}, max_tokens: {})",
            request.task, self.model, request.max_tokens
        );
        with_retry("Gemini", || self.call_gemini(request)).await
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[derive(Debug, Clone)]
struct CachedResponse {
    content: String,
    created_at: Instant,
}

/// LLM response cache with TTL. A zero TTL disables caching.
pub struct LlmCache {
    cache: DashMap<String, CachedResponse>,
    ttl: Duration,
}

impl LlmCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: DashMap::new(),
            ttl,
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let cached = self.cache.get(key)?;
        if cached.created_at.elapsed() < self.ttl {
            info!("Cache hit for key: {}", key);
            return Some(cached.content.clone());
        }
        drop(cached);
        self.cache.remove(key);
        None
    }

    pub fn set(&self, key: String, value: String) {
        if self.ttl.is_zero() {
            return;
        }
        self.cache.insert(
            key,
            CachedResponse {
                content: value,
                created_at: Instant::now(),
            },
        );
    }

    pub fn clear_expired(&self) {
        let initial_count = self.cache.len();
        self.cache.retain(|_, v| v.created_at.elapsed() < self.ttl);
        let removed_count = initial_count - self.cache.len();
        if removed_count > 0 {
            info!("Cleared {} expired cache entries", removed_count);
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.cache.len()
    }
}

/// LLM service with provider abstraction and response caching
pub struct LlmService {
    provider: Arc<dyn LlmProvider>,
    cache: LlmCache,
    max_tokens: usize,
    temperature: f32,
}

impl LlmService {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        info!(
            "Initializing LLM service with provider: {:?} (model: {})",
            config.provider, config.model
        );
        let provider: Arc<dyn LlmProvider> = match config.provider {
            LlmProviderKind::OpenAi => Arc::new(OpenAiProvider::new(
                config.api_key.clone(),
                config.model.clone(),
                config.timeout,
            )?),
            LlmProviderKind::Gemini => Arc::new(GeminiProvider::new(
                config.api_key.clone(),
                config.model.clone(),
                config.timeout,
            )?),
        };

        Ok(Self {
            provider,
            cache: LlmCache::new(config.cache_ttl),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }

    #[cfg(test)]
    pub fn with_provider(provider: Arc<dyn LlmProvider>, cache_ttl: Duration) -> Self {
        Self {
            provider,
            cache: LlmCache::new(cache_ttl),
            max_tokens: 1500,
            temperature: 0.2,
        }
    }

    pub fn model(&self) -> &str {
        self.provider.model()
    }

    /// Request template carrying the configured token and temperature limits
    pub fn request(&self, task: LlmTask, system: &str, prompt: String) -> CompletionRequest {
        CompletionRequest::json(task, system, prompt).with_limits(self.max_tokens, self.temperature)
    }

    /// Generate a completion, serving repeated identical requests from cache
    pub async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        let cache_key = request.cache_key();
        if let Some(cached) = self.cache.get(&cache_key) {
            return Ok(cached);
        }

        let result = self.provider.complete(request).await?;
        self.cache.set(cache_key, result.clone());
        Ok(result)
    }

    /// Generate a completion and decode the JSON object it contains
    pub async fn complete_json<T: DeserializeOwned>(
        &self,
        request: &CompletionRequest,
    ) -> Result<T, LlmError> {
        let text = self.complete(request).await?;
        parse_json_response(&text)
    }

    pub fn cleanup(&self) {
        self.cache.clear_expired();
    }
}

/// Locate the outermost JSON object in model output.
///
/// Tolerates Markdown code fences and prose before or after the object.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

pub fn parse_json_response<T: DeserializeOwned>(text: &str) -> Result<T, LlmError> {
    let json = extract_json_object(text)
        .ok_or_else(|| LlmError::InvalidResponse("no JSON object in completion".to_string()))?;
    serde_json::from_str(json).map_err(|e| LlmError::InvalidResponse(e.to_string()))
}


#[cfg(test)]
mod tests {
    use super::testing::FakeLlm;
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_extract_json_from_fenced_block() {
        let text = "Here you go:\n```json\n{\"a\": {\"b\": \"}\"}}\n```\nDone.";
        assert_eq!(extract_json_object(text), Some("{\"a\": {\"b\": \"}\"}}"));
    }

    #[test]
    fn test_extract_json_handles_escaped_quotes() {
        let text = r#"{"s": "say \"hi\" {"}"#;
        assert_eq!(extract_json_object(text), Some(text));
    }

    #[test]
    fn test_extract_json_missing_or_unbalanced() {
        assert_eq!(extract_json_object("no json here"), None);
        assert_eq!(extract_json_object("{\"open\": 1"), None);
    }

    #[test]
    fn test_parse_json_response_reports_invalid() {
        #[derive(Debug, Deserialize)]
        struct Shape {
            #[allow(dead_code)]
            value: u32,
        }
        let err = parse_json_response::<Shape>("{\"value\": \"x\"}").unwrap_err();
        assert!(matches!(err, LlmError::InvalidResponse(_)));
    }

    #[test]
    fn test_cache_key_depends_on_prompt_and_task() {
        let a = CompletionRequest::json(LlmTask::TopicExtraction, "sys", "p1");
        let b = CompletionRequest::json(LlmTask::TopicExtraction, "sys", "p2");
        let c = CompletionRequest::json(LlmTask::ImpactRanking, "sys", "p1");
        assert_ne!(a.cache_key(), b.cache_key());
        assert_ne!(a.cache_key(), c.cache_key());
        assert_eq!(a.cache_key(), a.clone().cache_key());
    }

    #[test]
    fn test_cache_stores_and_retrieves() {
        let cache = LlmCache::new(Duration::from_secs(60));
        cache.set("test_key".to_string(), "test_value".to_string());
        assert_eq!(cache.get("test_key"), Some("test_value".to_string()));
    }

    #[tokio::test]
    async fn test_cache_expires() {
        let cache = LlmCache::new(Duration::from_millis(100));
        cache.set("test_key".to_string(), "test_value".to_string());

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(cache.get("test_key"), None);
        cache.clear_expired();
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_zero_ttl_disables_cache() {
        let cache = LlmCache::new(Duration::ZERO);
        cache.set("k".to_string(), "v".to_string());
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.get("k"), None);
    }

    #[tokio::test]
    async fn test_service_serves_repeat_requests_from_cache() {
        let fake = Arc::new(FakeLlm::new(|_| Ok("{\"ok\": true}".to_string())));
        let service = LlmService::with_provider(fake.clone(), Duration::from_secs(60));
        let request = CompletionRequest::json(LlmTask::QueryGeneration, "sys", "prompt");

        service.complete(&request).await.unwrap();
        service.complete(&request).await.unwrap();

        assert_eq!(fake.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_service_does_not_cache_failures() {
        let fake = Arc::new(FakeLlm::new(|_| Err(LlmError::Timeout)));
        let service = LlmService::with_provider(fake.clone(), Duration::from_secs(60));
        let request = CompletionRequest::json(LlmTask::QueryGeneration, "sys", "prompt");

        assert!(service.complete(&request).await.is_err());
        assert!(service.complete(&request).await.is_err());
        assert_eq!(fake.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_from_transient_error() {
        let attempts = AtomicU32::new(0);
        let result = with_retry("test", || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(LlmError::RateLimited)
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_on_permanent_error() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), LlmError> = with_retry("test", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async {
                Err(LlmError::ApiError {
                    status: 400,
                    message: "bad request".to_string(),
                })
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_after_max_attempts() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), LlmError> = with_retry("test", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(LlmError::Timeout) }
        })
        .await;

        assert_eq!(result, Err(LlmError::Timeout));
        assert_eq!(attempts.load(Ordering::SeqCst), MAX_ATTEMPTS);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_backoff_is_one_then_two_seconds() {
        let start = tokio::time::Instant::now();
        let result: Result<(), LlmError> =
            with_retry("test", || async { Err(LlmError::NetworkError("reset".to_string())) }).await;

        assert!(result.is_err());
        let elapsed = start.elapsed();
        // Two sleeps (1s + 2s), each with under 250ms of jitter
        assert!(elapsed >= Duration::from_secs(3), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(3500), "elapsed {:?}", elapsed);
    }
}
