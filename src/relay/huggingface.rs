//! Hugging Face inference client with prompt templating and bounded retries.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::config::{Config, GenerationParameters};
use crate::relay::handler::Inference;

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Reply used when every attempt fails.
pub const FALLBACK_RESPONSE: &str = "Sorry, I'm having a technical problem right now. \
Please try again in a few moments. 🙏";

const STATUS_TIMEOUT: Duration = Duration::from_secs(10);

const PERSONA: &str = "You are a helpful and friendly WhatsApp assistant.\n\
Answer concisely and naturally, in 2-3 sentences at most.";

/// Prompt layout expected by a model family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptFormat {
    /// `[INST] ... [/INST]`
    Mistral,
    /// `[INST]` with a `<<SYS>>` block.
    Llama,
    /// Plain question, for seq2seq models.
    Flan,
    Generic,
}

impl PromptFormat {
    /// Pick a format from the model id. Checked in order: mistral/mixtral, llama, flan.
    pub fn detect(model: &str) -> Self {
        let model = model.to_lowercase();
        if model.contains("mistral") || model.contains("mixtral") {
            PromptFormat::Mistral
        } else if model.contains("llama") {
            PromptFormat::Llama
        } else if model.contains("flan") {
            PromptFormat::Flan
        } else {
            PromptFormat::Generic
        }
    }

    pub fn render(&self, message: &str, user_name: &str) -> String {
        match self {
            PromptFormat::Mistral => {
                format!("[INST] {PERSONA}\n\n{user_name} asks: {message} [/INST]")
            }
            PromptFormat::Llama => format!(
                "<s>[INST] <<SYS>>\n{PERSONA}\n<</SYS>>\n\n{user_name} asks: {message} [/INST]"
            ),
            PromptFormat::Flan => format!(
                "As a helpful WhatsApp assistant, answer this question from {user_name} \
                 concisely in 2-3 sentences: {message}"
            ),
            PromptFormat::Generic => format!(
                "Assistant: You are a helpful WhatsApp assistant. Keep replies to 2-3 sentences.\n\
                 User ({user_name}): {message}\n\
                 Assistant:"
            ),
        }
    }
}

/// Waits between attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Per-attempt request timeout.
    pub attempt_timeout: Duration,
    /// Wait while the model loads when the server gives no estimate.
    pub default_loading_wait: Duration,
    /// Upper bound on the server's loading estimate.
    pub max_loading_wait: Duration,
    /// After timeouts and transport/API errors.
    pub error_backoff: Duration,
    /// After a successful call that produced no text.
    pub empty_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(60),
            default_loading_wait: Duration::from_secs(20),
            max_loading_wait: Duration::from_secs(30),
            error_backoff: Duration::from_secs(5),
            empty_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts.
    pub fn immediate() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(10),
            default_loading_wait: Duration::ZERO,
            max_loading_wait: Duration::ZERO,
            error_backoff: Duration::ZERO,
            empty_backoff: Duration::ZERO,
        }
    }

    /// `min(estimate, max_loading_wait)`; unusable estimates fall back to the default.
    pub fn loading_wait(&self, estimated_secs: Option<f64>) -> Duration {
        let wait = match estimated_secs {
            Some(secs) if secs.is_finite() && secs >= 0.0 => {
                Duration::from_secs_f64(secs.min(self.max_loading_wait.as_secs_f64()))
            }
            _ => self.default_loading_wait,
        };
        wait.min(self.max_loading_wait)
    }
}

#[derive(Debug)]
pub enum InferenceError {
    Timeout,
    Http(String),
    /// 503 while the model is being loaded.
    Loading { estimated_secs: Option<f64> },
    Api { status: u16, body: String },
    Parse(String),
    Empty,
}

impl std::fmt::Display for InferenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InferenceError::Timeout => write!(f, "Request timed out"),
            InferenceError::Http(e) => write!(f, "HTTP error: {e}"),
            InferenceError::Loading { estimated_secs: Some(s) } => {
                write!(f, "Model loading (estimated {s:.0}s)")
            }
            InferenceError::Loading { estimated_secs: None } => write!(f, "Model loading"),
            InferenceError::Api { status, body } => write!(f, "API error {status}: {body}"),
            InferenceError::Parse(e) => write!(f, "Parse error: {e}"),
            InferenceError::Empty => write!(f, "Empty response"),
        }
    }
}

impl std::error::Error for InferenceError {}

/// Result of a model availability probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelStatus {
    /// HTTP status, 0 when the request itself failed.
    pub status: u16,
    pub available: bool,
    pub message: String,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    inputs: &'a str,
    parameters: &'a GenerationParameters,
}

#[derive(Deserialize)]
struct LoadingBody {
    estimated_time: Option<f64>,
}

/// Shapes the text-generation endpoint answers with.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GenerationResponse {
    /// `[{"generated_text": "..."}]`
    Batch(Vec<Map<String, Value>>),
    /// `{"generated_text": "..."}`
    Single(Map<String, Value>),
    #[allow(dead_code)]
    Unrecognized(IgnoredAny),
}

impl GenerationResponse {
    fn generated_text(&self) -> Option<String> {
        let record = match self {
            GenerationResponse::Batch(records) => records.first()?,
            GenerationResponse::Single(record) => record,
            GenerationResponse::Unrecognized(_) => return None,
        };
        let text = record.get("generated_text")?.as_str()?;
        Some(clean_generated_text(text))
    }
}

/// Strip an echoed prompt: keep what follows the last `[/INST]`, or else the
/// first `Assistant:`.
fn clean_generated_text(text: &str) -> String {
    const INST_CLOSE: &str = "[/INST]";
    if let Some(idx) = text.rfind(INST_CLOSE) {
        text[idx + INST_CLOSE.len()..].trim().to_string()
    } else if let Some((_, reply)) = text.split_once("Assistant:") {
        reply.trim().to_string()
    } else {
        text.trim().to_string()
    }
}

pub struct HuggingFaceClient {
    api_key: String,
    model: String,
    api_url: String,
    parameters: GenerationParameters,
    retry: RetryPolicy,
    http: reqwest::Client,
}

impl HuggingFaceClient {
    pub fn new(api_key: String, model: String, api_url: String, parameters: GenerationParameters) -> Self {
        Self {
            api_key,
            model,
            api_url,
            parameters,
            retry: RetryPolicy::default(),
            http: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let client = Self::new(
            config.huggingface_api_key.clone(),
            config.huggingface_model.clone(),
            config.huggingface_api_url(),
            config.generation.clone(),
        );
        info!("Hugging Face client ready, model: {}", client.model);
        client
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn format_prompt(&self, message: &str, user_name: &str) -> String {
        PromptFormat::detect(&self.model).render(message, user_name)
    }

    /// Generate a reply to `prompt`. Never fails: after `max_retries`
    /// unsuccessful attempts the fixed fallback is returned.
    pub async fn generate_response(&self, prompt: &str, user_name: &str, max_retries: u32) -> String {
        let formatted = self.format_prompt(prompt, user_name);
        let request = GenerateRequest {
            inputs: &formatted,
            parameters: &self.parameters,
        };

        for attempt in 1..=max_retries {
            info!("Generating response (attempt {attempt}/{max_retries})");
            let preview: String = formatted.chars().take(100).collect();
            debug!("Prompt: {preview}...");

            let wait = match self.attempt(&request).await {
                Ok(text) => {
                    let preview: String = text.chars().take(100).collect();
                    info!("Response generated: {preview}");
                    return text;
                }
                Err(InferenceError::Loading { estimated_secs }) => {
                    warn!("Model is loading, waiting before retry");
                    self.retry.loading_wait(estimated_secs)
                }
                Err(InferenceError::Empty) => {
                    warn!("Empty response from model");
                    self.retry.empty_backoff
                }
                Err(InferenceError::Timeout) => {
                    error!("Request timed out (attempt {attempt})");
                    self.retry.error_backoff
                }
                Err(e) => {
                    error!("Hugging Face API error: {e}");
                    self.retry.error_backoff
                }
            };

            if attempt < max_retries {
                tokio::time::sleep(wait).await;
            }
        }

        warn!("All attempts failed, using fallback response");
        FALLBACK_RESPONSE.to_string()
    }

    async fn attempt(&self, request: &GenerateRequest<'_>) -> Result<String, InferenceError> {
        let response = self
            .http
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .timeout(self.retry.attempt_timeout)
            .json(request)
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            let body = response.text().await.unwrap_or_default();
            let estimated_secs = serde_json::from_str::<LoadingBody>(&body)
                .ok()
                .and_then(|b| b.estimated_time);
            return Err(InferenceError::Loading { estimated_secs });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InferenceError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.text().await.map_err(request_error)?;
        let parsed: GenerationResponse =
            serde_json::from_str(&body).map_err(|e| InferenceError::Parse(e.to_string()))?;

        parsed
            .generated_text()
            .filter(|text| !text.is_empty())
            .ok_or(InferenceError::Empty)
    }

    /// Probe the model endpoint once.
    pub async fn check_model_status(&self) -> ModelStatus {
        let result = self
            .http
            .get(&self.api_url)
            .bearer_auth(&self.api_key)
            .timeout(STATUS_TIMEOUT)
            .send()
            .await;

        match result {
            Ok(response) => {
                let status = response.status().as_u16();
                let available = status == 200;
                let message = if available {
                    "OK".to_string()
                } else {
                    response.text().await.unwrap_or_default()
                };
                ModelStatus { status, available, message }
            }
            Err(e) => {
                error!("Model status check failed: {e}");
                ModelStatus {
                    status: 0,
                    available: false,
                    message: e.to_string(),
                }
            }
        }
    }
}

fn request_error(e: reqwest::Error) -> InferenceError {
    if e.is_timeout() {
        InferenceError::Timeout
    } else {
        InferenceError::Http(e.to_string())
    }
}

#[async_trait]
impl Inference for HuggingFaceClient {
    async fn generate(&self, prompt: &str, user_name: &str) -> String {
        self.generate_response(prompt, user_name, DEFAULT_MAX_RETRIES).await
    }

    async fn model_status(&self) -> ModelStatus {
        self.check_model_status().await
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const MODEL_PATH: &str = "/models/mistralai/Mistral-7B-Instruct-v0.2";

    fn client(base: &str) -> HuggingFaceClient {
        HuggingFaceClient::new(
            "hf_test".to_string(),
            "mistralai/Mistral-7B-Instruct-v0.2".to_string(),
            format!("{base}{MODEL_PATH}"),
            GenerationParameters::default(),
        )
        .with_retry_policy(RetryPolicy::immediate())
    }

    fn decode(json: &str) -> Option<String> {
        serde_json::from_str::<GenerationResponse>(json)
            .unwrap()
            .generated_text()
    }

    // Prompt templates

    #[test]
    fn test_detect_priority() {
        assert_eq!(PromptFormat::detect("mistralai/Mistral-7B-Instruct"), PromptFormat::Mistral);
        assert_eq!(PromptFormat::detect("mistralai/Mixtral-8x7B"), PromptFormat::Mistral);
        assert_eq!(PromptFormat::detect("meta-llama/Llama-2-7b-chat-hf"), PromptFormat::Llama);
        assert_eq!(PromptFormat::detect("google/flan-t5-large"), PromptFormat::Flan);
        assert_eq!(PromptFormat::detect("HuggingFaceH4/zephyr-7b-beta"), PromptFormat::Generic);
        // mistral wins over llama
        assert_eq!(PromptFormat::detect("someone/mistral-llama-merge"), PromptFormat::Mistral);
    }

    #[test]
    fn test_mistral_prompt() {
        let prompt = PromptFormat::Mistral.render("What's the capital of France?", "Alice");
        assert!(prompt.starts_with("[INST]"));
        assert!(prompt.ends_with("[/INST]"));
        assert!(prompt.contains("Alice"));
        assert!(prompt.contains("What's the capital of France?"));
        assert!(prompt.contains("WhatsApp assistant"));
    }

    #[test]
    fn test_llama_prompt_has_system_block() {
        let prompt = PromptFormat::Llama.render("hi", "Bob");
        assert!(prompt.starts_with("<s>[INST] <<SYS>>"));
        assert!(prompt.contains("<</SYS>>"));
        assert!(prompt.contains("Bob asks: hi [/INST]"));
    }

    #[test]
    fn test_generic_and_flan_prompts() {
        let generic = PromptFormat::Generic.render("hello", "Carol");
        assert!(generic.contains("User (Carol): hello"));
        assert!(generic.trim_end().ends_with("Assistant:"));

        let flan = PromptFormat::Flan.render("why is the sky blue?", "Dan");
        assert!(flan.contains("why is the sky blue?"));
        assert!(!flan.contains("[INST]"));
    }

    #[test]
    fn test_format_prompt_uses_configured_model() {
        let c = client("http://localhost");
        assert!(c.format_prompt("yo", "Eve").contains("[INST]"));
    }

    // Response extraction

    #[test]
    fn test_extract_batch() {
        assert_eq!(decode(r#"[{"generated_text": "  Paris.  "}]"#).as_deref(), Some("Paris."));
        assert_eq!(
            decode(r#"[{"generated_text": "first"}, {"generated_text": "second"}]"#).as_deref(),
            Some("first")
        );
    }

    #[test]
    fn test_extract_single_record() {
        assert_eq!(decode(r#"{"generated_text": "Hi there"}"#).as_deref(), Some("Hi there"));
    }

    #[test]
    fn test_extract_unrecognized_shapes() {
        assert_eq!(decode("[]"), None);
        assert_eq!(decode(r#"["just a string"]"#), None);
        assert_eq!(decode(r#""bare string""#), None);
        assert_eq!(decode("42"), None);
        assert_eq!(decode(r#"[{"other": "field"}]"#), None);
        assert_eq!(decode(r#"{"generated_text": 7}"#), None);
    }

    #[test]
    fn test_clean_strips_echoed_prompt() {
        assert_eq!(
            clean_generated_text("[INST] a [/INST] b [/INST] final answer "),
            "final answer"
        );
        assert_eq!(
            clean_generated_text("User (x): q\nAssistant: the reply Assistant: more"),
            "the reply Assistant: more"
        );
        assert_eq!(clean_generated_text("  plain  "), "plain");
    }

    #[test]
    fn test_loading_wait_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.loading_wait(Some(12.0)), Duration::from_secs(12));
        assert_eq!(policy.loading_wait(Some(95.5)), Duration::from_secs(30));
        assert_eq!(policy.loading_wait(None), Duration::from_secs(20));
        assert_eq!(policy.loading_wait(Some(f64::NAN)), Duration::from_secs(20));
        assert_eq!(policy.loading_wait(Some(-3.0)), Duration::from_secs(20));
        assert_eq!(policy.loading_wait(Some(1e300)), Duration::from_secs(30));
    }

    // Generation against a mock endpoint

    #[tokio::test]
    async fn test_generate_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", MODEL_PATH)
            .match_header("authorization", "Bearer hf_test")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "parameters": {
                    "max_new_tokens": 500,
                    "return_full_text": false
                }
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"[{"generated_text": "Paris is the capital of France."}]"#)
            .create_async()
            .await;

        let reply = client(&server.url())
            .generate_response("Capital of France?", "Alice", 3)
            .await;
        assert_eq!(reply, "Paris is the capital of France.");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_generate_sends_formatted_prompt() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", MODEL_PATH)
            .match_body(Matcher::Regex(r#""inputs":"\[INST\] .*Zoe asks: ping\? \[/INST\]""#.to_string()))
            .with_status(200)
            .with_body(r#"{"generated_text": "pong"}"#)
            .create_async()
            .await;

        assert_eq!(client(&server.url()).generate_response("ping?", "Zoe", 1).await, "pong");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_generate_unreachable_returns_fallback() {
        let reply = client("http://127.0.0.1:1").generate_response("hello", "User", 3).await;
        assert_eq!(reply, FALLBACK_RESPONSE);
        assert!(!reply.is_empty());
    }

    #[tokio::test]
    async fn test_generate_retries_while_loading() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", MODEL_PATH)
            .with_status(503)
            .with_body(r#"{"error": "Model is currently loading", "estimated_time": 0.0}"#)
            .expect(3)
            .create_async()
            .await;

        let reply = client(&server.url()).generate_response("hi", "User", 3).await;
        assert_eq!(reply, FALLBACK_RESPONSE);
        mock.assert_async().await;
    }

    /// Accepts connections and never answers. Returns the base URL and the
    /// number of connections accepted so far.
    async fn silent_server() -> (String, Arc<AtomicUsize>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                held.push(stream);
            }
        });
        (format!("http://{addr}"), accepted)
    }

    fn short_timeouts() -> RetryPolicy {
        RetryPolicy {
            attempt_timeout: Duration::from_millis(200),
            error_backoff: Duration::from_millis(10),
            ..RetryPolicy::immediate()
        }
    }

    #[tokio::test]
    async fn test_attempt_timeout_is_classified() {
        let (base, _) = silent_server().await;
        let c = client(&base).with_retry_policy(short_timeouts());
        let prompt = c.format_prompt("hi", "User");
        let request = GenerateRequest {
            inputs: &prompt,
            parameters: &c.parameters,
        };

        assert!(matches!(c.attempt(&request).await, Err(InferenceError::Timeout)));
    }

    #[tokio::test]
    async fn test_generate_retries_after_timeout() {
        let (base, accepted) = silent_server().await;
        let reply = client(&base)
            .with_retry_policy(short_timeouts())
            .generate_response("hi", "User", 2)
            .await;

        assert_eq!(reply, FALLBACK_RESPONSE);
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_generate_retries_on_empty_text() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", MODEL_PATH)
            .with_status(200)
            .with_body(r#"[{"generated_text": "   "}]"#)
            .expect(2)
            .create_async()
            .await;

        let reply = client(&server.url()).generate_response("hi", "User", 2).await;
        assert_eq!(reply, FALLBACK_RESPONSE);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_generate_retries_on_server_error() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", MODEL_PATH)
            .with_status(500)
            .with_body("internal error")
            .expect(3)
            .create_async()
            .await;

        let reply = client(&server.url()).generate_response("hi", "User", 3).await;
        assert_eq!(reply, FALLBACK_RESPONSE);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_generate_zero_retries() {
        let reply = client("http://127.0.0.1:1").generate_response("hi", "User", 0).await;
        assert_eq!(reply, FALLBACK_RESPONSE);
    }

    // Model status

    #[tokio::test]
    async fn test_model_status_available() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", MODEL_PATH)
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let status = client(&server.url()).check_model_status().await;
        assert_eq!(status, ModelStatus { status: 200, available: true, message: "OK".to_string() });
    }

    #[tokio::test]
    async fn test_model_status_unavailable() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", MODEL_PATH)
            .with_status(404)
            .with_body("Model not found")
            .create_async()
            .await;

        let status = client(&server.url()).check_model_status().await;
        assert_eq!(status.status, 404);
        assert!(!status.available);
        assert_eq!(status.message, "Model not found");
    }

    #[tokio::test]
    async fn test_model_status_unreachable() {
        let status = client("http://127.0.0.1:1").check_model_status().await;
        assert_eq!(status.status, 0);
        assert!(!status.available);
        assert!(!status.message.is_empty());
    }
}
