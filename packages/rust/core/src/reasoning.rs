//! Structural reasoning service boundary.
//!
//! The architecture analyzer sends one [`ReasoningRequest`] per analysis and
//! gets back raw response text. [`OpenRouterClient`] is the production
//! implementation: a single chat-completions round-trip against an
//! OpenAI-compatible API.

use std::future::Future;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};

use citelens_shared::{CitelensError, OpenRouterConfig, Result};

use crate::scoring::RelevanceScore;

/// User-Agent string for reasoning requests.
const USER_AGENT: &str = concat!("Citelens/", env!("CARGO_PKG_VERSION"));

/// Instructions sent as the system message on every structural analysis.
pub const SYSTEM_PROMPT: &str = r#"You are a document architecture reviewer for AI search and answer engines.
You receive a document split into numbered chunks, the heading path of each chunk, the target queries, and a 0-100 relevance score of every chunk against every query.

Find document-wide structural defects that stop chunks from being retrieved and cited:
- MISPLACED_CONTENT: content that belongs under a different heading or chunk
- REDUNDANCY: the same information repeated across chunks
- BROKEN_ATOMICITY: a chunk that depends on pronouns or context from other chunks
- TOPIC_INCOHERENCE: a chunk that mixes unrelated topics
- COVERAGE_GAP: a target query no chunk answers well
- ORPHANED_MENTION: a concept mentioned but never explained

Respond with a single JSON object and nothing else:
{"issues":[{"id":"issue-1","type":"REDUNDANCY","severity":"high|medium|low","chunk_indices":[0,3],"description":"...","recommendation":"...","impact":"..."}]}
chunk_indices are zero-based chunk numbers. When recommending a new heading, quote it, for example: Add a heading "Installing on Linux"."#;

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// Relevance of one chunk against one query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkQueryScore {
    pub query: String,
    pub score: RelevanceScore,
}

/// Everything the reasoning service sees about a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasoningRequest {
    pub document_text: String,
    pub chunk_bodies: Vec<String>,
    pub chunk_heading_paths: Vec<Vec<String>>,
    pub queries: Vec<String>,
    /// One entry per chunk, each listing every query in query order.
    pub per_chunk_scores: Vec<Vec<ChunkQueryScore>>,
}

/// SHA-256 over the canonical JSON form of a request.
pub fn request_fingerprint(request: &ReasoningRequest) -> String {
    let canonical = serde_json::to_string(request).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

// ---------------------------------------------------------------------------
// Service trait
// ---------------------------------------------------------------------------

/// External service that judges document structure.
///
/// Returns the raw response text; validation happens in the analyzer.
pub trait StructuralReasoningService: Send + Sync {
    fn analyze_structure(
        &self,
        request: &ReasoningRequest,
    ) -> impl Future<Output = Result<String>> + Send;
}

// ---------------------------------------------------------------------------
// Chat-completions protocol types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

// ---------------------------------------------------------------------------
// OpenRouterClient
// ---------------------------------------------------------------------------

/// [`StructuralReasoningService`] backed by an OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct OpenRouterClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenRouterClient {
    /// Build a client from the `[openrouter]` config section.
    pub fn new(config: &OpenRouterConfig, api_key: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| CitelensError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: config.default_model.clone(),
        })
    }

    /// Override the model ID.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    #[instrument(skip_all, fields(model = %self.model, chunks = request.chunk_bodies.len()))]
    async fn complete(&self, request: &ReasoningRequest) -> Result<String> {
        let user_content = serde_json::to_string(request)
            .map_err(|e| CitelensError::Reasoning(format!("failed to serialize request: {e}")))?;

        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: user_content,
                },
            ],
            temperature: 0.0,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        let url = format!("{}/chat/completions", self.base_url);
        debug!(%url, "sending structural analysis request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| CitelensError::Network(format!("{url}: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| CitelensError::Network(format!("{url}: body read failed: {e}")))?;

        if !status.is_success() {
            return Err(CitelensError::Reasoning(format!(
                "HTTP {status}: {}",
                truncate_chars(&text, 200)
            )));
        }

        let envelope: ChatResponse = serde_json::from_str(&text).map_err(|e| {
            CitelensError::Reasoning(format!(
                "invalid completion envelope: {e} (got: {})",
                truncate_chars(&text, 200)
            ))
        })?;

        if let Some(usage) = &envelope.usage {
            info!(
                tokens_in = usage.prompt_tokens,
                tokens_out = usage.completion_tokens,
                "structural analysis response received"
            );
        }

        envelope
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| CitelensError::Reasoning("completion contained no content".into()))
    }
}

impl StructuralReasoningService for OpenRouterClient {
    fn analyze_structure(
        &self,
        request: &ReasoningRequest,
    ) -> impl Future<Output = Result<String>> + Send {
        self.complete(request)
    }
}

/// Truncate to at most `max_chars` characters, on a character boundary.
pub(crate) fn truncate_chars(content: &str, max_chars: usize) -> &str {
    match content.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &content[..byte_idx],
        None => content,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sample_request() -> ReasoningRequest {
        ReasoningRequest {
            document_text: "# Guide\n\nIntro.".into(),
            chunk_bodies: vec!["Intro.".into()],
            chunk_heading_paths: vec![vec!["Guide".into()]],
            queries: vec!["what is this".into()],
            per_chunk_scores: vec![vec![ChunkQueryScore {
                query: "what is this".into(),
                score: RelevanceScore::new(42),
            }]],
        }
    }

    fn client_for(server: &MockServer) -> OpenRouterClient {
        let config = OpenRouterConfig {
            base_url: format!("{}/api/v1/", server.uri()),
            timeout_secs: 5,
            ..OpenRouterConfig::default()
        };
        OpenRouterClient::new(&config, "test-key")
            .unwrap()
            .with_model("test/model")
    }

    #[test]
    fn fingerprint_is_deterministic_and_input_sensitive() {
        let a = sample_request();
        let mut b = sample_request();
        assert_eq!(request_fingerprint(&a), request_fingerprint(&b));
        assert_eq!(request_fingerprint(&a).len(), 64);

        b.queries.push("another".into());
        assert_ne!(request_fingerprint(&a), request_fingerprint(&b));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("short", 100), "short");
    }

    #[test]
    fn chat_request_serializes_json_mode() {
        let body = ChatRequest {
            model: "m",
            messages: vec![ChatMessage {
                role: "user",
                content: "hi".into(),
            }],
            temperature: 0.0,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };
        let json = serde_json::to_string(&body).unwrap();
        assert!(json.contains(r#""response_format":{"type":"json_object"}"#));
        assert!(json.contains(r#""role":"user""#));
    }

    #[tokio::test]
    async fn returns_message_content_on_success() {
        let server = MockServer::start().await;
        let envelope = serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "{\"issues\":[]}"}}],
            "usage": {"prompt_tokens": 120, "completion_tokens": 8}
        });

        Mock::given(method("POST"))
            .and(path("/api/v1/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .and(body_string_contains("test/model"))
            .and(body_string_contains("chunk_heading_paths"))
            .respond_with(ResponseTemplate::new(200).set_body_json(envelope))
            .expect(1)
            .mount(&server)
            .await;

        let text = client_for(&server)
            .analyze_structure(&sample_request())
            .await
            .unwrap();
        assert_eq!(text, r#"{"issues":[]}"#);
    }

    #[tokio::test]
    async fn http_failure_is_retryable_reasoning_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("upstream overloaded"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .analyze_structure(&sample_request())
            .await
            .unwrap_err();
        assert!(matches!(err, CitelensError::Reasoning(_)));
        assert!(err.is_retryable());
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn empty_choices_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"choices": []})))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .analyze_structure(&sample_request())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no content"));
    }

    #[tokio::test]
    async fn malformed_envelope_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>gateway</html>"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .analyze_structure(&sample_request())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid completion envelope"));
    }
}
