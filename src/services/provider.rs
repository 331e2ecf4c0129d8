use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use crate::models::classification::{
    ClassificationMethod, ClassificationResult, InvalidClassification, ModelClassification,
};
use crate::models::job::MessageSummary;

pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(5);

const SYSTEM_PROMPT: &str = concat!(
    "You triage email. Classify the message and answer with ONLY a JSON object with fields: ",
    "category (short lowercase label), priority (high|medium|low), ",
    "sentiment (positive|neutral|negative), summary (one sentence), ",
    "topics (at most 3 short strings), action_required (boolean)."
);

/// Connection settings for one LLM endpoint.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Breaker and log name, e.g. "primary".
    pub name: String,
    /// Full completion endpoint URL.
    pub url: String,
    pub model: String,
    pub api_key: Option<String>,
    /// Hard deadline for one call, independent of the HTTP client.
    pub timeout: Duration,
}

/// One attempt at classifying a message with an external model.
///
/// Implementations never retry; redelivery is the queue's job.
#[async_trait]
pub trait ClassificationProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn classify(
        &self,
        message: &MessageSummary,
        method: ClassificationMethod,
    ) -> Result<ClassificationResult, ProviderError>;
}

/// HTTP client for an OpenAI-compatible chat completion endpoint.
///
/// Also understands the Workers AI `{"result": {"response": ...}}` envelope.
pub struct LlmProviderClient {
    http: Client,
    config: ProviderConfig,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CompletionResponse {
    Chat { choices: Vec<ChatChoice> },
    WorkersAi { result: WorkersAiResult },
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Deserialize)]
struct WorkersAiResult {
    response: String,
}

impl CompletionResponse {
    fn into_text(self) -> Option<String> {
        match self {
            CompletionResponse::Chat { choices } => {
                choices.into_iter().next().map(|c| c.message.content)
            }
            CompletionResponse::WorkersAi { result } => Some(result.response),
        }
    }
}

impl LlmProviderClient {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let http = Client::builder()
            .connect_timeout(config.timeout)
            .build()
            .map_err(ProviderError::Http)?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    async fn request_text(&self, message: &MessageSummary) -> Result<String, ProviderError> {
        let mut user_prompt = format!(
            "From: {}\nSubject: {}\n\n{}",
            message.sender, message.subject, message.body_excerpt
        );
        if let Some(hint) = message.priority_hint {
            user_prompt.push_str(&format!("\n\nSender-declared priority: {hint}"));
        }

        let request_body = serde_json::json!({
            "model": self.config.model,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": user_prompt }
            ],
            "temperature": 0,
            "max_tokens": 400
        });

        let mut request = self.http.post(&self.config.url).json(&request_body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(ProviderError::Http)?;
        let status = response.status();
        let body = response.text().await.map_err(ProviderError::Http)?;
        if !status.is_success() {
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body: body.chars().take(512).collect(),
            });
        }

        let completion: CompletionResponse =
            serde_json::from_str(&body).map_err(ProviderError::Parse)?;
        completion.into_text().ok_or(ProviderError::MissingJson)
    }
}

#[async_trait]
impl ClassificationProvider for LlmProviderClient {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn classify(
        &self,
        message: &MessageSummary,
        method: ClassificationMethod,
    ) -> Result<ClassificationResult, ProviderError> {
        // Dropping the request future on expiry cancels the in-flight call.
        let text = tokio::time::timeout(self.config.timeout, self.request_text(message))
            .await
            .map_err(|_| ProviderError::Timeout(self.config.timeout))??;

        let json = extract_json_object(&text).ok_or(ProviderError::MissingJson)?;
        let parsed: ModelClassification = serde_json::from_str(json).map_err(ProviderError::Parse)?;
        Ok(parsed.into_result(method, Utc::now())?)
    }
}

/// The outermost `{...}` span of a model reply that may carry prose or code fences.
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Provider did not answer within {0:?}")]
    Timeout(Duration),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Provider returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to parse provider response: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Provider response contained no classification object")]
    MissingJson,

    #[error("Provider classification rejected: {0}")]
    Invalid(#[from] InvalidClassification),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::classification::{Priority, Sentiment};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_client(base_url: &str, timeout: Duration) -> LlmProviderClient {
        LlmProviderClient::new(ProviderConfig {
            name: "primary".to_string(),
            url: format!("{base_url}/v1/chat/completions"),
            model: "test-model".to_string(),
            api_key: Some("test-key".to_string()),
            timeout,
        })
        .unwrap()
    }

    fn message() -> MessageSummary {
        MessageSummary {
            sender: "ops@example.com".to_string(),
            subject: "Server down".to_string(),
            body_excerpt: "Production API is returning 500s.".to_string(),
            priority_hint: None,
        }
    }

    fn chat_body(content: &str) -> serde_json::Value {
        serde_json::json!({
            "choices": [{ "message": { "role": "assistant", "content": content } }]
        })
    }

    const CLASSIFICATION: &str = r#"{"category":"support","priority":"high","sentiment":"negative","summary":"Production API outage.","topics":["outage","api"],"action_required":true}"#;

    #[tokio::test]
    async fn test_classify_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_body(CLASSIFICATION)))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server.uri(), Duration::from_secs(2));
        let result = client
            .classify(&message(), ClassificationMethod::Primary)
            .await
            .unwrap();

        assert_eq!(result.category, "support");
        assert_eq!(result.priority, Priority::High);
        assert_eq!(result.sentiment, Sentiment::Negative);
        assert_eq!(result.topics, vec!["outage", "api"]);
        assert!(result.action_required);
        assert_eq!(result.method, ClassificationMethod::Primary);
    }

    #[tokio::test]
    async fn test_classify_accepts_fenced_workers_ai_reply() {
        let server = MockServer::start().await;
        let fenced = format!("Here you go:\n```json\n{CLASSIFICATION}\n```");
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "result": { "response": fenced } })),
            )
            .mount(&server)
            .await;

        let client = test_client(&server.uri(), Duration::from_secs(2));
        let result = client
            .classify(&message(), ClassificationMethod::Fallback)
            .await
            .unwrap();
        assert_eq!(result.method, ClassificationMethod::Fallback);
    }

    #[tokio::test]
    async fn test_non_ascii_reply_is_accepted() {
        let server = MockServer::start().await;
        let reply = serde_json::json!({
            "category": "meeting",
            "priority": "medium",
            "sentiment": "neutral",
            "summary": "é".repeat(260),
            "topics": ["ü".repeat(40), "t".repeat(65)],
            "action_required": false
        })
        .to_string();
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_body(&reply)))
            .mount(&server)
            .await;

        let client = test_client(&server.uri(), Duration::from_secs(2));
        let result = client
            .classify(&message(), ClassificationMethod::Primary)
            .await
            .unwrap();
        assert_eq!(result.summary.chars().count(), 260);
        assert_eq!(result.topics[0].chars().count(), 40);
        assert_eq!(result.topics[1].len(), 64);
    }

    #[tokio::test]
    async fn test_unparseable_reply_is_provider_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_body("I cannot help with that.")))
            .mount(&server)
            .await;

        let client = test_client(&server.uri(), Duration::from_secs(2));
        let err = client
            .classify(&message(), ClassificationMethod::Primary)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::MissingJson));
    }

    #[tokio::test]
    async fn test_invalid_fields_are_rejected() {
        let server = MockServer::start().await;
        let bad = r#"{"category":"support","priority":"whenever","sentiment":"neutral","summary":"x"}"#;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_body(bad)))
            .mount(&server)
            .await;

        let client = test_client(&server.uri(), Duration::from_secs(2));
        let err = client
            .classify(&message(), ClassificationMethod::Primary)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Invalid(InvalidClassification::Priority(_))));
    }

    #[tokio::test]
    async fn test_server_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let client = test_client(&server.uri(), Duration::from_secs(2));
        let err = client
            .classify(&message(), ClassificationMethod::Primary)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Status { status: 503, .. }));
    }

    #[tokio::test]
    async fn test_slow_provider_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(chat_body(CLASSIFICATION))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let client = test_client(&server.uri(), Duration::from_millis(100));
        let started = std::time::Instant::now();
        let err = client
            .classify(&message(), ClassificationMethod::Primary)
            .await
            .unwrap_err();

        assert!(matches!(err, ProviderError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_extract_json_object() {
        assert_eq!(extract_json_object("x {\"a\":{}} y"), Some("{\"a\":{}}"));
        assert_eq!(extract_json_object("no json"), None);
        assert_eq!(extract_json_object("} {"), None);
    }
}
