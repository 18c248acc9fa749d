//! OpenAI-compatible chat completions provider

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, header};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use url::Url;

use super::{Completion, PromptRequest, ProviderAdapter, Usage};
use crate::config::{ApiKey, ConfigError};
use crate::error::ProviderError;
use crate::message::{ChatMessage, Role};

const PROVIDER_NAME: &str = "openai";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    temperature: f64,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: Role,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<Value>,
}

/// Chat completions over HTTP with bearer authentication
#[derive(Debug, Clone)]
pub struct OpenAiChatProvider {
    http: Client,
    endpoint: Url,
    api_key: ApiKey,
}

impl OpenAiChatProvider {
    /// Create a provider rooted at `base_url`, e.g. `https://api.openai.com/v1`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if the URL is invalid or the
    /// HTTP client cannot be built.
    pub fn new(base_url: &str, api_key: ApiKey) -> Result<Self, ConfigError> {
        let endpoint = Url::parse(&format!(
            "{}/chat/completions",
            base_url.trim_end_matches('/')
        ))
        .map_err(|e| ConfigError::ValidationError(format!("invalid provider URL: {e}")))?;

        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(format!("beast-agent/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| {
                ConfigError::ValidationError(format!("Failed to create HTTP client: {e}"))
            })?;

        Ok(Self {
            http,
            endpoint,
            api_key,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn build_body<'a>(request: &'a PromptRequest) -> ChatRequest<'a> {
        let mut messages: Vec<WireMessage<'a>> = request
            .history
            .iter()
            .map(|m: &ChatMessage| WireMessage {
                role: m.role,
                content: &m.content,
            })
            .collect();
        messages.push(WireMessage {
            role: Role::User,
            content: &request.prompt,
        });

        ChatRequest {
            model: &request.options.model,
            messages,
            temperature: request.options.temperature,
            max_tokens: request.options.max_tokens,
        }
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiChatProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn generate(&self, request: &PromptRequest) -> Result<Completion, ProviderError> {
        let body = Self::build_body(request);
        debug!(model = %request.options.model, turns = body.messages.len(), "Calling chat completions");

        let response = self
            .http
            .post(self.endpoint.clone())
            .bearer_auth(self.api_key.expose())
            .timeout(request.options.timeout)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, retry_after, &text));
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                classify_transport_error(e)
            } else {
                ProviderError::fatal("invalid_response", format!("Undecodable response body: {e}"))
            }
        })?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| {
                ProviderError::fatal("invalid_response", "Response contained no completion")
            })?;

        Ok(Completion {
            content,
            model: parsed
                .model
                .unwrap_or_else(|| request.options.model.clone()),
            usage: parsed.usage,
            provider: PROVIDER_NAME.to_string(),
            request_id: parsed.id,
        })
    }
}

fn classify_transport_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::retryable("timeout", format!("Provider request timed out: {err}"))
    } else if err.is_connect() {
        ProviderError::retryable("connection_error", format!("Could not reach provider: {err}"))
    } else if err.is_builder() {
        ProviderError::fatal("invalid_request", format!("Could not build request: {err}"))
    } else {
        ProviderError::retryable("connection_error", format!("Provider transport error: {err}"))
    }
}

/// `Retry-After` in seconds; HTTP-date values are ignored
fn parse_retry_after(headers: &header::HeaderMap) -> Option<Duration> {
    headers
        .get(header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
}

/// Map a non-success HTTP status to a classified error
pub(crate) fn classify_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> ProviderError {
    let parsed = serde_json::from_str::<ErrorEnvelope>(body).ok();
    let message = parsed
        .as_ref()
        .and_then(|e| e.error.message.clone())
        .unwrap_or_else(|| {
            let trimmed = body.trim();
            if trimmed.is_empty() {
                status.to_string()
            } else {
                trimmed.chars().take(500).collect()
            }
        });
    let body_code = parsed.and_then(|e| match e.error.code {
        Some(Value::String(code)) if !code.is_empty() => Some(code),
        _ => None,
    });

    let error = match status {
        StatusCode::TOO_MANY_REQUESTS => {
            let error = ProviderError::retryable("rate_limited", message);
            match retry_after {
                Some(delay) => error.with_retry_after(delay),
                None => error,
            }
        }
        StatusCode::REQUEST_TIMEOUT => ProviderError::retryable("request_timeout", message),
        StatusCode::CONFLICT => ProviderError::retryable("server_error", message),
        s if s.is_server_error() => ProviderError::retryable("server_error", message),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ProviderError::fatal("authentication_failed", message)
        }
        _ => ProviderError::fatal(body_code.unwrap_or_else(|| "invalid_request".to_string()), message),
    };

    error.with_detail("status", status.as_u16())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderErrorKind;
    use crate::message::GenerationOptions;
    use rstest::rstest;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(prompt: &str, timeout: Duration) -> PromptRequest {
        PromptRequest {
            prompt: prompt.to_string(),
            history: vec![
                ChatMessage::user("hello"),
                ChatMessage::assistant("hi there"),
            ],
            options: GenerationOptions {
                model: "gpt-4o-mini".to_string(),
                temperature: 0.2,
                max_tokens: 64,
                timeout,
            },
        }
    }

    fn provider(server: &MockServer) -> OpenAiChatProvider {
        OpenAiChatProvider::new(&format!("{}/v1", server.uri()), ApiKey::new("sk-test")).unwrap()
    }

    #[rstest]
    #[case(429, ProviderErrorKind::Retryable, "rate_limited")]
    #[case(408, ProviderErrorKind::Retryable, "request_timeout")]
    #[case(409, ProviderErrorKind::Retryable, "server_error")]
    #[case(500, ProviderErrorKind::Retryable, "server_error")]
    #[case(502, ProviderErrorKind::Retryable, "server_error")]
    #[case(503, ProviderErrorKind::Retryable, "server_error")]
    #[case(401, ProviderErrorKind::Fatal, "authentication_failed")]
    #[case(403, ProviderErrorKind::Fatal, "authentication_failed")]
    #[case(400, ProviderErrorKind::Fatal, "invalid_request")]
    #[case(404, ProviderErrorKind::Fatal, "invalid_request")]
    #[case(422, ProviderErrorKind::Fatal, "invalid_request")]
    fn test_status_classification(
        #[case] status: u16,
        #[case] kind: ProviderErrorKind,
        #[case] code: &str,
    ) {
        let status = StatusCode::from_u16(status).unwrap();
        let error = classify_status(status, None, "");
        assert_eq!(error.kind, kind);
        assert_eq!(error.code, code);
        assert_eq!(error.details["status"], status.as_u16());
    }

    #[test]
    fn test_error_body_message_and_code() {
        let body = r#"{"error":{"message":"The model `x` does not exist","type":"invalid_request_error","code":"model_not_found"}}"#;
        let error = classify_status(StatusCode::NOT_FOUND, None, body);
        assert_eq!(error.code, "model_not_found");
        assert_eq!(error.message, "The model `x` does not exist");
    }

    #[test]
    fn test_rate_limit_keeps_retry_after() {
        let error = classify_status(
            StatusCode::TOO_MANY_REQUESTS,
            Some(Duration::from_secs(7)),
            "",
        );
        assert_eq!(error.retry_after, Some(Duration::from_secs(7)));
    }

    #[tokio::test]
    async fn test_successful_completion() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({
                "model": "gpt-4o-mini",
                "max_tokens": 64,
                "messages": [
                    {"role": "user", "content": "hello"},
                    {"role": "assistant", "content": "hi there"},
                    {"role": "user", "content": "2+2?"}
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "chatcmpl-123",
                "model": "gpt-4o-mini-2024-07-18",
                "choices": [{"index": 0, "message": {"role": "assistant", "content": "4"}}],
                "usage": {"prompt_tokens": 12, "completion_tokens": 1, "total_tokens": 13}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let completion = provider(&server)
            .generate(&request("2+2?", Duration::from_secs(5)))
            .await
            .unwrap();

        assert_eq!(completion.content, "4");
        assert_eq!(completion.model, "gpt-4o-mini-2024-07-18");
        assert_eq!(completion.provider, "openai");
        assert_eq!(completion.request_id.as_deref(), Some("chatcmpl-123"));
        assert_eq!(completion.usage.total_tokens, 13);
    }

    #[tokio::test]
    async fn test_rate_limited_with_retry_after_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("retry-after", "2")
                    .set_body_json(json!({"error": {"message": "Rate limit reached"}})),
            )
            .mount(&server)
            .await;

        let error = provider(&server)
            .generate(&request("x", Duration::from_secs(5)))
            .await
            .unwrap_err();

        assert!(error.is_retryable());
        assert_eq!(error.code, "rate_limited");
        assert_eq!(error.message, "Rate limit reached");
        assert_eq!(error.retry_after, Some(Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn test_unauthorized_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .mount(&server)
            .await;

        let error = provider(&server)
            .generate(&request("x", Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(!error.is_retryable());
        assert_eq!(error.code, "authentication_failed");
    }

    #[tokio::test]
    async fn test_slow_response_times_out_as_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_secs(2))
                    .set_body_json(json!({"choices": []})),
            )
            .mount(&server)
            .await;

        let error = provider(&server)
            .generate(&request("x", Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(error.is_retryable());
        assert_eq!(error.code, "timeout");
    }

    #[tokio::test]
    async fn test_empty_choices_is_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
            .mount(&server)
            .await;

        let error = provider(&server)
            .generate(&request("x", Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(!error.is_retryable());
        assert_eq!(error.code, "invalid_response");
    }

    #[tokio::test]
    async fn test_malformed_body_is_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;

        let error = provider(&server)
            .generate(&request("x", Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert_eq!(error.code, "invalid_response");
    }

    #[tokio::test]
    async fn test_unreachable_host_is_retryable() {
        let provider =
            OpenAiChatProvider::new("http://127.0.0.1:1/v1", ApiKey::new("sk-test")).unwrap();
        let error = provider
            .generate(&request("x", Duration::from_secs(2)))
            .await
            .unwrap_err();
        assert!(error.is_retryable());
    }

    #[test]
    fn test_endpoint_joins_base_url() {
        let provider =
            OpenAiChatProvider::new("https://api.openai.com/v1/", ApiKey::new("k")).unwrap();
        assert_eq!(
            provider.endpoint().as_str(),
            "https://api.openai.com/v1/chat/completions"
        );
    }
}
