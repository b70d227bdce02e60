//! The single-round-trip seam beneath [`RetryingTransport`](crate::transport::RetryingTransport).

use async_trait::async_trait;
use std::time::Duration;

use crate::error::ClientError;
use crate::request::GenerationRequest;

/// Raw outcome of one call. For status 200, `body` is the assistant text with any
/// envelope already removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientResponse {
    pub status: u16,
    pub retry_after: Option<Duration>,
    pub body: String,
}

impl ClientResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            retry_after: None,
            body: body.into(),
        }
    }

    pub fn status(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            retry_after: None,
            body: body.into(),
        }
    }
}

/// Trait for anything that can execute a [`GenerationRequest`] once.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(
        &self,
        request: &GenerationRequest,
        timeout: Duration,
    ) -> Result<ClientResponse, ClientError>;
}

/// Parse a Retry-After header value (seconds or HTTP-date).
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    if let Ok(secs) = value.parse::<f64>() {
        return Duration::try_from_secs_f64(secs).ok();
    }
    if let Ok(when) = chrono::DateTime::parse_from_rfc2822(value) {
        let wait = when.with_timezone(&chrono::Utc) - chrono::Utc::now();
        return Some(wait.to_std().unwrap_or(Duration::ZERO));
    }
    None
}

#[cfg(feature = "http")]
pub use http::HttpCompletionClient;

#[cfg(feature = "http")]
mod http {
    use super::*;
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use reqwest::Client;
    use serde_json::{Value, json};
    use tracing::debug;

    /// OpenAI-compatible `chat/completions` client.
    #[derive(Clone)]
    pub struct HttpCompletionClient {
        client: Client,
        endpoint: String,
        api_key: String,
        model: String,
    }

    impl HttpCompletionClient {
        pub fn new(
            endpoint: impl Into<String>,
            api_key: impl Into<String>,
            model: impl Into<String>,
        ) -> Self {
            Self {
                client: Client::new(),
                endpoint: endpoint.into(),
                api_key: api_key.into(),
                model: model.into(),
            }
        }

        fn payload(&self, request: &GenerationRequest) -> Value {
            let mut content = vec![json!({
                "type": "text",
                "text": request.instruction,
            })];
            for attachment in &request.attachments {
                content.push(json!({
                    "type": "text",
                    "text": attachment.label,
                }));
                content.push(json!({
                    "type": "image_url",
                    "image_url": {
                        "url": format!(
                            "data:{};base64,{}",
                            attachment.media_type,
                            STANDARD.encode(&attachment.data)
                        )
                    }
                }));
            }

            let mut payload = json!({
                "model": self.model,
                "messages": [
                    {
                        "role": "user",
                        "content": content
                    }
                ]
            });
            if let Some(max_tokens) = request.max_completion_tokens {
                payload["max_completion_tokens"] = json!(max_tokens);
            }
            payload
        }
    }

    #[async_trait]
    impl CompletionClient for HttpCompletionClient {
        async fn complete(
            &self,
            request: &GenerationRequest,
            timeout: Duration,
        ) -> Result<ClientResponse, ClientError> {
            debug!(
                mode = ?request.mode,
                images = request.attachments.len(),
                timeout_secs = timeout.as_secs(),
                "Sending completion request"
            );

            let response = self
                .client
                .post(&self.endpoint)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .timeout(timeout)
                .json(&self.payload(request))
                .send()
                .await
                .map_err(classify)?;

            let status = response.status().as_u16();
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let body = response.text().await.map_err(classify)?;

            if status != 200 {
                return Ok(ClientResponse {
                    status,
                    retry_after,
                    body,
                });
            }

            let envelope: Value = serde_json::from_str(&body)
                .map_err(|e| ClientError::Malformed(format!("response is not JSON: {e}")))?;
            let content = envelope["choices"][0]["message"]["content"]
                .as_str()
                .ok_or_else(|| ClientError::Malformed("no message content in response".into()))?;

            Ok(ClientResponse::ok(content))
        }
    }

    fn classify(e: reqwest::Error) -> ClientError {
        if e.is_timeout() {
            ClientError::Timeout(e.to_string())
        } else if e.is_connect() {
            ClientError::Connection(e.to_string())
        } else {
            ClientError::Other(e.to_string())
        }
    }

}
