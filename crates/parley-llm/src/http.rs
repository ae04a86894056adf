use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use tracing::instrument;

use parley_core::backend::{Framing, GenerateRequest, ModelBackend, RawStream};
use parley_core::errors::BackendError;

use crate::converter;

/// Streaming chat backend for any OpenAI-compatible endpoint.
pub struct HttpModelBackend {
    client: Client,
    endpoint: String,
    api_key: Option<SecretString>,
    framing: Framing,
}

impl HttpModelBackend {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<SecretString>,
        framing: Framing,
        connect_timeout: Duration,
    ) -> Result<Self, BackendError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| BackendError::InvalidRequest(format!("http client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
            framing,
        })
    }
}

#[async_trait]
impl ModelBackend for HttpModelBackend {
    fn name(&self) -> &str {
        "http"
    }

    fn framing(&self) -> Framing {
        self.framing
    }

    #[instrument(skip(self, request), fields(model = %request.model, messages = request.messages.len()))]
    async fn generate(&self, request: &GenerateRequest) -> Result<RawStream, BackendError> {
        let body = converter::build_request_body(request);

        let mut req = self
            .client
            .post(&self.endpoint)
            .header("accept", "text/event-stream")
            .json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key.expose_secret());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = resp.text().await.unwrap_or_default();
            return Err(match BackendError::from_status(status, body) {
                BackendError::RateLimited { .. } => BackendError::RateLimited { retry_after },
                other => other,
            });
        }

        let stream = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| BackendError::StreamInterrupted(e.to_string())));
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::messages::Message;
    use parley_core::stream::ModelDelta;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> GenerateRequest {
        GenerateRequest {
            model: "gpt-test".into(),
            system_prompt: None,
            messages: vec![Message::user("hello")],
            tools: vec![],
            max_tokens: 64,
        }
    }

    fn backend(server: &MockServer) -> HttpModelBackend {
        HttpModelBackend::new(
            format!("{}/v1/chat/completions", server.uri()),
            Some(SecretString::from("sk-test")),
            Framing::Sse,
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn streams_and_decodes_sse_body() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .expect(1)
            .mount(&server)
            .await;

        let backend = backend(&server);
        let raw = backend.generate(&request()).await.unwrap();
        let deltas: Vec<ModelDelta> = crate::decode(raw, backend.framing()).collect().await;

        let text: String = deltas
            .iter()
            .filter_map(|d| match d {
                ModelDelta::TextDelta { text } => Some(text.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "Hello");
        assert!(matches!(deltas.last(), Some(ModelDelta::End { skipped_frames: 0 })));
    }

    #[tokio::test]
    async fn error_status_is_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
            .mount(&server)
            .await;

        let err = match backend(&server).generate(&request()).await {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert!(matches!(
            err,
            BackendError::RateLimited { retry_after: Some(d) } if d == Duration::from_secs(7)
        ));
    }

    #[tokio::test]
    async fn unauthorized_is_auth_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .mount(&server)
            .await;

        let result = backend(&server).generate(&request()).await;
        assert!(matches!(result, Err(BackendError::AuthenticationFailed(_))));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_network_error() {
        let backend = HttpModelBackend::new(
            "http://127.0.0.1:9/v1/chat/completions",
            None,
            Framing::Sse,
            Duration::from_millis(200),
        )
        .unwrap();
        let result = backend.generate(&request()).await;
        assert!(matches!(result, Err(BackendError::Network(_))));
    }
}
