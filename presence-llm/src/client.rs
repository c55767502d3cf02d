//! Completion client: unified interface for Ollama and OpenAI-compatible backends.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::error::LlmError;
use crate::types::{CompletionRequest, CompletionResponse};

/// Anything that can turn a prompt into text.
///
/// Every call site must treat an `Err` as "no output".
#[async_trait]
pub trait Completion: Send + Sync {
    /// Generate a completion for the request.
    ///
    /// # Errors
    /// Transport failures, timeouts and malformed responses.
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError>;

    /// Whether a backend is configured at all.
    fn is_available(&self) -> bool {
        true
    }
}

/// Provider backend for completions.
#[derive(Debug, Clone)]
pub enum LlmProvider {
    /// Ollama running locally.
    Ollama {
        /// Base URL, e.g. `http://localhost:11434`.
        base_url: String,
    },
    /// OpenAI-compatible chat completions API.
    OpenAiCompatible {
        /// Base URL without the `/v1` suffix.
        base_url: String,
        /// Bearer token.
        api_key: String,
    },
    /// No backend: every call fails, so callers take their fallback path.
    None,
}

impl LlmProvider {
    /// Build a provider from its configured name.
    ///
    /// # Errors
    /// [`LlmError::ConfigError`] for unknown provider names or a missing API key.
    pub fn from_parts(name: &str, base_url: &str, api_key: &str) -> Result<Self, LlmError> {
        let base_url = base_url.trim_end_matches('/').to_string();
        match name.to_ascii_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama { base_url }),
            "openai" | "openai_compatible" => {
                if api_key.trim().is_empty() {
                    return Err(LlmError::ConfigError(
                        "openai provider requires llm.api_key".into(),
                    ));
                }
                Ok(Self::OpenAiCompatible {
                    base_url,
                    api_key: api_key.to_string(),
                })
            }
            "none" | "" => Ok(Self::None),
            other => Err(LlmError::ConfigError(format!("unknown llm provider '{other}'"))),
        }
    }
}

/// The HTTP client that routes requests to the configured backend.
pub struct LlmClient {
    provider: LlmProvider,
    http: Client,
    model: String,
}

impl std::fmt::Debug for LlmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmClient")
            .field("provider", &self.provider_name())
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl LlmClient {
    /// Create a new client.
    #[must_use]
    pub fn new(provider: LlmProvider, model: impl Into<String>) -> Self {
        Self {
            provider,
            http: Client::new(),
            model: model.into(),
        }
    }

    /// Create a client with no backend (all calls fail).
    #[must_use]
    pub fn none() -> Self {
        Self::new(LlmProvider::None, String::new())
    }

    /// Short provider name for logs.
    #[must_use]
    pub fn provider_name(&self) -> &'static str {
        match self.provider {
            LlmProvider::Ollama { .. } => "ollama",
            LlmProvider::OpenAiCompatible { .. } => "openai",
            LlmProvider::None => "none",
        }
    }

    fn messages(request: &CompletionRequest) -> Vec<Value> {
        let mut messages = Vec::with_capacity(request.turns.len() + 1);
        if !request.system.is_empty() {
            messages.push(json!({ "role": "system", "content": request.system }));
        }
        for turn in &request.turns {
            messages.push(json!({ "role": turn.role, "content": turn.content }));
        }
        messages
    }

    /// POST `body` to `url` once and pull the text out with `extract`.
    ///
    /// A failed call is reported, never re-issued: the caller's "no output"
    /// path is the only fallback.
    async fn post(
        &self,
        url: &str,
        bearer: Option<&str>,
        body: &Value,
        timeout_ms: u64,
        extract: fn(&Value) -> Option<(String, u32)>,
    ) -> Result<CompletionResponse, LlmError> {
        let start = Instant::now();
        let mut builder = self
            .http
            .post(url)
            .json(body)
            .timeout(Duration::from_millis(timeout_ms));
        if let Some(token) = bearer {
            builder = builder.bearer_auth(token);
        }

        let resp = builder.send().await.map_err(|e| {
            let err = if e.is_timeout() {
                LlmError::Timeout(timeout_ms)
            } else {
                LlmError::from(e)
            };
            warn!(provider = self.provider_name(), error = %err, "Completion request failed");
            err
        })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(provider = self.provider_name(), status = status.as_u16(), "Completion returned error");
            return Err(LlmError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let json: Value = resp
            .json()
            .await
            .map_err(|e| LlmError::ParseError(e.to_string()))?;
        let latency_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        let Some((text, tokens_generated)) = extract(&json) else {
            return Err(LlmError::ParseError(format!(
                "no completion text in response: {json}"
            )));
        };
        debug!(provider = self.provider_name(), latency_ms, tokens_generated, "Completion finished");
        Ok(CompletionResponse {
            text,
            tokens_generated,
            latency_ms,
            model: self.model.clone(),
        })
    }
}

fn extract_ollama(json: &Value) -> Option<(String, u32)> {
    let text = json["message"]["content"].as_str()?.to_string();
    let tokens = json["eval_count"]
        .as_u64()
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or(0);
    Some((text, tokens))
}

fn extract_openai(json: &Value) -> Option<(String, u32)> {
    let text = json["choices"][0]["message"]["content"].as_str()?.to_string();
    let tokens = json["usage"]["completion_tokens"]
        .as_u64()
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or(0);
    Some((text, tokens))
}

#[async_trait]
impl Completion for LlmClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        match &self.provider {
            LlmProvider::None => Err(LlmError::Unavailable("No LLM provider configured".into())),
            LlmProvider::Ollama { base_url } => {
                let url = format!("{base_url}/api/chat");
                let body = json!({
                    "model": self.model,
                    "messages": Self::messages(request),
                    "stream": false,
                    "options": {
                        "temperature": request.temperature,
                        "num_predict": request.max_tokens,
                    }
                });
                self.post(&url, None, &body, request.timeout_ms, extract_ollama)
                    .await
            }
            LlmProvider::OpenAiCompatible { base_url, api_key } => {
                let url = format!("{base_url}/v1/chat/completions");
                let body = json!({
                    "model": self.model,
                    "messages": Self::messages(request),
                    "max_tokens": request.max_tokens,
                    "temperature": request.temperature,
                });
                self.post(
                    &url,
                    Some(api_key),
                    &body,
                    request.timeout_ms,
                    extract_openai,
                )
                .await
            }
        }
    }

    fn is_available(&self) -> bool {
        !matches!(self.provider, LlmProvider::None)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::types::ChatTurn;

    #[test]
    fn provider_from_parts() {
        assert!(matches!(
            LlmProvider::from_parts("ollama", "http://localhost:11434/", ""),
            Ok(LlmProvider::Ollama { base_url }) if base_url == "http://localhost:11434"
        ));
        assert!(matches!(
            LlmProvider::from_parts("none", "", ""),
            Ok(LlmProvider::None)
        ));
        assert!(LlmProvider::from_parts("openai", "https://api.example.com", "").is_err());
        assert!(LlmProvider::from_parts("llamafile", "", "").is_err());
    }

    #[tokio::test]
    async fn none_provider_always_fails() {
        let client = LlmClient::none();
        assert!(!client.is_available());
        let result = client
            .complete(&CompletionRequest::new("system", "hello"))
            .await;
        assert!(matches!(result, Err(LlmError::Unavailable(_))));
    }

    #[test]
    fn messages_put_system_first() {
        let mut request = CompletionRequest::new("be brief", "hi");
        request.turns.push(ChatTurn::assistant("yo"));
        let messages = LlmClient::messages(&request);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["role"], "user");
        assert_eq!(messages[2]["role"], "assistant");
    }

    #[test]
    fn extractors_read_provider_shapes() {
        let ollama = json!({"message": {"content": "sure"}, "eval_count": 3});
        assert_eq!(extract_ollama(&ollama), Some(("sure".to_string(), 3)));

        let openai = json!({"choices": [{"message": {"content": "ok"}}], "usage": {"completion_tokens": 1}});
        assert_eq!(extract_openai(&openai), Some(("ok".to_string(), 1)));

        assert_eq!(extract_openai(&json!({"error": "bad"})), None);
    }

    /// Accept connections on a local port, answer each with `status`, and
    /// count how many requests arrived.
    async fn counting_server(status: &'static str) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                read_request(&mut socket).await;
                let reply = format!("HTTP/1.1 {status}\r\ncontent-length: 4\r\nconnection: close\r\n\r\nnope");
                let _ = socket.write_all(reply.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        (format!("http://{addr}"), hits)
    }

    /// Read one request, headers and body, so closing the socket does not
    /// reset the connection under the client.
    async fn read_request(socket: &mut tokio::net::TcpStream) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let Ok(n) = socket.read(&mut chunk).await else { return };
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf);
            let Some(header_end) = text.find("\r\n\r\n") else { continue };
            let body_len = text[..header_end]
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    if !name.trim().eq_ignore_ascii_case("content-length") {
                        return None;
                    }
                    value.trim().parse::<usize>().ok()
                })
                .unwrap_or(0);
            if buf.len() >= header_end + 4 + body_len {
                return;
            }
        }
    }

    #[tokio::test]
    async fn failing_endpoint_is_called_once() {
        for status in ["500 Internal Server Error", "400 Bad Request"] {
            let (base_url, hits) = counting_server(status).await;
            let client = LlmClient::new(LlmProvider::Ollama { base_url }, "test-model");
            let result = client
                .complete(&CompletionRequest::new("s", "u").with_timeout(2000))
                .await;
            assert!(matches!(result, Err(LlmError::Http { body, .. }) if body == "nope"));
            assert_eq!(hits.load(Ordering::SeqCst), 1, "{status}");
        }
    }

    #[tokio::test]
    async fn unreachable_server_fails_without_retrying() {
        // Port 9 (discard) on localhost is closed in test environments.
        let client = LlmClient::new(
            LlmProvider::Ollama {
                base_url: "http://127.0.0.1:9".into(),
            },
            "test-model",
        );
        let result = client
            .complete(&CompletionRequest::new("s", "u").with_timeout(500))
            .await;
        assert!(matches!(
            result,
            Err(LlmError::Unavailable(_) | LlmError::RequestFailed(_) | LlmError::Timeout(_))
        ));
    }
}
