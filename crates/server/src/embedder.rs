//! Remote embedding client for Ollama-compatible model servers.
//!
//! The client is blocking: the pipeline calls it from worker threads and the
//! HTTP layer from the blocking pool. Build it outside of any async context.

use chunkdb_core::config::{RetryBackoff, DEFAULT_EMBED_TIMEOUT_SECS};
use chunkdb_core::embed::{Embedder, HashingEmbedder, RetryingEmbedder};
use chunkdb_core::{Error, Result};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const SERVICE: &str = "ollama";

/// Blocking client for `POST {base}/api/embeddings`.
pub struct OllamaEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    dimension: usize,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

impl OllamaEmbedder {
    pub fn new(base_url: &str, model: &str, dimension: usize, timeout: Duration) -> Result<Self> {
        if model.trim().is_empty() {
            return Err(Error::InvalidConfig("missing embedding model name".into()));
        }
        if base_url.trim().is_empty() {
            return Err(Error::InvalidConfig("missing embedding service URL".into()));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::InvalidConfig(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: format!("{}/api/embeddings", base_url.trim_end_matches('/')),
            model: model.to_string(),
            dimension,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn unavailable(reason: String) -> Error {
        Error::ExternalServiceFailure {
            service: SERVICE.to_string(),
            attempts: 1,
            reason,
        }
    }
}

fn should_retry(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

impl Embedder for OllamaEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let request = EmbeddingRequest {
            model: &self.model,
            prompt: text,
        };
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .map_err(|e| Self::unavailable(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp
                .text()
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            let reason = format!("{status}: {body}");
            if should_retry(status) {
                return Err(Self::unavailable(reason));
            }
            // 4xx other than 429 means the model or request is wrong; retrying won't help
            return Err(Error::InvalidConfig(format!(
                "embedding request to {} rejected with {reason}",
                self.endpoint
            )));
        }
        let parsed: EmbeddingResponse = resp
            .json()
            .map_err(|e| Self::unavailable(format!("unreadable embedding response: {e}")))?;
        if parsed.embedding.is_empty() {
            return Err(Self::unavailable("empty embedding returned".into()));
        }
        Ok(parsed.embedding)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        SERVICE
    }
}

/// Which embedder backs the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum EmbedderKind {
    /// In-process feature hashing; no external service.
    Hashing,
    /// Ollama-compatible HTTP service.
    Ollama,
}

/// Connection settings for the remote embedder.
#[derive(Debug, Clone)]
pub struct RemoteEmbedderConfig {
    pub url: String,
    pub model: String,
    pub timeout: Duration,
}

impl Default for RemoteEmbedderConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:11434".to_string(),
            model: "nomic-embed-text".to_string(),
            timeout: Duration::from_secs(DEFAULT_EMBED_TIMEOUT_SECS),
        }
    }
}

/// Build the configured embedder. Remote embedders are wrapped with retries.
pub fn build_embedder(
    kind: EmbedderKind,
    dimension: usize,
    remote: &RemoteEmbedderConfig,
    backoff: RetryBackoff,
) -> Result<Arc<dyn Embedder>> {
    match kind {
        EmbedderKind::Hashing => Ok(Arc::new(HashingEmbedder::new(dimension)?)),
        EmbedderKind::Ollama => {
            let client = OllamaEmbedder::new(&remote.url, &remote.model, dimension, remote.timeout)?;
            tracing::info!(endpoint = client.endpoint(), model = %remote.model, dimension, "using remote embedder");
            Ok(Arc::new(RetryingEmbedder::new(client, backoff)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    /// Serve one canned HTTP response per accepted connection.
    fn serve(responses: Vec<String>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            for body in responses {
                let (mut stream, _) = listener.accept().unwrap();
                read_request(&mut stream);
                stream.write_all(body.as_bytes()).unwrap();
            }
        });
        format!("http://{addr}")
    }

    /// Consume headers and the declared body so closing the socket is clean.
    fn read_request(stream: &mut std::net::TcpStream) {
        let mut data = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = stream.read(&mut buf).unwrap();
            if n == 0 {
                return;
            }
            data.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&data);
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .filter_map(|l| l.split_once(':'))
                    .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, v)| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if data.len() >= end + 4 + length {
                    return;
                }
            }
        }
    }

    fn http(status: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    #[test]
    fn test_embeds_from_response() {
        let base = serve(vec![http("200 OK", r#"{"embedding":[0.5,0.25,0.25]}"#)]);
        let e = OllamaEmbedder::new(&base, "m", 3, Duration::from_secs(5)).unwrap();
        assert_eq!(e.embed("hi").unwrap(), vec![0.5, 0.25, 0.25]);
    }

    #[test]
    fn test_server_errors_are_transient_and_client_errors_are_not() {
        let base = serve(vec![
            http("503 Service Unavailable", "{}"),
            http("404 Not Found", r#"{"error":"model not found"}"#),
        ]);
        let e = OllamaEmbedder::new(&base, "m", 3, Duration::from_secs(5)).unwrap();
        assert!(matches!(e.embed("a"), Err(Error::ExternalServiceFailure { .. })));
        assert!(matches!(e.embed("b"), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_unreachable_service_exhausts_retries() {
        // bind then drop so the port is very likely closed
        let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let remote = RemoteEmbedderConfig {
            url: format!("http://127.0.0.1:{port}"),
            model: "m".into(),
            timeout: Duration::from_millis(500),
        };
        let backoff = RetryBackoff {
            attempts: 2,
            base_delay_ms: 1,
        };
        let e = build_embedder(EmbedderKind::Ollama, 8, &remote, backoff).unwrap();
        match e.embed("x") {
            Err(Error::ExternalServiceFailure { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("expected service failure, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_model_is_rejected() {
        assert!(matches!(
            OllamaEmbedder::new("http://x", " ", 3, Duration::from_secs(1)),
            Err(Error::InvalidConfig(_))
        ));
    }
}
