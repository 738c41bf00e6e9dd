use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::CommonError;
use crate::supervisor::ServiceSupervisor;

#[derive(Clone, Debug)]
pub struct EmbeddingClientConfig {
    pub base_url: String,
    pub model: String,
    pub dimension: usize,
    pub default_timeout: Duration,
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_error_body_bytes: usize,
}

impl EmbeddingClientConfig {
    pub fn from_env() -> Self {
        let base_url =
            std::env::var("EMBEDDING_URL").unwrap_or_else(|_| "http://127.0.0.1:8765".to_string());

        let model =
            std::env::var("EMBEDDING_MODEL").unwrap_or_else(|_| "all-MiniLM-L6-v2".to_string());

        let dimension = std::env::var("EMBEDDING_DIMENSION")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(384);

        let default_timeout = std::env::var("EMBEDDING_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or_else(|| Duration::from_secs(60));

        let max_retries = std::env::var("EMBEDDING_MAX_RETRIES")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(3);

        let initial_backoff = std::env::var("EMBEDDING_RETRY_INITIAL_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or_else(|| Duration::from_millis(500));

        let max_backoff = std::env::var("EMBEDDING_RETRY_MAX_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or_else(|| Duration::from_millis(10_000));

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            dimension,
            default_timeout,
            max_retries,
            initial_backoff,
            max_backoff,
            max_error_body_bytes: 8 * 1024,
        }
    }
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    texts: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Errors of a single attempt, before retry classification.
#[derive(Debug, thiserror::Error)]
enum AttemptError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("service returned error: status={status} body={body}")]
    Upstream { status: StatusCode, body: String },

    #[error("invalid response: {0}")]
    Invalid(String),
}

impl AttemptError {
    fn is_connection(&self) -> bool {
        matches!(self, AttemptError::Request(e) if e.is_connect() || e.is_timeout())
    }
}

/// HTTP client for the embedding service (`POST /embed`, `GET /health`).
#[derive(Clone)]
pub struct EmbeddingClient {
    config: EmbeddingClientConfig,
    http: reqwest::Client,
    supervisor: Option<Arc<ServiceSupervisor>>,
}

impl EmbeddingClient {
    pub fn new(
        config: EmbeddingClientConfig,
        supervisor: Option<Arc<ServiceSupervisor>>,
    ) -> Result<Self, CommonError> {
        let http = reqwest::Client::builder()
            .user_agent("link-pipeline/embeddings")
            .build()?;
        Ok(Self {
            config,
            http,
            supervisor,
        })
    }

    pub fn config(&self) -> &EmbeddingClientConfig {
        &self.config
    }

    /// Embed a batch of texts, one vector per input in input order.
    ///
    /// Connection failures and timeouts that outlast the retry budget become
    /// `ServiceUnavailable`; other failures become `Embedding`.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CommonError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/embed", self.config.base_url);

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let err = match self.embed_once(&url, texts).await {
                Ok(vectors) => return Ok(vectors),
                Err(e) => e,
            };

            if attempt > self.config.max_retries || !should_retry(&err) {
                return Err(if err.is_connection() {
                    CommonError::ServiceUnavailable {
                        attempts: attempt,
                        message: err.to_string(),
                    }
                } else {
                    CommonError::Embedding(err.to_string())
                });
            }

            if err.is_connection() {
                if let Some(supervisor) = &self.supervisor {
                    if let Err(e) = supervisor.ensure_running().await {
                        warn!(error = %e, "embedding service did not come up");
                    }
                }
            }

            let delay = backoff_delay(self.config.initial_backoff, self.config.max_backoff, attempt - 1);
            warn!(
                attempt,
                delay_ms = delay.as_millis(),
                error = %err,
                "embedding request failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn embed_once(&self, url: &str, texts: &[String]) -> Result<Vec<Vec<f32>>, AttemptError> {
        let resp = self
            .http
            .post(url)
            .timeout(self.config.default_timeout)
            .json(&EmbedRequest { texts })
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = read_limited_text(resp, self.config.max_error_body_bytes).await;
            return Err(AttemptError::Upstream { status, body });
        }

        let parsed: EmbedResponse = resp.json().await?;
        if parsed.embeddings.len() != texts.len() {
            return Err(AttemptError::Invalid(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                parsed.embeddings.len()
            )));
        }
        if let Some(bad) = parsed
            .embeddings
            .iter()
            .find(|v| v.len() != self.config.dimension)
        {
            return Err(AttemptError::Invalid(format!(
                "expected dimension {}, got {}",
                self.config.dimension,
                bad.len()
            )));
        }
        debug!(count = texts.len(), "embedded batch");
        Ok(parsed.embeddings)
    }
}

fn should_retry(err: &AttemptError) -> bool {
    match err {
        AttemptError::Request(e) => e.is_timeout() || e.is_connect() || e.is_request() || e.is_body(),
        AttemptError::Upstream { status, .. } => {
            *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
        }
        AttemptError::Invalid(_) => false,
    }
}

fn backoff_delay(initial: Duration, max: Duration, exponent: u32) -> Duration {
    let mult = 1u128.checked_shl(exponent).unwrap_or(u128::MAX);
    let base_ms = initial.as_millis().saturating_mul(mult);
    let capped_ms = std::cmp::min(base_ms, max.as_millis()) as u64;
    let jitter_cap = std::cmp::max(1, capped_ms / 4);
    Duration::from_millis(capped_ms.saturating_add(pseudo_jitter_ms(jitter_cap)))
}

fn pseudo_jitter_ms(max_inclusive: u64) -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .subsec_nanos() as u64;
    nanos % (max_inclusive + 1)
}

async fn read_limited_text(resp: reqwest::Response, max_bytes: usize) -> String {
    match resp.bytes().await {
        Ok(mut b) => {
            if b.len() > max_bytes {
                b.truncate(max_bytes);
            }
            String::from_utf8_lossy(&b).to_string()
        }
        Err(e) => {
            warn!(error = %e, "failed to read embedding service error body");
            "<failed to read error body>".to_string()
        }
    }
}
