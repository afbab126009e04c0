//! The LLM backend trait and test doubles.
//!
//! A backend turns a message list plus options into a [`Generation`], either
//! in one shot ([`Llm::complete`]) or streaming text deltas to a sink while
//! accumulating the same generation ([`Llm::complete_stream`]).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{LlmError, Result, is_retryable};
use crate::options::LlmOptions;
use crate::types::{Generation, Message};

// ─────────────────────────────────────────────────────────────────────────────
// Shared Retry Logic
// ─────────────────────────────────────────────────────────────────────────────

/// Execute an async operation with exponential backoff retry.
///
/// Retries only transient errors; everything else is returned immediately.
pub async fn with_retry<F, Fut, T>(
    max_retries: u32,
    initial_backoff: Duration,
    backend_name: &str,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut last_error = None;
    let mut backoff = initial_backoff;

    for attempt in 0..=max_retries {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !is_retryable(&e) {
                    return Err(e);
                }

                last_error = Some(e);

                if attempt < max_retries {
                    tracing::warn!(
                        backend = backend_name,
                        attempt = attempt + 1,
                        max_retries = max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        "request failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
    }

    Err(last_error.unwrap())
}

// ─────────────────────────────────────────────────────────────────────────────
// Backend Trait
// ─────────────────────────────────────────────────────────────────────────────

/// Sink receiving raw text deltas during a streaming completion.
pub type DeltaSink = Arc<dyn Fn(&str) + Send + Sync>;

/// A large language model backend.
#[async_trait]
pub trait Llm: Send + Sync {
    /// Name of this backend.
    fn name(&self) -> &str;

    /// Generate a completion for the given messages.
    async fn complete(&self, messages: &[Message], options: &LlmOptions) -> Result<Generation>;

    /// Generate a completion, delivering text deltas to `sink` as they
    /// arrive. Returns the accumulated generation; if the options'
    /// cancellation token fires mid-stream, the partial generation is
    /// returned rather than an error.
    async fn complete_stream(
        &self,
        messages: &[Message],
        options: &LlmOptions,
        sink: DeltaSink,
    ) -> Result<Generation>;
}

/// A backend shared across tasks.
pub type SharedLlm = Arc<dyn Llm>;

// ─────────────────────────────────────────────────────────────────────────────
// Mock Backend
// ─────────────────────────────────────────────────────────────────────────────

/// Size of the deltas [`MockLlm`] streams, in characters.
const MOCK_CHUNK_CHARS: usize = 8;

/// Scripted backend for deterministic tests.
///
/// Responses are returned in order; requesting more than were scripted is an
/// error. Every request's message list is logged for assertions.
pub struct MockLlm {
    name: String,
    responses: std::sync::Mutex<Vec<Generation>>,
    requests: std::sync::Mutex<Vec<Vec<Message>>>,
}

impl MockLlm {
    /// Create a mock backend with the given scripted responses.
    pub fn new(responses: Vec<Generation>) -> Self {
        Self {
            name: "mock".to_string(),
            responses: std::sync::Mutex::new(responses),
            requests: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Create a mock backend with a single text response.
    pub fn with_text(text: impl Into<String>) -> Self {
        Self::new(vec![Generation::text(text)])
    }

    /// Message lists of every request made so far.
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().unwrap().clone()
    }

    /// Number of requests made so far.
    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn next_response(&self, messages: &[Message]) -> Result<Generation> {
        self.requests.lock().unwrap().push(messages.to_vec());

        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            return Err(LlmError::Backend(
                "MockLlm: no more responses available".to_string(),
            ));
        }
        Ok(responses.remove(0))
    }
}

#[async_trait]
impl Llm for MockLlm {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, messages: &[Message], _options: &LlmOptions) -> Result<Generation> {
        self.next_response(messages)
    }

    async fn complete_stream(
        &self,
        messages: &[Message],
        _options: &LlmOptions,
        sink: DeltaSink,
    ) -> Result<Generation> {
        let generation = self.next_response(messages)?;

        let mut rest = generation.content.as_str();
        while !rest.is_empty() {
            let split = rest
                .char_indices()
                .nth(MOCK_CHUNK_CHARS)
                .map(|(i, _)| i)
                .unwrap_or(rest.len());
            let (chunk, tail) = rest.split_at(split);
            sink(chunk);
            rest = tail;
        }

        Ok(generation)
    }
}
