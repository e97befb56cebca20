//! Client for the external model-aggregator marketplace.
//!
//! Marketplace-gated models are not served by the worker CLI; the driver
//! routes them here instead. The wire contract is the common
//! chat-completions shape: a bearer-authenticated POST with two
//! informational headers identifying this software, and a JSON response
//! carrying `choices[0].message.content` plus a `usage` block. Every
//! request runs under a 60-second deadline.
//!
//! Retries are narrow and local: only transport failures, 429s, and
//! aggregator-side 5xx responses are retried, on a short doubling
//! schedule with jitter that fits inside a single request deadline.
//! Auth rejections and malformed responses surface immediately — the
//! credential-chain recovery belongs to the driver, not this client.

use crate::types::TokenUsage;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Default chat-completions endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Request deadline mandated by the boundary contract.
pub const REQUEST_DEADLINE: Duration = Duration::from_secs(60);

const REFERER: &str = "https://github.com/slb350/agent-relay";
const TITLE: &str = "agent-relay";

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Completed marketplace call.
#[derive(Debug, Clone)]
pub struct MarketplaceReply {
    pub text: String,
    pub usage: TokenUsage,
}

/// Retry schedule for aggregator calls.
///
/// Three tries on a doubling base with up to 25 % jitter; the worst-case
/// sleep total stays well under one [`REQUEST_DEADLINE`], so a retried
/// call cannot outlive the budget the caller planned for.
#[derive(Debug, Clone)]
pub struct MarketplaceBackoff {
    /// Total tries, including the first.
    pub tries: u32,
    /// Delay before the first retry; doubles for each one after.
    pub base_delay: Duration,
    /// Ceiling on any single delay, jitter included.
    pub max_delay: Duration,
}

impl Default for MarketplaceBackoff {
    fn default() -> Self {
        Self {
            tries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl MarketplaceBackoff {
    /// Delay before retry number `retry` (zero-based).
    fn delay_before(&self, retry: u32) -> Duration {
        let doubled = self.base_delay.saturating_mul(1u32 << retry.min(8));
        let capped = doubled.min(self.max_delay);
        let jittered = capped.mul_f64(1.0 + rand::random::<f64>() * 0.25);
        jittered.min(self.max_delay)
    }
}

/// One failed try, tagged with whether another try could help.
struct TryError {
    error: Error,
    retryable: bool,
}

/// Map an aggregator HTTP status to a typed failure. Quota pushback and
/// server-side faults are worth retrying; auth rejections are not.
fn failure_for_status(status: u16, model: &str, body: String) -> TryError {
    match status {
        401 | 403 => TryError {
            error: Error::authentication(vec![format!("marketplace-key: HTTP {}", status)]),
            retryable: false,
        },
        429 => TryError {
            error: Error::rate_limit(model, format!("HTTP 429: {}", body)),
            retryable: true,
        },
        500..=599 => TryError {
            error: Error::process(format!("marketplace error {}: {}", status, body)),
            retryable: true,
        },
        other => TryError {
            error: Error::process(format!("marketplace error {}: {}", other, body)),
            retryable: false,
        },
    }
}

/// HTTP client for the aggregator.
#[derive(Debug, Clone)]
pub struct MarketplaceClient {
    endpoint: String,
    http: reqwest::Client,
    backoff: MarketplaceBackoff,
    temperature: f64,
    max_tokens: u32,
}

impl MarketplaceClient {
    pub fn new() -> Result<Self> {
        Self::with_endpoint(DEFAULT_ENDPOINT)
    }

    pub fn with_endpoint(endpoint: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_DEADLINE)
            .build()
            .map_err(Error::Http)?;
        Ok(Self {
            endpoint: endpoint.into(),
            http,
            backoff: MarketplaceBackoff::default(),
            temperature: 0.2,
            max_tokens: 8192,
        })
    }

    /// Override the retry schedule.
    pub fn with_backoff(mut self, backoff: MarketplaceBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Run one completion, absorbing transient aggregator failures.
    pub async fn complete(
        &self,
        api_key: &str,
        model: &str,
        system: Option<&str>,
        prompt: &str,
    ) -> Result<MarketplaceReply> {
        let mut last_error = None;
        for try_number in 0..self.backoff.tries {
            if try_number > 0 {
                let delay = self.backoff.delay_before(try_number - 1);
                debug!(model, try_number, delay_ms = delay.as_millis() as u64, "retrying marketplace call");
                sleep(delay).await;
            }
            match self.complete_once(api_key, model, system, prompt).await {
                Ok(reply) => return Ok(reply),
                Err(failed) => {
                    if !failed.retryable {
                        return Err(failed.error);
                    }
                    warn!(model, error = %failed.error, "transient marketplace failure");
                    last_error = Some(failed.error);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| Error::process("marketplace retry budget spent with no attempt")))
    }

    async fn complete_once(
        &self,
        api_key: &str,
        model: &str,
        system: Option<&str>,
        prompt: &str,
    ) -> std::result::Result<MarketplaceReply, TryError> {
        let mut messages = Vec::new();
        if let Some(system) = system {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: prompt,
        });

        let request = ChatRequest {
            model,
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stream: false,
        };

        debug!(model, endpoint = %self.endpoint, "marketplace completion");
        let response = self
            .http
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", api_key))
            .header("HTTP-Referer", REFERER)
            .header("X-Title", TITLE)
            .json(&request)
            .send()
            .await
            .map_err(|e| TryError {
                // Connection drops and deadline hits on the wire are the
                // textbook transient case.
                error: Error::Http(e),
                retryable: true,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(failure_for_status(status.as_u16(), model, body));
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| TryError {
            error: Error::Http(e),
            retryable: false,
        })?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| TryError {
                error: Error::process("marketplace response carried no choices"),
                retryable: false,
            })?;
        let usage = parsed
            .usage
            .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens))
            .unwrap_or_default();

        Ok(MarketplaceReply { text, usage })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization_shape() {
        let request = ChatRequest {
            model: "qwen/qwen3-coder:free",
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: "be brief",
                },
                ChatMessage {
                    role: "user",
                    content: "hello",
                },
            ],
            temperature: 0.2,
            max_tokens: 8192,
            stream: false,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["model"], "qwen/qwen3-coder:free");
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "hello");
        assert_eq!(json["stream"], false);
    }

    #[test]
    fn test_response_parsing() {
        let raw = r#"{
            "choices": [{"message": {"role": "assistant", "content": "hi"}}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3}
        }"#;
        let parsed: ChatResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.choices[0].message.content, "hi");
        let usage = parsed.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 12);
        assert_eq!(usage.completion_tokens, 3);
    }

    #[test]
    fn test_response_without_usage_defaults() {
        let raw = r#"{"choices": [{"message": {"content": "hi"}}]}"#;
        let parsed: ChatResponse = serde_json::from_str(raw).unwrap();
        assert!(parsed.usage.is_none());
    }

    #[test]
    fn test_client_construction() {
        let client = MarketplaceClient::new().unwrap();
        assert_eq!(client.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(client.backoff.tries, 3);
    }

    #[test]
    fn test_status_classification() {
        let auth = failure_for_status(401, "m", "no".to_string());
        assert!(!auth.retryable);
        assert!(matches!(auth.error, Error::Authentication { .. }));

        let quota = failure_for_status(429, "m", "slow down".to_string());
        assert!(quota.retryable);
        assert!(matches!(quota.error, Error::RateLimit { .. }));

        let fault = failure_for_status(503, "m", "flaky".to_string());
        assert!(fault.retryable);
        assert!(matches!(fault.error, Error::Process(_)));

        let client_error = failure_for_status(404, "m", "gone".to_string());
        assert!(!client_error.retryable);
    }

    #[test]
    fn test_backoff_schedule_doubles_and_caps() {
        let backoff = MarketplaceBackoff {
            tries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(4),
        };
        // Jitter only ever lengthens a delay, and the cap always wins.
        let first = backoff.delay_before(0);
        assert!(first >= Duration::from_millis(500));
        assert!(first <= Duration::from_secs(4));

        let late = backoff.delay_before(4);
        assert_eq!(late, Duration::from_secs(4));
    }

    #[test]
    fn test_backoff_total_fits_one_deadline() {
        let backoff = MarketplaceBackoff::default();
        let total: Duration = (0..backoff.tries.saturating_sub(1))
            .map(|retry| backoff.delay_before(retry))
            .sum();
        assert!(total < REQUEST_DEADLINE);
    }
}
