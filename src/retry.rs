use anyhow::Result;
use regex::Regex;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

use crate::limiter::RateLimiter;

/// Bounded retry around one network call. Quota-exceeded failures back off
/// harder than generic ones and honor the provider's suggested delay when
/// the error payload carries one.
pub struct RetryPolicy {
    max_retries: u32,
    backoff: f64,
}

const QUOTA_DELAY_BUFFER_SECS: f64 = 2.0;
const QUOTA_DELAY_CAP_SECS: f64 = 120.0;
const QUOTA_BACKOFF_MULTIPLIER: f64 = 10.0;

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: f64) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    /// Runs `op` up to `max_retries + 1` times. Every attempt first waits
    /// for a rate slot. The last error propagates unmodified.
    pub async fn run<T, F, Fut>(&self, limiter: &RateLimiter, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            limiter.acquire().await;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt >= self.max_retries => return Err(err),
                Err(err) => {
                    let error_text = err.to_string();
                    let delay = self.delay_for(attempt, &error_text);
                    if is_quota_error(&error_text) {
                        println!(
                            "Quota exceeded; waiting {:.1}s before retry ({}/{})",
                            delay.as_secs_f64(),
                            attempt + 1,
                            self.max_retries + 1
                        );
                    }
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    fn delay_for(&self, attempt: u32, error_text: &str) -> Duration {
        let secs = if is_quota_error(error_text) {
            match extract_retry_delay(error_text) {
                Some(suggested) => (suggested + QUOTA_DELAY_BUFFER_SECS).min(QUOTA_DELAY_CAP_SECS),
                None => self.backoff.powi(attempt as i32) * QUOTA_BACKOFF_MULTIPLIER,
            }
        } else {
            self.backoff.powi(attempt as i32)
        };
        Duration::from_secs_f64(secs)
    }
}

/// Rate-limit / resource-exhaustion markers, matched case-insensitively.
pub fn is_quota_error(error_text: &str) -> bool {
    let lower = error_text.to_lowercase();
    lower.contains("429") || lower.contains("resource_exhausted") || lower.contains("quota")
}

/// Pulls a provider-suggested retry delay in seconds out of an error
/// message, e.g. "Please retry in 38.36s" or a `"retryDelay": "44s"` field.
pub fn extract_retry_delay(error_text: &str) -> Option<f64> {
    let patterns = [
        r"(?i)retry in ([0-9]+(?:\.[0-9]+)?)\s*s",
        r#"(?i)retrydelay["']?\s*:\s*["']?([0-9]+(?:\.[0-9]+)?)"#,
    ];
    for pattern in patterns {
        let re = Regex::new(pattern).ok()?;
        if let Some(delay) = re
            .captures(error_text)
            .and_then(|caps| caps.get(1))
            .and_then(|group| group.as_str().parse::<f64>().ok())
        {
            return Some(delay);
        }
    }
    None
}
