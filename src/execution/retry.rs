//! HTTP status classification and exponential backoff for Power BI calls.

use crate::error::Result;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Network failures (no status), timeouts, throttling and server errors are worth retrying.
pub fn is_transient_status(status: Option<u16>) -> bool {
    match status {
        None => true,
        Some(408) | Some(429) => true,
        Some(code) => (500..600).contains(&code),
    }
}

/// Troubleshooting text for a Power BI HTTP status.
pub fn hint_for_status(status: Option<u16>) -> Option<&'static str> {
    match status? {
        401 => Some(
            "Authentication failed. Check PBI_TENANT_ID, PBI_CLIENT_ID and PBI_CLIENT_SECRET, and that \
             service principals may use Power BI APIs in the tenant settings.",
        ),
        403 => Some(
            "Access denied. Add the service principal to the workspace (Member or Admin), grant Build \
             permission on the dataset and enable XMLA read on the capacity.",
        ),
        404 => Some("Not found. Check the workspace name in PBI_XMLA_ENDPOINT and the dataset name or id."),
        400 => Some("Bad request. The DAX query is likely invalid; validate it before executing."),
        429 => Some("Throttled by Power BI. Reduce request rate or retry later."),
        code if (500..600).contains(&code) => Some("Power BI service error. Usually transient; retry later."),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base_delay,
        }
    }

    /// Delay before retry `attempt` (0-based): `base * 2^attempt` plus up to 25% jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay.saturating_mul(2u32.saturating_pow(attempt));
        let jitter_cap = base.as_millis() as u64 / 4;
        let jitter = if jitter_cap == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_cap)
        };
        base + Duration::from_millis(jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(800))
    }
}

/// Run `op` until it succeeds, fails permanently, or attempts run out.
pub async fn retry_with_backoff<T, F, Fut>(policy: RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < policy.attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    "{} failed (attempt {}/{}): {}. Retrying in {:?}",
                    label,
                    attempt + 1,
                    policy.attempts,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
