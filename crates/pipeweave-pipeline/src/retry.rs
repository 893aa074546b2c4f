//! Retry presets and the retry-around-a-handler loop.
//!
//! A [`RetryPolicy`] is a named backoff shape (`none`, `standard`,
//! `aggressive`, `linear`, `patient`) plus jitter. [`execute_with_retry`] wraps
//! a single node execution, retrying on a [`StageStatus::Retry`] outcome or a
//! retryable error, and falling back to partial success (when the node
//! allows it) or failure once attempts are exhausted.

use std::time::Duration;

use pipeweave_types::{classify_retryable_message, Outcome, PipeweaveError, Result, StageStatus};

/// Named backoff shape for a node's retry attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub initial_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl RetryPolicy {
    pub const fn none() -> Self {
        Self { initial_delay_ms: 0, backoff_factor: 1.0, max_delay_ms: 0, jitter: false }
    }

    pub const fn standard() -> Self {
        Self { initial_delay_ms: 200, backoff_factor: 2.0, max_delay_ms: 60_000, jitter: true }
    }

    pub const fn aggressive() -> Self {
        Self { initial_delay_ms: 500, backoff_factor: 2.0, max_delay_ms: 60_000, jitter: true }
    }

    pub const fn linear() -> Self {
        Self { initial_delay_ms: 500, backoff_factor: 1.0, max_delay_ms: 60_000, jitter: true }
    }

    pub const fn patient() -> Self {
        Self { initial_delay_ms: 2000, backoff_factor: 3.0, max_delay_ms: 60_000, jitter: true }
    }

    /// Resolve a policy by name, falling back to `standard` for anything
    /// unrecognized rather than failing the run over a typo'd attribute.
    pub fn by_name(name: &str) -> Self {
        match name {
            "none" => Self::none(),
            "aggressive" => Self::aggressive(),
            "linear" => Self::linear(),
            "patient" => Self::patient(),
            _ => Self::standard(),
        }
    }

    /// Delay before attempt number `n` (1-indexed: the delay taken after the
    /// n-th failed attempt, before attempt n+1), before jitter.
    fn base_delay_ms(&self, n: u32) -> u64 {
        if self.initial_delay_ms == 0 {
            return 0;
        }
        let scaled = self.initial_delay_ms as f64 * self.backoff_factor.powi(n as i32 - 1);
        scaled.min(self.max_delay_ms as f64) as u64
    }

    /// Compute the delay before the given attempt, applying jitter in
    /// `[0.5, 1.5)` when enabled. `jitter_roll` is a caller-supplied variate
    /// in `[0.0, 1.0)` so the formula stays deterministic and testable.
    pub fn delay_for_attempt(&self, n: u32, jitter_roll: f64) -> Duration {
        let base = self.base_delay_ms(n);
        if base == 0 {
            return Duration::ZERO;
        }
        let millis = if self.jitter {
            let factor = 0.5 + jitter_roll.clamp(0.0, 1.0);
            (base as f64 * factor) as u64
        } else {
            base
        };
        Duration::from_millis(millis)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

/// Retry-loop parameters for one node.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub policy: RetryPolicy,
    pub allow_partial: bool,
}

/// Hook invoked before each retry sleep, so the caller can emit a
/// `STAGE_RETRY` event without this module knowing about the event system.
pub trait RetryObserver: Sync {
    fn on_retry(&self, node_id: &str, attempt: usize, max_attempts: usize, reason: &str);
}

impl<F: Fn(&str, usize, usize, &str) + Sync> RetryObserver for F {
    fn on_retry(&self, node_id: &str, attempt: usize, max_attempts: usize, reason: &str) {
        self(node_id, attempt, max_attempts, reason)
    }
}

/// Execute `f` with retry semantics for one node.
///
/// `max_attempts = max_retries + 1`. A [`StageStatus::Retry`] outcome or a
/// [`PipeweaveError::is_retryable`] error triggers another attempt, sleeping
/// for `policy.delay_for_attempt` first. Once attempts are exhausted: a
/// node with `allow_partial` set falls back to [`StageStatus::PartialSuccess`]
/// with a `"partial accepted"` note; otherwise the node fails with
/// `failureReason = "max retries exceeded"`.
pub async fn execute_with_retry<F, Fut>(
    f: F,
    config: &RetryConfig,
    node_id: &str,
    observer: Option<&dyn RetryObserver>,
) -> Result<Outcome>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<Outcome>>,
{
    let max_attempts = config.max_retries + 1;
    let mut last_reason = String::new();

    for attempt in 1..=max_attempts {
        let outcome = match f().await {
            Ok(outcome) => outcome,
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                last_reason = e.to_string();
                sleep_before_retry(config, attempt, node_id, &last_reason, observer).await;
                continue;
            }
            Err(e) => return Err(e),
        };

        if outcome.status != StageStatus::Retry {
            return Ok(outcome);
        }
        last_reason = if outcome.notes.is_empty() { "retry requested".to_string() } else { outcome.notes.clone() };
        if attempt == max_attempts {
            break;
        }
        sleep_before_retry(config, attempt, node_id, &last_reason, observer).await;
    }

    if config.allow_partial {
        let mut outcome = Outcome::with_label(StageStatus::PartialSuccess, "partial accepted");
        outcome.notes = "partial accepted".to_string();
        return Ok(outcome);
    }

    let mut outcome = Outcome::fail("max retries exceeded");
    outcome.notes = last_reason;
    Ok(outcome)
}

async fn sleep_before_retry(
    config: &RetryConfig,
    attempt: usize,
    node_id: &str,
    reason: &str,
    observer: Option<&dyn RetryObserver>,
) {
    let max_attempts = config.max_retries + 1;
    if let Some(observer) = observer {
        observer.on_retry(node_id, attempt, max_attempts, reason);
    }
    let roll = jitter_roll();
    let delay = config.policy.delay_for_attempt(attempt as u32, roll);
    if !delay.is_zero() {
        tracing::info!(node = %node_id, attempt, delay_ms = %delay.as_millis(), "retrying node");
        tokio::time::sleep(delay).await;
    }
}

/// A `[0.0, 1.0)` variate for jitter. Not a `rand::Rng` parameter because the
/// retry loop's generic closure signature already carries enough type
/// parameters; callers needing determinism should exercise
/// `RetryPolicy::delay_for_attempt` directly instead of the full loop.
fn jitter_roll() -> f64 {
    use rand::Rng;
    rand::thread_rng().gen_range(0.0..1.0)
}

/// True if `error` should trigger another attempt, per the same
/// rate-limit/5xx/network classification the error taxonomy uses elsewhere.
pub fn should_retry(error: &PipeweaveError) -> bool {
    error.is_retryable() || classify_retryable_message(&error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn preset_parameters_match_table() {
        assert_eq!(RetryPolicy::none(), RetryPolicy { initial_delay_ms: 0, backoff_factor: 1.0, max_delay_ms: 0, jitter: false });
        assert_eq!(RetryPolicy::standard(), RetryPolicy { initial_delay_ms: 200, backoff_factor: 2.0, max_delay_ms: 60_000, jitter: true });
        assert_eq!(RetryPolicy::aggressive(), RetryPolicy { initial_delay_ms: 500, backoff_factor: 2.0, max_delay_ms: 60_000, jitter: true });
        assert_eq!(RetryPolicy::linear(), RetryPolicy { initial_delay_ms: 500, backoff_factor: 1.0, max_delay_ms: 60_000, jitter: true });
        assert_eq!(RetryPolicy::patient(), RetryPolicy { initial_delay_ms: 2000, backoff_factor: 3.0, max_delay_ms: 60_000, jitter: true });
    }

    #[test]
    fn by_name_falls_back_to_standard() {
        assert_eq!(RetryPolicy::by_name("typo"), RetryPolicy::standard());
        assert_eq!(RetryPolicy::by_name("aggressive"), RetryPolicy::aggressive());
    }

    #[test]
    fn delay_formula_without_jitter() {
        let policy = RetryPolicy { initial_delay_ms: 100, backoff_factor: 2.0, max_delay_ms: 500, jitter: false };
        assert_eq!(policy.delay_for_attempt(1, 0.0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2, 0.0), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3, 0.0), Duration::from_millis(400));
        // attempt 4 would be 800, capped at 500
        assert_eq!(policy.delay_for_attempt(4, 0.0), Duration::from_millis(500));
    }

    #[test]
    fn jitter_scales_within_half_to_one_point_five() {
        let policy = RetryPolicy { initial_delay_ms: 100, backoff_factor: 1.0, max_delay_ms: 1000, jitter: true };
        assert_eq!(policy.delay_for_attempt(1, 0.0), Duration::from_millis(50));
        assert_eq!(policy.delay_for_attempt(1, 0.999), Duration::from_millis(149));
    }

    #[test]
    fn none_preset_has_zero_delay() {
        assert_eq!(RetryPolicy::none().delay_for_attempt(1, 0.9), Duration::ZERO);
    }

    #[tokio::test]
    async fn success_on_first_try() {
        let config = RetryConfig { max_retries: 3, policy: RetryPolicy::none(), allow_partial: false };
        let outcome = execute_with_retry(|| async { Ok(Outcome::success("done")) }, &config, "node_a", None)
            .await
            .unwrap();
        assert_eq!(outcome.status, StageStatus::Success);
    }

    #[tokio::test]
    async fn retry_status_outcome_succeeds_on_second_attempt() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let config = RetryConfig { max_retries: 3, policy: RetryPolicy::none(), allow_partial: false };
        let outcome = execute_with_retry(
            move || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) == 0 {
                        Ok(Outcome::retry("not ready"))
                    } else {
                        Ok(Outcome::success("ready now"))
                    }
                }
            },
            &config,
            "node_b",
            None,
        )
        .await
        .unwrap();
        assert_eq!(outcome.status, StageStatus::Success);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhausted_retries_without_partial_fails() {
        let config = RetryConfig { max_retries: 2, policy: RetryPolicy::none(), allow_partial: false };
        let outcome = execute_with_retry(|| async { Ok(Outcome::retry("still bad")) }, &config, "node_c", None)
            .await
            .unwrap();
        assert_eq!(outcome.status, StageStatus::Fail);
        assert_eq!(outcome.failure_reason.as_deref(), Some("max retries exceeded"));
    }

    #[tokio::test]
    async fn exhausted_retries_with_allow_partial_falls_back() {
        let config = RetryConfig { max_retries: 1, policy: RetryPolicy::none(), allow_partial: true };
        let outcome = execute_with_retry(|| async { Ok(Outcome::retry("nope")) }, &config, "node_d", None)
            .await
            .unwrap();
        assert_eq!(outcome.status, StageStatus::PartialSuccess);
        assert_eq!(outcome.notes, "partial accepted");
    }

    #[tokio::test]
    async fn retryable_error_retries_then_succeeds() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let config = RetryConfig { max_retries: 2, policy: RetryPolicy::none(), allow_partial: false };
        let outcome = execute_with_retry(
            move || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(PipeweaveError::CommandTimeout { timeout_ms: 100 })
                    } else {
                        Ok(Outcome::success("recovered"))
                    }
                }
            },
            &config,
            "node_e",
            None,
        )
        .await
        .unwrap();
        assert_eq!(outcome.status, StageStatus::Success);
    }

    #[tokio::test]
    async fn non_retryable_error_returns_immediately() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let config = RetryConfig { max_retries: 3, policy: RetryPolicy::none(), allow_partial: false };
        let result = execute_with_retry(
            move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(PipeweaveError::ValidationError("bad config".into()))
                }
            },
            &config,
            "node_f",
            None,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn observer_is_called_once_per_retry() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let observer = move |node_id: &str, attempt: usize, max_attempts: usize, reason: &str| {
            seen2.lock().unwrap().push((node_id.to_string(), attempt, max_attempts, reason.to_string()));
        };
        let config = RetryConfig { max_retries: 2, policy: RetryPolicy::none(), allow_partial: false };
        execute_with_retry(|| async { Ok(Outcome::retry("slow")) }, &config, "node_g", Some(&observer))
            .await
            .unwrap();
        let calls = seen.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], ("node_g".to_string(), 1, 3, "slow".to_string()));
        assert_eq!(calls[1], ("node_g".to_string(), 2, 3, "slow".to_string()));
    }

    #[test]
    fn should_retry_classifies_like_error_taxonomy() {
        assert!(should_retry(&PipeweaveError::CommandTimeout { timeout_ms: 1 }));
        assert!(!should_retry(&PipeweaveError::ValidationError("nope".into())));
    }
}
