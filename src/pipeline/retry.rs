//! Bounded retry for structured model calls.
//!
//! A structured call can fail in ways that another attempt may fix: the
//! model emitted something that is not the JSON we asked for, or the service
//! hiccuped (timeout, 429, 5xx). Both share one attempt budget. A malformed
//! reply is retried immediately with a slightly higher sampling temperature,
//! nudging the model off the path that produced the bad output; a transient
//! error is retried after an exponential backoff at the same temperature.
//!
//! Everything else (a content-policy refusal, a rejected API key, a missing
//! local program) is returned on the first occurrence.

use crate::error::RecognizeError;
use std::future::Future;
use tokio::time::{sleep, Duration};
use tracing::warn;

/// Attempts per structured call, the first one included.
pub const MAX_STRUCTURED_ATTEMPTS: u32 = 3;

/// Highest temperature the policy will ever request.
pub const MAX_TEMPERATURE: f32 = 2.0;

/// How attempts are spaced and parameterised.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_temperature: f32,
    pub temperature_step: f32,
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_STRUCTURED_ATTEMPTS,
            base_temperature: 0.0,
            temperature_step: 0.1,
            backoff_ms: 500,
        }
    }
}

/// Parameters of one attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttemptParams {
    /// 1-indexed attempt number.
    pub attempt: u32,
    pub temperature: f32,
}

/// A successful value and the attempt that produced it.
#[derive(Debug, Clone)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

impl RetryPolicy {
    /// Parameters of the first attempt.
    pub fn first(&self) -> AttemptParams {
        AttemptParams {
            attempt: 1,
            temperature: self.base_temperature,
        }
    }

    /// Parameters of the attempt following `prev`, which failed with `err`.
    pub fn next(&self, prev: AttemptParams, err: &RecognizeError) -> AttemptParams {
        let temperature = match err {
            RecognizeError::Malformed { .. } => {
                (prev.temperature + self.temperature_step).min(MAX_TEMPERATURE)
            }
            _ => prev.temperature,
        };
        AttemptParams {
            attempt: prev.attempt + 1,
            temperature,
        }
    }

    /// Delay before the attempt following `prev`.
    pub fn delay_after(&self, prev: AttemptParams, err: &RecognizeError) -> Duration {
        match err {
            RecognizeError::Transient { .. } => {
                Duration::from_millis(self.backoff_ms.saturating_mul(1 << (prev.attempt - 1).min(16)))
            }
            _ => Duration::ZERO,
        }
    }
}

/// Run `call` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are used up.
///
/// When the budget is exhausted the result is [`RecognizeError::Exhausted`]
/// carrying the last error; it is raised on the final allowed failure and
/// never earlier.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut call: F,
) -> Result<Attempted<T>, RecognizeError>
where
    F: FnMut(AttemptParams) -> Fut,
    Fut: Future<Output = Result<T, RecognizeError>>,
{
    let mut params = policy.first();
    loop {
        match call(params).await {
            Ok(value) => {
                return Ok(Attempted {
                    value,
                    attempts: params.attempt,
                })
            }
            Err(err) if err.is_retryable() && params.attempt < policy.max_attempts => {
                warn!(
                    "{}: attempt {}/{} failed — {}",
                    label, params.attempt, policy.max_attempts, err
                );
                let delay = policy.delay_after(params, &err);
                if !delay.is_zero() {
                    sleep(delay).await;
                }
                params = policy.next(params, &err);
            }
            Err(err) if err.is_retryable() => {
                warn!(
                    "{}: attempt {}/{} failed, giving up — {}",
                    label, params.attempt, policy.max_attempts, err
                );
                return Err(RecognizeError::Exhausted {
                    attempts: params.attempt,
                    last: Box::new(err),
                });
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn quick() -> RetryPolicy {
        RetryPolicy {
            backoff_ms: 0,
            ..RetryPolicy::default()
        }
    }

    fn malformed() -> RecognizeError {
        RecognizeError::Malformed {
            detail: "EOF while parsing".into(),
        }
    }

    #[tokio::test]
    async fn three_malformed_replies_fail_on_the_third() {
        let calls = AtomicU32::new(0);
        let result: Result<Attempted<()>, _> = with_retry(&quick(), "page 1", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(malformed()) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(RecognizeError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, RecognizeError::Malformed { .. }));
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn success_on_third_attempt_is_returned() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&quick(), "page 1", |p| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if p.attempt < 3 {
                    Err(malformed())
                } else {
                    Ok("ok")
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result.value, "ok");
        assert_eq!(result.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn temperature_rises_only_after_malformed_replies() {
        let seen = Mutex::new(Vec::new());
        let policy = quick();
        let _ = with_retry(&policy, "block 2", |p| {
            seen.lock().unwrap().push(p.temperature);
            async move {
                match p.attempt {
                    1 => Err::<(), _>(RecognizeError::Transient {
                        detail: "429".into(),
                    }),
                    _ => Err(malformed()),
                }
            }
        })
        .await;

        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], 0.0);
        assert_eq!(seen[1], 0.0, "transient errors keep the temperature");
        assert!((seen[2] - 0.1).abs() < 1e-6);
    }

    #[tokio::test]
    async fn refusal_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<Attempted<()>, _> = with_retry(&quick(), "page 9", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(RecognizeError::refused("content_filter"))
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(RecognizeError::Refused { .. })));
    }

    #[test]
    fn backoff_doubles_for_transient_errors() {
        let policy = RetryPolicy::default();
        let transient = RecognizeError::Transient {
            detail: "503".into(),
        };
        let first = policy.first();
        assert_eq!(policy.delay_after(first, &transient), Duration::from_millis(500));
        let second = policy.next(first, &transient);
        assert_eq!(policy.delay_after(second, &transient), Duration::from_millis(1000));
        assert_eq!(policy.delay_after(first, &malformed()), Duration::ZERO);
    }

    #[test]
    fn temperature_is_capped() {
        let policy = RetryPolicy {
            base_temperature: 1.95,
            ..RetryPolicy::default()
        };
        let next = policy.next(policy.first(), &malformed());
        assert_eq!(next.temperature, MAX_TEMPERATURE);
    }
}
