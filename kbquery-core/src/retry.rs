//! Timeout and bounded-retry policy for collaborator calls.
//!
//! Every external call in the pipeline goes through [`call_with_policy`]: each
//! attempt is bounded by a per-service timeout, transient failures are retried
//! with exponential backoff, and permanent failures return immediately.

use std::future::Future;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::{ExternalError, ServiceKind};

/// Execute a collaborator call with a per-attempt timeout and bounded retries.
///
/// Retries on transient errors (`Timeout`, `RateLimited`, `Connection`,
/// `Unavailable`), respecting a rate limit's `retry_after_secs`. Permanent
/// errors (malformed input, auth, rejected queries) return immediately.
pub async fn call_with_policy<F, Fut, T>(
    service: ServiceKind,
    timeout: Duration,
    retry: &RetryConfig,
    operation: F,
) -> Result<T, ExternalError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ExternalError>>,
{
    let mut attempt: u32 = 0;
    loop {
        let result = match tokio::time::timeout(timeout, operation()).await {
            Ok(result) => result,
            Err(_) => Err(ExternalError::Timeout {
                service,
                timeout_ms: timeout.as_millis() as u64,
            }),
        };

        match result {
            Ok(val) => return Ok(val),
            Err(e) => {
                if !e.is_transient() || attempt >= retry.max_retries {
                    return Err(e);
                }

                let backoff_ms = compute_backoff(retry, attempt, &e);
                tracing::warn!(
                    service = %service,
                    attempt = attempt + 1,
                    max = retry.max_retries,
                    backoff_ms = backoff_ms,
                    error = %e,
                    "Retrying after transient error"
                );
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                attempt += 1;
            }
        }
    }
}

/// Compute backoff delay, respecting rate limit retry-after hints.
fn compute_backoff(config: &RetryConfig, attempt: u32, err: &ExternalError) -> u64 {
    let computed = compute_exponential_backoff(config, attempt);
    if let ExternalError::RateLimited {
        retry_after_secs, ..
    } = err
    {
        let server_ms = retry_after_secs.saturating_mul(1000);
        return server_ms.max(computed).min(config.max_backoff_ms);
    }
    computed
}

/// Pure exponential backoff with optional jitter.
fn compute_exponential_backoff(config: &RetryConfig, attempt: u32) -> u64 {
    let base = config.initial_backoff_ms as f64 * config.backoff_multiplier.powi(attempt as i32);
    let capped = base.min(config.max_backoff_ms as f64) as u64;
    if config.jitter {
        // Up to 25% jitter
        let jitter = (capped as f64 * 0.25 * rand_simple()) as u64;
        capped + jitter
    } else {
        capped
    }
}

/// Cheap pseudo-random fraction in [0, 1) for jitter.
fn rand_simple() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn test_compute_backoff_exponential() {
        let config = RetryConfig {
            max_retries: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 60000,
            backoff_multiplier: 2.0,
            jitter: false,
        };
        assert_eq!(compute_exponential_backoff(&config, 0), 1000);
        assert_eq!(compute_exponential_backoff(&config, 1), 2000);
        assert_eq!(compute_exponential_backoff(&config, 2), 4000);
    }

    #[test]
    fn test_compute_backoff_respects_cap() {
        let config = RetryConfig {
            max_retries: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 3000,
            backoff_multiplier: 2.0,
            jitter: false,
        };
        assert_eq!(compute_exponential_backoff(&config, 2), 3000);

        let err = ExternalError::RateLimited {
            service: ServiceKind::TextGenerator,
            retry_after_secs: 30,
        };
        assert_eq!(compute_backoff(&config, 0, &err), 3000);
    }

    #[tokio::test]
    async fn test_succeeds_first_try() {
        let result = call_with_policy(
            ServiceKind::Embedder,
            Duration::from_secs(1),
            &fast_retry(1),
            || async { Ok::<_, ExternalError>(42) },
        )
        .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retries_transient_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = call_with_policy(
            ServiceKind::VectorStore,
            Duration::from_secs(1),
            &fast_retry(1),
            move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(ExternalError::unavailable(ServiceKind::VectorStore, "blip"))
                    } else {
                        Ok("hits")
                    }
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), "hits");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = call_with_policy(
            ServiceKind::Reranker,
            Duration::from_secs(1),
            &fast_retry(1),
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(ExternalError::unavailable(ServiceKind::Reranker, "down"))
                }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = call_with_policy(
            ServiceKind::StructuredQuery,
            Duration::from_secs(1),
            &fast_retry(3),
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(ExternalError::Rejected {
                        service: ServiceKind::StructuredQuery,
                        message: "syntax error".into(),
                    })
                }
            },
        )
        .await;
        assert!(matches!(result, Err(ExternalError::Rejected { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_becomes_external_error() {
        let result: Result<(), _> = call_with_policy(
            ServiceKind::Embedder,
            Duration::from_millis(10),
            &fast_retry(0),
            || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
        )
        .await;
        match result {
            Err(ExternalError::Timeout {
                service,
                timeout_ms,
            }) => {
                assert_eq!(service, ServiceKind::Embedder);
                assert_eq!(timeout_ms, 10);
            }
            other => panic!("Expected Timeout, got: {other:?}"),
        }
    }

    #[test]
    fn test_huge_retry_after_hint_is_capped() {
        let err = ExternalError::RateLimited {
            service: ServiceKind::Reranker,
            retry_after_secs: u64::MAX / 10,
        };
        assert_eq!(compute_backoff(&fast_retry(1), 0, &err), 5);
    }

    #[tokio::test]
    async fn test_huge_retry_after_hint_still_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = call_with_policy(
            ServiceKind::Reranker,
            Duration::from_secs(1),
            &fast_retry(1),
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(ExternalError::RateLimited {
                        service: ServiceKind::Reranker,
                        retry_after_secs: u64::MAX / 10,
                    })
                }
            },
        )
        .await;
        assert!(matches!(result, Err(ExternalError::RateLimited { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
