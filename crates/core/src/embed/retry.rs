//! Retry with exponential backoff around any [`Embedder`].

use crate::config::RetryBackoff;
use crate::embed::Embedder;
use crate::error::{Error, Result};
use std::thread;

/// Retries transient failures of the wrapped embedder and validates its output.
///
/// Transient means `ExternalServiceFailure` or `Io`. Everything else (bad
/// input, wrong dimension) is returned immediately. After the last attempt the
/// error becomes `ExternalServiceFailure` carrying the attempt count.
pub struct RetryingEmbedder<E> {
    inner: E,
    backoff: RetryBackoff,
}

impl<E: Embedder> RetryingEmbedder<E> {
    pub fn new(inner: E, backoff: RetryBackoff) -> Self {
        Self { inner, backoff }
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }

    fn check(&self, vector: Vec<f32>) -> Result<Vec<f32>> {
        let expected = self.inner.dimension();
        if vector.len() != expected {
            return Err(Error::DimensionMismatch {
                expected,
                actual: vector.len(),
            });
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(Error::InvalidVector(format!(
                "{} returned a non-finite component",
                self.inner.name()
            )));
        }
        Ok(vector)
    }
}

fn is_transient(err: &Error) -> bool {
    matches!(err, Error::ExternalServiceFailure { .. } | Error::Io(_))
}

impl<E: Embedder> Embedder for RetryingEmbedder<E> {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let attempts = self.backoff.attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.inner.embed(text) {
                Ok(vector) => return self.check(vector),
                Err(err) if is_transient(&err) && attempt < attempts => {
                    let delay = self.backoff.delay_for(attempt);
                    tracing::warn!(
                        service = self.inner.name(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "embedding attempt failed, retrying"
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) if is_transient(&err) => {
                    let reason = match err {
                        Error::ExternalServiceFailure { reason, .. } => reason,
                        other => other.to_string(),
                    };
                    return Err(Error::ExternalServiceFailure {
                        service: self.inner.name().to_string(),
                        attempts: attempt,
                        reason,
                    });
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` calls, then returns `output`.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
        output: Vec<f32>,
        dimension: usize,
    }

    impl Flaky {
        fn new(failures: u32, output: Vec<f32>, dimension: usize) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
                output,
                dimension,
            }
        }
    }

    impl Embedder for Flaky {
        fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.failures {
                return Err(Error::ExternalServiceFailure {
                    service: "flaky".into(),
                    attempts: 1,
                    reason: "connection refused".into(),
                });
            }
            Ok(self.output.clone())
        }

        fn dimension(&self) -> usize {
            self.dimension
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    fn fast(attempts: u32) -> RetryBackoff {
        RetryBackoff {
            attempts,
            base_delay_ms: 1,
        }
    }

    #[test]
    fn test_recovers_after_transient_failures() {
        let e = RetryingEmbedder::new(Flaky::new(2, vec![1.0, 0.0], 2), fast(3));
        assert_eq!(e.embed("x").unwrap(), vec![1.0, 0.0]);
        assert_eq!(e.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_exhaustion_is_service_failure() {
        let e = RetryingEmbedder::new(Flaky::new(10, vec![1.0, 0.0], 2), fast(3));
        match e.embed("x") {
            Err(err @ Error::ExternalServiceFailure { .. }) => {
                assert_eq!(err.to_string(), "flaky failed after 3 attempt(s): connection refused");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(e.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_wrong_dimension_is_not_retried() {
        let e = RetryingEmbedder::new(Flaky::new(0, vec![1.0, 0.0, 0.0], 2), fast(5));
        assert!(matches!(
            e.embed("x"),
            Err(Error::DimensionMismatch {
                expected: 2,
                actual: 3
            })
        ));
        assert_eq!(e.inner().calls.load(Ordering::SeqCst), 1);
    }
}
