//! The transport seam: what the core needs from the data source, the retry
//! policy wrapped around it, and the executor that runs one round of bundle
//! requests with bounded parallelism.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use futures::future::try_join_all;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::config::RetryPolicy;
use crate::errors::{StitchError, TransportError};
use crate::models::{Bundle, BundleRequest, Granularity, Query, RawResponse, PEAK};

/// Fetches one bundle from the data source.
///
/// Implementations return one series per request entry, in entry order, each
/// value in `[0, 100]` with the response's own maximum at 100.
#[async_trait]
pub trait TransportGateway: Send + Sync {
    async fn fetch(&self, request: &BundleRequest) -> Result<RawResponse, TransportError>;
}

#[async_trait]
impl<G: TransportGateway + ?Sized> TransportGateway for std::sync::Arc<G> {
    async fn fetch(&self, request: &BundleRequest) -> Result<RawResponse, TransportError> {
        (**self).fetch(request).await
    }
}

/// Wraps a gateway with timeouts, backoff and pacing.
pub struct RetryingGateway<G> {
    inner: G,
    policy: RetryPolicy,
}

impl<G> RetryingGateway<G> {
    pub fn new(inner: G, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &G {
        &self.inner
    }
}

#[async_trait]
impl<G: TransportGateway> TransportGateway for RetryingGateway<G> {
    async fn fetch(&self, request: &BundleRequest) -> Result<RawResponse, TransportError> {
        let mut attempt: u32 = 1;
        loop {
            let outcome = match self.policy.request_timeout() {
                Some(limit) => match tokio::time::timeout(limit, self.inner.fetch(request)).await {
                    Ok(result) => result,
                    Err(_) => Err(TransportError::Transient(format!(
                        "request timed out after {:.1}s",
                        limit.as_secs_f32()
                    ))),
                },
                None => self.inner.fetch(request).await,
            };

            match outcome {
                Ok(response) => {
                    if let Some(pause) = self.policy.pacing() {
                        tokio::time::sleep(pause).await;
                    }
                    return Ok(response);
                }
                Err(err) if err.is_retryable() && attempt < self.policy.max_attempts => {
                    let wait = self.policy.backoff(attempt, err.retry_after());
                    warn!(
                        "Bundle request failed, retrying - attempt={}/{}, backoff={:.2}s, entries={}, error={}",
                        attempt,
                        self.policy.max_attempts,
                        wait.as_secs_f32(),
                        request.entries.len(),
                        err
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(err) if err.is_retryable() => {
                    return Err(TransportError::Exhausted {
                        attempts: attempt,
                        last: Box::new(err),
                    });
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Runs the bundles of one round concurrently, at most `parallelism` at a time.
///
/// Responses come back in bundle order, so a bundle maps to exactly one
/// response no matter how many attempts it took.
pub struct RoundExecutor<'a, G: ?Sized> {
    gateway: &'a G,
    queries: &'a [Query],
    granularity: Granularity,
    permits: Semaphore,
    cancel: CancellationToken,
    requests: AtomicUsize,
    rounds: AtomicUsize,
}

impl<'a, G: TransportGateway + ?Sized> RoundExecutor<'a, G> {
    pub fn new(
        gateway: &'a G,
        queries: &'a [Query],
        granularity: Granularity,
        parallelism: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            gateway,
            queries,
            granularity,
            permits: Semaphore::new(parallelism.max(1)),
            cancel,
            requests: AtomicUsize::new(0),
            rounds: AtomicUsize::new(0),
        }
    }

    /// Bundle requests handed to the gateway so far.
    pub fn requests_issued(&self) -> usize {
        self.requests.load(Ordering::Relaxed)
    }

    /// Rounds started so far.
    pub fn rounds_run(&self) -> usize {
        self.rounds.load(Ordering::Relaxed)
    }

    pub async fn run_round(
        &self,
        phase: &str,
        bundles: &[Bundle],
    ) -> Result<Vec<RawResponse>, StitchError> {
        self.cancel.check()?;
        let round = self.rounds.fetch_add(1, Ordering::Relaxed) + 1;
        let requests = bundles
            .iter()
            .map(|bundle| bundle.to_request(self.queries, self.granularity))
            .collect::<Result<Vec<_>, _>>()?;

        let started = Instant::now();
        info!(
            "Round started - phase={}, round={}, bundles={}, items={}",
            phase,
            round,
            bundles.len(),
            bundles.iter().map(Bundle::len).sum::<usize>()
        );

        let responses = try_join_all(
            requests
                .iter()
                .enumerate()
                .map(|(position, request)| self.issue(phase, round, position, request)),
        )
        .await?;

        for (position, (bundle, response)) in bundles.iter().zip(&responses).enumerate() {
            check_shape(bundle, response)
                .map_err(|e| annotate(e, &format!("{phase} round {round} bundle {position}")))?;
        }

        info!(
            "Round finished - phase={}, round={}, duration={:.2}s",
            phase,
            round,
            started.elapsed().as_secs_f32()
        );
        Ok(responses)
    }

    async fn issue(
        &self,
        phase: &str,
        round: usize,
        position: usize,
        request: &BundleRequest,
    ) -> Result<RawResponse, StitchError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| StitchError::Cancelled)?;
        self.cancel.check()?;
        self.requests.fetch_add(1, Ordering::Relaxed);

        let started = Instant::now();
        debug!(
            "Bundle request - phase={}, round={}, bundle={}, entries={}",
            phase,
            round,
            position,
            request.entries.len()
        );

        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(StitchError::Cancelled),
            result = self.gateway.fetch(request) => result.map_err(StitchError::from),
        };
        let response = outcome?;

        debug!(
            "Bundle response - phase={}, round={}, bundle={}, duration={:.2}s, max={}",
            phase,
            round,
            position,
            started.elapsed().as_secs_f32(),
            response.max_value()
        );
        Ok(response)
    }
}

fn check_shape(bundle: &Bundle, response: &RawResponse) -> Result<(), StitchError> {
    if response.series.len() != bundle.len() {
        return Err(StitchError::AssemblyInvariantViolation(format!(
            "expected {} series, got {}",
            bundle.len(),
            response.series.len()
        )));
    }
    for sample in response.series.iter().flatten() {
        if !sample.value.is_finite() || sample.value < 0.0 || sample.value > PEAK {
            return Err(StitchError::AssemblyInvariantViolation(format!(
                "value {} at {} is outside [0, {PEAK}]",
                sample.value, sample.timestamp
            )));
        }
    }
    Ok(())
}

fn annotate(err: StitchError, context: &str) -> StitchError {
    match err {
        StitchError::AssemblyInvariantViolation(msg) => {
            StitchError::AssemblyInvariantViolation(format!("{context}: {msg}"))
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RequestEntry, Sample, Span};
    use chrono::{TimeZone, Utc};
    use std::sync::Mutex;
    use std::time::Duration;

    struct Scripted {
        outcomes: Mutex<Vec<Result<RawResponse, TransportError>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(mut outcomes: Vec<Result<RawResponse, TransportError>>) -> Self {
            outcomes.reverse();
            Self {
                outcomes: Mutex::new(outcomes),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl TransportGateway for Scripted {
        async fn fetch(&self, _request: &BundleRequest) -> Result<RawResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcomes
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(TransportError::Transient("script exhausted".into())))
        }
    }

    fn request() -> BundleRequest {
        let start = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2020, 1, 3, 0, 0, 0).unwrap();
        BundleRequest {
            granularity: Granularity::Day,
            entries: vec![RequestEntry {
                query: Query::new("rust"),
                window: Span::new(start, end),
            }],
        }
    }

    fn ok_response() -> RawResponse {
        RawResponse {
            series: vec![vec![Sample {
                timestamp: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
                value: 100.0,
            }]],
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff_ms: 10,
            max_backoff_ms: 40,
            jitter: 0.0,
            pacing_ms: 0,
            ..RetryPolicy::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let inner = Scripted::new(vec![
            Err(TransportError::Transient("reset".into())),
            Err(TransportError::RateLimited { retry_after: Some(Duration::from_secs(3)) }),
            Ok(ok_response()),
        ]);
        let gateway = RetryingGateway::new(inner, fast_policy(4));
        let response = gateway.fetch(&request()).await.unwrap();
        assert_eq!(response, ok_response());
        assert_eq!(gateway.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_surfaces_last_error() {
        let inner = Scripted::new(vec![
            Err(TransportError::Transient("a".into())),
            Err(TransportError::Transient("b".into())),
        ]);
        let gateway = RetryingGateway::new(inner, fast_policy(2));
        let err = gateway.fetch(&request()).await.unwrap_err();
        match err {
            TransportError::Exhausted { attempts, last } => {
                assert_eq!(attempts, 2);
                assert!(matches!(*last, TransportError::Transient(ref m) if m == "b"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_errors_fail_immediately() {
        let inner = Scripted::new(vec![Err(TransportError::Unauthorized("cookie".into()))]);
        let gateway = RetryingGateway::new(inner, fast_policy(5));
        let err = gateway.fetch(&request()).await.unwrap_err();
        assert!(matches!(err, TransportError::Unauthorized(_)));
        assert_eq!(gateway.inner().calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_requests_are_paced() {
        let inner = Scripted::new(vec![Ok(ok_response())]);
        let policy = RetryPolicy {
            pacing_ms: 10_000,
            ..fast_policy(1)
        };
        let gateway = RetryingGateway::new(inner, policy);
        let started = tokio::time::Instant::now();
        gateway.fetch(&request()).await.unwrap();
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(7_500), "{waited:?}");
        assert!(waited <= Duration::from_millis(12_500), "{waited:?}");
    }

    struct Stalled;

    #[async_trait]
    impl TransportGateway for Stalled {
        async fn fetch(&self, _request: &BundleRequest) -> Result<RawResponse, TransportError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(RawResponse::default())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_count_as_transient() {
        let policy = RetryPolicy {
            request_timeout_ms: 50,
            ..fast_policy(2)
        };
        let gateway = RetryingGateway::new(Stalled, policy);
        let err = gateway.fetch(&request()).await.unwrap_err();
        assert!(matches!(err, TransportError::Exhausted { attempts: 2, .. }));
    }
}
