#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use svstitch::config::FragmentSpans;
use svstitch::{
    BundleRequest, Query, RawResponse, Sample, StitchConfig, TransportError, TransportGateway,
};

type Volume = Box<dyn Fn(&Query, DateTime<Utc>) -> f64 + Send + Sync>;

/// In-memory stand-in for the source: computes a "true" volume per
/// (query, timestamp) and rescales every request so its own maximum reads 100.
pub struct MockSource {
    volume: Volume,
    failures: Mutex<VecDeque<TransportError>>,
    missing: HashSet<DateTime<Utc>>,
    latency: Option<Duration>,
    attempts: AtomicUsize,
    answered: Mutex<Vec<BundleRequest>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockSource {
    pub fn new(volume: impl Fn(&Query, DateTime<Utc>) -> f64 + Send + Sync + 'static) -> Self {
        Self {
            volume: Box::new(volume),
            failures: Mutex::new(VecDeque::new()),
            missing: HashSet::new(),
            latency: None,
            attempts: AtomicUsize::new(0),
            answered: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Timestamps the source never reports a sample for.
    pub fn with_missing(mut self, missing: impl IntoIterator<Item = DateTime<Utc>>) -> Self {
        self.missing.extend(missing);
        self
    }

    /// Errors returned, in order, by the next calls.
    pub fn fail_next(&self, errors: impl IntoIterator<Item = TransportError>) {
        self.failures.lock().unwrap().extend(errors);
    }

    /// Every call, failed ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Calls that produced a response.
    pub fn calls(&self) -> usize {
        self.answered.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<BundleRequest> {
        self.answered.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn respond(&self, request: &BundleRequest) -> RawResponse {
        let raw: Vec<Vec<(DateTime<Utc>, f64)>> = request
            .entries
            .iter()
            .map(|entry| {
                request
                    .granularity
                    .ticks(&entry.window)
                    .into_iter()
                    .filter(|ts| !self.missing.contains(ts))
                    .map(|ts| (ts, (self.volume)(&entry.query, ts)))
                    .collect()
            })
            .collect();
        let max = raw.iter().flatten().map(|(_, v)| *v).fold(0.0, f64::max);
        RawResponse {
            series: raw
                .into_iter()
                .map(|series| {
                    series
                        .into_iter()
                        .map(|(timestamp, v)| Sample {
                            timestamp,
                            value: if max > 0.0 { v / max * 100.0 } else { 0.0 },
                        })
                        .collect()
                })
                .collect(),
        }
    }
}

#[async_trait]
impl TransportGateway for MockSource {
    async fn fetch(&self, request: &BundleRequest) -> Result<RawResponse, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let failure = self.failures.lock().unwrap().pop_front();
        let outcome = match failure {
            Some(err) => Err(err),
            None => {
                self.answered.lock().unwrap().push(request.clone());
                Ok(self.respond(request))
            }
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

pub fn day(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
}

pub fn hour(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
}

/// Fixed "now" so interval validation does not depend on the clock.
pub fn now() -> DateTime<Utc> {
    day(2024, 6, 1)
}

/// Uneven background noise in `[1, 97]`, distinct per term.
pub fn background(query: &Query, ts: DateTime<Utc>) -> f64 {
    let salt = query.term().bytes().map(u64::from).sum::<u64>();
    let bucket = (ts.timestamp() / 3600) as u64;
    1.0 + ((bucket.wrapping_mul(2_654_435_761) ^ salt.wrapping_mul(40_503)) % 97) as f64
}

/// Background noise plus one spike of `height` per listed term.
pub fn spiked(
    spikes: Vec<(&'static str, DateTime<Utc>, f64)>,
) -> impl Fn(&Query, DateTime<Utc>) -> f64 + Send + Sync + 'static {
    move |query: &Query, ts: DateTime<Utc>| {
        spikes
            .iter()
            .find(|(term, at, _)| *term == query.term() && *at == ts)
            .map(|(_, _, height)| *height)
            .unwrap_or_else(|| background(query, ts))
    }
}

/// Day fragments of `max_days`, minimum request span `min_days`.
pub fn day_config(bundle_cap: usize, max_days: i64, min_days: i64) -> StitchConfig {
    StitchConfig {
        bundle_cap,
        spans: FragmentSpans {
            day_max_hours: max_days * 24,
            day_min_hours: min_days * 24,
            ..FragmentSpans::default()
        },
        ..StitchConfig::default()
    }
}

pub fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() <= 1e-9 * expected.abs().max(1.0),
        "expected {expected}, got {actual}"
    );
}
