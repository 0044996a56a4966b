use std::path::Path;
use std::time::Duration;

use chrono::NaiveDate;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::errors::StitchError;
use crate::models::Granularity;

/// Request span limits per granularity, in hours.
///
/// The source does not publish these and has changed them before, so they are
/// plain configuration rather than constants.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FragmentSpans {
    pub hour_max_hours: i64,
    /// Below this the source switches to sub-hourly samples.
    pub hour_min_hours: i64,
    pub day_max_hours: i64,
    pub day_min_hours: i64,
    /// Monthly samples are only served for spans at least this long.
    pub month_min_hours: i64,
}

impl Default for FragmentSpans {
    fn default() -> Self {
        Self {
            hour_max_hours: 7 * 24,
            hour_min_hours: 3 * 24,
            day_max_hours: 269 * 24,
            day_min_hours: 2 * 24,
            month_min_hours: 1890 * 24,
        }
    }
}

impl FragmentSpans {
    /// Longest span one fragment may cover; `None` means never fragment.
    pub fn max_span(&self, granularity: Granularity) -> Option<chrono::Duration> {
        match granularity {
            Granularity::Hour => Some(chrono::Duration::hours(self.hour_max_hours)),
            Granularity::Day => Some(chrono::Duration::hours(self.day_max_hours)),
            Granularity::Month => None,
        }
    }

    /// Shortest window the source serves at this granularity.
    pub fn min_span(&self, granularity: Granularity) -> chrono::Duration {
        match granularity {
            Granularity::Hour => chrono::Duration::hours(self.hour_min_hours),
            Granularity::Day => chrono::Duration::hours(self.day_min_hours),
            Granularity::Month => chrono::Duration::hours(self.month_min_hours),
        }
    }

    fn validate(&self) -> Result<(), StitchError> {
        let pairs = [
            ("hour", self.hour_min_hours, self.hour_max_hours),
            ("day", self.day_min_hours, self.day_max_hours),
        ];
        for (name, min, max) in pairs {
            if min <= 0 || max <= 0 {
                return Err(StitchError::Config(format!("{name} spans must be positive")));
            }
            if min > max {
                return Err(StitchError::Config(format!(
                    "{name} min span {min}h exceeds max span {max}h"
                )));
            }
        }
        if self.day_min_hours % 24 != 0 || self.day_max_hours % 24 != 0 {
            return Err(StitchError::Config("day spans must be whole days".into()));
        }
        if self.month_min_hours <= 0 {
            return Err(StitchError::Config("month min span must be positive".into()));
        }
        Ok(())
    }
}

/// Exponential backoff applied by `RetryingGateway`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    /// Relative jitter in `[0, 1)`, applied symmetrically.
    pub jitter: f64,
    /// Per-attempt timeout; 0 disables it.
    pub request_timeout_ms: u64,
    /// Pause after every successful request, jittered by 25%; 0 disables
    /// pacing. The source starts refusing clients that poll it back to back.
    pub pacing_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            multiplier: 2.0,
            jitter: 0.25,
            request_timeout_ms: 30_000,
            pacing_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    /// Wait before attempt `attempt + 1`, given `attempt` failed.
    pub fn backoff(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let exp = self.multiplier.max(1.0).powi(attempt.saturating_sub(1) as i32);
        let base = (self.initial_backoff_ms as f64 * exp).min(self.max_backoff_ms as f64);
        let wait = Duration::from_millis(apply_jitter(base, self.jitter) as u64);
        match retry_after {
            Some(floor) if floor > wait => floor,
            _ => wait,
        }
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }

    /// Pacing delay with +/-25% jitter.
    pub fn pacing(&self) -> Option<Duration> {
        (self.pacing_ms > 0)
            .then(|| Duration::from_millis(apply_jitter(self.pacing_ms as f64, 0.25) as u64))
    }

    fn validate(&self) -> Result<(), StitchError> {
        if self.max_attempts == 0 {
            return Err(StitchError::Config("retry.max_attempts must be at least 1".into()));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(StitchError::Config("retry.jitter must be in [0, 1)".into()));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(StitchError::Config(
                "retry.initial_backoff_ms exceeds retry.max_backoff_ms".into(),
            ));
        }
        Ok(())
    }
}

fn apply_jitter(base_ms: f64, jitter: f64) -> f64 {
    if jitter <= 0.0 || base_ms <= 0.0 {
        return base_ms.max(0.0);
    }
    let factor = rand::rng().random_range((1.0 - jitter)..(1.0 + jitter));
    (base_ms * factor).max(0.0)
}

/// How missing source samples are filled when series are put on the shared axis.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum GapPolicy {
    /// Repeat the previous value, flagged as held.
    HoldLast,
    /// Leave an explicit missing marker.
    #[default]
    Mark,
}

/// How several queries are normalized against each other.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MultivariateMode {
    /// Pack queries together only when everything fits one request;
    /// otherwise each query gets its own tournament and anchor.
    #[default]
    Independent,
    /// One tournament over every (query, fragment) item, one shared anchor.
    Joint,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StitchConfig {
    pub spans: FragmentSpans,
    /// Items per request (B).
    pub bundle_cap: usize,
    /// Concurrent requests within one round.
    pub parallelism: usize,
    pub retry: RetryPolicy,
    pub gap_policy: GapPolicy,
    pub multivariate: MultivariateMode,
    /// Accept more than one sample reading 100 per normalization group.
    pub allow_peak_ties: bool,
    /// First date the source has data for.
    pub earliest_start: NaiveDate,
}

impl Default for StitchConfig {
    fn default() -> Self {
        Self {
            spans: FragmentSpans::default(),
            bundle_cap: 5,
            parallelism: 1,
            retry: RetryPolicy::default(),
            gap_policy: GapPolicy::default(),
            multivariate: MultivariateMode::default(),
            allow_peak_ties: false,
            earliest_start: NaiveDate::from_ymd_opt(2004, 1, 1).unwrap_or_default(),
        }
    }
}

impl StitchConfig {
    pub fn from_json_file(path: &Path) -> Result<Self, StitchError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| StitchError::Config(format!("reading {}: {e}", path.display())))?;
        let config: StitchConfig = serde_json::from_str(&raw)
            .map_err(|e| StitchError::Config(format!("parsing {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), StitchError> {
        if self.bundle_cap < 2 {
            return Err(StitchError::Config(format!(
                "bundle_cap must be at least 2 (got {})",
                self.bundle_cap
            )));
        }
        if self.parallelism == 0 {
            return Err(StitchError::Config("parallelism must be at least 1".into()));
        }
        self.spans.validate()?;
        self.retry.validate()
    }
}
