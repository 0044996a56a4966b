use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{is_peak, Anchor, Granularity, Query, Span};
use crate::reducer::ReductionTrace;

/// One value on the shared timestamp axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Point {
    Observed(f64),
    /// Filled with the previous observed value under `GapPolicy::HoldLast`.
    Held(f64),
    /// No sample from the source under `GapPolicy::Mark`.
    Missing,
}

impl Point {
    pub fn value(&self) -> Option<f64> {
        match self {
            Point::Observed(v) | Point::Held(v) => Some(*v),
            Point::Missing => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SeriesColumn {
    pub query: Query,
    /// One point per entry of `NormalizedSeries::timestamps`.
    pub points: Vec<Point>,
    /// Axis positions that had to be filled.
    pub filled: usize,
}

impl SeriesColumn {
    pub fn max(&self) -> Option<f64> {
        self.points.iter().filter_map(Point::value).reduce(f64::max)
    }

    pub fn peak_count(&self) -> usize {
        self.points
            .iter()
            .filter(|p| matches!(p, Point::Observed(v) if is_peak(*v)))
            .count()
    }
}

/// How one normalization group was resolved.
#[derive(Debug, Clone, Serialize)]
pub struct GroupReport {
    pub queries: Vec<usize>,
    pub anchor: Anchor,
    pub trace: ReductionTrace,
    pub anchor_readings: Vec<f64>,
}

/// The stitched, globally normalized result.
#[derive(Debug, Clone, Serialize)]
pub struct NormalizedSeries {
    pub granularity: Granularity,
    pub interval: Span,
    pub timestamps: Vec<DateTime<Utc>>,
    /// In the caller's query order.
    pub columns: Vec<SeriesColumn>,
    pub groups: Vec<GroupReport>,
    /// Bundle requests issued to produce this series.
    pub requests: usize,
}

impl NormalizedSeries {
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn column(&self, term: &str) -> Option<&SeriesColumn> {
        self.columns.iter().find(|c| c.query.term() == term)
    }

    /// `(timestamp, value)` pairs of one column; `None` marks a gap.
    pub fn samples(&self, column: usize) -> Vec<(DateTime<Utc>, Option<f64>)> {
        match self.columns.get(column) {
            Some(col) => self
                .timestamps
                .iter()
                .zip(&col.points)
                .map(|(ts, point)| (*ts, point.value()))
                .collect(),
            None => Vec::new(),
        }
    }
}

/// A search the source lists next to a query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelatedQuery {
    pub query: String,
    pub value: f64,
    /// As displayed by the source, e.g. "+250%" or "Breakout".
    pub formatted: String,
    /// Absolute explore URL for the related search.
    pub link: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelatedQueries {
    pub query: Query,
    pub window: Span,
    pub top: Vec<RelatedQuery>,
    pub rising: Vec<RelatedQuery>,
}
