//! Concatenates stitched pieces into per-query series on a shared axis and
//! verifies the result before it is handed out.

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::config::{GapPolicy, StitchConfig};
use crate::errors::StitchError;
use crate::models::{is_peak, Granularity, Interval, Query, Sample};
use crate::out_models::{GroupReport, NormalizedSeries, Point, SeriesColumn};
use crate::stitch::{Piece, StitchedGroup};

fn violation(msg: String) -> StitchError {
    StitchError::AssemblyInvariantViolation(msg)
}

/// Joins one query's pieces, in fragment order, into a single ordered series.
///
/// Fails on a missing or overlapping fragment, an empty fragment, samples
/// outside the requested window or off the granularity's boundaries, and when
/// the series does not start at the interval start.
pub fn concat_pieces(
    interval: &Interval,
    pieces: &[&Piece],
) -> Result<Vec<Sample>, StitchError> {
    let granularity = interval.granularity();
    let (Some(first), Some(last)) = (pieces.first(), pieces.last()) else {
        return Err(violation("no fragments to assemble".into()));
    };
    if first.item.fragment.span.start != interval.start() {
        return Err(violation(format!(
            "first fragment starts at {}, interval at {}",
            first.item.fragment.span.start,
            interval.start()
        )));
    }
    if last.item.fragment.span.end != interval.end() {
        return Err(violation(format!(
            "last fragment ends at {}, interval at {}",
            last.item.fragment.span.end,
            interval.end()
        )));
    }
    for pair in pieces.windows(2) {
        let (a, b) = (&pair[0].item.fragment, &pair[1].item.fragment);
        if a.span.end != b.span.start {
            return Err(violation(format!(
                "fragments {} and {} are not contiguous ({} vs {})",
                a.index, b.index, a.span.end, b.span.start
            )));
        }
    }

    let mut out: Vec<Sample> = Vec::new();
    for piece in pieces {
        let fragment = &piece.item.fragment;
        let before = out.len();
        for sample in &piece.samples {
            if !fragment.window.contains(sample.timestamp) {
                return Err(violation(format!(
                    "sample at {} lies outside fragment {} window {}",
                    sample.timestamp, fragment.index, fragment.window
                )));
            }
            if !fragment.span.contains(sample.timestamp) {
                // widened tail window, owned by the previous fragment
                continue;
            }
            if !granularity.is_aligned(sample.timestamp) {
                return Err(violation(format!(
                    "sample at {} is not on a {granularity} boundary",
                    sample.timestamp
                )));
            }
            if let Some(prev) = out.last() {
                if sample.timestamp <= prev.timestamp {
                    return Err(violation(format!(
                        "overlapping or unordered samples at {} after {}",
                        sample.timestamp, prev.timestamp
                    )));
                }
            }
            out.push(*sample);
        }
        if out.len() == before {
            return Err(violation(format!(
                "fragment {} {} returned no samples",
                fragment.index, fragment.span
            )));
        }
    }

    match (out.first(), out.last()) {
        (Some(head), Some(tail)) => {
            if head.timestamp != interval.start() {
                return Err(violation(format!(
                    "series starts at {}, expected {}",
                    head.timestamp,
                    interval.start()
                )));
            }
            if tail.timestamp >= interval.end() {
                return Err(violation(format!(
                    "series ends at {}, not before {}",
                    tail.timestamp,
                    interval.end()
                )));
            }
        }
        _ => return Err(violation("assembled series is empty".into())),
    }
    Ok(out)
}

/// Lays samples onto `axis`, filling absent ticks according to `policy`.
/// Returns the points and how many were filled.
pub fn place_on_axis(
    axis: &[DateTime<Utc>],
    samples: &[Sample],
    policy: GapPolicy,
) -> Result<(Vec<Point>, usize), StitchError> {
    let mut points = Vec::with_capacity(axis.len());
    let mut filled = 0usize;
    let mut next = samples.iter().peekable();
    let mut last_value: Option<f64> = None;

    for tick in axis {
        match next.peek() {
            Some(sample) if sample.timestamp == *tick => {
                points.push(Point::Observed(sample.value));
                last_value = Some(sample.value);
                next.next();
            }
            _ => {
                filled += 1;
                points.push(match (policy, last_value) {
                    (GapPolicy::HoldLast, Some(v)) => Point::Held(v),
                    _ => Point::Missing,
                });
            }
        }
    }
    if let Some(stray) = next.next() {
        return Err(violation(format!(
            "sample at {} does not fall on the series axis",
            stray.timestamp
        )));
    }
    Ok((points, filled))
}

pub fn assemble(
    interval: &Interval,
    queries: &[Query],
    groups: Vec<StitchedGroup>,
    config: &StitchConfig,
    requests: usize,
) -> Result<NormalizedSeries, StitchError> {
    let granularity: Granularity = interval.granularity();
    let axis = granularity.ticks(&interval.span());
    let mut columns: Vec<Option<SeriesColumn>> = vec![None; queries.len()];
    let mut reports = Vec::with_capacity(groups.len());

    for group in groups {
        let mut peaks = 0usize;
        for &q in &group.queries {
            let query = queries
                .get(q)
                .ok_or_else(|| violation(format!("group refers to unknown query {q}")))?;
            let pieces: Vec<&Piece> = group.pieces.iter().filter(|p| p.item.query == q).collect();
            let samples = concat_pieces(interval, &pieces).map_err(|e| match e {
                StitchError::AssemblyInvariantViolation(msg) => {
                    violation(format!("query '{}': {msg}", query.term()))
                }
                other => other,
            })?;
            peaks += samples.iter().filter(|s| is_peak(s.value)).count();

            let (points, filled) = place_on_axis(&axis, &samples, config.gap_policy)?;
            if filled > 0 {
                debug!(
                    "Gaps filled - query={}, filled={}, policy={:?}",
                    query.term(),
                    filled,
                    config.gap_policy
                );
            }
            if columns[q].is_some() {
                return Err(violation(format!("query {q} assembled twice")));
            }
            columns[q] = Some(SeriesColumn {
                query: query.clone(),
                points,
                filled,
            });
        }

        if peaks == 0 {
            return Err(violation(format!(
                "no sample reads 100 for queries {:?}",
                group.queries
            )));
        }
        if peaks > 1 && !config.allow_peak_ties {
            return Err(violation(format!(
                "{peaks} samples read 100 for queries {:?}, expected exactly one",
                group.queries
            )));
        }

        reports.push(GroupReport {
            queries: group.queries,
            anchor: group.anchor,
            trace: group.trace,
            anchor_readings: group.anchor_readings,
        });
    }

    let columns = columns
        .into_iter()
        .enumerate()
        .map(|(q, col)| col.ok_or_else(|| violation(format!("query {q} was never assembled"))))
        .collect::<Result<Vec<_>, _>>()?;

    info!(
        "Series assembled - points={}, columns={}, filled={}",
        axis.len(),
        columns.len(),
        columns.iter().map(|c| c.filled).sum::<usize>()
    );

    Ok(NormalizedSeries {
        granularity,
        interval: interval.span(),
        timestamps: axis,
        columns,
        groups: reports,
        requests,
    })
}
