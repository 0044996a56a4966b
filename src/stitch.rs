//! Re-requests every item next to the anchor so all responses share one
//! reference point, and the single-request path for groups that fit one bundle.

use std::time::Instant;

use tracing::{debug, info};

use crate::cancel::CancellationToken;
use crate::errors::StitchError;
use crate::gateway::{RoundExecutor, TransportGateway};
use crate::models::{is_peak, Anchor, Bundle, BundleItem, Sample};
use crate::planner::NormalizationGroup;
use crate::reducer::{bundle_winner, find_anchor, ReductionTrace};

/// The samples one item contributes to the final series.
#[derive(Debug, Clone, PartialEq)]
pub struct Piece {
    pub item: BundleItem,
    pub samples: Vec<Sample>,
}

/// A normalization group after every item has been put on the anchor's scale.
#[derive(Debug, Clone)]
pub struct StitchedGroup {
    pub queries: Vec<usize>,
    pub anchor: Anchor,
    /// Sorted by query, then fragment.
    pub pieces: Vec<Piece>,
    pub trace: ReductionTrace,
    /// Maximum the anchor read in each stitching bundle; empty when the
    /// group was served by a single request.
    pub anchor_readings: Vec<f64>,
}

/// Normalizes one group: a single request when it fits, otherwise a
/// tournament followed by anchored stitching.
pub async fn normalize_group<G: TransportGateway + ?Sized>(
    executor: &RoundExecutor<'_, G>,
    group: &NormalizationGroup,
    cap: usize,
    cancel: &CancellationToken,
) -> Result<StitchedGroup, StitchError> {
    if group.items.len() <= cap {
        return fetch_single_bundle(executor, group, cancel).await;
    }
    let (anchor, trace) = find_anchor(executor, &group.items, cap, cancel).await?;
    let (pieces, anchor_readings) = stitch(executor, &group.items, &anchor, cap, cancel).await?;
    Ok(StitchedGroup {
        queries: group.queries.clone(),
        anchor,
        pieces,
        trace,
        anchor_readings,
    })
}

/// Every item in one request; the source normalizes them jointly already.
pub async fn fetch_single_bundle<G: TransportGateway + ?Sized>(
    executor: &RoundExecutor<'_, G>,
    group: &NormalizationGroup,
    cancel: &CancellationToken,
) -> Result<StitchedGroup, StitchError> {
    cancel.check()?;
    let bundle = Bundle {
        items: group.items.clone(),
    };
    let mut responses = executor.run_round("single", std::slice::from_ref(&bundle)).await?;
    let response = responses.pop().unwrap_or_default();

    let item = bundle_winner(&bundle, &response)?.ok_or_else(|| {
        StitchError::DegenerateData(format!(
            "the only response for {} item(s) contains no volume",
            bundle.len()
        ))
    })?;

    let mut pieces: Vec<Piece> = bundle
        .items
        .iter()
        .zip(response.series)
        .map(|(item, samples)| Piece { item: *item, samples })
        .collect();
    sort_pieces(&mut pieces);

    Ok(StitchedGroup {
        queries: group.queries.clone(),
        anchor: Anchor { item },
        pieces,
        trace: ReductionTrace {
            layers: vec![group.items.clone()],
            degenerate_bundles: 0,
            rounds: 0,
        },
        anchor_readings: Vec::new(),
    })
}

/// Requests the non-anchor items in groups of `cap - 1`, each with the anchor
/// appended. Returns the pieces and the anchor's reading in every bundle.
pub async fn stitch<G: TransportGateway + ?Sized>(
    executor: &RoundExecutor<'_, G>,
    items: &[BundleItem],
    anchor: &Anchor,
    cap: usize,
    cancel: &CancellationToken,
) -> Result<(Vec<Piece>, Vec<f64>), StitchError> {
    cancel.check()?;
    let others: Vec<BundleItem> = items
        .iter()
        .filter(|item| **item != anchor.item)
        .copied()
        .collect();

    let per_bundle = cap.saturating_sub(1).max(1);
    let mut bundles: Vec<Bundle> = others
        .chunks(per_bundle)
        .map(|chunk| {
            let mut bundle_items = chunk.to_vec();
            bundle_items.push(anchor.item);
            Bundle { items: bundle_items }
        })
        .collect();
    if bundles.is_empty() {
        bundles.push(Bundle {
            items: vec![anchor.item],
        });
    }

    let started = Instant::now();
    info!(
        "Stitching started - items={}, bundles={}, anchor_fragment={}",
        items.len(),
        bundles.len(),
        anchor.item.fragment.index
    );

    let responses = executor.run_round("stitch", &bundles).await?;

    let mut pieces = Vec::with_capacity(items.len());
    let mut readings = Vec::with_capacity(bundles.len());
    for (position, (bundle, response)) in bundles.iter().zip(responses).enumerate() {
        if response.is_degenerate() {
            return Err(StitchError::DegenerateData(format!(
                "stitching bundle {position} contains no volume"
            )));
        }
        let mut series = response.series;
        let anchor_samples = series.pop().unwrap_or_default();
        let reading = anchor_samples.iter().map(|s| s.value).fold(0.0, f64::max);
        if !is_peak(reading) {
            return Err(StitchError::AssemblyInvariantViolation(format!(
                "anchor read {reading} in stitching bundle {position}, expected 100"
            )));
        }
        readings.push(reading);
        debug!(
            "Stitching bundle {} - items={}, anchor_reading={}",
            position,
            bundle.len(),
            reading
        );

        for (item, samples) in bundle.items.iter().zip(series) {
            pieces.push(Piece { item: *item, samples });
        }
        if position == 0 {
            pieces.push(Piece {
                item: anchor.item,
                samples: anchor_samples,
            });
        }
    }
    sort_pieces(&mut pieces);

    info!(
        "Stitching completed - duration={:.2}s, pieces={}",
        started.elapsed().as_secs_f32(),
        pieces.len()
    );
    Ok((pieces, readings))
}

fn sort_pieces(pieces: &mut [Piece]) {
    pieces.sort_by_key(|p| (p.item.query, p.item.fragment.index));
}
