//! Tournament search for the item holding a group's global maximum.
//!
//! Every response is rescaled by the source so that its own maximum reads
//! 100. Bundling candidates and keeping only each bundle's 100-holder
//! therefore narrows the field by a factor of B per round, and after
//! `ceil(log_B(F))` rounds one item is left: the one whose peak is the
//! highest across the whole group.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::errors::StitchError;
use crate::gateway::{RoundExecutor, TransportGateway};
use crate::models::{is_peak, Anchor, Bundle, BundleItem, RawResponse};
use crate::planner;

/// How the anchor was found: every layer's candidate list, first to last.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReductionTrace {
    pub layers: Vec<Vec<BundleItem>>,
    /// Bundles whose response held no volume at all.
    pub degenerate_bundles: usize,
    pub rounds: usize,
}

/// Picks the bundle's 100-holder, earliest fragment first on ties.
///
/// `Ok(None)` means the response is all zeros and there is nothing to pick.
pub fn bundle_winner(
    bundle: &Bundle,
    response: &RawResponse,
) -> Result<Option<BundleItem>, StitchError> {
    if response.is_degenerate() {
        return Ok(None);
    }
    let winner = bundle
        .items
        .iter()
        .zip(&response.series)
        .filter(|(_, series)| series.iter().any(|s| is_peak(s.value)))
        .map(|(item, _)| *item)
        .min_by_key(BundleItem::tie_key);
    match winner {
        Some(item) => Ok(Some(item)),
        None => Err(StitchError::AssemblyInvariantViolation(format!(
            "bundle maximum is {} instead of 100",
            response.max_value()
        ))),
    }
}

/// Runs the tournament over `items` until one candidate is left.
pub async fn find_anchor<G: TransportGateway + ?Sized>(
    executor: &RoundExecutor<'_, G>,
    items: &[BundleItem],
    cap: usize,
    cancel: &CancellationToken,
) -> Result<(Anchor, ReductionTrace), StitchError> {
    let mut trace = ReductionTrace::default();
    let mut candidates = items.to_vec();
    trace.layers.push(candidates.clone());

    while candidates.len() > 1 {
        cancel.check()?;
        let bundles = planner::bundle(&candidates, cap);
        let responses = executor.run_round("reduce", &bundles).await?;
        trace.rounds += 1;

        let mut winners = Vec::with_capacity(bundles.len());
        for (bundle, response) in bundles.iter().zip(&responses) {
            match bundle_winner(bundle, response)? {
                Some(item) => winners.push(item),
                None => {
                    trace.degenerate_bundles += 1;
                    warn!(
                        "Degenerate bundle dropped - round={}, items={}, first_fragment={}",
                        trace.rounds,
                        bundle.len(),
                        bundle.items.first().map(|i| i.fragment.index).unwrap_or_default()
                    );
                }
            }
        }

        if winners.is_empty() {
            return Err(StitchError::DegenerateData(format!(
                "all {} bundles of reduction round {} contained only zeros",
                bundles.len(),
                trace.rounds
            )));
        }

        debug!(
            "Reduction round {} - candidates {} -> {}",
            trace.rounds,
            candidates.len(),
            winners.len()
        );
        candidates = winners;
        trace.layers.push(candidates.clone());
    }

    let item = candidates.pop().ok_or_else(|| {
        StitchError::DegenerateData("no items to reduce".into())
    })?;
    info!(
        "Anchor found - query={}, fragment={}, span={}, rounds={}",
        item.query, item.fragment.index, item.fragment.span, trace.rounds
    );
    Ok((Anchor { item }, trace))
}
