use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::assemble::assemble;
use crate::cancel::CancellationToken;
use crate::config::StitchConfig;
use crate::errors::StitchError;
use crate::gateway::{RoundExecutor, TransportGateway};
use crate::models::{Interval, Query};
use crate::out_models::NormalizedSeries;
use crate::planner::plan;
use crate::stitch::normalize_group;

/// Fetches `queries` over `interval` and returns them on one global scale.
///
/// Each normalization group is reduced and stitched on its own; groups run
/// one after another, bundles within a round run concurrently.
pub async fn fetch_series<G: TransportGateway + ?Sized>(
    gateway: &G,
    queries: &[Query],
    interval: &Interval,
    config: &StitchConfig,
    cancel: &CancellationToken,
) -> Result<NormalizedSeries, StitchError> {
    fetch_series_at(gateway, queries, interval, config, cancel, Utc::now()).await
}

/// Like [`fetch_series`], validating the interval against `now`.
pub async fn fetch_series_at<G: TransportGateway + ?Sized>(
    gateway: &G,
    queries: &[Query],
    interval: &Interval,
    config: &StitchConfig,
    cancel: &CancellationToken,
    now: DateTime<Utc>,
) -> Result<NormalizedSeries, StitchError> {
    let pipeline_start = Instant::now();
    info!(
        "Pipeline started - queries={}, interval={}, granularity={}",
        queries.len(),
        interval.span(),
        interval.granularity()
    );

    let plan = plan(queries, interval, config, now)?;
    info!(
        "Plan ready - fragments={}, groups={}, bundle_cap={}, parallelism={}",
        plan.fragments.len(),
        plan.groups.len(),
        config.bundle_cap,
        config.parallelism
    );

    let executor = RoundExecutor::new(
        gateway,
        queries,
        interval.granularity(),
        config.parallelism,
        cancel.clone(),
    );

    let mut stitched = Vec::with_capacity(plan.groups.len());
    for (position, group) in plan.groups.iter().enumerate() {
        cancel.check()?;
        let group_start = Instant::now();
        debug!(
            "Normalizing group {} - queries={:?}, items={}",
            position,
            group.queries,
            group.items.len()
        );
        let result = normalize_group(&executor, group, config.bundle_cap, cancel).await?;
        info!(
            "Group normalized - group={}, duration={:.2}s, anchor_query={}, anchor_fragment={}",
            position,
            group_start.elapsed().as_secs_f32(),
            result.anchor.item.query,
            result.anchor.item.fragment.index
        );
        stitched.push(result);
    }

    cancel.check()?;
    let series = assemble(
        &plan.interval,
        queries,
        stitched,
        config,
        executor.requests_issued(),
    )?;

    info!(
        "Pipeline completed - duration={:.2}s, requests={}, rounds={}, points={}",
        pipeline_start.elapsed().as_secs_f32(),
        executor.requests_issued(),
        executor.rounds_run(),
        series.len()
    );
    Ok(series)
}
