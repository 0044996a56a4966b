//! Splits an interval into request-sized fragments and packs them into bundles.

use chrono::{DateTime, TimeZone, Utc};
use tracing::debug;

use crate::config::{FragmentSpans, MultivariateMode, StitchConfig};
use crate::errors::StitchError;
use crate::models::{Bundle, BundleItem, Category, Fragment, Granularity, Interval, Query, Span};

/// Items that must end up on one common scale, plus the queries they cover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizationGroup {
    pub queries: Vec<usize>,
    pub items: Vec<BundleItem>,
}

#[derive(Debug, Clone)]
pub struct Plan {
    pub interval: Interval,
    pub fragments: Vec<Fragment>,
    pub groups: Vec<NormalizationGroup>,
}

/// Checks the interval against what the source is able to serve.
pub fn validate_interval(
    interval: &Interval,
    config: &StitchConfig,
    now: DateTime<Utc>,
) -> Result<(), StitchError> {
    let earliest = config
        .earliest_start
        .and_hms_opt(0, 0, 0)
        .map(|naive| Utc.from_utc_datetime(&naive))
        .ok_or_else(|| StitchError::Config("earliest_start is not a valid date".into()))?;
    if interval.start() < earliest {
        return Err(StitchError::InvalidInterval(format!(
            "start {} precedes the earliest available date {}",
            interval.start(),
            config.earliest_start
        )));
    }
    if interval.end() > now {
        return Err(StitchError::InvalidInterval(format!(
            "end {} lies in the future",
            interval.end()
        )));
    }
    let granularity = interval.granularity();
    let min = config.spans.min_span(granularity);
    if interval.span().duration() < min {
        let reason = match granularity {
            Granularity::Month => "below the source's monthly threshold",
            _ => "shorter than the minimum request span",
        };
        return Err(StitchError::InvalidInterval(format!(
            "{granularity} span of {}h is {reason} ({}h)",
            interval.span().duration().num_hours(),
            min.num_hours()
        )));
    }
    Ok(())
}

/// Partitions `interval` into consecutive fragments no longer than the
/// granularity's max span. The last fragment may be shorter; when it is
/// shorter than the minimum request span its window is widened backwards.
pub fn build_fragments(
    interval: &Interval,
    spans: &FragmentSpans,
) -> Result<Vec<Fragment>, StitchError> {
    let granularity = interval.granularity();
    let whole = interval.span();
    let Some(max) = spans.max_span(granularity) else {
        return Ok(vec![Fragment {
            index: 0,
            span: whole,
            window: whole,
        }]);
    };
    let min = spans.min_span(granularity);

    let mut fragments = Vec::new();
    let mut cursor = whole.start;
    while cursor < whole.end {
        let next = cursor
            .checked_add_signed(max)
            .map(|t| t.min(whole.end))
            .ok_or_else(|| StitchError::InvalidInterval("interval end out of range".into()))?;
        let span = Span::new(cursor, next);
        let window = if span.duration() < min {
            let widened = next
                .checked_sub_signed(min)
                .map(|t| t.max(whole.start))
                .unwrap_or(whole.start);
            Span::new(widened, next)
        } else {
            span
        };
        fragments.push(Fragment {
            index: fragments.len(),
            span,
            window,
        });
        cursor = next;
    }
    Ok(fragments)
}

/// Packs items into bundles of at most `cap`, keeping their order.
/// The last bundle may be partial.
pub fn bundle(items: &[BundleItem], cap: usize) -> Vec<Bundle> {
    items
        .chunks(cap.max(1))
        .map(|chunk| Bundle {
            items: chunk.to_vec(),
        })
        .collect()
}

/// Query indices grouped by category, in order of first appearance.
/// Only queries of one category can share a request.
fn category_classes(queries: &[Query]) -> Vec<Vec<usize>> {
    let mut classes: Vec<(Category, Vec<usize>)> = Vec::new();
    for (index, query) in queries.iter().enumerate() {
        match classes.iter_mut().find(|(category, _)| *category == query.category()) {
            Some((_, members)) => members.push(index),
            None => classes.push((query.category(), vec![index])),
        }
    }
    classes.into_iter().map(|(_, members)| members).collect()
}

pub fn plan(
    queries: &[Query],
    interval: &Interval,
    config: &StitchConfig,
    now: DateTime<Utc>,
) -> Result<Plan, StitchError> {
    if queries.is_empty() {
        return Err(StitchError::InvalidQuery("at least one query is required".into()));
    }
    if let Some(pos) = queries.iter().position(|q| q.term().trim().is_empty()) {
        return Err(StitchError::InvalidQuery(format!("query {pos} has an empty term")));
    }
    config.validate()?;
    validate_interval(interval, config, now)?;

    let fragments = build_fragments(interval, &config.spans)?;
    let cap = config.bundle_cap;
    let classes = category_classes(queries);

    let items_for = |members: &[usize], order_by_fragment: bool| {
        let mut items: Vec<BundleItem> = members
            .iter()
            .flat_map(|&query| {
                fragments
                    .iter()
                    .map(move |fragment| BundleItem { query, fragment: *fragment })
            })
            .collect();
        if order_by_fragment {
            items.sort_by_key(|item| (item.fragment.index, item.query));
        }
        NormalizationGroup {
            queries: members.to_vec(),
            items,
        }
    };

    let groups = match config.multivariate {
        MultivariateMode::Joint => {
            if classes.len() > 1 {
                return Err(StitchError::InvalidQuery(format!(
                    "joint normalization needs a single category, got {}",
                    classes.len()
                )));
            }
            vec![items_for(classes[0].as_slice(), true)]
        }
        MultivariateMode::Independent => classes
            .iter()
            .flat_map(|members| {
                if fragments.len() * members.len() <= cap {
                    vec![items_for(members.as_slice(), false)]
                } else {
                    members.iter().map(|&q| items_for(&[q][..], false)).collect()
                }
            })
            .collect(),
    };

    debug!(
        "Plan built - interval={}, granularity={}, fragments={}, queries={}, groups={}, bundle_cap={}",
        interval.span(),
        interval.granularity(),
        fragments.len(),
        queries.len(),
        groups.len(),
        cap
    );

    Ok(Plan {
        interval: *interval,
        fragments,
        groups,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn day(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn now() -> DateTime<Utc> {
        day(2024, 1, 1)
    }

    fn assert_partition(interval: &Interval, fragments: &[Fragment]) {
        assert_eq!(fragments.first().unwrap().span.start, interval.start());
        assert_eq!(fragments.last().unwrap().span.end, interval.end());
        for pair in fragments.windows(2) {
            assert_eq!(pair[0].span.end, pair[1].span.start, "gap or overlap between fragments");
        }
        for (i, f) in fragments.iter().enumerate() {
            assert_eq!(f.index, i);
            assert!(f.span.duration() > Duration::zero());
            assert!(f.window.start <= f.span.start && f.window.end == f.span.end);
            assert!(f.window.start >= interval.start());
        }
    }

    #[test]
    fn fragments_partition_daily_intervals_exactly() {
        let spans = FragmentSpans::default();
        let start = day(2010, 1, 1);
        for days in [2_i64, 30, 268, 269, 270, 538, 539, 1000, 4000] {
            let interval =
                Interval::new(start, start + Duration::days(days), Granularity::Day).unwrap();
            let fragments = build_fragments(&interval, &spans).unwrap();
            assert_partition(&interval, &fragments);
            assert_eq!(fragments.len() as i64, (days + 268) / 269);
        }
    }

    #[test]
    fn fragments_partition_hourly_intervals_exactly() {
        let spans = FragmentSpans::default();
        let start = day(2020, 3, 1);
        for hours in [72_i64, 100, 168, 169, 24 * 40 + 5] {
            let interval =
                Interval::new(start, start + Duration::hours(hours), Granularity::Hour).unwrap();
            let fragments = build_fragments(&interval, &spans).unwrap();
            assert_partition(&interval, &fragments);
        }
    }

    #[test]
    fn short_tail_window_is_widened_to_minimum() {
        let spans = FragmentSpans::default();
        let start = day(2020, 3, 1);
        let interval =
            Interval::new(start, start + Duration::hours(168 + 5), Granularity::Hour).unwrap();
        let fragments = build_fragments(&interval, &spans).unwrap();
        let tail = fragments.last().unwrap();
        assert_eq!(tail.span.duration(), Duration::hours(5));
        assert_eq!(tail.window.duration(), Duration::hours(72));
    }

    #[test]
    fn month_interval_is_never_fragmented() {
        let interval = Interval::new(day(2010, 1, 1), day(2020, 1, 1), Granularity::Month).unwrap();
        let fragments = build_fragments(&interval, &FragmentSpans::default()).unwrap();
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].span, interval.span());
    }

    #[test]
    fn short_month_interval_is_invalid() {
        let interval = Interval::new(day(2019, 1, 1), day(2019, 6, 1), Granularity::Month).unwrap();
        let err = validate_interval(&interval, &StitchConfig::default(), now()).unwrap_err();
        assert!(matches!(err, StitchError::InvalidInterval(_)));
    }

    #[test]
    fn intervals_before_earliest_or_in_future_are_invalid() {
        let config = StitchConfig::default();
        let early = Interval::new(day(2003, 1, 1), day(2003, 3, 1), Granularity::Day).unwrap();
        assert!(validate_interval(&early, &config, now()).is_err());
        let future = Interval::new(day(2023, 12, 1), day(2024, 2, 1), Granularity::Day).unwrap();
        assert!(validate_interval(&future, &config, now()).is_err());
    }

    #[test]
    fn bundles_keep_order_and_cap() {
        let interval = Interval::new(day(2000, 1, 1), day(2000, 1, 14), Granularity::Day).unwrap();
        let items: Vec<BundleItem> = (0..13)
            .map(|i| BundleItem {
                query: 0,
                fragment: Fragment {
                    index: i,
                    span: interval.span(),
                    window: interval.span(),
                },
            })
            .collect();
        let bundles = bundle(&items, 5);
        assert_eq!(bundles.iter().map(Bundle::len).collect::<Vec<_>>(), vec![5, 5, 3]);
        let flat: Vec<usize> = bundles
            .iter()
            .flat_map(|b| b.items.iter().map(|i| i.fragment.index))
            .collect();
        assert_eq!(flat, (0..13).collect::<Vec<_>>());
    }

    #[test]
    fn queries_pack_together_when_everything_fits() {
        let queries: Vec<Query> = ["a", "b", "c"].iter().map(|t| Query::new(*t)).collect();
        let interval = Interval::new(day(2010, 1, 1), day(2020, 1, 1), Granularity::Month).unwrap();
        let plan = plan(&queries, &interval, &StitchConfig::default(), now()).unwrap();
        assert_eq!(plan.groups.len(), 1);
        assert_eq!(plan.groups[0].items.len(), 3);
    }

    #[test]
    fn fragmented_queries_are_planned_independently() {
        let queries: Vec<Query> = (0..6).map(|i| Query::new(format!("q{i}"))).collect();
        let interval = Interval::new(day(2010, 1, 1), day(2015, 1, 1), Granularity::Day).unwrap();
        let plan = plan(&queries, &interval, &StitchConfig::default(), now()).unwrap();
        assert_eq!(plan.groups.len(), 6);
        for (q, group) in plan.groups.iter().enumerate() {
            assert_eq!(group.queries, vec![q]);
            assert!(group.items.iter().all(|item| item.query == q));
            assert_eq!(group.items.len(), plan.fragments.len());
        }
    }

    #[test]
    fn joint_mode_orders_items_chronologically() {
        let queries: Vec<Query> = ["a", "b"].iter().map(|t| Query::new(*t)).collect();
        let interval = Interval::new(day(2010, 1, 1), day(2013, 1, 1), Granularity::Day).unwrap();
        let config = StitchConfig {
            multivariate: MultivariateMode::Joint,
            ..StitchConfig::default()
        };
        let plan = plan(&queries, &interval, &config, now()).unwrap();
        assert_eq!(plan.groups.len(), 1);
        let keys: Vec<(usize, usize)> = plan.groups[0]
            .items
            .iter()
            .map(|i| (i.fragment.index, i.query))
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn queries_share_requests_only_within_a_category() {
        let queries = vec![
            Query::new("rust"),
            Query::new("go").with_category(Category::ComputersElectronics),
            Query::new("zig"),
        ];
        let interval = Interval::new(day(2010, 1, 1), day(2018, 1, 1), Granularity::Month).unwrap();
        let plan = plan(&queries, &interval, &StitchConfig::default(), now()).unwrap();
        let members: Vec<Vec<usize>> = plan.groups.iter().map(|g| g.queries.clone()).collect();
        assert_eq!(members, vec![vec![0, 2], vec![1]]);
        for group in &plan.groups {
            let category = queries[group.items[0].query].category();
            assert!(group.items.iter().all(|i| queries[i.query].category() == category));
        }
    }

    #[test]
    fn joint_mode_rejects_mixed_categories() {
        let queries = vec![
            Query::new("rust"),
            Query::new("go").with_category(Category::ComputersElectronics),
        ];
        let interval = Interval::new(day(2010, 1, 1), day(2018, 1, 1), Granularity::Month).unwrap();
        let config = StitchConfig {
            multivariate: MultivariateMode::Joint,
            ..StitchConfig::default()
        };
        let err = plan(&queries, &interval, &config, now()).unwrap_err();
        assert!(matches!(err, StitchError::InvalidQuery(_)));
    }

    #[test]
    fn empty_query_list_is_rejected() {
        let interval = Interval::new(day(2010, 1, 1), day(2011, 1, 1), Granularity::Day).unwrap();
        let err = plan(&[], &interval, &StitchConfig::default(), now()).unwrap_err();
        assert!(matches!(err, StitchError::InvalidQuery(_)));
    }
}
