//! `TransportGateway` backed by the public Google Trends endpoints.
//!
//! One bundle costs two calls: `explore` hands out a signed widget request,
//! and `widgetdata/multiline` (one shared window) or `widgetdata/multirange`
//! (differing windows) returns the jointly normalized series. Related queries
//! go through the same handshake with `widgetdata/relatedsearches`.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::{header, Client, StatusCode};
use tracing::{debug, info};

use serde_json::Value;

use crate::api_types::{
    ComparisonItem, ExploreRequest, ExploreResponse, ExploreWidget, RankedKeyword, RelatedResponse,
    TimelineResponse,
};
use crate::errors::TransportError;
use crate::gateway::TransportGateway;
use crate::models::{BundleRequest, Granularity, Query, RawResponse, RequestEntry, Sample, Span};
use crate::out_models::{RelatedQueries, RelatedQuery};

const URL_BASE: &str = "https://trends.google.com/";
const URL_EXPLORE: &str = "https://trends.google.com/trends/api/explore";
const URL_MULTILINE: &str = "https://trends.google.com/trends/api/widgetdata/multiline";
const URL_MULTIRANGE: &str = "https://trends.google.com/trends/api/widgetdata/multirange";
const URL_RELATED: &str = "https://trends.google.com/trends/api/widgetdata/relatedsearches";
const URL_TRENDS: &str = "https://trends.google.com";
const TIMESERIES_WIDGET: &str = "TIMESERIES";
const RELATED_QUERIES_WIDGET: &str = "RELATED_QUERIES";
// Buckets are requested in UTC so timestamps land on granularity boundaries.
const TZ_OFFSET_MINUTES: &str = "0";

pub struct TrendsGateway {
    client: Client,
    language: String,
}

impl TrendsGateway {
    /// Builds the HTTP client and collects the session cookies the API
    /// endpoints insist on.
    pub async fn connect(language: &str, timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .cookie_store(true)
            .timeout(timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError::Transient(format!("building HTTP client: {e}")))?;

        let start = Instant::now();
        let resp = client.get(URL_BASE).send().await.map_err(request_error)?;
        if !resp.status().is_success() {
            return Err(status_error(resp.status(), resp.headers(), "cookie bootstrap"));
        }
        info!(
            "Trends session ready - language={}, duration={:.2}s",
            language,
            start.elapsed().as_secs_f32()
        );

        Ok(Self {
            client,
            language: language.to_string(),
        })
    }

    /// Runs explore and returns the signed request and token of the first
    /// widget whose id starts with `widget_id`.
    async fn explore(
        &self,
        request: &BundleRequest,
        widget_id: &str,
    ) -> Result<(Value, String), TransportError> {
        let req = serde_json::to_string(&explore_request(request)?)
            .map_err(|e| TransportError::Decode(format!("encoding explore request: {e}")))?;
        let body = self
            .get(URL_EXPLORE, &[("hl", self.language.as_str()), ("tz", TZ_OFFSET_MINUTES), ("req", req.as_str())])
            .await?;

        let explore: ExploreResponse = serde_json::from_str(strip_xssi(&body))
            .map_err(|e| TransportError::Decode(format!("explore response: {e}")))?;
        let widget: ExploreWidget = explore
            .widgets
            .into_iter()
            .find(|w| w.id.starts_with(widget_id))
            .ok_or_else(|| TransportError::Decode(format!("explore response has no {widget_id} widget")))?;
        match (widget.request, widget.token) {
            (Some(req), Some(token)) => Ok((req, token)),
            _ => Err(TransportError::Decode(format!(
                "{widget_id} widget lacks request or token"
            ))),
        }
    }

    /// Top and rising searches related to `query` within `window`.
    pub async fn related_queries(
        &self,
        query: &Query,
        window: Span,
        granularity: Granularity,
    ) -> Result<RelatedQueries, TransportError> {
        let start = Instant::now();
        let request = BundleRequest {
            granularity,
            entries: vec![RequestEntry {
                query: query.clone(),
                window,
            }],
        };
        let (widget_req, token) = self.explore(&request, RELATED_QUERIES_WIDGET).await?;
        let req = widget_req.to_string();
        let body = self
            .get(
                URL_RELATED,
                &[
                    ("hl", self.language.as_str()),
                    ("tz", TZ_OFFSET_MINUTES),
                    ("req", req.as_str()),
                    ("token", token.as_str()),
                ],
            )
            .await?;

        let related = parse_related(&body, query, window)?;
        info!(
            "Related queries fetched - query={}, top={}, rising={}, duration={:.2}s",
            query.label(),
            related.top.len(),
            related.rising.len(),
            start.elapsed().as_secs_f32()
        );
        Ok(related)
    }

    async fn get(&self, url: &str, params: &[(&str, &str)]) -> Result<String, TransportError> {
        let resp = self
            .client
            .get(url)
            .query(params)
            .send()
            .await
            .map_err(request_error)?;
        if !resp.status().is_success() {
            return Err(status_error(resp.status(), resp.headers(), url));
        }
        resp.text().await.map_err(request_error)
    }
}

#[async_trait]
impl TransportGateway for TrendsGateway {
    async fn fetch(&self, request: &BundleRequest) -> Result<RawResponse, TransportError> {
        let start = Instant::now();
        let (widget_req, token) = self.explore(request, TIMESERIES_WIDGET).await?;

        let shared = shares_window(request);
        let url = if shared { URL_MULTILINE } else { URL_MULTIRANGE };
        let req = widget_req.to_string();
        let body = self
            .get(
                url,
                &[
                    ("hl", self.language.as_str()),
                    ("tz", TZ_OFFSET_MINUTES),
                    ("req", req.as_str()),
                    ("token", token.as_str()),
                ],
            )
            .await?;

        let response = parse_timeline(&body, request, shared)?;
        debug!(
            "Trends bundle fetched - entries={}, endpoint={}, duration={:.2}s",
            request.entries.len(),
            if shared { "multiline" } else { "multirange" },
            start.elapsed().as_secs_f32()
        );
        Ok(response)
    }
}

/// The explore payload for one bundle. All entries must share a category,
/// the endpoint takes only one.
pub fn explore_request(request: &BundleRequest) -> Result<ExploreRequest, TransportError> {
    let category = match request.entries.first() {
        Some(entry) => entry.query.category(),
        None => return Err(TransportError::InvalidQuery("empty bundle".into())),
    };
    if request.entries.iter().any(|e| e.query.category() != category) {
        return Err(TransportError::InvalidQuery(
            "queries with different categories cannot share a request".into(),
        ));
    }
    Ok(ExploreRequest {
        comparisonItem: request
            .entries
            .iter()
            .map(|entry| ComparisonItem {
                keyword: entry.query.term().to_string(),
                time: format_window(&entry.window, request.granularity),
                geo: entry.query.geo().to_string(),
            })
            .collect(),
        category: category.code(),
        property: String::new(),
    })
}

/// Renders a half-open window the way the explore endpoint expects it:
/// both bounds inclusive, hours only for hourly data.
pub fn format_window(window: &Span, granularity: Granularity) -> String {
    match granularity {
        Granularity::Hour => {
            let last = window.end - ChronoDuration::hours(1);
            format!("{} {}", window.start.format("%Y-%m-%dT%H"), last.format("%Y-%m-%dT%H"))
        }
        Granularity::Day | Granularity::Month => {
            let last = window.end - ChronoDuration::days(1);
            format!("{} {}", window.start.format("%Y-%m-%d"), last.format("%Y-%m-%d"))
        }
    }
}

fn shares_window(request: &BundleRequest) -> bool {
    request
        .entries
        .windows(2)
        .all(|pair| pair[0].window == pair[1].window)
}

/// Drops the anti-XSSI guard (`)]}'` plus a separator) the API prepends.
pub fn strip_xssi(body: &str) -> &str {
    let rest = if body.starts_with(")]}'") {
        body.get(5..).unwrap_or_default()
    } else {
        body
    };
    rest.trim_start_matches([',', '\n', '\r', ' '])
}

/// Splits a widget-data body into one series per request entry.
///
/// Multirange pads shorter ranges to the longest one; cells outside their
/// entry's window are dropped.
pub fn parse_timeline(
    body: &str,
    request: &BundleRequest,
    shared_window: bool,
) -> Result<RawResponse, TransportError> {
    let timeline: TimelineResponse = serde_json::from_str(strip_xssi(body))
        .map_err(|e| TransportError::Decode(format!("timeline response: {e}")))?;
    let columns = request.entries.len();
    let mut series: Vec<Vec<Sample>> = vec![Vec::new(); columns];

    for row in &timeline.default.timelineData {
        if shared_window {
            let time = row
                .time
                .as_deref()
                .ok_or_else(|| TransportError::Decode("multiline row without time".into()))?;
            let timestamp = parse_unix(time)?;
            if row.value.len() < columns {
                return Err(TransportError::Decode(format!(
                    "multiline row has {} values, expected {columns}",
                    row.value.len()
                )));
            }
            for (column, value) in row.value.iter().take(columns).enumerate() {
                series[column].push(Sample { timestamp, value: *value });
            }
        } else {
            for (column, cell) in row.columnData.iter().take(columns).enumerate() {
                let timestamp = parse_unix(&cell.time)?;
                if request.entries[column].window.contains(timestamp) {
                    series[column].push(Sample { timestamp, value: cell.value });
                }
            }
        }
    }
    Ok(RawResponse { series })
}

/// Reads a related-searches body: the first ranked list is "top", the
/// second "rising". Either may be absent when the source has too little data.
pub fn parse_related(body: &str, query: &Query, window: Span) -> Result<RelatedQueries, TransportError> {
    let related: RelatedResponse = serde_json::from_str(strip_xssi(body))
        .map_err(|e| TransportError::Decode(format!("related searches response: {e}")))?;
    let mut lists = related.default.rankedList.into_iter().map(|list| {
        list.rankedKeyword
            .into_iter()
            .map(related_row)
            .collect::<Vec<_>>()
    });
    let top = lists.next().unwrap_or_default();
    let rising = lists.next().unwrap_or_default();
    Ok(RelatedQueries {
        query: query.clone(),
        window,
        top,
        rising,
    })
}

fn related_row(keyword: RankedKeyword) -> RelatedQuery {
    let link = if keyword.link.starts_with('/') {
        format!("{URL_TRENDS}{}", keyword.link)
    } else {
        keyword.link
    };
    RelatedQuery {
        query: keyword.query,
        value: keyword.value,
        formatted: keyword.formattedValue,
        link,
    }
}

fn parse_unix(raw: &str) -> Result<DateTime<Utc>, TransportError> {
    raw.trim()
        .parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .ok_or_else(|| TransportError::Decode(format!("bad timestamp '{raw}'")))
}

fn request_error(err: reqwest::Error) -> TransportError {
    TransportError::Transient(err.to_string())
}

fn status_error(status: StatusCode, headers: &header::HeaderMap, context: &str) -> TransportError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => TransportError::RateLimited {
            retry_after: headers
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs),
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            TransportError::Unauthorized(format!("{context}: HTTP {status}"))
        }
        StatusCode::BAD_REQUEST => TransportError::InvalidQuery(format!("{context}: HTTP {status}")),
        _ => TransportError::Transient(format!("{context}: HTTP {status}")),
    }
}
