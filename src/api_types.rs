//! Wire shapes of the Google Trends explore and widget-data endpoints.
#![allow(non_snake_case)]

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize)]
pub struct ExploreRequest {
    pub comparisonItem: Vec<ComparisonItem>,
    pub category: u32,
    pub property: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComparisonItem {
    pub keyword: String,
    pub time: String,             // "2020-01-01 2020-03-31" or "2020-01-01T00 2020-01-07T23"
    pub geo: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExploreResponse {
    #[serde(default)]
    pub widgets: Vec<ExploreWidget>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExploreWidget {
    pub id: String,               // "TIMESERIES", "GEO_MAP", "RELATED_QUERIES", ...
    #[serde(default)]
    pub request: Option<Value>,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimelineResponse {
    pub default: TimelineDefault,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimelineDefault {
    #[serde(default)]
    pub timelineData: Vec<TimelineRow>,
}

/// One row of `multiline` (`time` + `value`) or `multirange` (`columnData`).
#[derive(Debug, Clone, Deserialize)]
pub struct TimelineRow {
    #[serde(default)]
    pub time: Option<String>,     // unix seconds as a string
    #[serde(default)]
    pub value: Vec<f64>,
    #[serde(default)]
    pub columnData: Vec<ColumnCell>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ColumnCell {
    pub time: String,
    pub value: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelatedResponse {
    pub default: RelatedDefault,
}

/// `rankedList[0]` holds the top queries, `rankedList[1]` the rising ones.
#[derive(Debug, Clone, Deserialize)]
pub struct RelatedDefault {
    #[serde(default)]
    pub rankedList: Vec<RankedList>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RankedList {
    #[serde(default)]
    pub rankedKeyword: Vec<RankedKeyword>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RankedKeyword {
    pub query: String,
    pub value: f64,               // relative volume (top) or growth in percent (rising)
    #[serde(default)]
    pub formattedValue: String,   // "100", "+250%", "Breakout"
    #[serde(default)]
    pub link: String,             // "/trends/explore?q=...&date=...&geo=..."
}
