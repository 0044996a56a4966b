use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, Months, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::StitchError;

/// Value the source assigns to the maximum of every response.
pub const PEAK: f64 = 100.0;

const PEAK_EPS: f64 = 1e-9;

pub fn is_peak(value: f64) -> bool {
    value >= PEAK - PEAK_EPS
}

/// Search categories understood by the source (numeric ids are the source's own).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Category {
    #[default]
    None,
    ArtsEntertainment,
    AutosVehicles,
    BeautyFitness,
    BooksLiterature,
    BusinessIndustrial,
    ComputersElectronics,
    Finance,
    FoodDrink,
    Games,
    Health,
    InternetTelecom,
    JobsEducation,
    LawGovernment,
    News,
    Science,
    Shopping,
    Sports,
    Travel,
}

impl Category {
    pub fn code(self) -> u32 {
        match self {
            Category::None => 0,
            Category::ArtsEntertainment => 3,
            Category::AutosVehicles => 47,
            Category::BeautyFitness => 44,
            Category::BooksLiterature => 22,
            Category::BusinessIndustrial => 12,
            Category::ComputersElectronics => 5,
            Category::Finance => 7,
            Category::FoodDrink => 71,
            Category::Games => 8,
            Category::Health => 45,
            Category::InternetTelecom => 13,
            Category::JobsEducation => 958,
            Category::LawGovernment => 19,
            Category::News => 16,
            Category::Science => 174,
            Category::Shopping => 18,
            Category::Sports => 20,
            Category::Travel => 67,
        }
    }
}

impl FromStr for Category {
    type Err = StitchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace(['-', ' '], "_");
        let category = match normalized.as_str() {
            "NONE" | "ALL" | "0" => Category::None,
            "ARTS_ENTERTAINMENT" => Category::ArtsEntertainment,
            "AUTOS_VEHICLES" => Category::AutosVehicles,
            "BEAUTY_FITNESS" => Category::BeautyFitness,
            "BOOKS_LITERATURE" => Category::BooksLiterature,
            "BUSINESS_INDUSTRIAL" => Category::BusinessIndustrial,
            "COMPUTERS_ELECTRONICS" => Category::ComputersElectronics,
            "FINANCE" => Category::Finance,
            "FOOD_DRINK" => Category::FoodDrink,
            "GAMES" => Category::Games,
            "HEALTH" => Category::Health,
            "INTERNET_TELECOM" => Category::InternetTelecom,
            "JOBS_EDUCATION" => Category::JobsEducation,
            "LAW_GOVERNMENT" => Category::LawGovernment,
            "NEWS" => Category::News,
            "SCIENCE" => Category::Science,
            "SHOPPING" => Category::Shopping,
            "SPORTS" => Category::Sports,
            "TRAVEL" => Category::Travel,
            _ => return Err(StitchError::InvalidQuery(format!("unknown category '{s}'"))),
        };
        Ok(category)
    }
}

/// One search term plus the context it is measured in. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Query {
    term: String,
    geo: String,
    category: Category,
}

impl Query {
    pub fn new(term: impl Into<String>) -> Self {
        Self {
            term: term.into(),
            geo: String::new(),
            category: Category::None,
        }
    }

    /// Region code, empty for worldwide. Stored upper-cased.
    pub fn with_geo(mut self, geo: impl Into<String>) -> Self {
        self.geo = geo.into().trim().to_ascii_uppercase();
        self
    }

    pub fn with_category(mut self, category: Category) -> Self {
        self.category = category;
        self
    }

    pub fn term(&self) -> &str {
        &self.term
    }

    pub fn geo(&self) -> &str {
        &self.geo
    }

    pub fn category(&self) -> Category {
        self.category
    }

    /// Column label used in rendered output.
    pub fn label(&self) -> String {
        if self.geo.is_empty() {
            self.term.clone()
        } else {
            format!("{}@{}", self.term, self.geo)
        }
    }
}

/// Sampling resolution of the requested series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Granularity {
    Hour,
    Day,
    Month,
}

impl Granularity {
    /// Whether `ts` sits on a sample boundary of this granularity.
    pub fn is_aligned(self, ts: DateTime<Utc>) -> bool {
        let on_hour = ts.minute() == 0 && ts.second() == 0 && ts.nanosecond() == 0;
        match self {
            Granularity::Hour => on_hour,
            Granularity::Day => on_hour && ts.hour() == 0,
            Granularity::Month => on_hour && ts.hour() == 0 && ts.day() == 1,
        }
    }

    /// The sample boundary following `ts`.
    pub fn next_tick(self, ts: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Granularity::Hour => ts.checked_add_signed(Duration::hours(1)),
            Granularity::Day => ts.checked_add_signed(Duration::days(1)),
            Granularity::Month => ts.checked_add_months(Months::new(1)),
        }
    }

    /// All sample boundaries inside `span`, in order.
    pub fn ticks(self, span: &Span) -> Vec<DateTime<Utc>> {
        let mut out = Vec::new();
        let mut cursor = Some(span.start);
        while let Some(ts) = cursor {
            if ts >= span.end {
                break;
            }
            out.push(ts);
            cursor = self.next_tick(ts);
        }
        out
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Granularity::Hour => "HOUR",
            Granularity::Day => "DAY",
            Granularity::Month => "MONTH",
        };
        f.write_str(s)
    }
}

impl FromStr for Granularity {
    type Err = StitchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "HOUR" | "H" => Ok(Granularity::Hour),
            "DAY" | "D" => Ok(Granularity::Day),
            "MONTH" | "M" => Ok(Granularity::Month),
            other => Err(StitchError::Config(format!("unknown granularity '{other}'"))),
        }
    }
}

/// Half-open time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Span {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start.format("%Y-%m-%dT%H:%M"), self.end.format("%Y-%m-%dT%H:%M"))
    }
}

/// Caller-requested range plus the resolution it should be sampled at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    span: Span,
    granularity: Granularity,
}

impl Interval {
    /// Structural checks only; source limits are checked by the planner.
    pub fn new(
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        granularity: Granularity,
    ) -> Result<Self, StitchError> {
        if end <= start {
            return Err(StitchError::InvalidInterval(format!(
                "end {end} must be after start {start}"
            )));
        }
        for (name, ts) in [("start", start), ("end", end)] {
            if !granularity.is_aligned(ts) {
                return Err(StitchError::InvalidInterval(format!(
                    "{name} {ts} is not aligned to a {granularity} boundary"
                )));
            }
        }
        Ok(Self {
            span: Span::new(start, end),
            granularity,
        })
    }

    pub fn span(&self) -> Span {
        self.span
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.span.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.span.end
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }
}

/// A contiguous piece of an interval small enough for one request.
///
/// `span` is the part of the interval this fragment owns; `window` is what is
/// actually requested and is only wider than `span` for a short tail fragment
/// that had to be widened to the source's minimum request span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fragment {
    pub index: usize,
    pub span: Span,
    pub window: Span,
}

/// A (query, fragment) pair; the unit a bundle is made of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BundleItem {
    /// Position of the query in the caller's query list.
    pub query: usize,
    pub fragment: Fragment,
}

impl BundleItem {
    /// Deterministic ordering used to break ties between peak holders.
    pub fn tie_key(&self) -> (DateTime<Utc>, usize) {
        (self.fragment.span.start, self.query)
    }
}

/// Up to B items normalized jointly by one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    pub items: Vec<BundleItem>,
}

impl Bundle {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Resolves query indices into what the gateway needs to see.
    pub fn to_request(
        &self,
        queries: &[Query],
        granularity: Granularity,
    ) -> Result<BundleRequest, StitchError> {
        let entries = self
            .items
            .iter()
            .map(|item| {
                queries
                    .get(item.query)
                    .map(|query| RequestEntry {
                        query: query.clone(),
                        window: item.fragment.window,
                    })
                    .ok_or_else(|| {
                        StitchError::InvalidQuery(format!("no query at position {}", item.query))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(BundleRequest {
            granularity,
            entries,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestEntry {
    pub query: Query,
    pub window: Span,
}

/// What the transport gateway is asked to fetch: one series per entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BundleRequest {
    pub granularity: Granularity,
    pub entries: Vec<RequestEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// One bundle's result: a series per bundle entry, in entry order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawResponse {
    pub series: Vec<Vec<Sample>>,
}

impl RawResponse {
    pub fn max_value(&self) -> f64 {
        self.series
            .iter()
            .flatten()
            .map(|s| s.value)
            .fold(0.0, f64::max)
    }

    /// True when there is no volume at all to normalize against.
    pub fn is_degenerate(&self) -> bool {
        self.series.iter().flatten().all(|s| s.value == 0.0)
    }
}

/// The item proven to hold the maximum of a normalization group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Anchor {
    pub item: BundleItem,
}
