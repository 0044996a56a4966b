//! Arbitrary-length search-volume series from a source that rescales every
//! response to its own maximum.
//!
//! The interval is split into fragments the source can serve, the fragment
//! holding the global maximum is located by a bundled tournament, and every
//! fragment is then re-requested next to it so all values share one scale.

pub mod api_types;
pub mod assemble;
pub mod cancel;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod models;
pub mod orchestrator;
pub mod out_models;
pub mod planner;
pub mod reducer;
pub mod render;
pub mod stitch;
pub mod trends;

pub use cancel::{CancellationHandle, CancellationToken};
pub use config::{GapPolicy, MultivariateMode, RetryPolicy, StitchConfig};
pub use errors::{StitchError, TransportError};
pub use gateway::{RetryingGateway, TransportGateway};
pub use models::{BundleRequest, Category, Granularity, Interval, Query, RawResponse, Sample};
pub use orchestrator::{fetch_series, fetch_series_at};
pub use out_models::{NormalizedSeries, Point, RelatedQueries, RelatedQuery, SeriesColumn};
pub use trends::TrendsGateway;
