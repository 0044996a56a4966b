use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use clap::{Parser, ValueEnum};
use tracing::{debug, info, warn};

use svstitch::render::{render_csv, render_json};
use svstitch::{
    fetch_series, CancellationHandle, Category, GapPolicy, Granularity, Interval,
    MultivariateMode, Query, RetryingGateway, StitchConfig, TrendsGateway,
};

const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Format {
    Csv,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum GapArg {
    Hold,
    Mark,
}

/// svstitch - consistently scaled search-volume series of any length
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Search terms, one column each
    #[arg(required = true)]
    terms: Vec<String>,

    /// Region code applied to every term (empty for worldwide)
    #[arg(long, default_value = "")]
    geo: String,

    /// Category name or "none"
    #[arg(long, default_value = "none")]
    category: String,

    /// First bucket, YYYY-MM-DD or YYYY-MM-DDTHH (UTC)
    #[arg(long)]
    start: String,

    /// Exclusive end, YYYY-MM-DD or YYYY-MM-DDTHH (UTC)
    #[arg(long)]
    end: String,

    /// hour, day or month
    #[arg(long, default_value = "day")]
    granularity: String,

    /// JSON config file (overrides SVSTITCH_CONFIG environment variable)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    bundle_cap: Option<usize>,

    /// Concurrent requests per round. Raising it without pacing gets the
    /// client blocked quickly
    #[arg(long)]
    parallelism: Option<usize>,

    /// Pause after each successful request in milliseconds (default 10000, 0 disables)
    #[arg(long)]
    pacing_ms: Option<u64>,

    #[arg(long, value_enum)]
    gap_policy: Option<GapArg>,

    /// Put all terms on one shared scale
    #[arg(long)]
    joint: bool,

    /// Print top and rising related queries per term as JSON instead of a series
    #[arg(long)]
    related: bool,

    #[arg(long, value_enum, default_value = "csv")]
    format: Format,

    /// Output file (default: stdout)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Per-request timeout in seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Interface language sent to the source
    #[arg(long, default_value = "en-US")]
    language: String,
}

fn parse_bound(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    let naive = if raw.contains('T') {
        NaiveDateTime::parse_from_str(&format!("{raw}:00"), "%Y-%m-%dT%H:%M")
            .with_context(|| format!("invalid hour bound '{raw}'"))?
    } else {
        let date = if raw.len() == 7 {
            NaiveDate::parse_from_str(&format!("{raw}-01"), "%Y-%m-%d")
        } else {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        }
        .with_context(|| format!("invalid date bound '{raw}'"))?;
        date.and_hms_opt(0, 0, 0)
            .ok_or_else(|| anyhow::anyhow!("invalid date bound '{raw}'"))?
    };
    Ok(Utc.from_utc_datetime(&naive))
}

fn load_config(args: &Args) -> Result<StitchConfig> {
    let path = args
        .config
        .clone()
        .or_else(|| std::env::var("SVSTITCH_CONFIG").ok().map(PathBuf::from));

    let mut config = match path {
        Some(path) => {
            debug!("Using config file: {}", path.display());
            StitchConfig::from_json_file(&path)?
        }
        None => {
            debug!("No config file given, using defaults");
            StitchConfig::default()
        }
    };

    if let Some(cap) = args.bundle_cap {
        config.bundle_cap = cap;
    }
    if let Some(parallelism) = args.parallelism {
        config.parallelism = parallelism;
    }
    if let Some(pacing) = args.pacing_ms {
        config.retry.pacing_ms = pacing;
    }
    if let Some(gap) = args.gap_policy {
        config.gap_policy = match gap {
            GapArg::Hold => GapPolicy::HoldLast,
            GapArg::Mark => GapPolicy::Mark,
        };
    }
    if args.joint {
        config.multivariate = MultivariateMode::Joint;
    }
    if let Some(secs) = args.timeout_secs {
        config.retry.request_timeout_ms = secs.saturating_mul(1000);
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
        )
        .with_target(false)
        .with_thread_ids(false)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    info!("Starting svstitch - terms={:?}", args.terms);

    let config = load_config(&args)?;
    let granularity: Granularity = args.granularity.parse()?;
    let category: Category = args.category.parse()?;
    let interval = Interval::new(parse_bound(&args.start)?, parse_bound(&args.end)?, granularity)?;

    let queries: Vec<Query> = args
        .terms
        .iter()
        .map(|term| {
            Query::new(term.as_str())
                .with_geo(args.geo.as_str())
                .with_category(category)
        })
        .collect();

    let http_timeout = config
        .retry
        .request_timeout()
        .unwrap_or(Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS));
    let trends = TrendsGateway::connect(&args.language, http_timeout)
        .await
        .context("connecting to Google Trends")?;

    if args.related {
        let mut related = Vec::with_capacity(queries.len());
        for query in &queries {
            let rows = trends
                .related_queries(query, interval.span(), granularity)
                .await
                .with_context(|| format!("fetching related queries for '{}'", query.label()))?;
            related.push(rows);
        }
        let rendered =
            serde_json::to_string_pretty(&related).context("serializing related queries")?;
        return write_output(args.output.as_deref(), &rendered);
    }

    let gateway = RetryingGateway::new(trends, config.retry.clone());

    let handle = CancellationHandle::new();
    let token = handle.token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling");
            handle.cancel();
        }
    });

    let series = fetch_series(&gateway, &queries, &interval, &config, &token).await?;

    let rendered = match args.format {
        Format::Csv => render_csv(&series).context("writing CSV")?,
        Format::Json => render_json(&series).context("serializing series")?,
    };

    write_output(args.output.as_deref(), &rendered)?;
    info!(
        "Series done - points={}, requests={}",
        series.len(),
        series.requests
    );
    Ok(())
}

fn write_output(path: Option<&Path>, rendered: &str) -> Result<()> {
    match path {
        Some(path) => {
            std::fs::write(path, rendered)
                .with_context(|| format!("writing {}", path.display()))?;
            info!("Output written - path={}, bytes={}", path.display(), rendered.len());
        }
        None => print!("{rendered}"),
    }
    Ok(())
}
