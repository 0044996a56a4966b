use serde::Serialize;

use crate::models::Granularity;
use crate::out_models::NormalizedSeries;

fn timestamp_format(granularity: Granularity) -> &'static str {
    match granularity {
        Granularity::Hour => "%Y-%m-%dT%H:00:00Z",
        Granularity::Day => "%Y-%m-%d",
        Granularity::Month => "%Y-%m",
    }
}

/// One row per timestamp, one column per query. Gaps stay empty.
pub fn render_csv(series: &NormalizedSeries) -> csv::Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());

    let mut header = vec!["timestamp".to_string()];
    header.extend(series.columns.iter().map(|c| c.query.label()));
    writer.write_record(&header)?;

    let fmt = timestamp_format(series.granularity);
    for (row, ts) in series.timestamps.iter().enumerate() {
        let mut record = vec![ts.format(fmt).to_string()];
        record.extend(series.columns.iter().map(|column| {
            column
                .points
                .get(row)
                .and_then(|p| p.value())
                .map(|v| round2(v).to_string())
                .unwrap_or_default()
        }));
        writer.write_record(&record)?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| csv::Error::from(e.into_error()))?;
    String::from_utf8(bytes)
        .map_err(|e| csv::Error::from(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[derive(Serialize)]
struct JsonRow {
    timestamp: String,
    values: Vec<Option<f64>>,
}

#[derive(Serialize)]
struct JsonDocument<'a> {
    granularity: Granularity,
    columns: Vec<String>,
    rows: Vec<JsonRow>,
    series: &'a NormalizedSeries,
}

/// The compact table plus the full result (points, anchors, traces).
pub fn render_json(series: &NormalizedSeries) -> serde_json::Result<String> {
    let fmt = timestamp_format(series.granularity);
    let rows = series
        .timestamps
        .iter()
        .enumerate()
        .map(|(row, ts)| JsonRow {
            timestamp: ts.format(fmt).to_string(),
            values: series
                .columns
                .iter()
                .map(|c| c.points.get(row).and_then(|p| p.value()))
                .collect(),
        })
        .collect();
    let doc = JsonDocument {
        granularity: series.granularity,
        columns: series.columns.iter().map(|c| c.query.label()).collect(),
        rows,
        series,
    };
    serde_json::to_string_pretty(&doc)
}
