use crate::models::{Provider, RawEvent};
use crate::normalize::{derive_external_id, ga4_rows_from_report, metrika_rows_from_tsv};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use serde_json::Value;
use std::fs;
use std::path::Path;

// Below this many rows a progress bar is just noise.
const PROGRESS_MIN_ROWS: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ExportFormat {
    /// One JSON payload object per line
    Jsonl,
    /// A JSON array of payload objects
    Json,
    /// A GA4 Data API runReport response
    Ga4Report,
    /// A Yandex Metrika Logs API TSV export
    MetrikaTsv,
}

#[derive(Debug)]
pub struct LoadedExport {
    pub events: Vec<RawEvent>,
    pub skipped_without_id: usize,
}

pub fn load_raw_events(
    path: &Path,
    provider: Provider,
    format: Option<ExportFormat>,
    received_at: DateTime<Utc>,
) -> Result<LoadedExport> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read export file {}", path.display()))?;
    let format = match format {
        Some(format) => format,
        None => infer_format(path, &text)?,
    };
    info!(
        "Loading {} export from {} as {:?}",
        provider,
        path.display(),
        format
    );

    let payloads = parse_payloads(&text, format)
        .with_context(|| format!("Failed to parse export file {}", path.display()))?;
    Ok(raw_events_from_payloads(payloads, provider, received_at))
}

pub fn parse_payloads(text: &str, format: ExportFormat) -> Result<Vec<Value>> {
    match format {
        ExportFormat::Jsonl => text
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(index, line)| {
                serde_json::from_str::<Value>(line)
                    .with_context(|| format!("Invalid JSON on line {}", index + 1))
            })
            .collect(),
        ExportFormat::Json => match serde_json::from_str::<Value>(text)? {
            Value::Array(items) => Ok(items),
            other @ Value::Object(_) => Ok(vec![other]),
            _ => Err(anyhow!("JSON export must be an array of objects")),
        },
        ExportFormat::Ga4Report => {
            let report: Value = serde_json::from_str(text)?;
            ga4_rows_from_report(&report)
        }
        ExportFormat::MetrikaTsv => metrika_rows_from_tsv(text),
    }
}

pub fn raw_events_from_payloads(
    payloads: Vec<Value>,
    provider: Provider,
    received_at: DateTime<Utc>,
) -> LoadedExport {
    let progress = if payloads.len() >= PROGRESS_MIN_ROWS {
        let pb = ProgressBar::new(payloads.len() as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        Some(pb)
    } else {
        None
    };

    let mut events = Vec::with_capacity(payloads.len());
    let mut skipped_without_id = 0usize;
    for payload in payloads {
        if let Some(pb) = progress.as_ref() {
            pb.inc(1);
        }
        let Some(external_id) = derive_external_id(provider, &payload) else {
            skipped_without_id += 1;
            continue;
        };
        events.push(RawEvent {
            id: uuid::Uuid::new_v4().to_string(),
            provider,
            external_id,
            payload,
            received_at,
            processed_at: None,
            error: None,
        });
    }

    if let Some(pb) = progress {
        pb.finish_with_message("Export loaded");
    }
    if skipped_without_id > 0 {
        warn!(
            "Skipped {} {} payloads without an identifying visit/session id",
            skipped_without_id, provider
        );
    }

    LoadedExport {
        events,
        skipped_without_id,
    }
}

fn infer_format(path: &Path, text: &str) -> Result<ExportFormat> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "tsv" | "txt" => Ok(ExportFormat::MetrikaTsv),
        "jsonl" | "ndjson" => Ok(ExportFormat::Jsonl),
        "json" => {
            let value: Value = serde_json::from_str(text).context("Export is not valid JSON")?;
            if value.get("rows").is_some() || value.get("dimensionHeaders").is_some() {
                Ok(ExportFormat::Ga4Report)
            } else {
                Ok(ExportFormat::Json)
            }
        }
        other => Err(anyhow!(
            "Cannot infer export format from extension {:?}; pass --format",
            other
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    #[test]
    fn infers_formats_from_extension_and_shape() {
        assert_eq!(
            infer_format(&PathBuf::from("visits.tsv"), "").unwrap(),
            ExportFormat::MetrikaTsv
        );
        assert_eq!(
            infer_format(&PathBuf::from("visits.NDJSON"), "").unwrap(),
            ExportFormat::Jsonl
        );
        assert_eq!(
            infer_format(&PathBuf::from("r.json"), r#"{"rows": []}"#).unwrap(),
            ExportFormat::Ga4Report
        );
        assert_eq!(
            infer_format(&PathBuf::from("r.json"), "[]").unwrap(),
            ExportFormat::Json
        );
        assert!(infer_format(&PathBuf::from("r.csv"), "").is_err());
    }

    #[test]
    fn jsonl_reports_bad_line_number() {
        let error = parse_payloads("{}\n\nnot json\n", ExportFormat::Jsonl).unwrap_err();
        assert!(error.to_string().contains("line 3"));
    }

    #[test]
    fn payloads_without_ids_are_skipped() {
        let loaded = raw_events_from_payloads(
            vec![
                json!({"ym:s:visitID": "1", "ym:s:clientID": "c"}),
                json!({"ym:s:clientID": "c"}),
            ],
            Provider::YandexMetrika,
            Utc::now(),
        );
        assert_eq!(loaded.events.len(), 1);
        assert_eq!(loaded.events[0].external_id, "1");
        assert_eq!(loaded.skipped_without_id, 1);
    }
}
