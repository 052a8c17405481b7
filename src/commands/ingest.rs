use crate::context::AppContext;
use crate::models::Provider;
use crate::pipeline::IntakePipeline;
use crate::sources::{load_raw_events, ExportFormat};
use anyhow::Result;
use chrono::Utc;
use log::info;
use std::path::Path;

pub async fn run(
    app: &AppContext,
    input: &Path,
    provider: Provider,
    format: Option<ExportFormat>,
    normalize: bool,
) -> Result<()> {
    let loaded = load_raw_events(input, provider, format, Utc::now())?;
    let db = app.database().await?;
    let settings = app.load_settings(&db).await?;
    let mut pipeline = IntakePipeline::new(db, settings);

    let summary = pipeline.ingest(&loaded.events).await?;
    info!(
        "Ingest finished for {}: {} new, {} duplicates, {} without id",
        input.display(),
        summary.inserted,
        summary.duplicates,
        loaded.skipped_without_id
    );

    if normalize {
        pipeline.normalize_pending().await?;
    }
    Ok(())
}
