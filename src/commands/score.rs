use crate::commands::top_leads::print_leads;
use crate::context::AppContext;
use crate::pipeline::IntakePipeline;
use crate::snapshot::NormalizedSnapshot;
use crate::storage::{IntakeStore, MemoryStore};
use anyhow::Result;
use chrono::Utc;
use log::info;
use std::path::Path;

pub async fn run(app: &AppContext, data_file: Option<&Path>, limit: usize) -> Result<()> {
    match data_file {
        Some(path) => run_offline(app, path, limit).await,
        None => run_database(app, limit).await,
    }
}

async fn run_database(app: &AppContext, limit: usize) -> Result<()> {
    let db = app.database().await?;
    let settings = app.load_settings(&db).await?;
    let mut pipeline = IntakePipeline::new(db, settings);
    let summary = pipeline.score(Utc::now()).await?;
    info!(
        "Scoring finished: {} leads scored, {} re-decayed, {} written",
        summary.leads_scored, summary.leads_decayed, summary.leads_written
    );
    let leads = pipeline.store().top_lead_features(limit, None).await?;
    print_leads(&leads);
    Ok(())
}

async fn run_offline(app: &AppContext, path: &Path, limit: usize) -> Result<()> {
    info!("Scoring offline from snapshot {}", path.display());
    let snapshot = NormalizedSnapshot::load_from_file(path)?;
    info!(
        "Loaded {} normalized events generated at {}",
        snapshot.events.len(),
        snapshot.generated_at.to_rfc3339()
    );

    let settings = app.load_env_settings()?;
    let store = MemoryStore::with_normalized_events(snapshot.events);
    let mut pipeline = IntakePipeline::new(store, settings);
    let summary = pipeline.score(Utc::now()).await?;
    info!("Scored {} leads offline", summary.leads_scored);

    let leads = pipeline.store().top_lead_features(limit, None).await?;
    print_leads(&leads);
    Ok(())
}
