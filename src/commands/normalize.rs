use crate::context::AppContext;
use crate::pipeline::IntakePipeline;
use anyhow::Result;
use log::info;

pub async fn run(app: &AppContext) -> Result<()> {
    let db = app.database().await?;
    let settings = app.load_settings(&db).await?;
    let mut pipeline = IntakePipeline::new(db, settings);
    let summary = pipeline.normalize_pending().await?;
    info!(
        "Normalization finished: {} normalized, {} failed",
        summary.normalized, summary.failed
    );
    Ok(())
}
