use crate::context::AppContext;
use crate::snapshot::NormalizedSnapshot;
use crate::storage::IntakeStore;
use anyhow::Result;
use chrono::{Duration, Utc};
use log::info;
use std::path::Path;

pub async fn run(app: &AppContext, output_path: &Path, lookback_days: Option<i64>) -> Result<()> {
    let db = app.database().await?;
    let settings = app.load_settings(&db).await?;
    let lookback_days = lookback_days.unwrap_or(settings.feature_lookback_days);
    let now = Utc::now();
    let since = now - Duration::days(lookback_days);
    info!(
        "Generating normalized event snapshot since {} at {}",
        since.format("%Y-%m-%d"),
        output_path.display()
    );

    let events = db.normalized_events_since(since).await?;
    let count = events.len();
    NormalizedSnapshot::new(events, now).save_to_file(output_path)?;
    info!(
        "Snapshot with {} events successfully written to {}",
        count,
        output_path.display()
    );
    Ok(())
}
