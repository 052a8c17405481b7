use crate::commands::insights::print_insights;
use crate::context::AppContext;
use crate::models::{Provider, RawEvent};
use crate::pipeline::IntakePipeline;
use crate::sources::{load_raw_events, ExportFormat};
use anyhow::Result;
use chrono::Utc;
use log::{error, info};
use std::path::PathBuf;
use std::time::Duration;

pub async fn run(
    app: &AppContext,
    inputs: &[PathBuf],
    provider: Provider,
    format: Option<ExportFormat>,
    interval_secs: Option<u64>,
) -> Result<()> {
    let db = app.database().await?;
    let settings = app.load_settings(&db).await?;
    if let Some(last) = db.latest_intake_run().await? {
        info!(
            "Previous intake run {} started {} finished as {}",
            last.id,
            last.started_at.to_rfc3339(),
            last.status.as_str()
        );
    }
    let alerts = app.alert_notifier(&settings);
    let mut pipeline = IntakePipeline::new(db, settings).with_alerts(alerts);

    let Some(interval_secs) = interval_secs else {
        let events = load_inputs(inputs, provider, format)?;
        let summary = pipeline.run_once(&events, Utc::now()).await?;
        print_insights(&summary.insights);
        return Ok(());
    };

    info!(
        "Watching {} input file(s) every {}s",
        inputs.len(),
        interval_secs
    );
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    loop {
        interval.tick().await;
        // Rows already stored are skipped on re-read.
        let events = match load_inputs(inputs, provider, format) {
            Ok(events) => events,
            Err(e) => {
                error!("Failed to load intake inputs: {:#}", e);
                continue;
            }
        };
        if let Ok(summary) = pipeline.run_once(&events, Utc::now()).await {
            info!(
                "Run {} finished; next run in {}s",
                summary.run.id, interval_secs
            );
        }
    }
}

fn load_inputs(
    inputs: &[PathBuf],
    provider: Provider,
    format: Option<ExportFormat>,
) -> Result<Vec<RawEvent>> {
    let received_at = Utc::now();
    let mut events = Vec::new();
    for input in inputs {
        let loaded = load_raw_events(input, provider, format, received_at)?;
        events.extend(loaded.events);
    }
    Ok(events)
}
