use crate::context::AppContext;
use crate::models::SourceInsight;
use crate::pipeline::IntakePipeline;
use anyhow::Result;
use chrono::Utc;
use log::info;

pub async fn run(app: &AppContext) -> Result<()> {
    let db = app.database().await?;
    let settings = app.load_settings(&db).await?;
    let mut pipeline = IntakePipeline::new(db, settings);
    let insights = pipeline.insights(Utc::now()).await?;
    if insights.is_empty() {
        info!("No scored leads to summarize");
        return Ok(());
    }
    print_insights(&insights);
    Ok(())
}

pub(crate) fn print_insights(insights: &[SourceInsight]) {
    println!(
        "{:<20} {:>6} {:>5} {:>5} {:>5} {:>7} {:>7} {:>8}",
        "source", "leads", "hot", "warm", "cold", "avg", "median", "goal %"
    );
    for insight in insights {
        println!(
            "{:<20} {:>6} {:>5} {:>5} {:>5} {:>7.2} {:>7.2} {:>7.1}%",
            insight.traffic_source,
            insight.leads,
            insight.hot_leads,
            insight.warm_leads,
            insight.cold_leads,
            insight.avg_hot_score,
            insight.median_hot_score,
            insight.goal_conversion_rate * 100.0
        );
    }
}
