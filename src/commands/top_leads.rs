use crate::context::AppContext;
use crate::models::{LeadFeatures, LeadSegment};
use crate::storage::IntakeStore;
use anyhow::Result;
use log::info;

pub async fn run(app: &AppContext, limit: usize, segment: Option<LeadSegment>) -> Result<()> {
    let db = app.database().await?;
    let leads = db.top_lead_features(limit, segment).await?;
    if leads.is_empty() {
        info!("No scored leads found");
        return Ok(());
    }
    print_leads(&leads);
    Ok(())
}

pub(crate) fn print_leads(leads: &[LeadFeatures]) {
    println!(
        "{:<4} {:<24} {:>6} {:<5} {:>6} {:>6} {:>5} {:>8} {:<16}",
        "#", "client", "score", "seg", "visits", "views", "goals", "recency", "source"
    );
    for (i, lead) in leads.iter().enumerate() {
        println!(
            "{:<4} {:<24} {:>6.1} {:<5} {:>6} {:>6} {:>5} {:>7}d {:<16}",
            i + 1,
            lead.client_id,
            lead.hot_score,
            lead.segment,
            lead.visits,
            lead.page_views,
            lead.goal_completions,
            lead.recency_days,
            lead.primary_source
        );
    }
}
