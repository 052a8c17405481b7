use crate::context::AppContext;
use crate::storage::IntakeStore;
use anyhow::{anyhow, Result};

pub async fn run(app: &AppContext, client_id: &str) -> Result<()> {
    let db = app.database().await?;
    let lead = db
        .lead_features(client_id)
        .await?
        .ok_or_else(|| anyhow!("No features stored for client {}", client_id))?;

    println!("Lead {}", lead.client_id);
    println!("  Hot score: {:.1} ({})", lead.hot_score, lead.segment);
    println!("  Visits: {}", lead.visits);
    println!("  Page views: {}", lead.page_views);
    println!(
        "  Time on site: {}s total, {:.0}s avg",
        lead.total_duration_seconds, lead.avg_duration_seconds
    );
    println!("  Distinct pages: {}", lead.distinct_pages);
    println!(
        "  Intent hits: pricing {}, contact {}, catalog {}",
        lead.pricing_hits, lead.contact_hits, lead.catalog_hits
    );
    println!("  Goal completions: {}", lead.goal_completions);
    println!("  Returning: {}", if lead.returning { "yes" } else { "no" });
    println!(
        "  Seen: {} .. {} ({} days ago)",
        lead.first_seen.format("%Y-%m-%d %H:%M"),
        lead.last_seen.format("%Y-%m-%d %H:%M"),
        lead.recency_days
    );
    println!("  Primary source: {}", lead.primary_source);
    println!("  Computed at: {}", lead.computed_at.to_rfc3339());
    Ok(())
}
