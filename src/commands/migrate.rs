use crate::context::AppContext;
use anyhow::Result;
use log::info;

pub async fn run(app: &AppContext) -> Result<()> {
    info!("Applying intake schema");
    let db = app.database().await?;
    db.apply_schema().await?;
    info!("Schema is up to date");
    Ok(())
}
