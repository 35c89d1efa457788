use crate::context::AppContext;
use anyhow::Result;
use log::info;

/// Creates the schema. Safe to run repeatedly.
pub async fn run(app: &AppContext) -> Result<()> {
    let db = app.database().await?;
    db.init_schema().await?;
    info!("Schema initialized");
    Ok(())
}
