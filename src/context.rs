use crate::alerts::AlertNotifier;
use crate::config::{apply_env_overrides, IntakeSettings};
use crate::database::Database;
use anyhow::{anyhow, Result};
use log::warn;
use std::collections::HashMap;

#[derive(Clone)]
pub struct AppContext {
    database_url: Option<String>,
}

impl AppContext {
    pub async fn initialize(database_url: Option<String>) -> Result<Self> {
        Ok(Self { database_url })
    }

    pub async fn database(&self) -> Result<Database> {
        let Some(database_url) = self.database_url.as_deref() else {
            return Err(anyhow!(
                "DATABASE_URL must be set to use database-backed intake commands."
            ));
        };
        Database::new(database_url).await
    }

    /// Stored settings with environment overrides applied on top.
    pub async fn load_settings(&self, db: &Database) -> Result<IntakeSettings> {
        let mut settings = db.get_all_settings().await?;
        apply_env_overrides(&mut settings);
        IntakeSettings::from_settings_map(&settings)
    }

    /// Settings from environment variables alone, for offline commands.
    pub fn load_env_settings(&self) -> Result<IntakeSettings> {
        let mut settings = HashMap::new();
        apply_env_overrides(&mut settings);
        IntakeSettings::from_settings_map(&settings)
    }

    pub fn alert_notifier(&self, settings: &IntakeSettings) -> Option<AlertNotifier> {
        let notifier = AlertNotifier::from_settings(
            settings.alert_webhook_url.as_deref(),
            &settings.alert_source_label,
        );
        if notifier.is_none() && settings.alert_webhook_url.is_some() {
            warn!("ALERT_WEBHOOK_URL is set but alerts could not be enabled");
        }
        notifier
    }
}
