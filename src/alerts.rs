use anyhow::{anyhow, Context, Result};
use serde_json::json;
use std::time::Duration;

const ALERT_TIMEOUT_SECS: u64 = 10;
const MAX_RETRIES: u32 = 3;
const BASE_DELAY_MS: u64 = 1000;
const MAX_DELAY_MS: u64 = 10000;

/// Posts `{"text": ...}` alerts to a chat webhook. Delivery problems are
/// logged and never surface to the caller.
#[derive(Clone)]
pub struct AlertNotifier {
    client: reqwest::Client,
    webhook_url: String,
    source_label: String,
}

impl AlertNotifier {
    pub fn new(webhook_url: &str, source_label: &str) -> Result<Self> {
        let client = build_async_client(Some(Duration::from_secs(ALERT_TIMEOUT_SECS)))?;
        Ok(Self {
            client,
            webhook_url: webhook_url.to_string(),
            source_label: source_label.to_string(),
        })
    }

    /// Returns `None` when no webhook is configured or the client cannot be built.
    pub fn from_settings(webhook_url: Option<&str>, source_label: &str) -> Option<Self> {
        let url = webhook_url?.trim();
        if url.is_empty() {
            return None;
        }
        match Self::new(url, source_label) {
            Ok(notifier) => Some(notifier),
            Err(e) => {
                log::warn!("Alerts disabled: {:#}", e);
                None
            }
        }
    }

    pub fn format_failure(&self, stage: &str, run_id: &str, error: &str) -> String {
        format!(
            "[{}] intake run {} failed during {}: {}",
            self.source_label, run_id, stage, error
        )
    }

    pub async fn notify_failure(&self, stage: &str, run_id: &str, error: &str) {
        let text = self.format_failure(stage, run_id, error);
        if let Err(e) = self.send_with_backoff(&text).await {
            log::warn!("Failed to deliver alert for run {}: {:#}", run_id, e);
        }
    }

    async fn send_with_backoff(&self, text: &str) -> Result<()> {
        let mut last_error = None;

        for attempt in 0..=MAX_RETRIES {
            match self.send(text).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    last_error = Some(e);
                    if attempt < MAX_RETRIES {
                        let final_delay = backoff_delay_ms(attempt);
                        log::debug!(
                            "Alert attempt {} failed, retrying in {}ms",
                            attempt + 1,
                            final_delay
                        );
                        tokio::time::sleep(Duration::from_millis(final_delay)).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("alert delivery exhausted attempts")))
    }

    async fn send(&self, text: &str) -> Result<()> {
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&json!({ "text": text }))
            .send()
            .await
            .context("alert webhook request failed")?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("alert webhook responded with {}", status));
        }
        Ok(())
    }
}

fn backoff_delay_ms(attempt: u32) -> u64 {
    let delay_ms = (BASE_DELAY_MS * 2_u64.pow(attempt)).min(MAX_DELAY_MS);
    let jitter_range = (delay_ms as f64 * 0.25) as u64;
    let jitter = fastrand::u64(0..=jitter_range * 2);
    delay_ms.saturating_sub(jitter_range).saturating_add(jitter)
}

pub fn build_async_client(timeout: Option<Duration>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder.build().context("failed to build HTTP client")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_webhook_disables_alerts() {
        assert!(AlertNotifier::from_settings(None, "intake").is_none());
        assert!(AlertNotifier::from_settings(Some("  "), "intake").is_none());
    }

    #[test]
    fn failure_text_names_stage_and_run() {
        let notifier = AlertNotifier::new("http://127.0.0.1:9/hook", "crm-intake").unwrap();
        let text = notifier.format_failure("normalize", "run-1", "connection reset");
        assert_eq!(
            text,
            "[crm-intake] intake run run-1 failed during normalize: connection reset"
        );
    }

    #[test]
    fn backoff_stays_within_jitter_bounds() {
        for attempt in 0..5 {
            let base = (BASE_DELAY_MS * 2_u64.pow(attempt)).min(MAX_DELAY_MS);
            let delay = backoff_delay_ms(attempt);
            assert!(delay >= base - base / 4);
            assert!(delay <= base + base / 4);
        }
    }
}
