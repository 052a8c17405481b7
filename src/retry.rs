use crate::config::IntakeSettings;
use std::time::Duration;

/// Attempts and pause applied to every store call made by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &IntakeSettings) -> Self {
        Self {
            max_attempts: settings.store_retry_attempts.max(1),
            delay: Duration::from_millis(settings.store_retry_delay_ms),
        }
    }
}

/// Awaits `$operation` (re-created per attempt) until it succeeds or the
/// policy runs out of attempts. The last error is returned unchanged.
macro_rules! retry_db_operation {
    ($policy:expr, $context:expr, $operation:expr) => {{
        let policy: $crate::retry::RetryPolicy = $policy;
        let mut attempt = 1u32;

        loop {
            match ($operation).await {
                Ok(value) => break Ok(value),
                Err(err) if attempt >= policy.max_attempts => {
                    log::error!("Giving up on {} after {} attempts: {}", $context, attempt, err);
                    break Err(err);
                }
                Err(err) => {
                    log::warn!(
                        "Store call for {} failed (attempt {}/{}): {}. Retrying in {}ms.",
                        $context,
                        attempt,
                        policy.max_attempts,
                        err,
                        policy.delay.as_millis()
                    );
                    if !policy.delay.is_zero() {
                        tokio::time::sleep(policy.delay).await;
                    }
                    attempt += 1;
                }
            }
        }
    }};
}

pub(crate) use retry_db_operation;

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Result};

    fn immediate(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            delay: Duration::ZERO,
        }
    }

    #[test]
    fn policy_follows_settings() {
        let settings = IntakeSettings {
            store_retry_attempts: 0,
            store_retry_delay_ms: 250,
            ..IntakeSettings::default()
        };
        let policy = RetryPolicy::from_settings(&settings);
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.delay, Duration::from_millis(250));
    }

    #[tokio::test]
    async fn transient_store_errors_are_retried() {
        let mut calls = 0u32;
        let result: Result<u32> = retry_db_operation!(immediate(3), "loading pending raw events", async {
            calls += 1;
            if calls < 3 {
                Err(anyhow!("connection reset"))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn last_error_is_returned_after_final_attempt() {
        let mut calls = 0u32;
        let result: Result<()> = retry_db_operation!(immediate(2), "marking raw events processed", async {
            calls += 1;
            Err(anyhow!("raw_events is locked ({})", calls))
        });
        assert_eq!(calls, 2);
        assert_eq!(result.unwrap_err().to_string(), "raw_events is locked (2)");
    }
}
