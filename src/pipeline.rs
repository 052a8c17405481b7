use crate::alerts::AlertNotifier;
use crate::cache::FeatureCache;
use crate::config::IntakeSettings;
use crate::features::{FeatureCalculator, FeatureRules};
use crate::insights::summarize_by_source;
use crate::intake_status::IntakeStatus;
use crate::models::{
    clamp_usize_to_i32, IntakeRun, LeadFeatures, NormalizedEvent, Provider, RawEvent,
    RawEventOutcome, RunStatus, SourceInsight,
};
use crate::normalize::normalize_event;
use crate::retry::{retry_db_operation, RetryPolicy};
use crate::storage::IntakeStore;
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use log::{error, info, warn};
use serde_json::json;
use std::collections::HashSet;

const SYSTEM_LOG_SOURCE: &str = "intake";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub received: usize,
    pub inserted: usize,
    pub duplicates: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NormalizeSummary {
    pub batches: usize,
    pub processed: usize,
    pub normalized: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScoreSummary {
    pub events: usize,
    pub leads_scored: usize,
    /// Stored leads with no events left in the lookback window, re-decayed.
    pub leads_decayed: usize,
    pub leads_written: usize,
    pub leads_unchanged: usize,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run: IntakeRun,
    pub ingest: IngestSummary,
    pub normalize: NormalizeSummary,
    pub score: ScoreSummary,
    pub insights: Vec<SourceInsight>,
}

/// Drives raw events through normalization, scoring and insights (L1 → L4).
pub struct IntakePipeline<S: IntakeStore> {
    store: S,
    settings: IntakeSettings,
    calculator: FeatureCalculator,
    cache: FeatureCache,
    status: IntakeStatus,
    retry: RetryPolicy,
    alerts: Option<AlertNotifier>,
}

impl<S: IntakeStore> IntakePipeline<S> {
    pub fn new(store: S, settings: IntakeSettings) -> Self {
        let calculator = FeatureCalculator::new(FeatureRules::from_settings(&settings));
        let cache = FeatureCache::from_ttl_secs(settings.feature_cache_ttl_secs);
        let status = IntakeStatus::new();
        status.set_phase("Idle");
        let retry = RetryPolicy::from_settings(&settings);
        Self {
            store,
            settings,
            calculator,
            cache,
            status,
            retry,
            alerts: None,
        }
    }

    pub fn with_alerts(mut self, alerts: Option<AlertNotifier>) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    pub fn settings(&self) -> &IntakeSettings {
        &self.settings
    }

    pub fn cache(&self) -> &FeatureCache {
        &self.cache
    }

    pub fn status_handle(&self) -> IntakeStatus {
        self.status.clone()
    }

    /// Stores raw events, ignoring repeats of `(provider, external_id)` both
    /// inside the batch and against what is already stored.
    pub async fn ingest(&mut self, events: &[RawEvent]) -> Result<IngestSummary> {
        self.status.set_phase("Ingesting raw events");
        self.status.set_total(events.len());

        let mut seen: HashSet<(Provider, &str)> = HashSet::with_capacity(events.len());
        let unique: Vec<RawEvent> = events
            .iter()
            .filter(|event| seen.insert((event.provider, event.external_id.as_str())))
            .cloned()
            .collect();

        let inserted = if unique.is_empty() {
            0
        } else {
            retry_db_operation!(self.retry, "inserting raw events", async {
                self.store.insert_raw_events(&unique).await
            })?
        };

        let summary = IngestSummary {
            received: events.len(),
            inserted,
            duplicates: events.len().saturating_sub(inserted),
        };
        self.status.record_progress(events.len(), 0);
        info!(
            "Ingested {} raw events ({} new, {} duplicates)",
            summary.received, summary.inserted, summary.duplicates
        );
        Ok(summary)
    }

    /// Normalizes every pending raw event in batches. Failed rows are marked
    /// processed with the failure reason and are not retried.
    pub async fn normalize_pending(&mut self) -> Result<NormalizeSummary> {
        self.status.set_phase("Normalizing raw events");
        let batch_size = self.settings.normalize_batch_size.max(1);
        let mut summary = NormalizeSummary::default();

        loop {
            let pending = retry_db_operation!(self.retry, "loading pending raw events", async {
                self.store.pending_raw_events(batch_size).await
            })?;
            if pending.is_empty() {
                break;
            }

            let processed_at = Utc::now();
            let mut normalized: Vec<NormalizedEvent> = Vec::with_capacity(pending.len());
            let mut outcomes: Vec<RawEventOutcome> = Vec::with_capacity(pending.len());
            let mut failed = 0usize;

            for raw in &pending {
                let error = match normalize_event(raw) {
                    Ok(event) => {
                        normalized.push(event);
                        None
                    }
                    Err(e) => {
                        warn!(
                            "Failed to normalize {} raw event {} ({}): {}",
                            raw.provider, raw.id, raw.external_id, e
                        );
                        failed += 1;
                        Some(e.to_string())
                    }
                };
                outcomes.push(RawEventOutcome {
                    raw_event_id: raw.id.clone(),
                    processed_at,
                    error,
                });
            }

            if !normalized.is_empty() {
                let inserted = retry_db_operation!(self.retry, "inserting normalized events", async {
                    self.store.insert_normalized_events(&normalized).await
                })?;
                if inserted < normalized.len() {
                    warn!(
                        "{} normalized events were already stored for their raw events",
                        normalized.len() - inserted
                    );
                }
            }
            retry_db_operation!(self.retry, "marking raw events processed", async {
                self.store.mark_raw_events(&outcomes).await
            })?;

            summary.batches += 1;
            summary.processed += pending.len();
            summary.normalized += normalized.len();
            summary.failed += failed;
            self.status.record_progress(pending.len() - failed, failed);
        }

        info!(
            "Normalized {} of {} raw events in {} batches ({} failed)",
            summary.normalized, summary.processed, summary.batches, summary.failed
        );
        Ok(summary)
    }

    /// Recomputes features for every lead active in the lookback window and
    /// re-decays stored leads whose last visit has fallen out of it. Rows the
    /// cache still holds unchanged are not rewritten.
    pub async fn score(&mut self, now: DateTime<Utc>) -> Result<ScoreSummary> {
        self.status.set_phase("Computing lead features");
        let since = now - Duration::days(self.settings.feature_lookback_days);
        let events = retry_db_operation!(self.retry, "loading normalized events", async {
            self.store.normalized_events_since(since).await
        })?;

        let purged = self.cache.purge_expired();
        if purged > 0 {
            info!("Evicted {} expired feature cache entries", purged);
        }

        let features = self.calculator.compute_all(&events, now);
        let leads_scored = features.len();

        let stale = retry_db_operation!(self.retry, "loading stale lead features", async {
            self.store.lead_features_last_seen_before(since).await
        })?;
        let fresh: HashSet<&str> = features.iter().map(|row| row.client_id.as_str()).collect();
        let mut decayed: Vec<LeadFeatures> = Vec::new();
        let mut stale_unchanged = 0usize;
        for stored in stale.iter().filter(|row| !fresh.contains(row.client_id.as_str())) {
            let rescored = self.calculator.rescore(stored, now);
            if rescored.recency_days == stored.recency_days
                && rescored.hot_score == stored.hot_score
                && rescored.segment == stored.segment
            {
                stale_unchanged += 1;
            } else {
                decayed.push(rescored);
            }
        }
        let leads_decayed = decayed.len() + stale_unchanged;
        self.status.set_total(leads_scored + leads_decayed);

        let (unchanged, mut changed): (Vec<LeadFeatures>, Vec<LeadFeatures>) = features
            .into_iter()
            .partition(|row| self.cache.is_unchanged(row));
        changed.extend(decayed);

        let leads_written = if changed.is_empty() {
            0
        } else {
            retry_db_operation!(self.retry, "upserting lead features", async {
                self.store.upsert_lead_features(&changed).await
            })?
        };
        for row in &changed {
            self.cache.insert(row.clone());
        }
        self.status.record_progress(leads_scored + leads_decayed, 0);

        let summary = ScoreSummary {
            events: events.len(),
            leads_scored,
            leads_decayed,
            leads_written,
            leads_unchanged: unchanged.len() + stale_unchanged,
        };
        info!(
            "Scored {} leads from {} events since {} and re-decayed {} older leads ({} written, {} unchanged)",
            summary.leads_scored,
            summary.events,
            since.format("%Y-%m-%d"),
            summary.leads_decayed,
            summary.leads_written,
            summary.leads_unchanged
        );
        Ok(summary)
    }

    /// Summarizes stored lead features per traffic source and persists them.
    pub async fn insights(&mut self, now: DateTime<Utc>) -> Result<Vec<SourceInsight>> {
        self.status.set_phase("Summarizing traffic sources");
        let features = retry_db_operation!(self.retry, "loading lead features", async {
            self.store.all_lead_features().await
        })?;
        let insights = summarize_by_source(&features, self.settings.insights_min_leads);
        if !insights.is_empty() {
            retry_db_operation!(self.retry, "storing source insights", async {
                self.store.insert_source_insights(now, &insights).await
            })?;
        }
        info!(
            "Summarized {} leads into {} traffic source insights",
            features.len(),
            insights.len()
        );
        Ok(insights)
    }

    /// One full intake pass. The run is recorded as `running` up front and
    /// finalized as `succeeded` or `failed`.
    pub async fn run_once(&mut self, events: &[RawEvent], now: DateTime<Utc>) -> Result<RunSummary> {
        let mut run = IntakeRun::start(now);
        retry_db_operation!(self.retry, "recording intake run start", async {
            self.store.record_intake_run(&run).await
        })?;
        info!("Intake run {} started", run.id);

        let mut stage = "ingest";
        let outcome = self.run_stages(events, now, &mut run, &mut stage).await;
        run.finished_at = Some(Utc::now());

        match outcome {
            Ok((ingest, normalize, score, insights)) => {
                run.status = RunStatus::Succeeded;
                retry_db_operation!(self.retry, "recording intake run result", async {
                    self.store.record_intake_run(&run).await
                })?;
                self.status.set_phase("Idle");
                info!(
                    "Intake run {} succeeded: {} raw in, {} normalized, {} leads written",
                    run.id, ingest.inserted, normalize.normalized, score.leads_written
                );
                Ok(RunSummary {
                    run,
                    ingest,
                    normalize,
                    score,
                    insights,
                })
            }
            Err(e) => {
                let message = format!("{:#}", e);
                run.status = RunStatus::Failed;
                run.error = Some(message.clone());
                error!("Intake run {} failed during {}: {}", run.id, stage, message);
                self.status.set_phase(format!("Failed during {}", stage));

                if let Err(record_error) = self.store.record_intake_run(&run).await {
                    warn!(
                        "Failed to record failure of intake run {}: {}",
                        run.id, record_error
                    );
                }
                self.log_failure(&run, stage, &message).await;
                if let Some(alerts) = self.alerts.as_ref() {
                    alerts.notify_failure(stage, &run.id, &message).await;
                }
                Err(e)
            }
        }
    }

    async fn run_stages(
        &mut self,
        events: &[RawEvent],
        now: DateTime<Utc>,
        run: &mut IntakeRun,
        stage: &mut &'static str,
    ) -> Result<(IngestSummary, NormalizeSummary, ScoreSummary, Vec<SourceInsight>)> {
        *stage = "ingest";
        let ingest = self.ingest(events).await?;
        run.raw_received = clamp_usize_to_i32(ingest.received);
        run.raw_inserted = clamp_usize_to_i32(ingest.inserted);
        run.raw_duplicates = clamp_usize_to_i32(ingest.duplicates);

        *stage = "normalize";
        let normalize = self.normalize_pending().await?;
        run.normalized = clamp_usize_to_i32(normalize.normalized);
        run.normalize_failures = clamp_usize_to_i32(normalize.failed);

        *stage = "score";
        let score = self.score(now).await?;
        run.leads_scored = clamp_usize_to_i32(score.leads_scored);
        run.leads_written = clamp_usize_to_i32(score.leads_written);

        *stage = "insights";
        let insights = self.insights(now).await?;

        Ok((ingest, normalize, score, insights))
    }

    async fn log_failure(&self, run: &IntakeRun, stage: &str, message: &str) {
        let metadata = json!({
            "run_id": run.id,
            "stage": stage,
            "raw_inserted": run.raw_inserted,
            "normalized": run.normalized,
        });
        if let Err(e) = self
            .store
            .insert_system_log(
                SYSTEM_LOG_SOURCE,
                "error",
                &format!("Intake run failed during {}: {}", stage, message),
                Some(metadata),
            )
            .await
        {
            warn!("Failed to persist intake failure log: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use serde_json::json;

    fn metrika_raw(visit_id: &str, client_id: &str, url: &str, when: &str) -> RawEvent {
        RawEvent {
            id: uuid::Uuid::new_v4().to_string(),
            provider: Provider::YandexMetrika,
            external_id: visit_id.to_string(),
            payload: json!({
                "ym:s:visitID": visit_id,
                "ym:s:clientID": client_id,
                "ym:s:dateTime": when,
                "ym:s:startURL": url,
                "ym:s:visitDuration": "120",
                "ym:s:pageViews": "3",
            }),
            received_at: Utc::now(),
            processed_at: None,
            error: None,
        }
    }

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-03-10T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[tokio::test]
    async fn ingest_dedupes_within_batch_and_against_store() {
        let mut pipeline = IntakePipeline::new(MemoryStore::new(), IntakeSettings::default());
        let first = metrika_raw("1", "c1", "https://shop.example/", "2024-03-09 10:00:00");
        let repeat = metrika_raw("1", "c1", "https://shop.example/", "2024-03-09 10:00:00");
        let second = metrika_raw("2", "c2", "https://shop.example/", "2024-03-09 11:00:00");

        let summary = pipeline
            .ingest(&[first.clone(), repeat, second])
            .await
            .unwrap();
        assert_eq!(
            summary,
            IngestSummary {
                received: 3,
                inserted: 2,
                duplicates: 1
            }
        );

        let again = pipeline.ingest(&[first]).await.unwrap();
        assert_eq!(again.inserted, 0);
        assert_eq!(again.duplicates, 1);
    }

    #[tokio::test]
    async fn normalize_drains_in_batches_and_records_failures() {
        let settings = IntakeSettings {
            normalize_batch_size: 2,
            ..IntakeSettings::default()
        };
        let mut pipeline = IntakePipeline::new(MemoryStore::new(), settings);
        let broken = metrika_raw("3", "c3", "https://shop.example/", "not a date");
        pipeline
            .ingest(&[
                metrika_raw("1", "c1", "https://shop.example/", "2024-03-09 10:00:00"),
                metrika_raw("2", "c2", "https://shop.example/", "2024-03-09 11:00:00"),
                broken,
            ])
            .await
            .unwrap();

        let summary = pipeline.normalize_pending().await.unwrap();
        assert_eq!(summary.batches, 2);
        assert_eq!(summary.processed, 3);
        assert_eq!(summary.normalized, 2);
        assert_eq!(summary.failed, 1);

        let store = pipeline.store();
        assert!(store.raw_events().iter().all(|raw| raw.processed_at.is_some()));
        let failed: Vec<&RawEvent> = store
            .raw_events()
            .iter()
            .filter(|raw| raw.error.is_some())
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].external_id, "3");
    }

    #[tokio::test]
    async fn unchanged_features_are_not_rewritten_while_cached() {
        let mut pipeline = IntakePipeline::new(MemoryStore::new(), IntakeSettings::default());
        pipeline
            .ingest(&[metrika_raw(
                "1",
                "c1",
                "https://shop.example/pricing",
                "2024-03-09 10:00:00",
            )])
            .await
            .unwrap();
        pipeline.normalize_pending().await.unwrap();

        let first = pipeline.score(now()).await.unwrap();
        assert_eq!(first.leads_written, 1);
        assert_eq!(pipeline.cache().len(), 1);

        let second = pipeline.score(now()).await.unwrap();
        assert_eq!(second.leads_scored, 1);
        assert_eq!(second.leads_written, 0);
        assert_eq!(second.leads_unchanged, 1);
    }

    #[tokio::test]
    async fn disabled_cache_rewrites_every_lead() {
        let settings = IntakeSettings {
            feature_cache_ttl_secs: 0,
            ..IntakeSettings::default()
        };
        let mut pipeline = IntakePipeline::new(MemoryStore::new(), settings);
        pipeline
            .ingest(&[metrika_raw(
                "1",
                "c1",
                "https://shop.example/",
                "2024-03-09 10:00:00",
            )])
            .await
            .unwrap();
        pipeline.normalize_pending().await.unwrap();
        pipeline.score(now()).await.unwrap();

        let again = pipeline.score(now()).await.unwrap();
        assert_eq!(again.leads_written, 1);
        assert!(pipeline.cache().is_empty());
    }

    #[tokio::test]
    async fn events_outside_lookback_are_ignored() {
        let mut pipeline = IntakePipeline::new(MemoryStore::new(), IntakeSettings::default());
        pipeline
            .ingest(&[metrika_raw(
                "1",
                "c1",
                "https://shop.example/",
                "2023-12-01 10:00:00",
            )])
            .await
            .unwrap();
        pipeline.normalize_pending().await.unwrap();

        let summary = pipeline.score(now()).await.unwrap();
        assert_eq!(summary.events, 0);
        assert_eq!(summary.leads_scored, 0);
    }
}
