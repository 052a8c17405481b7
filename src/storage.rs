use crate::models::*;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Persistence for the intake layers. Implemented by the Postgres
/// [`Database`](crate::database::Database) and by [`MemoryStore`].
#[allow(async_fn_in_trait)]
pub trait IntakeStore {
    /// Inserts raw events, skipping any whose `(provider, external_id)` is
    /// already stored. Returns the number of rows inserted.
    async fn insert_raw_events(&mut self, events: &[RawEvent]) -> Result<usize>;

    /// Oldest unprocessed raw events first.
    async fn pending_raw_events(&self, limit: usize) -> Result<Vec<RawEvent>>;

    async fn mark_raw_events(&mut self, outcomes: &[RawEventOutcome]) -> Result<()>;

    /// Inserts normalized events, skipping any whose `raw_event_id` already
    /// has a normalized row. Returns the number of rows inserted.
    async fn insert_normalized_events(&mut self, events: &[NormalizedEvent]) -> Result<usize>;

    async fn normalized_events_since(&self, since: DateTime<Utc>) -> Result<Vec<NormalizedEvent>>;

    async fn upsert_lead_features(&mut self, rows: &[LeadFeatures]) -> Result<usize>;

    async fn lead_features(&self, client_id: &str) -> Result<Option<LeadFeatures>>;

    async fn top_lead_features(
        &self,
        limit: usize,
        segment: Option<LeadSegment>,
    ) -> Result<Vec<LeadFeatures>>;

    async fn all_lead_features(&self) -> Result<Vec<LeadFeatures>>;

    /// Stored rows whose `last_seen` is strictly before `cutoff`.
    async fn lead_features_last_seen_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<LeadFeatures>>;

    async fn record_intake_run(&mut self, run: &IntakeRun) -> Result<()>;

    async fn insert_source_insights(
        &mut self,
        computed_at: DateTime<Utc>,
        insights: &[SourceInsight],
    ) -> Result<()>;

    async fn insert_system_log(
        &self,
        source: &str,
        level: &str,
        message: &str,
        metadata: Option<Value>,
    ) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct SystemLogEntry {
    pub source: String,
    pub level: String,
    pub message: String,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// In-process store used for offline scoring and tests.
#[derive(Default)]
pub struct MemoryStore {
    raw_events: Vec<RawEvent>,
    raw_keys: HashSet<(Provider, String)>,
    normalized_events: Vec<NormalizedEvent>,
    normalized_raw_ids: HashSet<String>,
    features: HashMap<String, LeadFeatures>,
    runs: Vec<IntakeRun>,
    insights: Vec<(DateTime<Utc>, SourceInsight)>,
    system_logs: std::sync::Mutex<Vec<SystemLogEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_normalized_events(events: Vec<NormalizedEvent>) -> Self {
        Self {
            normalized_raw_ids: events
                .iter()
                .map(|event| event.raw_event_id.clone())
                .collect(),
            normalized_events: events,
            ..Self::default()
        }
    }

    pub fn raw_events(&self) -> &[RawEvent] {
        &self.raw_events
    }

    pub fn normalized_events(&self) -> &[NormalizedEvent] {
        &self.normalized_events
    }

    pub fn runs(&self) -> &[IntakeRun] {
        &self.runs
    }

    pub fn insights(&self) -> &[(DateTime<Utc>, SourceInsight)] {
        &self.insights
    }

    pub fn system_logs(&self) -> Vec<SystemLogEntry> {
        self.system_logs
            .lock()
            .map(|logs| logs.clone())
            .unwrap_or_default()
    }
}

impl IntakeStore for MemoryStore {
    async fn insert_raw_events(&mut self, events: &[RawEvent]) -> Result<usize> {
        let mut inserted = 0;
        for event in events {
            if self
                .raw_keys
                .insert((event.provider, event.external_id.clone()))
            {
                self.raw_events.push(event.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn pending_raw_events(&self, limit: usize) -> Result<Vec<RawEvent>> {
        let mut pending: Vec<&RawEvent> = self
            .raw_events
            .iter()
            .filter(|event| event.processed_at.is_none())
            .collect();
        pending.sort_by(|a, b| a.received_at.cmp(&b.received_at).then(a.id.cmp(&b.id)));
        Ok(pending.into_iter().take(limit).cloned().collect())
    }

    async fn mark_raw_events(&mut self, outcomes: &[RawEventOutcome]) -> Result<()> {
        let by_id: HashMap<&str, &RawEventOutcome> = outcomes
            .iter()
            .map(|outcome| (outcome.raw_event_id.as_str(), outcome))
            .collect();
        for event in &mut self.raw_events {
            if let Some(outcome) = by_id.get(event.id.as_str()) {
                event.processed_at = Some(outcome.processed_at);
                event.error = outcome.error.clone();
            }
        }
        Ok(())
    }

    async fn insert_normalized_events(&mut self, events: &[NormalizedEvent]) -> Result<usize> {
        let mut inserted = 0;
        for event in events {
            if self.normalized_raw_ids.insert(event.raw_event_id.clone()) {
                self.normalized_events.push(event.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn normalized_events_since(&self, since: DateTime<Utc>) -> Result<Vec<NormalizedEvent>> {
        let mut events: Vec<NormalizedEvent> = self
            .normalized_events
            .iter()
            .filter(|event| event.occurred_at >= since)
            .cloned()
            .collect();
        events.sort_by(|a, b| a.occurred_at.cmp(&b.occurred_at).then(a.id.cmp(&b.id)));
        Ok(events)
    }

    async fn upsert_lead_features(&mut self, rows: &[LeadFeatures]) -> Result<usize> {
        for row in rows {
            self.features.insert(row.client_id.clone(), row.clone());
        }
        Ok(rows.len())
    }

    async fn lead_features(&self, client_id: &str) -> Result<Option<LeadFeatures>> {
        Ok(self.features.get(client_id).cloned())
    }

    async fn top_lead_features(
        &self,
        limit: usize,
        segment: Option<LeadSegment>,
    ) -> Result<Vec<LeadFeatures>> {
        let mut rows: Vec<LeadFeatures> = self
            .features
            .values()
            .filter(|row| segment.map_or(true, |wanted| row.segment == wanted))
            .cloned()
            .collect();
        sort_by_score(&mut rows);
        rows.truncate(limit);
        Ok(rows)
    }

    async fn all_lead_features(&self) -> Result<Vec<LeadFeatures>> {
        let mut rows: Vec<LeadFeatures> = self.features.values().cloned().collect();
        sort_by_score(&mut rows);
        Ok(rows)
    }

    async fn lead_features_last_seen_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<LeadFeatures>> {
        let mut rows: Vec<LeadFeatures> = self
            .features
            .values()
            .filter(|row| row.last_seen < cutoff)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        Ok(rows)
    }

    async fn record_intake_run(&mut self, run: &IntakeRun) -> Result<()> {
        match self.runs.iter_mut().find(|existing| existing.id == run.id) {
            Some(existing) => *existing = run.clone(),
            None => self.runs.push(run.clone()),
        }
        Ok(())
    }

    async fn insert_source_insights(
        &mut self,
        computed_at: DateTime<Utc>,
        insights: &[SourceInsight],
    ) -> Result<()> {
        self.insights
            .extend(insights.iter().cloned().map(|insight| (computed_at, insight)));
        Ok(())
    }

    async fn insert_system_log(
        &self,
        source: &str,
        level: &str,
        message: &str,
        metadata: Option<Value>,
    ) -> Result<()> {
        let mut logs = self
            .system_logs
            .lock()
            .map_err(|_| anyhow!("system log buffer lock poisoned"))?;
        logs.push(SystemLogEntry {
            source: source.to_string(),
            level: level.to_string(),
            message: message.to_string(),
            metadata,
            created_at: Utc::now(),
        });
        Ok(())
    }
}

pub(crate) fn sort_by_score(rows: &mut [LeadFeatures]) {
    rows.sort_by(|a, b| {
        b.hot_score
            .partial_cmp(&a.hot_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.client_id.cmp(&b.client_id))
    });
}
