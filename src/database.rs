use crate::models::*;
use crate::secrets::decrypt_settings;
use crate::storage::IntakeStore;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use log::error;
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use tokio_postgres::{Client, NoTls, Row};

// Keep a single transaction bounded when a large export is ingested at once.
const INSERT_CHUNK_SIZE: usize = 1_000;
const SCHEMA_SQL: &str = include_str!("../sql/schema.sql");

const RAW_EVENT_COLUMNS: &str =
    "id, provider, external_id, payload, received_at, processed_at, error";
const NORMALIZED_EVENT_COLUMNS: &str = "id, raw_event_id, provider, client_id, session_id, occurred_at, page_url, page_path, traffic_source, utm_source, utm_campaign, device, city, duration_seconds, page_views, goals, is_new_visitor";
const FEATURE_COLUMNS: &str = "client_id, computed_at, visits, page_views, total_duration_seconds, avg_duration_seconds, distinct_pages, pricing_hits, contact_hits, catalog_hits, goal_completions, returning, first_seen, last_seen, recency_days, primary_source, hot_score, segment";

pub struct Database {
    client: Client,
}

impl Database {
    pub async fn new<S: AsRef<str>>(database_url: S) -> Result<Self> {
        let database_url = database_url.as_ref().to_string();
        let (client, connection) = tokio_postgres::connect(&database_url, NoTls)
            .await
            .with_context(|| format!("failed to connect to PostgreSQL at {}", database_url))?;

        tokio::spawn(async move {
            if let Err(err) = connection.await {
                error!("PostgreSQL connection error: {}", err);
            }
        });

        Ok(Self { client })
    }

    pub async fn apply_schema(&self) -> Result<()> {
        self.client
            .batch_execute(SCHEMA_SQL)
            .await
            .context("failed to apply intake schema")
    }

    pub async fn get_all_settings(&self) -> Result<HashMap<String, String>> {
        let rows = self
            .client
            .query("SELECT setting_key, value FROM settings", &[])
            .await?;
        let stored: HashMap<String, String> = rows
            .iter()
            .map(|row| (row.get::<_, String>(0), row.get::<_, String>(1)))
            .collect();
        decrypt_settings(stored)
    }

    pub async fn upsert_setting(&self, key: &str, value: &str) -> Result<()> {
        self.client
            .execute(
                "INSERT INTO settings (setting_key, value, updated_at)
                 VALUES ($1, $2, NOW())
                 ON CONFLICT (setting_key) DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()",
                &[&key, &value],
            )
            .await?;
        Ok(())
    }

    pub async fn latest_intake_run(&self) -> Result<Option<IntakeRun>> {
        let row = self
            .client
            .query_opt(
                "SELECT id, started_at, finished_at, status, raw_received, raw_inserted, raw_duplicates,
                        normalized, normalize_failures, leads_scored, leads_written, error
                 FROM intake_runs
                 ORDER BY started_at DESC
                 LIMIT 1",
                &[],
            )
            .await?;
        row.map(|row| intake_run_from_row(&row)).transpose()
    }
}

impl IntakeStore for Database {
    async fn insert_raw_events(&mut self, events: &[RawEvent]) -> Result<usize> {
        if events.is_empty() {
            return Ok(0);
        }

        let mut inserted = 0u64;
        for chunk in events.chunks(INSERT_CHUNK_SIZE) {
            let tx = self.client.transaction().await?;
            let stmt = tx
                .prepare(
                    "INSERT INTO raw_events (id, provider, external_id, payload, received_at, processed_at, error)
                     VALUES ($1, $2, $3, $4, $5, $6, $7)
                     ON CONFLICT (provider, external_id) DO NOTHING",
                )
                .await?;
            for event in chunk {
                inserted += tx
                    .execute(
                        &stmt,
                        &[
                            &event.id,
                            &event.provider.as_str(),
                            &event.external_id,
                            &event.payload,
                            &event.received_at,
                            &event.processed_at,
                            &event.error,
                        ],
                    )
                    .await?;
            }
            tx.commit().await?;
        }

        Ok(inserted as usize)
    }

    async fn pending_raw_events(&self, limit: usize) -> Result<Vec<RawEvent>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = self
            .client
            .query(
                format!(
                    "SELECT {} FROM raw_events
                     WHERE processed_at IS NULL
                     ORDER BY received_at, id
                     LIMIT $1",
                    RAW_EVENT_COLUMNS
                )
                .as_str(),
                &[&limit],
            )
            .await?;
        rows.iter().map(raw_event_from_row).collect()
    }

    async fn mark_raw_events(&mut self, outcomes: &[RawEventOutcome]) -> Result<()> {
        if outcomes.is_empty() {
            return Ok(());
        }

        let tx = self.client.transaction().await?;
        let stmt = tx
            .prepare("UPDATE raw_events SET processed_at = $2, error = $3 WHERE id = $1")
            .await?;
        for outcome in outcomes {
            tx.execute(
                &stmt,
                &[&outcome.raw_event_id, &outcome.processed_at, &outcome.error],
            )
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn insert_normalized_events(&mut self, events: &[NormalizedEvent]) -> Result<usize> {
        if events.is_empty() {
            return Ok(0);
        }

        let mut inserted = 0u64;
        for chunk in events.chunks(INSERT_CHUNK_SIZE) {
            let tx = self.client.transaction().await?;
            let stmt = tx
                .prepare(&format!(
                    "INSERT INTO normalized_events ({})
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
                     ON CONFLICT (raw_event_id) DO NOTHING",
                    NORMALIZED_EVENT_COLUMNS
                ))
                .await?;
            for event in chunk {
                let goals = serde_json::to_value(&event.goals)?;
                inserted += tx
                    .execute(
                        &stmt,
                        &[
                            &event.id,
                            &event.raw_event_id,
                            &event.provider.as_str(),
                            &event.client_id,
                            &event.session_id,
                            &event.occurred_at,
                            &event.page_url,
                            &event.page_path,
                            &event.traffic_source,
                            &event.utm_source,
                            &event.utm_campaign,
                            &event.device.as_str(),
                            &event.city,
                            &event.duration_seconds,
                            &event.page_views,
                            &goals,
                            &event.is_new_visitor,
                        ],
                    )
                    .await?;
            }
            tx.commit().await?;
        }

        Ok(inserted as usize)
    }

    async fn normalized_events_since(&self, since: DateTime<Utc>) -> Result<Vec<NormalizedEvent>> {
        let rows = self
            .client
            .query(
                format!(
                    "SELECT {} FROM normalized_events
                     WHERE occurred_at >= $1
                     ORDER BY occurred_at, id",
                    NORMALIZED_EVENT_COLUMNS
                )
                .as_str(),
                &[&since],
            )
            .await?;
        rows.iter().map(normalized_event_from_row).collect()
    }

    async fn upsert_lead_features(&mut self, rows: &[LeadFeatures]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut written = 0u64;
        for chunk in rows.chunks(INSERT_CHUNK_SIZE) {
            let tx = self.client.transaction().await?;
            let stmt = tx
                .prepare(&format!(
                    "INSERT INTO feature_store ({})
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
                     ON CONFLICT (client_id) DO UPDATE SET
                        computed_at = EXCLUDED.computed_at,
                        visits = EXCLUDED.visits,
                        page_views = EXCLUDED.page_views,
                        total_duration_seconds = EXCLUDED.total_duration_seconds,
                        avg_duration_seconds = EXCLUDED.avg_duration_seconds,
                        distinct_pages = EXCLUDED.distinct_pages,
                        pricing_hits = EXCLUDED.pricing_hits,
                        contact_hits = EXCLUDED.contact_hits,
                        catalog_hits = EXCLUDED.catalog_hits,
                        goal_completions = EXCLUDED.goal_completions,
                        returning = EXCLUDED.returning,
                        first_seen = EXCLUDED.first_seen,
                        last_seen = EXCLUDED.last_seen,
                        recency_days = EXCLUDED.recency_days,
                        primary_source = EXCLUDED.primary_source,
                        hot_score = EXCLUDED.hot_score,
                        segment = EXCLUDED.segment",
                    FEATURE_COLUMNS
                ))
                .await?;
            for row in chunk {
                written += tx
                    .execute(
                        &stmt,
                        &[
                            &row.client_id,
                            &row.computed_at,
                            &row.visits,
                            &row.page_views,
                            &row.total_duration_seconds,
                            &row.avg_duration_seconds,
                            &row.distinct_pages,
                            &row.pricing_hits,
                            &row.contact_hits,
                            &row.catalog_hits,
                            &row.goal_completions,
                            &row.returning,
                            &row.first_seen,
                            &row.last_seen,
                            &row.recency_days,
                            &row.primary_source,
                            &row.hot_score,
                            &row.segment.as_str(),
                        ],
                    )
                    .await?;
            }
            tx.commit().await?;
        }

        Ok(written as usize)
    }

    async fn lead_features(&self, client_id: &str) -> Result<Option<LeadFeatures>> {
        let row = self
            .client
            .query_opt(
                format!(
                    "SELECT {} FROM feature_store WHERE client_id = $1",
                    FEATURE_COLUMNS
                )
                .as_str(),
                &[&client_id],
            )
            .await?;
        row.map(|row| lead_features_from_row(&row)).transpose()
    }

    async fn top_lead_features(
        &self,
        limit: usize,
        segment: Option<LeadSegment>,
    ) -> Result<Vec<LeadFeatures>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let segment = segment.map(|value| value.as_str());
        let rows = self
            .client
            .query(
                format!(
                    "SELECT {} FROM feature_store
                     WHERE ($2::TEXT IS NULL OR segment = $2)
                     ORDER BY hot_score DESC, client_id
                     LIMIT $1",
                    FEATURE_COLUMNS
                )
                .as_str(),
                &[&limit, &segment],
            )
            .await?;
        rows.iter().map(lead_features_from_row).collect()
    }

    async fn all_lead_features(&self) -> Result<Vec<LeadFeatures>> {
        let rows = self
            .client
            .query(
                format!(
                    "SELECT {} FROM feature_store ORDER BY hot_score DESC, client_id",
                    FEATURE_COLUMNS
                )
                .as_str(),
                &[],
            )
            .await?;
        rows.iter().map(lead_features_from_row).collect()
    }

    async fn lead_features_last_seen_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<LeadFeatures>> {
        let rows = self
            .client
            .query(
                format!(
                    "SELECT {} FROM feature_store WHERE last_seen < $1 ORDER BY client_id",
                    FEATURE_COLUMNS
                )
                .as_str(),
                &[&cutoff],
            )
            .await?;
        rows.iter().map(lead_features_from_row).collect()
    }

    async fn record_intake_run(&mut self, run: &IntakeRun) -> Result<()> {
        self.client
            .execute(
                "INSERT INTO intake_runs (id, started_at, finished_at, status, raw_received, raw_inserted,
                                          raw_duplicates, normalized, normalize_failures, leads_scored,
                                          leads_written, error)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                 ON CONFLICT (id) DO UPDATE SET
                    finished_at = EXCLUDED.finished_at,
                    status = EXCLUDED.status,
                    raw_received = EXCLUDED.raw_received,
                    raw_inserted = EXCLUDED.raw_inserted,
                    raw_duplicates = EXCLUDED.raw_duplicates,
                    normalized = EXCLUDED.normalized,
                    normalize_failures = EXCLUDED.normalize_failures,
                    leads_scored = EXCLUDED.leads_scored,
                    leads_written = EXCLUDED.leads_written,
                    error = EXCLUDED.error",
                &[
                    &run.id,
                    &run.started_at,
                    &run.finished_at,
                    &run.status.as_str(),
                    &run.raw_received,
                    &run.raw_inserted,
                    &run.raw_duplicates,
                    &run.normalized,
                    &run.normalize_failures,
                    &run.leads_scored,
                    &run.leads_written,
                    &run.error,
                ],
            )
            .await?;
        Ok(())
    }

    async fn insert_source_insights(
        &mut self,
        computed_at: DateTime<Utc>,
        insights: &[SourceInsight],
    ) -> Result<()> {
        if insights.is_empty() {
            return Ok(());
        }

        let tx = self.client.transaction().await?;
        for insight in insights {
            tx.execute(
                "INSERT INTO source_insights (computed_at, traffic_source, leads, hot_leads, warm_leads,
                                              cold_leads, avg_hot_score, median_hot_score, goal_conversion_rate)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
                &[
                    &computed_at,
                    &insight.traffic_source,
                    &insight.leads,
                    &insight.hot_leads,
                    &insight.warm_leads,
                    &insight.cold_leads,
                    &insight.avg_hot_score,
                    &insight.median_hot_score,
                    &insight.goal_conversion_rate,
                ],
            )
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn insert_system_log(
        &self,
        source: &str,
        level: &str,
        message: &str,
        metadata: Option<Value>,
    ) -> Result<()> {
        let created_at = Utc::now();
        let metadata_text = metadata.map(|value| value.to_string());

        self.client
            .execute(
                "INSERT INTO system_logs (source, level, message, metadata, created_at)
                 VALUES ($1, $2, $3, $4, $5)",
                &[&source, &level, &message, &metadata_text, &created_at],
            )
            .await?;

        Ok(())
    }
}

fn raw_event_from_row(row: &Row) -> Result<RawEvent> {
    let provider: String = row.get(1);
    Ok(RawEvent {
        id: row.get(0),
        provider: Provider::from_str(&provider)?,
        external_id: row.get(2),
        payload: row.get(3),
        received_at: row.get(4),
        processed_at: row.get(5),
        error: row.get(6),
    })
}

fn normalized_event_from_row(row: &Row) -> Result<NormalizedEvent> {
    let provider: String = row.get(2);
    let device: String = row.get(11);
    let goals: Value = row.get(15);
    let goals: Vec<String> =
        serde_json::from_value(goals).context("normalized_events.goals must be a string array")?;
    Ok(NormalizedEvent {
        id: row.get(0),
        raw_event_id: row.get(1),
        provider: Provider::from_str(&provider)?,
        client_id: row.get(3),
        session_id: row.get(4),
        occurred_at: row.get(5),
        page_url: row.get(6),
        page_path: row.get(7),
        traffic_source: row.get(8),
        utm_source: row.get(9),
        utm_campaign: row.get(10),
        device: DeviceKind::parse(&device),
        city: row.get(12),
        duration_seconds: row.get(13),
        page_views: row.get(14),
        goals,
        is_new_visitor: row.get(16),
    })
}

fn lead_features_from_row(row: &Row) -> Result<LeadFeatures> {
    let segment: String = row.get(17);
    Ok(LeadFeatures {
        client_id: row.get(0),
        computed_at: row.get(1),
        visits: row.get(2),
        page_views: row.get(3),
        total_duration_seconds: row.get(4),
        avg_duration_seconds: row.get(5),
        distinct_pages: row.get(6),
        pricing_hits: row.get(7),
        contact_hits: row.get(8),
        catalog_hits: row.get(9),
        goal_completions: row.get(10),
        returning: row.get(11),
        first_seen: row.get(12),
        last_seen: row.get(13),
        recency_days: row.get(14),
        primary_source: row.get(15),
        hot_score: row.get(16),
        segment: LeadSegment::from_str(&segment)
            .map_err(|err| anyhow!("invalid segment for {}: {}", row.get::<_, String>(0), err))?,
    })
}

fn intake_run_from_row(row: &Row) -> Result<IntakeRun> {
    let status: String = row.get(3);
    Ok(IntakeRun {
        id: row.get(0),
        started_at: row.get(1),
        finished_at: row.get(2),
        status: RunStatus::parse(&status)?,
        raw_received: row.get(4),
        raw_inserted: row.get(5),
        raw_duplicates: row.get(6),
        normalized: row.get(7),
        normalize_failures: row.get(8),
        leads_scored: row.get(9),
        leads_written: row.get(10),
        error: row.get(11),
    })
}
