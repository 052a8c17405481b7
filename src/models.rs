use anyhow::{anyhow, Result as AnyResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Provider {
    YandexMetrika,
    GoogleAnalytics,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::YandexMetrika => "yandex_metrika",
            Provider::GoogleAnalytics => "google_analytics",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> AnyResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "yandex_metrika" | "yandex-metrika" | "metrika" | "ym" => Ok(Provider::YandexMetrika),
            "google_analytics" | "google-analytics" | "ga4" | "ga" => {
                Ok(Provider::GoogleAnalytics)
            }
            other => Err(anyhow!("Unknown analytics provider: {}", other)),
        }
    }
}

/// Layer 1: a provider payload exactly as it was received.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawEvent {
    pub id: String,
    pub provider: Provider,
    pub external_id: String,
    pub payload: Value,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Outcome of normalizing one raw event. `error` is set when the payload was rejected.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEventOutcome {
    pub raw_event_id: String,
    pub processed_at: DateTime<Utc>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Desktop,
    Mobile,
    Tablet,
    Unknown,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Desktop => "desktop",
            DeviceKind::Mobile => "mobile",
            DeviceKind::Tablet => "tablet",
            DeviceKind::Unknown => "unknown",
        }
    }

    /// Accepts both provider names ("desktop", "smartphone") and Metrika's numeric codes.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "desktop" | "pc" => DeviceKind::Desktop,
            "2" | "mobile" | "smartphone" | "phone" => DeviceKind::Mobile,
            "3" | "tablet" => DeviceKind::Tablet,
            _ => DeviceKind::Unknown,
        }
    }
}

/// Layer 2: one visit mapped onto the provider-independent shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NormalizedEvent {
    pub id: String,
    pub raw_event_id: String,
    pub provider: Provider,
    pub client_id: String,
    pub session_id: String,
    pub occurred_at: DateTime<Utc>,
    pub page_url: String,
    pub page_path: String,
    pub traffic_source: String,
    pub utm_source: Option<String>,
    pub utm_campaign: Option<String>,
    pub device: DeviceKind,
    pub city: Option<String>,
    pub duration_seconds: i64,
    pub page_views: i32,
    pub goals: Vec<String>,
    pub is_new_visitor: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LeadSegment {
    Hot,
    Warm,
    Cold,
}

impl LeadSegment {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeadSegment::Hot => "hot",
            LeadSegment::Warm => "warm",
            LeadSegment::Cold => "cold",
        }
    }

    pub fn classify(score: f64, hot_threshold: f64, warm_threshold: f64) -> Self {
        if score >= hot_threshold {
            LeadSegment::Hot
        } else if score >= warm_threshold {
            LeadSegment::Warm
        } else {
            LeadSegment::Cold
        }
    }
}

impl fmt::Display for LeadSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for LeadSegment {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> AnyResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hot" => Ok(LeadSegment::Hot),
            "warm" => Ok(LeadSegment::Warm),
            "cold" => Ok(LeadSegment::Cold),
            other => Err(anyhow!("Unknown lead segment: {}", other)),
        }
    }
}

/// Layer 3: per-lead features stored in the feature store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LeadFeatures {
    pub client_id: String,
    pub computed_at: DateTime<Utc>,
    pub visits: i32,
    pub page_views: i32,
    pub total_duration_seconds: i64,
    pub avg_duration_seconds: f64,
    pub distinct_pages: i32,
    pub pricing_hits: i32,
    pub contact_hits: i32,
    pub catalog_hits: i32,
    pub goal_completions: i32,
    pub returning: bool,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub recency_days: i64,
    pub primary_source: String,
    pub hot_score: f64,
    pub segment: LeadSegment,
}

impl LeadFeatures {
    /// Compares the fields that come from visit data. `computed_at` and
    /// `recency_days` move with the clock and are ignored.
    pub fn same_activity(&self, other: &LeadFeatures) -> bool {
        self.client_id == other.client_id
            && self.visits == other.visits
            && self.page_views == other.page_views
            && self.total_duration_seconds == other.total_duration_seconds
            && self.distinct_pages == other.distinct_pages
            && self.pricing_hits == other.pricing_hits
            && self.contact_hits == other.contact_hits
            && self.catalog_hits == other.catalog_hits
            && self.goal_completions == other.goal_completions
            && self.returning == other.returning
            && self.first_seen == other.first_seen
            && self.last_seen == other.last_seen
            && self.primary_source == other.primary_source
            && self.hot_score == other.hot_score
            && self.segment == other.segment
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> AnyResult<Self> {
        match raw {
            "running" => Ok(RunStatus::Running),
            "succeeded" => Ok(RunStatus::Succeeded),
            "failed" => Ok(RunStatus::Failed),
            other => Err(anyhow!("Unknown intake run status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IntakeRun {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub raw_received: i32,
    pub raw_inserted: i32,
    pub raw_duplicates: i32,
    pub normalized: i32,
    pub normalize_failures: i32,
    pub leads_scored: i32,
    pub leads_written: i32,
    pub error: Option<String>,
}

impl IntakeRun {
    pub fn start(started_at: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            started_at,
            finished_at: None,
            status: RunStatus::Running,
            raw_received: 0,
            raw_inserted: 0,
            raw_duplicates: 0,
            normalized: 0,
            normalize_failures: 0,
            leads_scored: 0,
            leads_written: 0,
            error: None,
        }
    }
}

/// Layer 4: aggregate lead quality per traffic source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceInsight {
    pub traffic_source: String,
    pub leads: i32,
    pub hot_leads: i32,
    pub warm_leads: i32,
    pub cold_leads: i32,
    pub avg_hot_score: f64,
    pub median_hot_score: f64,
    pub goal_conversion_rate: f64,
}

pub(crate) fn clamp_usize_to_i32(value: usize) -> i32 {
    if value > i32::MAX as usize {
        i32::MAX
    } else {
        value as i32
    }
}
