use crate::config::{IntakeSettings, ScoreWeights};
use crate::models::{clamp_usize_to_i32, LeadFeatures, LeadSegment, NormalizedEvent};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};

const SECONDS_PER_MINUTE: f64 = 60.0;
const MAX_HOT_SCORE: f64 = 100.0;

#[derive(Debug, Clone)]
pub struct FeatureRules {
    pub pricing_keywords: Vec<String>,
    pub contact_keywords: Vec<String>,
    pub catalog_keywords: Vec<String>,
    pub weights: ScoreWeights,
    pub hot_threshold: f64,
    pub warm_threshold: f64,
    pub recency_half_life_days: f64,
}

impl FeatureRules {
    pub fn from_settings(settings: &IntakeSettings) -> Self {
        Self {
            pricing_keywords: settings.pricing_keywords.clone(),
            contact_keywords: settings.contact_keywords.clone(),
            catalog_keywords: settings.catalog_keywords.clone(),
            weights: settings.score_weights.clone(),
            hot_threshold: settings.hot_score_threshold,
            warm_threshold: settings.warm_score_threshold,
            recency_half_life_days: settings.recency_half_life_days,
        }
    }
}

impl Default for FeatureRules {
    fn default() -> Self {
        Self::from_settings(&IntakeSettings::default())
    }
}

/// Rule-based scoring of normalized visits into per-lead features.
pub struct FeatureCalculator {
    rules: FeatureRules,
}

impl FeatureCalculator {
    pub fn new(rules: FeatureRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &FeatureRules {
        &self.rules
    }

    /// Groups events by `client_id` and scores every lead. Rows come back
    /// sorted by score (highest first), then by client id.
    pub fn compute_all(&self, events: &[NormalizedEvent], now: DateTime<Utc>) -> Vec<LeadFeatures> {
        let mut by_client: HashMap<&str, Vec<&NormalizedEvent>> = HashMap::new();
        for event in events {
            by_client
                .entry(event.client_id.as_str())
                .or_default()
                .push(event);
        }

        let groups: Vec<(&str, Vec<&NormalizedEvent>)> = by_client.into_iter().collect();
        let mut features: Vec<LeadFeatures> = groups
            .par_iter()
            .filter_map(|(client_id, client_events)| {
                self.compute_lead(client_id, client_events, now)
            })
            .collect();

        features.sort_by(|a, b| {
            b.hot_score
                .partial_cmp(&a.hot_score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.client_id.cmp(&b.client_id))
        });
        features
    }

    /// Returns `None` when the lead has no events.
    pub fn compute_lead(
        &self,
        client_id: &str,
        events: &[&NormalizedEvent],
        now: DateTime<Utc>,
    ) -> Option<LeadFeatures> {
        let first_seen = events.iter().map(|event| event.occurred_at).min()?;
        let last_seen = events.iter().map(|event| event.occurred_at).max()?;

        let sessions: HashSet<&str> = events.iter().map(|event| event.session_id.as_str()).collect();
        let pages: HashSet<&str> = events.iter().map(|event| event.page_path.as_str()).collect();
        let visits = sessions.len();
        let page_views: i64 = events
            .iter()
            .map(|event| i64::from(event.page_views.max(0)))
            .sum();
        let total_duration_seconds: i64 = events
            .iter()
            .map(|event| event.duration_seconds.max(0))
            .sum();
        let avg_duration_seconds = if visits > 0 {
            total_duration_seconds as f64 / visits as f64
        } else {
            0.0
        };

        let pricing_hits = count_keyword_hits(events, &self.rules.pricing_keywords);
        let contact_hits = count_keyword_hits(events, &self.rules.contact_keywords);
        let catalog_hits = count_keyword_hits(events, &self.rules.catalog_keywords);
        let goal_completions: usize = events.iter().map(|event| event.goals.len()).sum();
        let returning = visits >= 2 || events.iter().any(|event| !event.is_new_visitor);

        let mut features = LeadFeatures {
            client_id: client_id.to_string(),
            computed_at: now,
            visits: clamp_usize_to_i32(visits),
            page_views: page_views.clamp(0, i64::from(i32::MAX)) as i32,
            total_duration_seconds,
            avg_duration_seconds,
            distinct_pages: clamp_usize_to_i32(pages.len()),
            pricing_hits: clamp_usize_to_i32(pricing_hits),
            contact_hits: clamp_usize_to_i32(contact_hits),
            catalog_hits: clamp_usize_to_i32(catalog_hits),
            goal_completions: clamp_usize_to_i32(goal_completions),
            returning,
            first_seen,
            last_seen,
            recency_days: 0,
            primary_source: primary_source(events),
            hot_score: 0.0,
            segment: LeadSegment::Cold,
        };
        self.apply_score(&mut features, now);
        Some(features)
    }

    /// Re-scores a stored row as of `now` from its activity counts. Used for
    /// leads with no events left in the lookback window, so their score keeps
    /// decaying from `last_seen`.
    pub fn rescore(&self, features: &LeadFeatures, now: DateTime<Utc>) -> LeadFeatures {
        let mut rescored = features.clone();
        self.apply_score(&mut rescored, now);
        rescored
    }

    fn apply_score(&self, features: &mut LeadFeatures, now: DateTime<Utc>) {
        let weights = &self.rules.weights;
        let mut raw_score = weights.visit.contribution(f64::from(features.visits))
            + weights.page_view.contribution(f64::from(features.page_views))
            + weights
                .engaged_minute
                .contribution(features.total_duration_seconds as f64 / SECONDS_PER_MINUTE)
            + weights.pricing_hit.contribution(f64::from(features.pricing_hits))
            + weights.contact_hit.contribution(f64::from(features.contact_hits))
            + weights.catalog_hit.contribution(f64::from(features.catalog_hits))
            + weights.goal.contribution(f64::from(features.goal_completions));
        if features.returning {
            raw_score += weights.returning_bonus;
        }

        features.computed_at = now;
        features.recency_days = (now - features.last_seen).num_days().max(0);
        features.hot_score = round_score(
            raw_score * recency_decay(features.recency_days, self.rules.recency_half_life_days),
        );
        features.segment = LeadSegment::classify(
            features.hot_score,
            self.rules.hot_threshold,
            self.rules.warm_threshold,
        );
    }
}

fn count_keyword_hits(events: &[&NormalizedEvent], keywords: &[String]) -> usize {
    if keywords.is_empty() {
        return 0;
    }
    events
        .iter()
        .filter(|event| {
            let path = event.page_path.to_lowercase();
            keywords.iter().any(|keyword| path.contains(keyword.as_str()))
        })
        .count()
}

fn primary_source(events: &[&NormalizedEvent]) -> String {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for event in events {
        *counts.entry(event.traffic_source.as_str()).or_default() += 1;
    }
    // BTreeMap iterates alphabetically, so the first maximum wins ties.
    let mut best: Option<(&str, usize)> = None;
    for (source, count) in counts {
        if best.map_or(true, |(_, best_count)| count > best_count) {
            best = Some((source, count));
        }
    }
    best.map(|(source, _)| source.to_string())
        .unwrap_or_else(|| "direct".to_string())
}

fn recency_decay(recency_days: i64, half_life_days: f64) -> f64 {
    if half_life_days <= 0.0 || recency_days <= 0 {
        return 1.0;
    }
    0.5_f64.powf(recency_days as f64 / half_life_days)
}

fn round_score(score: f64) -> f64 {
    if !score.is_finite() {
        return 0.0;
    }
    (score.clamp(0.0, MAX_HOT_SCORE) * 10.0).round() / 10.0
}
