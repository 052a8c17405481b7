use crate::models::{clamp_usize_to_i32, LeadFeatures, LeadSegment, SourceInsight};
use statrs::statistics::{Data, Median, Statistics};
use std::cmp::Ordering;
use std::collections::BTreeMap;

pub const OTHER_SOURCE_BUCKET: &str = "other";

/// Aggregates lead features per primary traffic source. Sources with fewer
/// than `min_leads` leads are folded into a single `other` bucket.
pub fn summarize_by_source(features: &[LeadFeatures], min_leads: usize) -> Vec<SourceInsight> {
    let mut groups: BTreeMap<&str, Vec<&LeadFeatures>> = BTreeMap::new();
    for row in features {
        groups
            .entry(row.primary_source.as_str())
            .or_default()
            .push(row);
    }

    let mut buckets: BTreeMap<String, Vec<&LeadFeatures>> = BTreeMap::new();
    for (source, rows) in groups {
        let bucket = if rows.len() < min_leads {
            OTHER_SOURCE_BUCKET.to_string()
        } else {
            source.to_string()
        };
        buckets.entry(bucket).or_default().extend(rows);
    }

    let mut insights: Vec<SourceInsight> = buckets
        .into_iter()
        .map(|(source, rows)| summarize_group(source, &rows))
        .collect();

    insights.sort_by(|a, b| {
        b.avg_hot_score
            .partial_cmp(&a.avg_hot_score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.traffic_source.cmp(&b.traffic_source))
    });
    insights
}

fn summarize_group(traffic_source: String, rows: &[&LeadFeatures]) -> SourceInsight {
    let count_segment = |segment: LeadSegment| {
        clamp_usize_to_i32(rows.iter().filter(|row| row.segment == segment).count())
    };
    let scores: Vec<f64> = rows.iter().map(|row| row.hot_score).collect();
    let converted = rows.iter().filter(|row| row.goal_completions > 0).count();

    let (avg_hot_score, median_hot_score, goal_conversion_rate) = if scores.is_empty() {
        (0.0, 0.0, 0.0)
    } else {
        (
            round_two(scores.clone().mean()),
            round_two(Data::new(scores).median()),
            round_two(converted as f64 / rows.len() as f64),
        )
    };

    SourceInsight {
        traffic_source,
        leads: clamp_usize_to_i32(rows.len()),
        hot_leads: count_segment(LeadSegment::Hot),
        warm_leads: count_segment(LeadSegment::Warm),
        cold_leads: count_segment(LeadSegment::Cold),
        avg_hot_score,
        median_hot_score,
        goal_conversion_rate,
    }
}

fn round_two(value: f64) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn lead(client_id: &str, source: &str, score: f64, segment: LeadSegment, goals: i32) -> LeadFeatures {
        let now = Utc::now();
        LeadFeatures {
            client_id: client_id.to_string(),
            computed_at: now,
            visits: 1,
            page_views: 1,
            total_duration_seconds: 0,
            avg_duration_seconds: 0.0,
            distinct_pages: 1,
            pricing_hits: 0,
            contact_hits: 0,
            catalog_hits: 0,
            goal_completions: goals,
            returning: false,
            first_seen: now,
            last_seen: now,
            recency_days: 0,
            primary_source: source.to_string(),
            hot_score: score,
            segment,
        }
    }

    #[test]
    fn groups_by_source_with_segment_counts_and_stats() {
        let rows = vec![
            lead("a", "ad", 80.0, LeadSegment::Hot, 1),
            lead("b", "ad", 50.0, LeadSegment::Warm, 0),
            lead("c", "ad", 20.0, LeadSegment::Cold, 0),
            lead("d", "organic", 10.0, LeadSegment::Cold, 0),
        ];
        let insights = summarize_by_source(&rows, 1);
        assert_eq!(insights.len(), 2);

        let ad = &insights[0];
        assert_eq!(ad.traffic_source, "ad");
        assert_eq!(ad.leads, 3);
        assert_eq!((ad.hot_leads, ad.warm_leads, ad.cold_leads), (1, 1, 1));
        assert_eq!(ad.avg_hot_score, 50.0);
        assert_eq!(ad.median_hot_score, 50.0);
        assert_eq!(ad.goal_conversion_rate, 0.33);
        assert_eq!(insights[1].traffic_source, "organic");
    }

    #[test]
    fn small_sources_fold_into_other() {
        let rows = vec![
            lead("a", "ad", 80.0, LeadSegment::Hot, 0),
            lead("b", "ad", 60.0, LeadSegment::Warm, 0),
            lead("c", "email", 30.0, LeadSegment::Cold, 0),
            lead("d", "social", 10.0, LeadSegment::Cold, 0),
        ];
        let insights = summarize_by_source(&rows, 2);
        let sources: Vec<&str> = insights.iter().map(|i| i.traffic_source.as_str()).collect();
        assert_eq!(sources, vec!["ad", OTHER_SOURCE_BUCKET]);
        assert_eq!(insights[1].leads, 2);
        assert_eq!(insights[1].avg_hot_score, 20.0);
    }

    #[test]
    fn empty_input_yields_no_insights() {
        assert!(summarize_by_source(&[], 1).is_empty());
    }
}
