use crate::models::LeadFeatures;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Clone)]
struct CachedFeatures {
    features: LeadFeatures,
    stored_at: Instant,
}

/// Time-bounded cache of the last feature row written per lead.
#[derive(Clone)]
pub struct FeatureCache {
    entries: Arc<DashMap<String, CachedFeatures>>,
    ttl: Duration,
}

impl FeatureCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            ttl,
        }
    }

    pub fn from_ttl_secs(ttl_secs: u64) -> Self {
        Self::new(Duration::from_secs(ttl_secs))
    }

    pub fn is_enabled(&self) -> bool {
        !self.ttl.is_zero()
    }

    pub fn get(&self, client_id: &str) -> Option<LeadFeatures> {
        self.get_at(client_id, Instant::now())
    }

    fn get_at(&self, client_id: &str, now: Instant) -> Option<LeadFeatures> {
        if !self.is_enabled() {
            return None;
        }
        let expired = match self.entries.get(client_id) {
            Some(entry) if !self.is_expired(entry.stored_at, now) => {
                return Some(entry.features.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(client_id);
        }
        None
    }

    pub fn insert(&self, features: LeadFeatures) {
        self.insert_at(features, Instant::now());
    }

    fn insert_at(&self, features: LeadFeatures, now: Instant) {
        if !self.is_enabled() {
            return;
        }
        self.entries.insert(
            features.client_id.clone(),
            CachedFeatures {
                features,
                stored_at: now,
            },
        );
    }

    /// True when a live entry describes the same activity as `features`.
    pub fn is_unchanged(&self, features: &LeadFeatures) -> bool {
        self.get(&features.client_id)
            .map(|cached| cached.same_activity(features))
            .unwrap_or(false)
    }

    pub fn invalidate(&self, client_id: &str) {
        self.entries.remove(client_id);
    }

    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    fn purge_expired_at(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| !self.is_expired(entry.stored_at, now));
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_expired(&self, stored_at: Instant, now: Instant) -> bool {
        now.saturating_duration_since(stored_at) >= self.ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LeadSegment;
    use chrono::Utc;

    fn features(client_id: &str, score: f64) -> LeadFeatures {
        let now = Utc::now();
        LeadFeatures {
            client_id: client_id.to_string(),
            computed_at: now,
            visits: 1,
            page_views: 1,
            total_duration_seconds: 60,
            avg_duration_seconds: 60.0,
            distinct_pages: 1,
            pricing_hits: 0,
            contact_hits: 0,
            catalog_hits: 0,
            goal_completions: 0,
            returning: false,
            first_seen: now,
            last_seen: now,
            recency_days: 0,
            primary_source: "direct".to_string(),
            hot_score: score,
            segment: LeadSegment::Cold,
        }
    }

    #[test]
    fn live_entries_are_returned_and_compared() {
        let cache = FeatureCache::from_ttl_secs(60);
        let row = features("a", 13.0);
        cache.insert(row.clone());

        assert_eq!(cache.get("a").map(|f| f.hot_score), Some(13.0));
        let mut later = row.clone();
        later.computed_at = row.computed_at + chrono::Duration::hours(1);
        later.recency_days = 1;
        assert!(cache.is_unchanged(&later));
        assert!(!cache.is_unchanged(&features("a", 20.0)));
        assert!(!cache.is_unchanged(&features("b", 13.0)));
    }

    #[test]
    fn expired_entries_are_evicted_on_read_and_purge() {
        let cache = FeatureCache::new(Duration::from_secs(10));
        let start = Instant::now();
        cache.insert_at(features("a", 1.0), start);
        cache.insert_at(features("b", 1.0), start + Duration::from_secs(8));

        let later = start + Duration::from_secs(11);
        assert!(cache.get_at("a", later).is_none());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.purge_expired_at(start + Duration::from_secs(30)), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn zero_ttl_disables_caching() {
        let cache = FeatureCache::from_ttl_secs(0);
        cache.insert(features("a", 1.0));
        assert!(cache.is_empty());
        assert!(cache.get("a").is_none());
    }

    #[test]
    fn invalidate_removes_entry() {
        let cache = FeatureCache::from_ttl_secs(60);
        cache.insert(features("a", 1.0));
        cache.invalidate("a");
        assert!(cache.get("a").is_none());
    }
}
