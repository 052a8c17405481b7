use anyhow::{anyhow, Result};
use std::collections::HashMap;

pub const SETTING_KEYS: [&str; 22] = [
    "NORMALIZE_BATCH_SIZE",
    "FEATURE_LOOKBACK_DAYS",
    "FEATURE_CACHE_TTL_SECS",
    "HOT_SCORE_THRESHOLD",
    "WARM_SCORE_THRESHOLD",
    "RECENCY_HALF_LIFE_DAYS",
    "PRICING_KEYWORDS",
    "CONTACT_KEYWORDS",
    "CATALOG_KEYWORDS",
    "SCORE_WEIGHT_VISIT",
    "SCORE_WEIGHT_PAGE_VIEW",
    "SCORE_WEIGHT_MINUTE",
    "SCORE_WEIGHT_PRICING",
    "SCORE_WEIGHT_CONTACT",
    "SCORE_WEIGHT_CATALOG",
    "SCORE_WEIGHT_GOAL",
    "SCORE_WEIGHT_RETURNING",
    "ALERT_WEBHOOK_URL",
    "ALERT_SOURCE_LABEL",
    "INSIGHTS_MIN_LEADS",
    "STORE_RETRY_ATTEMPTS",
    "STORE_RETRY_DELAY_MS",
];

const DEFAULT_PRICING_KEYWORDS: &[&str] =
    &["price", "prices", "pricing", "tariff", "cost", "ceny", "tseny"];
const DEFAULT_CONTACT_KEYWORDS: &[&str] =
    &["contact", "contacts", "kontakty", "order", "checkout", "callback"];
const DEFAULT_CATALOG_KEYWORDS: &[&str] = &["catalog", "katalog", "product", "products", "shop"];

/// Per-unit weight and the cap on that component's contribution to the hot score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightCap {
    pub per_unit: f64,
    pub cap: f64,
}

impl WeightCap {
    pub const fn new(per_unit: f64, cap: f64) -> Self {
        Self { per_unit, cap }
    }

    pub fn contribution(&self, units: f64) -> f64 {
        (units.max(0.0) * self.per_unit).min(self.cap)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoreWeights {
    pub visit: WeightCap,
    pub page_view: WeightCap,
    pub engaged_minute: WeightCap,
    pub pricing_hit: WeightCap,
    pub contact_hit: WeightCap,
    pub catalog_hit: WeightCap,
    pub goal: WeightCap,
    pub returning_bonus: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            visit: WeightCap::new(8.0, 24.0),
            page_view: WeightCap::new(2.0, 20.0),
            engaged_minute: WeightCap::new(3.0, 15.0),
            pricing_hit: WeightCap::new(10.0, 20.0),
            contact_hit: WeightCap::new(15.0, 30.0),
            catalog_hit: WeightCap::new(3.0, 9.0),
            goal: WeightCap::new(20.0, 40.0),
            returning_bonus: 5.0,
        }
    }
}

impl ScoreWeights {
    fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self> {
        let defaults = Self::default();
        let per_unit = |key: &str, fallback: WeightCap| -> Result<WeightCap> {
            let value = optional_setting_f64(settings, key, fallback.per_unit, Some(0.0), None)?;
            Ok(WeightCap::new(value, fallback.cap))
        };

        Ok(Self {
            visit: per_unit("SCORE_WEIGHT_VISIT", defaults.visit)?,
            page_view: per_unit("SCORE_WEIGHT_PAGE_VIEW", defaults.page_view)?,
            engaged_minute: per_unit("SCORE_WEIGHT_MINUTE", defaults.engaged_minute)?,
            pricing_hit: per_unit("SCORE_WEIGHT_PRICING", defaults.pricing_hit)?,
            contact_hit: per_unit("SCORE_WEIGHT_CONTACT", defaults.contact_hit)?,
            catalog_hit: per_unit("SCORE_WEIGHT_CATALOG", defaults.catalog_hit)?,
            goal: per_unit("SCORE_WEIGHT_GOAL", defaults.goal)?,
            returning_bonus: optional_setting_f64(
                settings,
                "SCORE_WEIGHT_RETURNING",
                defaults.returning_bonus,
                Some(0.0),
                None,
            )?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct IntakeSettings {
    pub normalize_batch_size: usize,
    pub feature_lookback_days: i64,
    pub feature_cache_ttl_secs: u64,
    pub hot_score_threshold: f64,
    pub warm_score_threshold: f64,
    pub recency_half_life_days: f64,
    pub pricing_keywords: Vec<String>,
    pub contact_keywords: Vec<String>,
    pub catalog_keywords: Vec<String>,
    pub score_weights: ScoreWeights,
    pub alert_webhook_url: Option<String>,
    pub alert_source_label: String,
    pub insights_min_leads: usize,
    pub store_retry_attempts: u32,
    pub store_retry_delay_ms: u64,
}

impl Default for IntakeSettings {
    fn default() -> Self {
        Self {
            normalize_batch_size: 500,
            feature_lookback_days: 30,
            feature_cache_ttl_secs: 900,
            hot_score_threshold: 70.0,
            warm_score_threshold: 40.0,
            recency_half_life_days: 14.0,
            pricing_keywords: to_owned_list(DEFAULT_PRICING_KEYWORDS),
            contact_keywords: to_owned_list(DEFAULT_CONTACT_KEYWORDS),
            catalog_keywords: to_owned_list(DEFAULT_CATALOG_KEYWORDS),
            score_weights: ScoreWeights::default(),
            alert_webhook_url: None,
            alert_source_label: "lead-intake".to_string(),
            insights_min_leads: 1,
            store_retry_attempts: 3,
            store_retry_delay_ms: 3_000,
        }
    }
}

impl IntakeSettings {
    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self> {
        let normalize_batch_size = optional_setting_usize(settings, "NORMALIZE_BATCH_SIZE", 500, 1)?;
        let feature_lookback_days =
            optional_setting_usize(settings, "FEATURE_LOOKBACK_DAYS", 30, 1)? as i64;
        let feature_cache_ttl_secs =
            optional_setting_usize(settings, "FEATURE_CACHE_TTL_SECS", 900, 0)? as u64;
        let hot_score_threshold = optional_setting_f64(
            settings,
            "HOT_SCORE_THRESHOLD",
            70.0,
            Some(0.0),
            Some(100.0),
        )?;
        let warm_score_threshold = optional_setting_f64(
            settings,
            "WARM_SCORE_THRESHOLD",
            40.0,
            Some(0.0),
            Some(100.0),
        )?;
        let recency_half_life_days =
            optional_setting_f64(settings, "RECENCY_HALF_LIFE_DAYS", 14.0, None, None)?;
        let pricing_keywords =
            optional_setting_keywords(settings, "PRICING_KEYWORDS", DEFAULT_PRICING_KEYWORDS)?;
        let contact_keywords =
            optional_setting_keywords(settings, "CONTACT_KEYWORDS", DEFAULT_CONTACT_KEYWORDS)?;
        let catalog_keywords =
            optional_setting_keywords(settings, "CATALOG_KEYWORDS", DEFAULT_CATALOG_KEYWORDS)?;
        let score_weights = ScoreWeights::from_settings_map(settings)?;
        let alert_webhook_url = optional_setting(settings, "ALERT_WEBHOOK_URL").map(str::to_string);
        let alert_source_label = optional_setting(settings, "ALERT_SOURCE_LABEL")
            .unwrap_or("lead-intake")
            .to_string();
        let insights_min_leads = optional_setting_usize(settings, "INSIGHTS_MIN_LEADS", 1, 1)?;
        let store_retry_attempts =
            optional_setting_usize(settings, "STORE_RETRY_ATTEMPTS", 3, 1)?.min(u32::MAX as usize)
                as u32;
        let store_retry_delay_ms =
            optional_setting_usize(settings, "STORE_RETRY_DELAY_MS", 3_000, 0)? as u64;

        if recency_half_life_days <= 0.0 {
            return Err(anyhow!(
                "Setting RECENCY_HALF_LIFE_DAYS must be > 0 (value: {})",
                recency_half_life_days
            ));
        }

        if warm_score_threshold > hot_score_threshold {
            return Err(anyhow!(
                "WARM_SCORE_THRESHOLD ({}) must be <= HOT_SCORE_THRESHOLD ({})",
                warm_score_threshold,
                hot_score_threshold
            ));
        }

        if let Some(url) = alert_webhook_url.as_deref() {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(anyhow!(
                    "Setting ALERT_WEBHOOK_URL must be an http(s) URL (value: {})",
                    url
                ));
            }
        }

        Ok(Self {
            normalize_batch_size,
            feature_lookback_days,
            feature_cache_ttl_secs,
            hot_score_threshold,
            warm_score_threshold,
            recency_half_life_days,
            pricing_keywords,
            contact_keywords,
            catalog_keywords,
            score_weights,
            alert_webhook_url,
            alert_source_label,
            insights_min_leads,
            store_retry_attempts,
            store_retry_delay_ms,
        })
    }
}

/// Environment variables win over stored settings for every known key.
pub fn apply_env_overrides(settings: &mut HashMap<String, String>) {
    for key in SETTING_KEYS {
        if let Ok(value) = std::env::var(key) {
            if !value.trim().is_empty() {
                settings.insert(key.to_string(), value);
            }
        }
    }
}

fn to_owned_list(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

fn optional_setting<'a>(settings: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    settings
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn optional_setting_f64(
    settings: &HashMap<String, String>,
    key: &str,
    default: f64,
    min: Option<f64>,
    max: Option<f64>,
) -> Result<f64> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(default);
    };
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if let Some(min_value) = min {
        if value < min_value {
            return Err(anyhow!(
                "Setting {} must be >= {} (value: {})",
                key,
                min_value,
                raw
            ));
        }
    }
    if let Some(max_value) = max {
        if value > max_value {
            return Err(anyhow!(
                "Setting {} must be <= {} (value: {})",
                key,
                max_value,
                raw
            ));
        }
    }
    Ok(value)
}

fn optional_setting_usize(
    settings: &HashMap<String, String>,
    key: &str,
    default: usize,
    min: usize,
) -> Result<usize> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(default);
    };
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if value.fract() != 0.0 {
        return Err(anyhow!(
            "Setting {} must be an integer (value: {})",
            key,
            raw
        ));
    }
    if value < min as f64 {
        return Err(anyhow!(
            "Setting {} must be >= {} (value: {})",
            key,
            min,
            raw
        ));
    }
    Ok(value as usize)
}

fn optional_setting_keywords(
    settings: &HashMap<String, String>,
    key: &str,
    default: &[&str],
) -> Result<Vec<String>> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(to_owned_list(default));
    };
    let trimmed = raw.trim().trim_matches(|c| c == '[' || c == ']');
    let mut values: Vec<String> = Vec::new();

    for part in trimmed.split(|c: char| c == ',' || c.is_whitespace()) {
        let entry = part.trim().trim_matches('"').to_lowercase();
        if entry.is_empty() || values.contains(&entry) {
            continue;
        }
        values.push(entry);
    }

    if values.is_empty() {
        return Err(anyhow!(
            "Setting {} must contain at least one keyword (value: {})",
            key,
            raw
        ));
    }

    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn empty_settings_resolve_to_defaults() {
        let resolved = IntakeSettings::from_settings_map(&HashMap::new()).unwrap();
        assert_eq!(resolved.normalize_batch_size, 500);
        assert_eq!(resolved.feature_lookback_days, 30);
        assert_eq!(resolved.feature_cache_ttl_secs, 900);
        assert_eq!(resolved.hot_score_threshold, 70.0);
        assert_eq!(resolved.warm_score_threshold, 40.0);
        assert!(resolved.pricing_keywords.contains(&"price".to_string()));
        assert_eq!(resolved.score_weights, ScoreWeights::default());
        assert!(resolved.alert_webhook_url.is_none());

        let defaults = IntakeSettings::default();
        assert_eq!(defaults.pricing_keywords, resolved.pricing_keywords);
        assert_eq!(defaults.recency_half_life_days, resolved.recency_half_life_days);
    }

    #[test]
    fn keyword_lists_are_lowercased_and_deduplicated() {
        let resolved = IntakeSettings::from_settings_map(&settings(&[(
            "PRICING_KEYWORDS",
            "[Price, PRICE  tarif]",
        )]))
        .unwrap();
        assert_eq!(resolved.pricing_keywords, vec!["price", "tarif"]);
    }

    #[test]
    fn rejects_warm_threshold_above_hot() {
        let error = IntakeSettings::from_settings_map(&settings(&[
            ("HOT_SCORE_THRESHOLD", "50"),
            ("WARM_SCORE_THRESHOLD", "60"),
        ]))
        .unwrap_err();
        assert!(error.to_string().contains("WARM_SCORE_THRESHOLD"));
    }

    #[test]
    fn rejects_fractional_batch_size_and_bad_webhook() {
        assert!(
            IntakeSettings::from_settings_map(&settings(&[("NORMALIZE_BATCH_SIZE", "2.5")]))
                .is_err()
        );
        assert!(
            IntakeSettings::from_settings_map(&settings(&[("ALERT_WEBHOOK_URL", "ftp://x")]))
                .is_err()
        );
        assert!(
            IntakeSettings::from_settings_map(&settings(&[("RECENCY_HALF_LIFE_DAYS", "0")]))
                .is_err()
        );
    }

    #[test]
    fn store_retry_policy_is_configurable() {
        let defaults = IntakeSettings::from_settings_map(&HashMap::new()).unwrap();
        assert_eq!(defaults.store_retry_attempts, 3);
        assert_eq!(defaults.store_retry_delay_ms, 3_000);

        let resolved = IntakeSettings::from_settings_map(&settings(&[
            ("STORE_RETRY_ATTEMPTS", "5"),
            ("STORE_RETRY_DELAY_MS", "0"),
        ]))
        .unwrap();
        assert_eq!(resolved.store_retry_attempts, 5);
        assert_eq!(resolved.store_retry_delay_ms, 0);

        assert!(
            IntakeSettings::from_settings_map(&settings(&[("STORE_RETRY_ATTEMPTS", "0")]))
                .is_err()
        );
    }

    #[test]
    fn weight_overrides_keep_caps() {
        let resolved =
            IntakeSettings::from_settings_map(&settings(&[("SCORE_WEIGHT_GOAL", "30")])).unwrap();
        assert_eq!(resolved.score_weights.goal, WeightCap::new(30.0, 40.0));
        assert_eq!(resolved.score_weights.goal.contribution(2.0), 40.0);
    }
}
