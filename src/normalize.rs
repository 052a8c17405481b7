//! Layer 1 → layer 2: provider payload readers and the per-provider visit mappings.

use crate::models::{DeviceKind, NormalizedEvent, Provider, RawEvent};
use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

const METRIKA_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const DIRECT_TRAFFIC_SOURCE: &str = "direct";
const GA4_DEFAULT_GOAL: &str = "key_event";
const ABSENT_MARKERS: [&str; 4] = ["(not set)", "(none)", "null", "undefined"];

#[derive(Debug, Error, Clone, PartialEq)]
pub enum NormalizeError {
    #[error("payload must be a JSON object, found {0}")]
    NotAnObject(&'static str),
    #[error("{provider} payload is missing required field {field}")]
    MissingField {
        provider: Provider,
        field: &'static str,
    },
    #[error("field {field} has an invalid timestamp: {value:?}")]
    InvalidTimestamp { field: &'static str, value: String },
    #[error("field {field} has an invalid number: {value:?}")]
    InvalidNumber { field: &'static str, value: String },
}

pub fn normalize_event(raw: &RawEvent) -> Result<NormalizedEvent, NormalizeError> {
    let object = match &raw.payload {
        Value::Object(map) => map,
        other => return Err(NormalizeError::NotAnObject(json_kind(other))),
    };

    match raw.provider {
        Provider::YandexMetrika => normalize_metrika(raw, object),
        Provider::GoogleAnalytics => normalize_ga4(raw, object),
    }
}

/// Dedupe key for a payload; `None` when the identifying fields are absent.
pub fn derive_external_id(provider: Provider, payload: &Value) -> Option<String> {
    let object = payload.as_object()?;
    match provider {
        Provider::YandexMetrika => field_text(object, "ym:s:visitID"),
        Provider::GoogleAnalytics => {
            let session = field_text(object, "sessionId")?;
            let when = field_text(object, "dateHourMinute").or_else(|| field_text(object, "date"))?;
            let page =
                field_text(object, "pagePath").or_else(|| field_text(object, "pageLocation"))?;
            Some(format!("{}|{}|{}", session, when, page))
        }
    }
}

/// Parses a Metrika Logs API export: a tab-separated header of `ym:s:*`
/// fields followed by one visit per line.
pub fn metrika_rows_from_tsv(text: &str) -> Result<Vec<Value>> {
    let mut lines = text.lines().enumerate();
    let header: Vec<String> = loop {
        match lines.next() {
            Some((_, line)) if line.trim().is_empty() => continue,
            Some((_, line)) => {
                break line
                    .trim_start_matches('\u{feff}')
                    .split('\t')
                    .map(|name| name.trim().to_string())
                    .collect()
            }
            None => return Ok(Vec::new()),
        }
    };

    if header.iter().any(|name| name.is_empty()) {
        return Err(anyhow!("Metrika export header contains an empty column name"));
    }

    let mut rows = Vec::new();
    for (index, line) in lines {
        if line.trim().is_empty() {
            continue;
        }
        let values: Vec<&str> = line.split('\t').collect();
        if values.len() != header.len() {
            return Err(anyhow!(
                "Metrika export line {} has {} columns, header has {}",
                index + 1,
                values.len(),
                header.len()
            ));
        }
        let mut row = Map::with_capacity(header.len());
        for (name, value) in header.iter().zip(values) {
            row.insert(name.clone(), Value::String(unescape_tsv(value)));
        }
        rows.push(Value::Object(row));
    }

    Ok(rows)
}

/// Flattens a GA4 `runReport` response into one object per row keyed by
/// dimension and metric names.
pub fn ga4_rows_from_report(report: &Value) -> Result<Vec<Value>> {
    let dimension_names = header_names(report, "dimensionHeaders")?;
    let metric_names = header_names(report, "metricHeaders")?;

    let Some(rows) = report.get("rows") else {
        return Ok(Vec::new());
    };
    let rows = rows
        .as_array()
        .ok_or_else(|| anyhow!("GA4 report field rows must be an array"))?;

    let mut flattened = Vec::with_capacity(rows.len());
    for (index, row) in rows.iter().enumerate() {
        let dimension_values = report_values(row, "dimensionValues");
        let metric_values = report_values(row, "metricValues");
        if dimension_values.len() != dimension_names.len()
            || metric_values.len() != metric_names.len()
        {
            return Err(anyhow!(
                "GA4 report row {} does not match the report headers",
                index
            ));
        }

        let mut object = Map::new();
        for (name, value) in dimension_names.iter().zip(dimension_values) {
            object.insert(name.clone(), value);
        }
        for (name, value) in metric_names.iter().zip(metric_values) {
            object.insert(name.clone(), value);
        }
        flattened.push(Value::Object(object));
    }

    Ok(flattened)
}

fn normalize_metrika(
    raw: &RawEvent,
    object: &Map<String, Value>,
) -> Result<NormalizedEvent, NormalizeError> {
    let provider = Provider::YandexMetrika;
    let client_id = require_text(object, provider, "ym:s:clientID")?;
    let session_id = require_text(object, provider, "ym:s:visitID")?;
    let occurred_raw = require_text(object, provider, "ym:s:dateTime")?;
    let occurred_at = parse_metrika_datetime(&occurred_raw).ok_or_else(|| {
        NormalizeError::InvalidTimestamp {
            field: "ym:s:dateTime",
            value: occurred_raw.clone(),
        }
    })?;
    let page_url = require_text(object, provider, "ym:s:startURL")?;

    let duration_seconds = field_number(object, "ym:s:visitDuration")?
        .map(non_negative_i64)
        .unwrap_or(0);
    let page_views = field_number(object, "ym:s:pageViews")?
        .map(non_negative_i32)
        .unwrap_or(0);
    let goals = object.get("ym:s:goalsID").map(parse_goal_list).unwrap_or_default();
    let is_new_visitor = field_text(object, "ym:s:isNewUser")
        .map(|value| parse_flag(&value))
        .unwrap_or(true);

    Ok(NormalizedEvent {
        id: uuid::Uuid::new_v4().to_string(),
        raw_event_id: raw.id.clone(),
        provider,
        client_id,
        session_id,
        occurred_at,
        page_path: page_path_from_url(&page_url),
        page_url,
        traffic_source: field_text(object, "ym:s:lastTrafficSource")
            .map(|value| value.to_lowercase())
            .unwrap_or_else(|| DIRECT_TRAFFIC_SOURCE.to_string()),
        utm_source: field_text(object, "ym:s:UTMSource"),
        utm_campaign: field_text(object, "ym:s:UTMCampaign"),
        device: field_text(object, "ym:s:deviceCategory")
            .map(|value| DeviceKind::parse(&value))
            .unwrap_or(DeviceKind::Unknown),
        city: field_text(object, "ym:s:regionCity"),
        duration_seconds,
        page_views,
        goals,
        is_new_visitor,
    })
}

fn normalize_ga4(
    raw: &RawEvent,
    object: &Map<String, Value>,
) -> Result<NormalizedEvent, NormalizeError> {
    let provider = Provider::GoogleAnalytics;
    let client_id = require_text(object, provider, "clientId")?;
    let session_id = require_text(object, provider, "sessionId")?;
    let occurred_at = if let Some(value) = field_text(object, "dateHourMinute") {
        parse_ga4_date_hour_minute(&value).ok_or(NormalizeError::InvalidTimestamp {
            field: "dateHourMinute",
            value,
        })?
    } else if let Some(value) = field_text(object, "date") {
        parse_ga4_date(&value).ok_or(NormalizeError::InvalidTimestamp {
            field: "date",
            value,
        })?
    } else {
        return Err(NormalizeError::MissingField {
            provider,
            field: "dateHourMinute",
        });
    };
    let page_url = field_text(object, "pageLocation")
        .or_else(|| field_text(object, "pagePath"))
        .ok_or(NormalizeError::MissingField {
            provider,
            field: "pagePath",
        })?;

    let duration = match field_number(object, "userEngagementDuration")? {
        Some(value) => Some(value),
        None => field_number(object, "averageSessionDuration")?,
    };
    let page_views = field_number(object, "screenPageViews")?
        .map(non_negative_i32)
        .unwrap_or(0);
    let key_events = match field_number(object, "keyEvents")? {
        Some(value) => Some(value),
        None => field_number(object, "conversions")?,
    };
    let goals = match key_events {
        Some(count) if count > 0.0 => vec![field_text(object, "eventName")
            .unwrap_or_else(|| GA4_DEFAULT_GOAL.to_string())],
        _ => Vec::new(),
    };
    let is_new_visitor = field_text(object, "newVsReturning")
        .map(|value| !value.eq_ignore_ascii_case("returning"))
        .unwrap_or(true);

    Ok(NormalizedEvent {
        id: uuid::Uuid::new_v4().to_string(),
        raw_event_id: raw.id.clone(),
        provider,
        client_id,
        session_id,
        occurred_at,
        page_path: page_path_from_url(&page_url),
        page_url,
        traffic_source: field_text(object, "sessionSource")
            .map(|value| value.to_lowercase())
            .unwrap_or_else(|| DIRECT_TRAFFIC_SOURCE.to_string()),
        utm_source: field_text(object, "sessionManualSource"),
        utm_campaign: field_text(object, "sessionCampaignName"),
        device: field_text(object, "deviceCategory")
            .map(|value| DeviceKind::parse(&value))
            .unwrap_or(DeviceKind::Unknown),
        city: field_text(object, "city"),
        duration_seconds: duration.map(non_negative_i64).unwrap_or(0),
        page_views,
        goals,
        is_new_visitor,
    })
}

/// Lower-cased path without scheme, host, query or fragment. Trailing
/// slashes are dropped except for the root.
pub fn page_path_from_url(url: &str) -> String {
    let trimmed = url.trim();
    let without_scheme = match trimmed.find("://") {
        Some(index) => &trimmed[index + 3..],
        None => trimmed,
    };
    let path = if trimmed.contains("://") || !without_scheme.starts_with('/') {
        match without_scheme.find('/') {
            Some(index) => &without_scheme[index..],
            None => "/",
        }
    } else {
        without_scheme
    };
    let path = path
        .split(|c| c == '?' || c == '#')
        .next()
        .unwrap_or("/")
        .to_lowercase();
    let path = path.trim_end_matches('/');
    if path.is_empty() {
        "/".to_string()
    } else {
        path.to_string()
    }
}

fn parse_metrika_datetime(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, METRIKA_DATETIME_FORMAT) {
        return Some(parsed.and_utc());
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|value| value.with_timezone(&Utc))
}

fn parse_ga4_date(raw: &str) -> Option<DateTime<Utc>> {
    if raw.len() != 8 || !raw.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    let year = raw[0..4].parse().ok()?;
    let month = raw[4..6].parse().ok()?;
    let day = raw[6..8].parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)?
        .and_hms_opt(0, 0, 0)
        .map(|value| value.and_utc())
}

fn parse_ga4_date_hour_minute(raw: &str) -> Option<DateTime<Utc>> {
    if raw.len() != 12 || !raw.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    let date = parse_ga4_date(&raw[0..8])?;
    let hour = raw[8..10].parse().ok()?;
    let minute = raw[10..12].parse().ok()?;
    date.date_naive()
        .and_hms_opt(hour, minute, 0)
        .map(|value| value.and_utc())
}

fn parse_goal_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items.iter().filter_map(value_text).collect(),
        Value::Number(number) => vec![number.to_string()],
        Value::String(text) => text
            .trim()
            .trim_matches(|c| c == '[' || c == ']')
            .split(',')
            .map(|part| part.trim().trim_matches('"').to_string())
            .filter(|part| !part.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "new"
    )
}

fn require_text(
    object: &Map<String, Value>,
    provider: Provider,
    field: &'static str,
) -> Result<String, NormalizeError> {
    field_text(object, field).ok_or(NormalizeError::MissingField { provider, field })
}

fn field_text(object: &Map<String, Value>, key: &str) -> Option<String> {
    object.get(key).and_then(value_text)
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty()
                || ABSENT_MARKERS
                    .iter()
                    .any(|marker| trimmed.eq_ignore_ascii_case(marker))
            {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(if *flag { "1" } else { "0" }.to_string()),
        _ => None,
    }
}

fn field_number(
    object: &Map<String, Value>,
    field: &'static str,
) -> Result<Option<f64>, NormalizeError> {
    match object.get(field) {
        Some(Value::Number(number)) => Ok(number.as_f64().filter(|value| value.is_finite())),
        Some(value @ Value::String(_)) => match value_text(value) {
            None => Ok(None),
            Some(text) => text
                .parse::<f64>()
                .ok()
                .filter(|value| value.is_finite())
                .map(Some)
                .ok_or(NormalizeError::InvalidNumber { field, value: text }),
        },
        _ => Ok(None),
    }
}

fn non_negative_i64(value: f64) -> i64 {
    value.round().max(0.0).min(i64::MAX as f64) as i64
}

fn non_negative_i32(value: f64) -> i32 {
    value.round().max(0.0).min(i32::MAX as f64) as i32
}

fn unescape_tsv(value: &str) -> String {
    if !value.contains('\\') {
        return value.to_string();
    }
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn header_names(report: &Value, key: &str) -> Result<Vec<String>> {
    let Some(headers) = report.get(key) else {
        return Ok(Vec::new());
    };
    let headers = headers
        .as_array()
        .ok_or_else(|| anyhow!("GA4 report field {} must be an array", key))?;
    headers
        .iter()
        .map(|header| {
            header
                .get("name")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| anyhow!("GA4 report {} entry is missing a name", key))
        })
        .collect()
}

fn report_values(row: &Value, key: &str) -> Vec<Value> {
    row.get(key)
        .and_then(Value::as_array)
        .map(|values| {
            values
                .iter()
                .map(|value| value.get("value").cloned().unwrap_or(Value::Null))
                .collect()
        })
        .unwrap_or_default()
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn raw(provider: Provider, payload: Value) -> RawEvent {
        RawEvent {
            id: "raw-1".to_string(),
            provider,
            external_id: "ext".to_string(),
            payload,
            received_at: Utc::now(),
            processed_at: None,
            error: None,
        }
    }

    #[test]
    fn metrika_visit_maps_onto_normalized_event() {
        let event = normalize_event(&raw(
            Provider::YandexMetrika,
            json!({
                "ym:s:visitID": "9001",
                "ym:s:clientID": "1700000000123",
                "ym:s:dateTime": "2024-03-05 14:22:01",
                "ym:s:startURL": "https://shop.example.kz/Catalog/Pumps/?utm_source=yandex#top",
                "ym:s:visitDuration": "184",
                "ym:s:pageViews": "6",
                "ym:s:goalsID": "[3101,3102]",
                "ym:s:lastTrafficSource": "ad",
                "ym:s:UTMSource": "yandex",
                "ym:s:UTMCampaign": "(not set)",
                "ym:s:deviceCategory": "2",
                "ym:s:regionCity": "Almaty",
                "ym:s:isNewUser": "0"
            }),
        ))
        .unwrap();

        assert_eq!(event.raw_event_id, "raw-1");
        assert_eq!(event.client_id, "1700000000123");
        assert_eq!(event.session_id, "9001");
        assert_eq!(
            event.occurred_at,
            Utc.with_ymd_and_hms(2024, 3, 5, 14, 22, 1).unwrap()
        );
        assert_eq!(event.page_path, "/catalog/pumps");
        assert_eq!(event.traffic_source, "ad");
        assert_eq!(event.utm_source.as_deref(), Some("yandex"));
        assert_eq!(event.utm_campaign, None);
        assert_eq!(event.device, DeviceKind::Mobile);
        assert_eq!(event.city.as_deref(), Some("Almaty"));
        assert_eq!(event.duration_seconds, 184);
        assert_eq!(event.page_views, 6);
        assert_eq!(event.goals, vec!["3101", "3102"]);
        assert!(!event.is_new_visitor);
    }

    #[test]
    fn metrika_missing_client_is_rejected() {
        let error = normalize_event(&raw(
            Provider::YandexMetrika,
            json!({
                "ym:s:visitID": "1",
                "ym:s:dateTime": "2024-03-05 14:22:01",
                "ym:s:startURL": "https://example.kz/"
            }),
        ))
        .unwrap_err();
        assert_eq!(
            error,
            NormalizeError::MissingField {
                provider: Provider::YandexMetrika,
                field: "ym:s:clientID"
            }
        );
    }

    #[test]
    fn metrika_bad_timestamp_and_number_are_typed_errors() {
        let base = json!({
            "ym:s:visitID": "1",
            "ym:s:clientID": "c",
            "ym:s:dateTime": "05.03.2024",
            "ym:s:startURL": "https://example.kz/"
        });
        assert!(matches!(
            normalize_event(&raw(Provider::YandexMetrika, base.clone())),
            Err(NormalizeError::InvalidTimestamp { .. })
        ));

        let mut bad_number = base;
        bad_number["ym:s:dateTime"] = json!("2024-03-05 10:00:00");
        bad_number["ym:s:visitDuration"] = json!("long");
        assert_eq!(
            normalize_event(&raw(Provider::YandexMetrika, bad_number)).unwrap_err(),
            NormalizeError::InvalidNumber {
                field: "ym:s:visitDuration",
                value: "long".to_string()
            }
        );
    }

    #[test]
    fn ga4_row_maps_key_events_to_goal() {
        let event = normalize_event(&raw(
            Provider::GoogleAnalytics,
            json!({
                "clientId": "GA1.1.42",
                "sessionId": "1712000000",
                "dateHourMinute": "202404011530",
                "pagePath": "/Prices/",
                "userEngagementDuration": "95.6",
                "screenPageViews": 3,
                "eventName": "generate_lead",
                "keyEvents": "1",
                "sessionSource": "Google",
                "deviceCategory": "desktop",
                "newVsReturning": "returning"
            }),
        ))
        .unwrap();

        assert_eq!(
            event.occurred_at,
            Utc.with_ymd_and_hms(2024, 4, 1, 15, 30, 0).unwrap()
        );
        assert_eq!(event.page_path, "/prices");
        assert_eq!(event.page_url, "/Prices/");
        assert_eq!(event.duration_seconds, 96);
        assert_eq!(event.page_views, 3);
        assert_eq!(event.goals, vec!["generate_lead"]);
        assert_eq!(event.traffic_source, "google");
        assert_eq!(event.utm_source, None);
        assert_eq!(event.device, DeviceKind::Desktop);
        assert!(!event.is_new_visitor);
    }

    #[test]
    fn ga4_utm_source_comes_from_manual_source_only() {
        let event = normalize_event(&raw(
            Provider::GoogleAnalytics,
            json!({
                "clientId": "c9",
                "sessionId": "s9",
                "date": "20240402",
                "pagePath": "/catalog",
                "sessionSource": "google",
                "sessionManualSource": "spring_newsletter",
                "sessionCampaignName": "pumps-2024"
            }),
        ))
        .unwrap();
        assert_eq!(event.traffic_source, "google");
        assert_eq!(event.utm_source.as_deref(), Some("spring_newsletter"));
        assert_eq!(event.utm_campaign.as_deref(), Some("pumps-2024"));
    }

    #[test]
    fn ga4_without_key_events_has_no_goals_and_defaults_source() {
        let event = normalize_event(&raw(
            Provider::GoogleAnalytics,
            json!({
                "clientId": "c1",
                "sessionId": "s1",
                "date": "20240401",
                "pageLocation": "https://example.kz/",
                "keyEvents": "0",
                "userEngagementDuration": "-4"
            }),
        ))
        .unwrap();
        assert!(event.goals.is_empty());
        assert_eq!(event.traffic_source, "direct");
        assert_eq!(event.page_path, "/");
        assert_eq!(event.duration_seconds, 0);
        assert_eq!(event.device, DeviceKind::Unknown);
        assert!(event.is_new_visitor);
    }

    #[test]
    fn non_object_payload_is_rejected() {
        assert_eq!(
            normalize_event(&raw(Provider::GoogleAnalytics, json!([1, 2]))).unwrap_err(),
            NormalizeError::NotAnObject("an array")
        );
    }

    #[test]
    fn page_paths_are_canonical() {
        assert_eq!(page_path_from_url("https://Example.kz"), "/");
        assert_eq!(page_path_from_url("example.kz/Kontakty/?a=1"), "/kontakty");
        assert_eq!(page_path_from_url("/price#plans"), "/price");
        assert_eq!(page_path_from_url("http://x.kz//"), "/");
    }

    #[test]
    fn metrika_tsv_export_is_parsed_and_unescaped() {
        let text = "ym:s:visitID\tym:s:clientID\tym:s:startURL\n\
                    1\t100\thttps://a.kz/x\\ty\n\
                    \n\
                    2\t200\thttps://a.kz/\n";
        let rows = metrika_rows_from_tsv(text).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["ym:s:startURL"], json!("https://a.kz/x\ty"));
        assert_eq!(rows[1]["ym:s:clientID"], json!("200"));
        assert_eq!(
            derive_external_id(Provider::YandexMetrika, &rows[1]).as_deref(),
            Some("2")
        );
    }

    #[test]
    fn metrika_tsv_column_mismatch_names_line() {
        let text = "ym:s:visitID\tym:s:clientID\n1\t2\n3\n";
        let error = metrika_rows_from_tsv(text).unwrap_err();
        assert!(error.to_string().contains("line 3"));
    }

    #[test]
    fn ga4_report_is_flattened() {
        let report = json!({
            "dimensionHeaders": [{"name": "clientId"}, {"name": "sessionId"}, {"name": "dateHourMinute"}, {"name": "pagePath"}],
            "metricHeaders": [{"name": "screenPageViews", "type": "TYPE_INTEGER"}],
            "rows": [
                {
                    "dimensionValues": [{"value": "c1"}, {"value": "s1"}, {"value": "202404011530"}, {"value": "/price"}],
                    "metricValues": [{"value": "4"}]
                }
            ]
        });
        let rows = ga4_rows_from_report(&report).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["screenPageViews"], json!("4"));
        assert_eq!(
            derive_external_id(Provider::GoogleAnalytics, &rows[0]).as_deref(),
            Some("s1|202404011530|/price")
        );

        let empty = ga4_rows_from_report(&json!({"dimensionHeaders": [], "rowCount": 0})).unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn ga4_report_row_shape_mismatch_is_an_error() {
        let report = json!({
            "dimensionHeaders": [{"name": "clientId"}],
            "metricHeaders": [],
            "rows": [{"dimensionValues": []}]
        });
        assert!(ga4_rows_from_report(&report).is_err());
    }
}
