use crate::models::NormalizedEvent;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

pub const NORMALIZED_SNAPSHOT_VERSION: u32 = 1;

/// Offline copy of L2 events for scoring without Postgres.
#[derive(Debug, Serialize, Deserialize)]
pub struct NormalizedSnapshot {
    pub version: u32,
    pub generated_at: DateTime<Utc>,
    pub events: Vec<NormalizedEvent>,
}

impl NormalizedSnapshot {
    pub fn new(events: Vec<NormalizedEvent>, generated_at: DateTime<Utc>) -> Self {
        Self {
            version: NORMALIZED_SNAPSHOT_VERSION,
            generated_at,
            events,
        }
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| {
            format!("Failed to open normalized event snapshot at {}", path.display())
        })?;
        let reader = BufReader::new(file);
        let snapshot: NormalizedSnapshot =
            bincode::deserialize_from(reader).context("Snapshot decode failed")?;

        if snapshot.version != NORMALIZED_SNAPSHOT_VERSION {
            return Err(anyhow!(
                "Normalized event snapshot version mismatch (found {}, expected {})",
                snapshot.version,
                NORMALIZED_SNAPSHOT_VERSION
            ));
        }
        Ok(snapshot)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create snapshot directory {}", parent.display())
                })?;
            }
        }

        let file = File::create(path).with_context(|| {
            format!(
                "Unable to create normalized event snapshot at {}",
                path.display()
            )
        })?;
        let mut writer = BufWriter::new(file);
        bincode::serialize_into(&mut writer, self)
            .context("Failed to serialize normalized event snapshot")?;
        writer
            .flush()
            .context("Failed to flush normalized event snapshot to disk")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DeviceKind, Provider};
    use std::path::PathBuf;

    fn scratch_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("lead-intake-{}-{}", name, uuid::Uuid::new_v4()))
            .join("events.bin")
    }

    fn event() -> NormalizedEvent {
        NormalizedEvent {
            id: "n1".to_string(),
            raw_event_id: "r1".to_string(),
            provider: Provider::GoogleAnalytics,
            client_id: "client-1".to_string(),
            session_id: "s1".to_string(),
            occurred_at: Utc::now(),
            page_url: "https://shop.example/pricing".to_string(),
            page_path: "/pricing".to_string(),
            traffic_source: "google".to_string(),
            utm_source: None,
            utm_campaign: Some("spring".to_string()),
            device: DeviceKind::Mobile,
            city: None,
            duration_seconds: 95,
            page_views: 3,
            goals: vec!["form_submit".to_string()],
            is_new_visitor: false,
        }
    }

    #[test]
    fn snapshot_survives_disk_and_creates_parent_dirs() {
        let path = scratch_path("roundtrip");
        let snapshot = NormalizedSnapshot::new(vec![event()], Utc::now());
        snapshot.save_to_file(&path).unwrap();

        let loaded = NormalizedSnapshot::load_from_file(&path).unwrap();
        assert_eq!(loaded.events, snapshot.events);
        if let Some(dir) = path.parent() {
            let _ = fs::remove_dir_all(dir);
        }
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let path = scratch_path("version");
        let mut snapshot = NormalizedSnapshot::new(Vec::new(), Utc::now());
        snapshot.version = NORMALIZED_SNAPSHOT_VERSION + 1;
        snapshot.save_to_file(&path).unwrap();

        let error = NormalizedSnapshot::load_from_file(&path).unwrap_err();
        assert!(error.to_string().contains("version mismatch"));
        if let Some(dir) = path.parent() {
            let _ = fs::remove_dir_all(dir);
        }
    }

    #[test]
    fn missing_file_reports_path() {
        let path = scratch_path("missing");
        let error = NormalizedSnapshot::load_from_file(&path).unwrap_err();
        assert!(error.to_string().contains("Failed to open"));
    }
}
