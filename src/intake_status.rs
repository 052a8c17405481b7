use std::sync::{Arc, Mutex};

#[derive(Clone, Default)]
pub struct IntakeStatus {
    inner: Arc<Mutex<IntakeStatusData>>,
}

#[derive(Default)]
struct IntakeStatusData {
    phase: String,
    total_records: usize,
    processed_records: usize,
    failed_records: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct IntakeStatusSnapshot {
    pub phase: String,
    pub total_records: usize,
    pub processed_records: usize,
    pub failed_records: usize,
}

impl IntakeStatus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(IntakeStatusData {
                phase: "Initializing".to_string(),
                ..Default::default()
            })),
        }
    }

    pub fn set_phase<S: Into<String>>(&self, phase: S) {
        if let Ok(mut data) = self.inner.lock() {
            data.phase = phase.into();
            data.total_records = 0;
            data.processed_records = 0;
            data.failed_records = 0;
        }
    }

    pub fn set_total(&self, total_records: usize) {
        if let Ok(mut data) = self.inner.lock() {
            data.total_records = total_records;
        }
    }

    pub fn record_progress(&self, processed: usize, failed: usize) {
        if let Ok(mut data) = self.inner.lock() {
            data.processed_records += processed;
            data.failed_records += failed;
        }
    }

    pub fn snapshot(&self) -> IntakeStatusSnapshot {
        if let Ok(data) = self.inner.lock() {
            IntakeStatusSnapshot {
                phase: data.phase.clone(),
                total_records: data.total_records,
                processed_records: data.processed_records,
                failed_records: data.failed_records,
            }
        } else {
            IntakeStatusSnapshot {
                phase: "Status unavailable".to_string(),
                total_records: 0,
                processed_records: 0,
                failed_records: 0,
            }
        }
    }
}
