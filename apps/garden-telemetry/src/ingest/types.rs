use crate::telemetry::TelemetryRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleReason {
    First,
    Periodic,
    Forced,
}

impl SampleReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SampleReason::First => "first",
            SampleReason::Periodic => "periodic",
            SampleReason::Forced => "forced",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "first" => Some(SampleReason::First),
            "periodic" => Some(SampleReason::Periodic),
            "forced" => Some(SampleReason::Forced),
            _ => None,
        }
    }
}

/// Immutable copy of a site's latest state at sampling time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistorySample {
    #[serde(flatten)]
    pub record: TelemetryRecord,
    pub sampled_at: DateTime<Utc>,
    pub reason: SampleReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UpsertOutcome {
    pub created: bool,
    pub revision: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestOutcome {
    pub site_id: String,
    pub created: bool,
    pub sampled: Option<SampleReason>,
    pub updates_until_next_sample: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SiteCounter {
    pub site_id: String,
    pub updates_since_sample: u32,
    pub updates_until_next_sample: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClearOutcome {
    pub sites: usize,
    pub samples: usize,
}
