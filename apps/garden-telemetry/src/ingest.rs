mod broadcast;
pub(crate) mod db;
mod dedup;
mod ingestor;
mod sampler;
mod state;
mod types;

#[cfg(test)]
mod tests;

pub use broadcast::Subscription;
pub use dedup::NotificationKey;
pub use ingestor::HealthSnapshot;
pub use sampler::Sampler;
pub use types::{ClearOutcome, HistorySample, IngestOutcome, SampleReason, SiteCounter};

use broadcast::Broadcaster;
use dedup::NotificationGate;
use state::SiteStateStore;

use crate::pipeline::{PersistHandle, PipelineStats};
use std::sync::Arc;

/// Decoded record in, latest state + history + live fan-out out. Cheap to clone; every clone
/// shares the same store.
#[derive(Clone)]
pub struct SitePipeline {
    store: Arc<SiteStateStore>,
    sampler: Sampler,
    broadcaster: Arc<Broadcaster>,
    notifications: Arc<NotificationGate>,
    persist: Option<PersistHandle>,
    stats: Arc<PipelineStats>,
}
