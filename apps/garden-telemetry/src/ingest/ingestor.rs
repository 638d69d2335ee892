use super::broadcast::{Broadcaster, Subscription};
use super::dedup::{NotificationGate, NotificationKey};
use super::sampler::Sampler;
use super::state::{SiteSlot, SiteStateStore};
use super::types::{ClearOutcome, HistorySample, IngestOutcome, SampleReason, SiteCounter};
use super::{db, SitePipeline};
use crate::error::PipelineError;
use crate::mqtt::InboundMessage;
use crate::pipeline::{PersistCommand, PersistHandle, PipelineStats, StatsSnapshot};
use crate::telemetry::{DecodeError, Decoder, TelemetryRecord};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    #[serde(flatten)]
    pub stats: StatsSnapshot,
    pub sample_every: u32,
    pub sites: Vec<SiteCounter>,
    pub subscribers: usize,
    pub history_memory_limit: usize,
    pub tracked_notifications: usize,
    pub persistence_enabled: bool,
}

impl SitePipeline {
    pub fn new(
        sampler: Sampler,
        subscriber_buffer: usize,
        notify_window: ChronoDuration,
        persist: Option<PersistHandle>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            store: Arc::new(SiteStateStore::new()),
            sampler,
            broadcaster: Arc::new(Broadcaster::new(subscriber_buffer)),
            notifications: Arc::new(NotificationGate::new(notify_window)),
            persist,
            stats,
        }
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    /// Merges one decoded record, ticks the site's sampler and fans the new latest state out.
    /// Everything after the merge happens under the site's lock and never waits, so other
    /// sites proceed untouched and subscribers see a site's updates in merge order.
    pub async fn ingest(&self, record: TelemetryRecord) -> IngestOutcome {
        let now = Utc::now();
        let (upsert, mut slot) = self.store.upsert(&record).await;
        let reason = self.sampler.tick(&mut slot.counter, upsert.created);
        let sample = reason.and_then(|reason| self.sampler.capture(&mut slot, reason, now));
        self.stats.accepted.fetch_add(1, Ordering::Relaxed);

        if let Some(latest) = slot.latest.clone().map(Arc::new) {
            let delivered = self.broadcaster.publish(latest.clone());
            tracing::trace!(
                site = %record.site_id,
                revision = upsert.revision,
                delivered,
                "accepted telemetry"
            );
            self.persist_latest(latest);
        }
        if let Some(sample) = sample.as_ref() {
            self.record_sample(sample);
        }

        IngestOutcome {
            site_id: record.site_id,
            created: upsert.created,
            sampled: sample.map(|sample| sample.reason),
            updates_until_next_sample: self.sampler.remaining(&slot.counter),
        }
    }

    /// `Ok(None)` when the topic is not ours.
    pub async fn ingest_payload(
        &self,
        decoder: &Decoder,
        topic: &str,
        payload: &mut [u8],
        received_at: DateTime<Utc>,
    ) -> Result<Option<IngestOutcome>, DecodeError> {
        match decoder.decode(topic, payload, received_at)? {
            Some(record) => Ok(Some(self.ingest(record).await)),
            None => Ok(None),
        }
    }

    /// Drains transport messages until every sender is gone. A bad message is counted and
    /// skipped; nothing here ends the loop early.
    pub async fn run_worker(self, decoder: Decoder, mut rx: mpsc::Receiver<InboundMessage>) {
        tracing::info!(prefix = %decoder.topic_prefix(), "ingest worker started");
        while let Some(message) = rx.recv().await {
            let mut payload = message.payload.to_vec();
            match self
                .ingest_payload(&decoder, &message.topic, &mut payload, message.received_at)
                .await
            {
                Ok(Some(outcome)) => {
                    if let Some(reason) = outcome.sampled {
                        tracing::debug!(
                            site = %outcome.site_id,
                            reason = reason.as_str(),
                            "history sample taken"
                        );
                    }
                }
                Ok(None) => {
                    tracing::debug!(
                        topic = %message.topic,
                        "ignoring message outside topic prefix"
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        kind = err.kind(),
                        topic = %message.topic,
                        "failed to decode telemetry payload"
                    );
                    self.stats.record_failure(&PipelineError::Decode(err));
                }
            }
        }
        tracing::info!("ingest worker stopped");
    }

    /// Operator override. `None` when the site has no data yet.
    pub async fn force_snapshot(&self, site_id: &str) -> Option<HistorySample> {
        let mut slot = self.store.lock_existing(site_id).await?;
        let sample = self.sampler.force(&mut slot, Utc::now())?;
        self.record_sample(&sample);
        tracing::info!(site = %site_id, "forced history sample");
        Some(sample)
    }

    pub async fn reset_counter(&self, site_id: &str) -> Option<SiteCounter> {
        let mut slot = self.store.lock_existing(site_id).await?;
        if slot.latest.is_none() {
            return None;
        }
        slot.counter.reset();
        tracing::info!(site = %site_id, "sample counter reset");
        Some(self.counter_for(site_id, &slot))
    }

    /// Drops every site's state, history, counter and notification memory, then the persisted
    /// tables. Every site stays locked until the wipe is queued behind that site's last write.
    pub async fn clear_all(&self) -> Result<ClearOutcome> {
        let mut outcome = ClearOutcome {
            sites: 0,
            samples: 0,
        };
        let mut cells = self.store.cells();
        cells.sort_by(|a, b| a.0.cmp(&b.0));
        let mut guards = Vec::with_capacity(cells.len());
        for (_, cell) in cells {
            let slot = cell.lock_owned().await;
            if slot.latest.is_some() {
                outcome.sites += 1;
            }
            outcome.samples += slot.history.len();
            guards.push(slot);
        }
        self.store.clear();
        self.notifications.clear();
        let wiped = match self.persist.as_ref() {
            Some(persist) => Some(persist.request_clear().await?),
            None => None,
        };
        drop(guards);

        if let Some(wiped) = wiped {
            wiped
                .await
                .map_err(|_| anyhow!("persistence writer stopped"))??;
        }
        tracing::warn!(
            sites = outcome.sites,
            samples = outcome.samples,
            "cleared all telemetry"
        );
        Ok(outcome)
    }

    pub async fn get_latest(&self, site_id: &str) -> Option<TelemetryRecord> {
        self.store.get_latest(site_id).await
    }

    /// Most recent first, served from memory. At most `history_memory_limit` samples per site
    /// are kept here; older ones live only in the database. `None` means the site was never
    /// populated.
    pub async fn get_history(&self, site_id: &str, limit: usize) -> Option<Vec<HistorySample>> {
        let slot = self.store.lock_existing(site_id).await?;
        if slot.latest.is_none() {
            return None;
        }
        Some(slot.history.iter().rev().take(limit).cloned().collect())
    }

    pub fn site_ids(&self) -> Vec<String> {
        self.store.site_ids()
    }

    /// Registers a live consumer primed with the current latest state of every matching site.
    pub async fn subscribe(&self, site_filter: Option<String>) -> Subscription {
        let initial = self.store.snapshot(site_filter.as_deref()).await;
        let seen: HashMap<String, u64> = initial
            .iter()
            .map(|(record, revision)| (record.site_id.clone(), *revision))
            .collect();
        let subscription = self.broadcaster.register(
            site_filter.clone(),
            initial
                .into_iter()
                .map(|(record, _)| Arc::new(record))
                .collect(),
            self.store.len(),
        );

        // Catch up on sites that changed between the snapshot and registration.
        for (site_id, cell) in self.store.cells() {
            if site_filter.as_deref().is_some_and(|filter| filter != site_id) {
                continue;
            }
            let slot = cell.lock().await;
            if slot.revision <= seen.get(&site_id).copied().unwrap_or(0) {
                continue;
            }
            if let Some(latest) = slot.latest.clone() {
                self.broadcaster.deliver_to(&subscription.id, Arc::new(latest));
            }
        }
        subscription
    }

    pub fn unsubscribe(&self, id: &Uuid) -> bool {
        self.broadcaster.unsubscribe(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.broadcaster.len()
    }

    pub async fn counters(&self) -> Vec<SiteCounter> {
        let mut counters = Vec::new();
        for (site_id, cell) in self.store.cells() {
            let slot = cell.lock().await;
            if slot.latest.is_some() {
                counters.push(self.counter_for(&site_id, &slot));
            }
        }
        counters.sort_by(|a, b| a.site_id.cmp(&b.site_id));
        counters
    }

    pub async fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            stats: self.stats.snapshot(),
            sample_every: self.sampler.every(),
            sites: self.counters().await,
            subscribers: self.subscriber_count(),
            history_memory_limit: self.sampler.history_limit(),
            tracked_notifications: self.notifications.tracked(),
            persistence_enabled: self.persist.is_some(),
        }
    }

    pub fn should_emit(&self, key: &NotificationKey) -> bool {
        self.should_emit_at(key, Utc::now())
    }

    pub fn should_emit_at(&self, key: &NotificationKey, now: DateTime<Utc>) -> bool {
        self.notifications.should_emit(key, now)
    }

    pub fn sweep_notifications(&self, now: DateTime<Utc>) -> usize {
        self.notifications.sweep(now)
    }

    pub async fn flush(&self) -> Result<()> {
        match self.persist.as_ref() {
            Some(persist) => persist.flush().await,
            None => Ok(()),
        }
    }

    /// Loads persisted latest rows and recent history so a restart does not re-sample sites
    /// that were already seen. Nothing loaded here is re-persisted or broadcast.
    pub async fn hydrate(&self, pool: &PgPool, history_limit: usize) -> Result<usize> {
        let latest = db::load_latest(pool).await?;
        let history = db::load_recent_history(pool, history_limit).await?;

        let mut by_site: HashMap<String, Vec<HistorySample>> = HashMap::new();
        for sample in history {
            by_site
                .entry(sample.record.site_id.clone())
                .or_default()
                .push(sample);
        }

        let sites = latest.len();
        for record in latest {
            let mut slot = self.store.lock(&record.site_id).await;
            slot.latest = Some(record.clone());
            slot.revision += 1;
            if let Some(samples) = by_site.remove(&record.site_id) {
                slot.history = samples.into();
            }
        }
        tracing::info!(sites, "hydrated site state from database");
        Ok(sites)
    }

    fn counter_for(&self, site_id: &str, slot: &SiteSlot) -> SiteCounter {
        SiteCounter {
            site_id: site_id.to_string(),
            updates_since_sample: slot.counter.updates(),
            updates_until_next_sample: self.sampler.remaining(&slot.counter),
        }
    }

    fn record_sample(&self, sample: &HistorySample) {
        self.stats.history_samples.fetch_add(1, Ordering::Relaxed);
        if sample.reason == SampleReason::First {
            tracing::info!(site = %sample.record.site_id, "first telemetry for site");
        }
        let Some(persist) = self.persist.as_ref() else {
            return;
        };
        if let Err(err) = persist.try_enqueue(PersistCommand::Sample(sample.clone())) {
            let failure = PipelineError::SnapshotWrite(err.to_string());
            tracing::warn!(
                error = %failure,
                site = %sample.record.site_id,
                "history sample not queued for persistence"
            );
            self.stats.record_failure(&failure);
        }
    }

    fn persist_latest(&self, latest: Arc<TelemetryRecord>) {
        let Some(persist) = self.persist.as_ref() else {
            return;
        };
        let site_id = latest.site_id.clone();
        if let Err(err) = persist.try_enqueue(PersistCommand::Latest(latest)) {
            let failure = PipelineError::StoreWrite(err.to_string());
            tracing::warn!(
                error = %failure,
                site = %site_id,
                "latest state not queued for persistence"
            );
            self.stats.record_failure(&failure);
        }
    }
}
