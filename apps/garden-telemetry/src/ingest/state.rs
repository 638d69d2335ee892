use super::sampler::SampleCounter;
use super::types::{HistorySample, UpsertOutcome};
use crate::telemetry::TelemetryRecord;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Everything owned for one site. Guarded by that site's lock only.
#[derive(Debug, Default)]
pub(crate) struct SiteSlot {
    pub(in crate::ingest) latest: Option<TelemetryRecord>,
    pub(in crate::ingest) revision: u64,
    pub(in crate::ingest) counter: SampleCounter,
    /// Oldest first.
    pub(in crate::ingest) history: VecDeque<HistorySample>,
}

impl SiteSlot {
    pub(in crate::ingest) fn merge(&mut self, record: &TelemetryRecord) -> UpsertOutcome {
        self.revision += 1;
        let created = match self.latest.as_mut() {
            Some(latest) => {
                latest.measurements.merge_from(&record.measurements);
                // Fields follow arrival order; the record's timestamp never moves backwards.
                latest.timestamp = latest.timestamp.max(record.timestamp);
                false
            }
            None => {
                self.latest = Some(record.clone());
                true
            }
        };
        UpsertOutcome {
            created,
            revision: self.revision,
        }
    }
}

/// Latest merged record per site. Sites never share a lock.
#[derive(Debug, Default)]
pub struct SiteStateStore {
    sites: DashMap<String, Arc<Mutex<SiteSlot>>>,
}

impl SiteStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the site's slot, creating it on first sight. A slot that was cleared out of the
    /// map while this caller waited is never handed out; the caller gets the live one instead.
    pub(in crate::ingest) async fn lock(&self, site_id: &str) -> OwnedMutexGuard<SiteSlot> {
        loop {
            let cell = match self.sites.get(site_id) {
                Some(cell) => cell.value().clone(),
                None => self
                    .sites
                    .entry(site_id.to_string())
                    .or_default()
                    .value()
                    .clone(),
            };
            // The map shard guard is released above; only the site lock is awaited.
            let guard = cell.clone().lock_owned().await;
            if self.is_current(site_id, &cell) {
                return guard;
            }
        }
    }

    pub(in crate::ingest) async fn lock_existing(
        &self,
        site_id: &str,
    ) -> Option<OwnedMutexGuard<SiteSlot>> {
        loop {
            let cell = self.sites.get(site_id).map(|cell| cell.value().clone())?;
            let guard = cell.clone().lock_owned().await;
            if self.is_current(site_id, &cell) {
                return Some(guard);
            }
        }
    }

    fn is_current(&self, site_id: &str, cell: &Arc<Mutex<SiteSlot>>) -> bool {
        self.sites
            .get(site_id)
            .is_some_and(|current| Arc::ptr_eq(current.value(), cell))
    }

    /// Merges `record` into the site's latest state, creating it on first sight. The site
    /// stays locked through the returned guard so the caller can act on the merged state.
    pub(in crate::ingest) async fn upsert(
        &self,
        record: &TelemetryRecord,
    ) -> (UpsertOutcome, OwnedMutexGuard<SiteSlot>) {
        let mut slot = self.lock(&record.site_id).await;
        let outcome = slot.merge(record);
        (outcome, slot)
    }

    pub async fn get_latest(&self, site_id: &str) -> Option<TelemetryRecord> {
        let slot = self.lock_existing(site_id).await?;
        slot.latest.clone()
    }

    pub fn site_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sites.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Latest record and revision for every populated site, optionally restricted to one.
    pub(in crate::ingest) async fn snapshot(
        &self,
        site_filter: Option<&str>,
    ) -> Vec<(TelemetryRecord, u64)> {
        let cells: Vec<Arc<Mutex<SiteSlot>>> = match site_filter {
            Some(site_id) => self
                .sites
                .get(site_id)
                .map(|cell| vec![cell.value().clone()])
                .unwrap_or_default(),
            None => self.sites.iter().map(|entry| entry.value().clone()).collect(),
        };
        let mut out = Vec::with_capacity(cells.len());
        for cell in cells {
            let slot = cell.lock().await;
            if let Some(latest) = slot.latest.clone() {
                out.push((latest, slot.revision));
            }
        }
        out.sort_by(|a, b| a.0.site_id.cmp(&b.0.site_id));
        out
    }

    pub(in crate::ingest) fn cells(&self) -> Vec<(String, Arc<Mutex<SiteSlot>>)> {
        self.sites
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub(in crate::ingest) fn len(&self) -> usize {
        self.sites.len()
    }

    pub(in crate::ingest) fn clear(&self) {
        self.sites.clear();
    }
}
