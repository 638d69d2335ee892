use super::state::SiteSlot;
use super::types::{HistorySample, SampleReason};
use chrono::{DateTime, Utc};

/// Accepted updates since the last snapshot of one site.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleCounter {
    updates: u32,
}

impl SampleCounter {
    pub fn updates(&self) -> u32 {
        self.updates
    }

    pub fn reset(&mut self) {
        self.updates = 0;
    }
}

/// Down-samples a site's update stream into history: the first record ever seen, then every
/// `every`-th accepted update. `every == 0` keeps only first-ever samples.
#[derive(Debug, Clone, Copy)]
pub struct Sampler {
    every: u32,
    history_limit: usize,
}

impl Sampler {
    pub fn new(every: u32, history_limit: usize) -> Self {
        Self {
            every,
            history_limit: history_limit.max(1),
        }
    }

    pub fn every(&self) -> u32 {
        self.every
    }

    pub fn history_limit(&self) -> usize {
        self.history_limit
    }

    /// Counts one accepted upsert. The first record of a site counts as update one.
    pub fn tick(&self, counter: &mut SampleCounter, created: bool) -> Option<SampleReason> {
        counter.updates = counter.updates.saturating_add(1);
        let due = self.every > 0 && counter.updates >= self.every;
        if due {
            counter.updates = 0;
        }
        if created {
            Some(SampleReason::First)
        } else if due {
            Some(SampleReason::Periodic)
        } else {
            None
        }
    }

    pub fn remaining(&self, counter: &SampleCounter) -> Option<u32> {
        if self.every == 0 {
            return None;
        }
        Some(self.every.saturating_sub(counter.updates))
    }

    /// Appends a copy of the slot's latest state to its history. Caller holds the site lock.
    pub(in crate::ingest) fn capture(
        &self,
        slot: &mut SiteSlot,
        reason: SampleReason,
        sampled_at: DateTime<Utc>,
    ) -> Option<HistorySample> {
        let record = slot.latest.clone()?;
        let sample = HistorySample {
            record,
            sampled_at,
            reason,
        };
        slot.history.push_back(sample.clone());
        while slot.history.len() > self.history_limit {
            slot.history.pop_front();
        }
        Some(sample)
    }

    /// Operator override: snapshot now and restart the periodic count.
    pub(in crate::ingest) fn force(
        &self,
        slot: &mut SiteSlot,
        sampled_at: DateTime<Utc>,
    ) -> Option<HistorySample> {
        let sample = self.capture(slot, SampleReason::Forced, sampled_at)?;
        slot.counter.reset();
        Some(sample)
    }
}
