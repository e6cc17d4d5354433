//! Resumable cursor over (region, locality, filter cycle).

use crate::data::SearchCursor;
use crate::error::Result;
use crate::store::CheckpointStore;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where to start in `region` given the stored cursor.
pub fn resume_index(cursor: &SearchCursor, region: &str) -> usize {
    match (&cursor.region, cursor.locality_index) {
        (Some(current), Some(done)) if current.eq_ignore_ascii_case(region) => done + 1,
        _ => 0,
    }
}

/// Counters folded into the cursor when a locality finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalityTally {
    pub persisted: u64,
    pub rejected: u64,
    pub skipped: bool,
}

pub struct Checkpoint {
    store: Arc<dyn CheckpointStore>,
    cursor: SearchCursor,
}

impl Checkpoint {
    pub async fn load(store: Arc<dyn CheckpointStore>) -> Result<Self> {
        let cursor = store.get_cursor().await?;
        debug!(
            region = ?cursor.region,
            locality_index = ?cursor.locality_index,
            cycle = cursor.filter_cycle_index,
            "Checkpoint loaded"
        );
        Ok(Self { store, cursor })
    }

    pub fn cursor(&self) -> &SearchCursor {
        &self.cursor
    }

    pub fn resume_index(&self, region: &str) -> usize {
        resume_index(&self.cursor, region)
    }

    pub fn is_region_complete(&self, region: &str) -> bool {
        self.cursor
            .completed_regions
            .iter()
            .any(|r| r.eq_ignore_ascii_case(region))
    }

    pub fn filter_cycle_index(&self) -> usize {
        self.cursor.filter_cycle_index
    }

    /// Records that `index` in `region` was attempted (harvested, skipped or timed out)
    /// and persists immediately.
    pub async fn complete_locality(
        &mut self,
        region: &str,
        index: usize,
        tally: LocalityTally,
    ) -> Result<()> {
        let same_region = self
            .cursor
            .region
            .as_deref()
            .is_some_and(|r| r.eq_ignore_ascii_case(region));
        if same_region && self.cursor.locality_index.is_some_and(|done| index <= done) {
            warn!(region, index, "Locality already checkpointed, not moving backwards");
            return Ok(());
        }

        self.cursor.region = Some(region.to_string());
        self.cursor.locality_index = Some(index);
        self.cursor.total_persisted += tally.persisted;
        self.cursor.total_rejected += tally.rejected;
        if tally.skipped {
            self.cursor.total_skipped += 1;
        }
        self.store.upsert_cursor(&self.cursor, false).await
    }

    pub async fn complete_region(&mut self, region: &str) -> Result<()> {
        if !self.is_region_complete(region) {
            self.cursor.completed_regions.push(region.to_string());
        }
        self.cursor.region = None;
        self.cursor.locality_index = None;
        info!(region, "Region complete");
        self.store.upsert_cursor(&self.cursor, false).await
    }

    /// Moves to the next filter-cycle preset and clears region progress.
    /// Returns true when the rotation wrapped and a new global pass begins.
    pub async fn advance_filter_cycle(&mut self, cycle_count: usize) -> Result<bool> {
        let next = self.cursor.filter_cycle_index + 1;
        let wrapped = next >= cycle_count.max(1);
        if wrapped {
            self.cursor.filter_cycle_index = 0;
            self.cursor.pass_count += 1;
        } else {
            self.cursor.filter_cycle_index = next;
        }
        self.cursor.completed_regions.clear();
        self.cursor.region = None;
        self.cursor.locality_index = None;

        info!(
            cycle = self.cursor.filter_cycle_index,
            passes = self.cursor.pass_count,
            wrapped,
            "Filter cycle advanced"
        );
        self.store.upsert_cursor(&self.cursor, true).await?;
        Ok(wrapped)
    }
}
