//! Persistence seams used by the orchestrator, and their SQLite implementation.

use crate::data::{Database, QuotaState, SearchCursor, UpsertOutcome};
use crate::error::{Result, SweepError};
use async_trait::async_trait;
use plotwalk_scanner::NormalizedListing;
use std::sync::{Arc, Mutex, MutexGuard};

pub const INGEST_QUOTA: &str = "ingest";

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// The stored cursor, or a fresh one when this run key has none yet.
    async fn get_cursor(&self) -> Result<SearchCursor>;

    /// Filter-cycle fields are only written when `advance_filter_cycle` is set.
    async fn upsert_cursor(&self, cursor: &SearchCursor, advance_filter_cycle: bool) -> Result<()>;
}

#[async_trait]
pub trait ListingStore: Send + Sync {
    /// Last write wins on mutable fields; valuation fields are insert-only.
    async fn upsert_by_address(
        &self,
        listing: &NormalizedListing,
        filter_cycle: Option<&str>,
    ) -> Result<UpsertOutcome>;
}

#[async_trait]
pub trait QuotaGate: Send + Sync {
    /// Counts one ingested record; true once the threshold is reached.
    async fn increment_and_check(&self) -> Result<bool>;

    async fn is_over_threshold(&self) -> Result<bool>;
}

/// All three stores over one SQLite database.
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Mutex<Database>>,
    run_key: String,
}

impl SqliteStore {
    pub fn new(db: Database, run_key: &str) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            run_key: run_key.to_string(),
        }
    }

    pub fn run_key(&self) -> &str {
        &self.run_key
    }

    pub fn db(&self) -> Result<MutexGuard<'_, Database>> {
        self.db.lock().map_err(|_| SweepError::LockPoisoned)
    }

    pub fn quota(&self) -> Result<QuotaState> {
        Ok(self.db()?.get_quota(INGEST_QUOTA)?)
    }
}

#[async_trait]
impl CheckpointStore for SqliteStore {
    async fn get_cursor(&self) -> Result<SearchCursor> {
        let cursor = self.db()?.get_cursor(&self.run_key)?;
        Ok(cursor.unwrap_or_else(|| SearchCursor {
            run_key: self.run_key.clone(),
            ..Default::default()
        }))
    }

    async fn upsert_cursor(&self, cursor: &SearchCursor, advance_filter_cycle: bool) -> Result<()> {
        let mut cursor = cursor.clone();
        cursor.run_key = self.run_key.clone();
        self.db()?.upsert_cursor(&cursor, advance_filter_cycle)?;
        Ok(())
    }
}

#[async_trait]
impl ListingStore for SqliteStore {
    async fn upsert_by_address(
        &self,
        listing: &NormalizedListing,
        filter_cycle: Option<&str>,
    ) -> Result<UpsertOutcome> {
        Ok(self.db()?.upsert_listing(listing, filter_cycle)?)
    }
}

#[async_trait]
impl QuotaGate for SqliteStore {
    async fn increment_and_check(&self) -> Result<bool> {
        Ok(self.db()?.increment_quota(INGEST_QUOTA)?.is_over())
    }

    async fn is_over_threshold(&self) -> Result<bool> {
        Ok(self.quota()?.is_over())
    }
}
