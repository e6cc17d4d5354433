use plotwalk_scanner::NormalizedListing;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Result, params};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub struct Database {
    conn: Connection,
}

/// Durable position of a sweep. One row per run key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchCursor {
    pub run_key: String,
    pub region: Option<String>,
    /// Index of the last finished locality in `region`.
    pub locality_index: Option<usize>,
    pub completed_regions: Vec<String>,
    pub filter_cycle_index: usize,
    /// Global passes completed.
    pub pass_count: u32,
    pub total_persisted: u64,
    pub total_rejected: u64,
    pub total_skipped: u64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Running,
    Completed,
    Paused,
    Cancelled,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Paused => "paused",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredListing {
    pub id: i64,
    pub full_address: String,
    pub street: String,
    pub city: String,
    pub region: String,
    pub postal: Option<String>,
    pub price: i64,
    pub beds: Option<f64>,
    pub baths: Option<f64>,
    pub sqft: Option<i64>,
    pub agent_name: Option<String>,
    pub agent_phone: Option<String>,
    pub agent_email: Option<String>,
    pub agent_brokerage: Option<String>,
    pub source: String,
    pub filter_cycle: Option<String>,
    pub valuation_status: String,
    pub estimated_value: Option<i64>,
    pub harvest_count: i64,
    pub first_seen: i64,
    pub last_seen: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepRun {
    pub id: String,
    pub run_key: String,
    pub started_at: i64,
    pub ended_at: Option<i64>,
    pub status: String,
    pub persisted: i64,
    pub rejected: i64,
    pub localities: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaState {
    pub count: u64,
    pub threshold: Option<u64>,
}

impl QuotaState {
    pub fn is_over(&self) -> bool {
        self.threshold.is_some_and(|t| self.count >= t)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

fn current_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}

impl Database {
    /// Removes the database file and any WAL sidecars.
    pub fn drop(path: &Path) -> std::io::Result<()> {
        fs::remove_file(path)?;
        for suffix in ["-wal", "-shm"] {
            let mut sidecar = path.as_os_str().to_owned();
            sidecar.push(suffix);
            let sidecar = Path::new(&sidecar);
            if sidecar.exists() {
                fs::remove_file(sidecar)?;
            }
        }
        Ok(())
    }
    pub fn exists(path: &Path) -> bool {
        path.exists()
    }
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            PRAGMA foreign_keys = ON;
            ",
        )?;

        let db = Database { conn };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            "
-- One row per listing, keyed by the case-folded full address
CREATE TABLE IF NOT EXISTS listings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    address_key TEXT UNIQUE NOT NULL,
    full_address TEXT NOT NULL,
    street TEXT NOT NULL,
    city TEXT NOT NULL,
    region TEXT NOT NULL,
    postal TEXT,

    price INTEGER NOT NULL,
    beds REAL,
    baths REAL,
    sqft INTEGER,

    agent_name TEXT,
    agent_phone TEXT,
    agent_email TEXT,
    agent_brokerage TEXT,

    source TEXT NOT NULL,
    filter_cycle TEXT,
    first_seen INTEGER NOT NULL,
    last_seen INTEGER NOT NULL,
    harvest_count INTEGER NOT NULL DEFAULT 1,

    -- Owned by the valuation stage, never written by a harvest
    valuation_status TEXT NOT NULL DEFAULT 'pending',
    estimated_value INTEGER
);

CREATE INDEX IF NOT EXISTS idx_listings_region ON listings(region);
CREATE INDEX IF NOT EXISTS idx_listings_valuation ON listings(valuation_status);

CREATE TABLE IF NOT EXISTS search_cursor (
    run_key TEXT PRIMARY KEY,
    region TEXT,
    locality_index INTEGER,
    completed_regions TEXT NOT NULL DEFAULT '[]',  -- JSON array
    filter_cycle_index INTEGER NOT NULL DEFAULT 0,
    pass_count INTEGER NOT NULL DEFAULT 0,
    total_persisted INTEGER NOT NULL DEFAULT 0,
    total_rejected INTEGER NOT NULL DEFAULT 0,
    total_skipped INTEGER NOT NULL DEFAULT 0,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS quota (
    name TEXT PRIMARY KEY,
    count INTEGER NOT NULL DEFAULT 0,
    threshold INTEGER
);

CREATE TABLE IF NOT EXISTS sweep_runs (
    id TEXT PRIMARY KEY,
    run_key TEXT NOT NULL,
    started_at INTEGER NOT NULL,
    ended_at INTEGER,
    status TEXT NOT NULL CHECK(status IN ('running', 'completed', 'paused', 'cancelled', 'failed')),
    persisted INTEGER NOT NULL DEFAULT 0,
    rejected INTEGER NOT NULL DEFAULT 0,
    localities INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_sweep_runs_key ON sweep_runs(run_key);
            ",
        )?;
        Ok(())
    }

    // Listings
    pub fn upsert_listing(
        &self,
        listing: &NormalizedListing,
        filter_cycle: Option<&str>,
    ) -> Result<UpsertOutcome> {
        let key = listing.full_address.to_lowercase();
        let timestamp = current_timestamp();
        let existed = self
            .conn
            .query_row(
                "SELECT id FROM listings WHERE address_key = ?1",
                params![&key],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
            .is_some();

        // Agent columns keep their previous value when a later harvest found none.
        self.conn.execute(
            "INSERT INTO listings (
                address_key, full_address, street, city, region, postal,
                price, beds, baths, sqft,
                agent_name, agent_phone, agent_email, agent_brokerage,
                source, filter_cycle, first_seen, last_seen
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?17)
            ON CONFLICT(address_key) DO UPDATE SET
                full_address = excluded.full_address,
                street = excluded.street,
                city = excluded.city,
                region = excluded.region,
                postal = excluded.postal,
                price = excluded.price,
                beds = excluded.beds,
                baths = excluded.baths,
                sqft = excluded.sqft,
                agent_name = COALESCE(excluded.agent_name, listings.agent_name),
                agent_phone = COALESCE(excluded.agent_phone, listings.agent_phone),
                agent_email = COALESCE(excluded.agent_email, listings.agent_email),
                agent_brokerage = COALESCE(excluded.agent_brokerage, listings.agent_brokerage),
                source = excluded.source,
                filter_cycle = excluded.filter_cycle,
                last_seen = excluded.last_seen,
                harvest_count = listings.harvest_count + 1",
            params![
                &key,
                &listing.full_address,
                &listing.address.street,
                &listing.address.city,
                &listing.region,
                &listing.address.postal,
                listing.price,
                listing.beds,
                listing.baths,
                listing.sqft,
                &listing.agent.name,
                &listing.agent.phone,
                &listing.agent.email,
                &listing.agent.brokerage,
                &listing.source,
                filter_cycle,
                timestamp,
            ],
        )?;

        Ok(if existed {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Inserted
        })
    }

    pub fn get_listing_by_address(&self, address: &str) -> Result<Option<StoredListing>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {LISTING_COLUMNS} FROM listings WHERE address_key = ?1"
        ))?;
        stmt.query_row(params![address.to_lowercase()], listing_from_row)
            .optional()
    }

    pub fn get_listings(&self, region: Option<&str>) -> Result<Vec<StoredListing>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {LISTING_COLUMNS} FROM listings
             WHERE ?1 IS NULL OR region = UPPER(?1)
             ORDER BY region, city, street"
        ))?;
        let listings = stmt
            .query_map(params![region], listing_from_row)?
            .collect::<Result<Vec<_>>>()?;
        Ok(listings)
    }

    pub fn count_listings(&self) -> Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM listings", [], |row| row.get(0))
    }

    /// Written by the downstream valuation stage.
    pub fn set_valuation(&self, address: &str, status: &str, estimated_value: Option<i64>) -> Result<usize> {
        self.conn.execute(
            "UPDATE listings SET valuation_status = ?1, estimated_value = ?2 WHERE address_key = ?3",
            params![status, estimated_value, address.to_lowercase()],
        )
    }

    // Checkpoint cursor
    pub fn get_cursor(&self, run_key: &str) -> Result<Option<SearchCursor>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_key, region, locality_index, completed_regions, filter_cycle_index,
                    pass_count, total_persisted, total_rejected, total_skipped, updated_at
             FROM search_cursor WHERE run_key = ?1",
        )?;
        stmt.query_row(params![run_key], |row| {
            let completed: String = row.get(3)?;
            Ok(SearchCursor {
                run_key: row.get(0)?,
                region: row.get(1)?,
                locality_index: row.get::<_, Option<i64>>(2)?.map(|i| i as usize),
                completed_regions: serde_json::from_str(&completed).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e))
                })?,
                filter_cycle_index: row.get::<_, i64>(4)? as usize,
                pass_count: row.get::<_, i64>(5)? as u32,
                total_persisted: row.get::<_, i64>(6)? as u64,
                total_rejected: row.get::<_, i64>(7)? as u64,
                total_skipped: row.get::<_, i64>(8)? as u64,
                updated_at: row.get(9)?,
            })
        })
        .optional()
    }

    /// Writes the cursor. The filter-cycle columns are only written when
    /// `advance_filter_cycle` is set; otherwise the stored values are kept.
    pub fn upsert_cursor(&self, cursor: &SearchCursor, advance_filter_cycle: bool) -> Result<()> {
        let completed = serde_json::to_string(&cursor.completed_regions)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        let (cycle, passes) = if advance_filter_cycle {
            (cursor.filter_cycle_index as i64, cursor.pass_count as i64)
        } else {
            (0, 0)
        };

        self.conn.execute(
            "INSERT INTO search_cursor (
                run_key, region, locality_index, completed_regions, filter_cycle_index,
                pass_count, total_persisted, total_rejected, total_skipped, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(run_key) DO UPDATE SET
                region = excluded.region,
                locality_index = excluded.locality_index,
                completed_regions = excluded.completed_regions,
                filter_cycle_index = CASE WHEN ?11 THEN excluded.filter_cycle_index
                                          ELSE search_cursor.filter_cycle_index END,
                pass_count = CASE WHEN ?11 THEN excluded.pass_count
                                  ELSE search_cursor.pass_count END,
                total_persisted = excluded.total_persisted,
                total_rejected = excluded.total_rejected,
                total_skipped = excluded.total_skipped,
                updated_at = excluded.updated_at",
            params![
                &cursor.run_key,
                &cursor.region,
                cursor.locality_index.map(|i| i as i64),
                completed,
                cycle,
                passes,
                cursor.total_persisted as i64,
                cursor.total_rejected as i64,
                cursor.total_skipped as i64,
                current_timestamp(),
                advance_filter_cycle,
            ],
        )?;
        Ok(())
    }

    pub fn clear_cursor(&self, run_key: &str) -> Result<usize> {
        self.conn
            .execute("DELETE FROM search_cursor WHERE run_key = ?1", params![run_key])
    }

    // Quota
    pub fn get_quota(&self, name: &str) -> Result<QuotaState> {
        let state = self
            .conn
            .query_row(
                "SELECT count, threshold FROM quota WHERE name = ?1",
                params![name],
                |row| {
                    Ok(QuotaState {
                        count: row.get::<_, i64>(0)? as u64,
                        threshold: row.get::<_, Option<i64>>(1)?.map(|t| t as u64),
                    })
                },
            )
            .optional()?;
        Ok(state.unwrap_or_default())
    }

    pub fn set_quota_threshold(&self, name: &str, threshold: Option<u64>) -> Result<()> {
        self.conn.execute(
            "INSERT INTO quota (name, count, threshold) VALUES (?1, 0, ?2)
             ON CONFLICT(name) DO UPDATE SET threshold = excluded.threshold",
            params![name, threshold.map(|t| t as i64)],
        )?;
        Ok(())
    }

    pub fn increment_quota(&self, name: &str) -> Result<QuotaState> {
        self.conn.execute(
            "INSERT INTO quota (name, count) VALUES (?1, 1)
             ON CONFLICT(name) DO UPDATE SET count = count + 1",
            params![name],
        )?;
        self.get_quota(name)
    }

    pub fn reset_quota(&self, name: &str) -> Result<()> {
        self.conn
            .execute("UPDATE quota SET count = 0 WHERE name = ?1", params![name])?;
        Ok(())
    }

    // Run log
    pub fn create_run(&self, run_key: &str) -> Result<String> {
        let run_id = uuid::Uuid::new_v4().to_string();
        self.conn.execute(
            "INSERT INTO sweep_runs (id, run_key, started_at, status) VALUES (?1, ?2, ?3, ?4)",
            params![&run_id, run_key, current_timestamp(), RunStatus::Running.as_str()],
        )?;
        Ok(run_id)
    }

    pub fn finish_run(
        &self,
        run_id: &str,
        status: RunStatus,
        persisted: u64,
        rejected: u64,
        localities: u64,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE sweep_runs
             SET status = ?1, ended_at = ?2, persisted = ?3, rejected = ?4, localities = ?5
             WHERE id = ?6",
            params![
                status.as_str(),
                current_timestamp(),
                persisted as i64,
                rejected as i64,
                localities as i64,
                run_id
            ],
        )?;
        Ok(())
    }

    pub fn get_runs(&self, run_key: &str, limit: usize) -> Result<Vec<SweepRun>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, run_key, started_at, ended_at, status, persisted, rejected, localities
             FROM sweep_runs WHERE run_key = ?1 ORDER BY started_at DESC, rowid DESC LIMIT ?2",
        )?;
        let runs = stmt
            .query_map(params![run_key, limit as i64], |row| {
                Ok(SweepRun {
                    id: row.get(0)?,
                    run_key: row.get(1)?,
                    started_at: row.get(2)?,
                    ended_at: row.get(3)?,
                    status: row.get(4)?,
                    persisted: row.get(5)?,
                    rejected: row.get(6)?,
                    localities: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>>>()?;
        Ok(runs)
    }

    pub fn get_connection(&self) -> &Connection {
        &self.conn
    }
}

const LISTING_COLUMNS: &str = "id, full_address, street, city, region, postal, price, beds, baths, sqft,
    agent_name, agent_phone, agent_email, agent_brokerage, source, filter_cycle,
    valuation_status, estimated_value, harvest_count, first_seen, last_seen";

fn listing_from_row(row: &rusqlite::Row<'_>) -> Result<StoredListing> {
    Ok(StoredListing {
        id: row.get(0)?,
        full_address: row.get(1)?,
        street: row.get(2)?,
        city: row.get(3)?,
        region: row.get(4)?,
        postal: row.get(5)?,
        price: row.get(6)?,
        beds: row.get(7)?,
        baths: row.get(8)?,
        sqft: row.get(9)?,
        agent_name: row.get(10)?,
        agent_phone: row.get(11)?,
        agent_email: row.get(12)?,
        agent_brokerage: row.get(13)?,
        source: row.get(14)?,
        filter_cycle: row.get(15)?,
        valuation_status: row.get(16)?,
        estimated_value: row.get(17)?,
        harvest_count: row.get(18)?,
        first_seen: row.get(19)?,
        last_seen: row.get(20)?,
    })
}
