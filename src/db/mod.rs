pub mod migrations;
pub mod models;
pub mod queries;

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::broker::ExtractedProfile;
use models::{AttemptInformation, BrokerProfileQueryData, ConfirmationCheckpoint, HistoryEvent};

/// Storage the scheduling core reads and writes.
///
/// Calls are synchronous and any error is fatal to the operation that made
/// it; callers propagate rather than retry.
pub trait Repository: Send + Sync {
    fn fetch_all_query_data(&self) -> anyhow::Result<Vec<BrokerProfileQueryData>>;

    fn fetch_query_data(
        &self,
        broker_id: i64,
        profile_query_id: i64,
    ) -> anyhow::Result<Option<BrokerProfileQueryData>>;

    fn fetch_extracted_profiles(
        &self,
        broker_id: i64,
        profile_query_id: i64,
    ) -> anyhow::Result<Vec<ExtractedProfile>>;

    fn fetch_all_extracted_profiles(&self) -> anyhow::Result<Vec<ExtractedProfile>>;

    /// Store a newly found record together with its opt-out job. Returns the
    /// new extracted profile id.
    fn save_opt_out_job(
        &self,
        broker_id: i64,
        profile_query_id: i64,
        profile: &ExtractedProfile,
        preferred_run_date: Option<DateTime<Utc>>,
    ) -> anyhow::Result<i64>;

    fn update_removed_date(
        &self,
        extracted_profile_id: i64,
        date: Option<DateTime<Utc>>,
    ) -> anyhow::Result<()>;

    fn update_scan_preferred_run_date(
        &self,
        date: Option<DateTime<Utc>>,
        broker_id: i64,
        profile_query_id: i64,
    ) -> anyhow::Result<()>;

    fn update_opt_out_preferred_run_date(
        &self,
        date: Option<DateTime<Utc>>,
        broker_id: i64,
        profile_query_id: i64,
        extracted_profile_id: i64,
    ) -> anyhow::Result<()>;

    fn update_scan_last_run_date(
        &self,
        date: DateTime<Utc>,
        broker_id: i64,
        profile_query_id: i64,
    ) -> anyhow::Result<()>;

    fn update_opt_out_last_run_date(
        &self,
        date: DateTime<Utc>,
        broker_id: i64,
        profile_query_id: i64,
        extracted_profile_id: i64,
    ) -> anyhow::Result<()>;

    /// Bump the attempt count and stamp the successful submission date.
    fn record_opt_out_submitted(
        &self,
        date: DateTime<Utc>,
        broker_id: i64,
        profile_query_id: i64,
        extracted_profile_id: i64,
    ) -> anyhow::Result<()>;

    fn add_history_event(&self, event: &HistoryEvent) -> anyhow::Result<()>;

    /// Scan and opt-out events for a pair in insertion order.
    fn fetch_history_events(
        &self,
        broker_id: i64,
        profile_query_id: i64,
    ) -> anyhow::Result<Vec<HistoryEvent>>;

    fn add_attempt(&self, attempt: &AttemptInformation) -> anyhow::Result<()>;

    fn fetch_attempt_information(
        &self,
        extracted_profile_id: i64,
    ) -> anyhow::Result<Option<AttemptInformation>>;

    fn mark_confirmation_checkpoint(
        &self,
        checkpoint: ConfirmationCheckpoint,
        broker_id: i64,
        profile_query_id: i64,
        extracted_profile_id: i64,
    ) -> anyhow::Result<()>;
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        migrations::run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        migrations::run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}
