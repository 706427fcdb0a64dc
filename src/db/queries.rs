use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, params};
use serde::de::DeserializeOwned;

use super::models::{
    AttemptInformation, BrokerProfileQueryData, ConfirmationCheckpoint, HistoryEvent,
    HistoryEventKind, OptOutJobData, ScanJobData,
};
use super::{Database, Repository};
use crate::broker::registry::is_newer_version;
use crate::broker::{DataBroker, ExtractedProfile, ProfileQuery};

/// Outcome of ingesting one broker definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerUpsert {
    Inserted(i64),
    Updated(i64),
    Unchanged(i64),
}

#[cfg(test)]
impl BrokerUpsert {
    pub fn id(&self) -> i64 {
        match *self {
            Self::Inserted(id) | Self::Updated(id) | Self::Unchanged(id) => id,
        }
    }
}

impl Database {
    // --- Brokers ---

    /// Insert a broker, or replace the stored definition when this one carries
    /// a newer version.
    pub fn upsert_broker(&self, broker: &DataBroker) -> anyhow::Result<BrokerUpsert> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();
        let definition = serde_json::to_string(broker)?;

        let existing: Option<(i64, String)> = conn
            .query_row(
                "SELECT id, version FROM brokers WHERE name = ?1",
                params![broker.name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match existing {
            None => {
                conn.execute(
                    "INSERT INTO brokers (name, url, version, parent, definition, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                    params![
                        broker.name,
                        broker.url,
                        broker.version,
                        broker.parent,
                        definition,
                        now
                    ],
                )?;
                Ok(BrokerUpsert::Inserted(conn.last_insert_rowid()))
            }
            Some((id, stored)) if is_newer_version(&broker.version, &stored) => {
                conn.execute(
                    "UPDATE brokers SET url = ?1, version = ?2, parent = ?3, definition = ?4, updated_at = ?5
                     WHERE id = ?6",
                    params![
                        broker.url,
                        broker.version,
                        broker.parent,
                        definition,
                        now,
                        id
                    ],
                )?;
                Ok(BrokerUpsert::Updated(id))
            }
            Some((id, _)) => Ok(BrokerUpsert::Unchanged(id)),
        }
    }

    pub fn get_broker_by_name(&self, name: &str) -> anyhow::Result<Option<DataBroker>> {
        let conn = self.conn.lock().unwrap();
        let id: Option<i64> = conn
            .query_row(
                "SELECT id FROM brokers WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        match id {
            Some(id) => load_broker(&conn, id),
            None => Ok(None),
        }
    }

    pub fn list_brokers(&self) -> anyhow::Result<Vec<DataBroker>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT id, definition FROM brokers ORDER BY name")?;
        let rows = stmt.query_map([], map_broker_row)?;
        let mut brokers = Vec::new();
        for row in rows {
            brokers.push(row?);
        }
        Ok(brokers)
    }

    // --- Profile queries ---

    /// Store the user's profile. A profile that differs from the active one
    /// deprecates it; history for the old query is kept.
    pub fn save_profile_query(&self, query: &ProfileQuery) -> anyhow::Result<i64> {
        let conn = self.conn.lock().unwrap();
        let active = load_profile_queries(&conn)?
            .into_iter()
            .filter(|q| !q.deprecated)
            .collect::<Vec<_>>();

        if let Some(existing) = active.iter().find(|q| q.same_identity(query))
            && let Some(id) = existing.id
        {
            return Ok(id);
        }

        let tx = conn.unchecked_transaction()?;
        tx.execute("UPDATE profile_queries SET deprecated = 1 WHERE deprecated = 0", [])?;
        tx.execute(
            "INSERT INTO profile_queries (first_name, last_name, middle_name, city, state, birth_year, deprecated, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)",
            params![
                query.first_name,
                query.last_name,
                query.middle_name,
                query.city,
                query.state,
                query.birth_year,
                Utc::now()
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    pub fn list_profile_queries(&self) -> anyhow::Result<Vec<ProfileQuery>> {
        let conn = self.conn.lock().unwrap();
        load_profile_queries(&conn)
    }

    pub fn active_profile_query(&self) -> anyhow::Result<Option<ProfileQuery>> {
        Ok(self
            .list_profile_queries()?
            .into_iter()
            .rev()
            .find(|q| !q.deprecated))
    }

    /// Give every (broker, active query) pair a scan job due now, and drop the
    /// scan jobs of deprecated queries that have nothing left to track.
    /// Returns the number of jobs created.
    pub fn sync_scan_jobs(&self) -> anyhow::Result<usize> {
        let conn = self.conn.lock().unwrap();
        let created = conn.execute(
            "INSERT OR IGNORE INTO scan_jobs (broker_id, profile_query_id, preferred_run_date)
             SELECT b.id, q.id, ?1 FROM brokers b CROSS JOIN profile_queries q
             WHERE q.deprecated = 0",
            params![Utc::now()],
        )?;
        let pruned = conn.execute(
            "DELETE FROM scan_jobs
             WHERE profile_query_id IN (SELECT id FROM profile_queries WHERE deprecated = 1)
               AND NOT EXISTS (
                   SELECT 1 FROM extracted_profiles e
                   WHERE e.broker_id = scan_jobs.broker_id
                     AND e.profile_query_id = scan_jobs.profile_query_id
                     AND e.removed_date IS NULL
               )",
            [],
        )?;
        if pruned > 0 {
            tracing::debug!("Dropped {pruned} scan jobs of deprecated profile queries");
        }
        Ok(created)
    }
}

impl Repository for Database {
    fn fetch_all_query_data(&self) -> anyhow::Result<Vec<BrokerProfileQueryData>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT broker_id, profile_query_id FROM scan_jobs ORDER BY broker_id, profile_query_id",
        )?;
        let pairs = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut all = Vec::with_capacity(pairs.len());
        for (broker_id, profile_query_id) in pairs {
            if let Some(data) = load_query_data(&conn, broker_id, profile_query_id)? {
                all.push(data);
            }
        }
        Ok(all)
    }

    fn fetch_query_data(
        &self,
        broker_id: i64,
        profile_query_id: i64,
    ) -> anyhow::Result<Option<BrokerProfileQueryData>> {
        let conn = self.conn.lock().unwrap();
        load_query_data(&conn, broker_id, profile_query_id)
    }

    fn fetch_extracted_profiles(
        &self,
        broker_id: i64,
        profile_query_id: i64,
    ) -> anyhow::Result<Vec<ExtractedProfile>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, profile, removed_date FROM extracted_profiles
             WHERE broker_id = ?1 AND profile_query_id = ?2 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![broker_id, profile_query_id], map_profile_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn fetch_all_extracted_profiles(&self) -> anyhow::Result<Vec<ExtractedProfile>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT id, profile, removed_date FROM extracted_profiles ORDER BY id")?;
        let rows = stmt.query_map([], map_profile_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn save_opt_out_job(
        &self,
        broker_id: i64,
        profile_query_id: i64,
        profile: &ExtractedProfile,
        preferred_run_date: Option<DateTime<Utc>>,
    ) -> anyhow::Result<i64> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO extracted_profiles (broker_id, profile_query_id, identity, profile, removed_date)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                broker_id,
                profile_query_id,
                profile.identity(),
                serde_json::to_string(profile)?,
                profile.removed_date
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.execute(
            "INSERT INTO opt_out_jobs (extracted_profile_id, broker_id, profile_query_id, created_date, preferred_run_date)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, broker_id, profile_query_id, Utc::now(), preferred_run_date],
        )?;
        tx.commit()?;
        Ok(id)
    }

    fn update_removed_date(
        &self,
        extracted_profile_id: i64,
        date: Option<DateTime<Utc>>,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE extracted_profiles SET removed_date = ?1 WHERE id = ?2",
            params![date, extracted_profile_id],
        )?;
        Ok(())
    }

    fn update_scan_preferred_run_date(
        &self,
        date: Option<DateTime<Utc>>,
        broker_id: i64,
        profile_query_id: i64,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE scan_jobs SET preferred_run_date = ?1 WHERE broker_id = ?2 AND profile_query_id = ?3",
            params![date, broker_id, profile_query_id],
        )?;
        Ok(())
    }

    fn update_opt_out_preferred_run_date(
        &self,
        date: Option<DateTime<Utc>>,
        broker_id: i64,
        profile_query_id: i64,
        extracted_profile_id: i64,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE opt_out_jobs SET preferred_run_date = ?1
             WHERE broker_id = ?2 AND profile_query_id = ?3 AND extracted_profile_id = ?4",
            params![date, broker_id, profile_query_id, extracted_profile_id],
        )?;
        Ok(())
    }

    fn update_scan_last_run_date(
        &self,
        date: DateTime<Utc>,
        broker_id: i64,
        profile_query_id: i64,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE scan_jobs SET last_run_date = ?1 WHERE broker_id = ?2 AND profile_query_id = ?3",
            params![date, broker_id, profile_query_id],
        )?;
        Ok(())
    }

    fn update_opt_out_last_run_date(
        &self,
        date: DateTime<Utc>,
        broker_id: i64,
        profile_query_id: i64,
        extracted_profile_id: i64,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE opt_out_jobs SET last_run_date = ?1
             WHERE broker_id = ?2 AND profile_query_id = ?3 AND extracted_profile_id = ?4",
            params![date, broker_id, profile_query_id, extracted_profile_id],
        )?;
        Ok(())
    }

    fn record_opt_out_submitted(
        &self,
        date: DateTime<Utc>,
        broker_id: i64,
        profile_query_id: i64,
        extracted_profile_id: i64,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE opt_out_jobs
             SET attempt_count = attempt_count + 1, submitted_successfully_date = ?1
             WHERE broker_id = ?2 AND profile_query_id = ?3 AND extracted_profile_id = ?4",
            params![date, broker_id, profile_query_id, extracted_profile_id],
        )?;
        Ok(())
    }

    fn add_history_event(&self, event: &HistoryEvent) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO history_events (broker_id, profile_query_id, extracted_profile_id, event, date)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.broker_id,
                event.profile_query_id,
                event.extracted_profile_id,
                serde_json::to_string(&event.kind)?,
                event.date
            ],
        )?;
        Ok(())
    }

    fn fetch_history_events(
        &self,
        broker_id: i64,
        profile_query_id: i64,
    ) -> anyhow::Result<Vec<HistoryEvent>> {
        let conn = self.conn.lock().unwrap();
        load_events(&conn, broker_id, profile_query_id)
    }

    fn add_attempt(&self, attempt: &AttemptInformation) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO opt_out_attempts (extracted_profile_id, data_broker, attempt_id, last_stage_date, start_date)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                attempt.extracted_profile_id,
                attempt.data_broker,
                attempt.attempt_id.to_string(),
                attempt.last_stage_date,
                attempt.start_date
            ],
        )?;
        Ok(())
    }

    fn fetch_attempt_information(
        &self,
        extracted_profile_id: i64,
    ) -> anyhow::Result<Option<AttemptInformation>> {
        let conn = self.conn.lock().unwrap();
        let attempt = conn
            .query_row(
                "SELECT extracted_profile_id, data_broker, attempt_id, last_stage_date, start_date
                 FROM opt_out_attempts WHERE extracted_profile_id = ?1",
                params![extracted_profile_id],
                |row| {
                    let attempt_id: String = row.get(2)?;
                    Ok(AttemptInformation {
                        extracted_profile_id: row.get(0)?,
                        data_broker: row.get(1)?,
                        attempt_id: attempt_id.parse().map_err(|e| {
                            rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e))
                        })?,
                        last_stage_date: row.get(3)?,
                        start_date: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(attempt)
    }

    fn mark_confirmation_checkpoint(
        &self,
        checkpoint: ConfirmationCheckpoint,
        broker_id: i64,
        profile_query_id: i64,
        extracted_profile_id: i64,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            &format!(
                "UPDATE opt_out_jobs SET {} = 1
                 WHERE broker_id = ?1 AND profile_query_id = ?2 AND extracted_profile_id = ?3",
                checkpoint.column()
            ),
            params![broker_id, profile_query_id, extracted_profile_id],
        )?;
        Ok(())
    }
}

// Helpers below take the already-locked connection so composite reads never
// lock the mutex twice.

fn parse_json<T: DeserializeOwned>(idx: usize, text: &str) -> rusqlite::Result<T> {
    serde_json::from_str(text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn map_broker_row(row: &rusqlite::Row) -> rusqlite::Result<DataBroker> {
    let id: i64 = row.get(0)?;
    let definition: String = row.get(1)?;
    let mut broker: DataBroker = parse_json(1, &definition)?;
    broker.id = Some(id);
    Ok(broker)
}

fn map_profile_row(row: &rusqlite::Row) -> rusqlite::Result<ExtractedProfile> {
    let profile: String = row.get(1)?;
    let mut profile: ExtractedProfile = parse_json(1, &profile)?;
    profile.id = Some(row.get(0)?);
    profile.removed_date = row.get(2)?;
    Ok(profile)
}

fn load_broker(conn: &Connection, id: i64) -> anyhow::Result<Option<DataBroker>> {
    Ok(conn
        .query_row(
            "SELECT id, definition FROM brokers WHERE id = ?1",
            params![id],
            map_broker_row,
        )
        .optional()?)
}

fn map_profile_query_row(row: &rusqlite::Row) -> rusqlite::Result<ProfileQuery> {
    Ok(ProfileQuery {
        id: Some(row.get(0)?),
        first_name: row.get(1)?,
        last_name: row.get(2)?,
        middle_name: row.get(3)?,
        city: row.get(4)?,
        state: row.get(5)?,
        birth_year: row.get(6)?,
        deprecated: row.get(7)?,
    })
}

const PROFILE_QUERY_COLUMNS: &str =
    "id, first_name, last_name, middle_name, city, state, birth_year, deprecated";

fn load_profile_queries(conn: &Connection) -> anyhow::Result<Vec<ProfileQuery>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PROFILE_QUERY_COLUMNS} FROM profile_queries ORDER BY id"
    ))?;
    let rows = stmt.query_map([], map_profile_query_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn load_profile_query(conn: &Connection, id: i64) -> anyhow::Result<Option<ProfileQuery>> {
    Ok(conn
        .query_row(
            &format!("SELECT {PROFILE_QUERY_COLUMNS} FROM profile_queries WHERE id = ?1"),
            params![id],
            map_profile_query_row,
        )
        .optional()?)
}

fn load_events(
    conn: &Connection,
    broker_id: i64,
    profile_query_id: i64,
) -> anyhow::Result<Vec<HistoryEvent>> {
    let mut stmt = conn.prepare(
        "SELECT broker_id, profile_query_id, extracted_profile_id, event, date
         FROM history_events WHERE broker_id = ?1 AND profile_query_id = ?2
         ORDER BY date, id",
    )?;
    let rows = stmt.query_map(params![broker_id, profile_query_id], |row| {
        let kind: String = row.get(3)?;
        Ok(HistoryEvent {
            broker_id: row.get(0)?,
            profile_query_id: row.get(1)?,
            extracted_profile_id: row.get(2)?,
            kind: parse_json::<HistoryEventKind>(3, &kind)?,
            date: row.get(4)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn load_query_data(
    conn: &Connection,
    broker_id: i64,
    profile_query_id: i64,
) -> anyhow::Result<Option<BrokerProfileQueryData>> {
    let scan: Option<(Option<DateTime<Utc>>, Option<DateTime<Utc>>)> = conn
        .query_row(
            "SELECT preferred_run_date, last_run_date FROM scan_jobs
             WHERE broker_id = ?1 AND profile_query_id = ?2",
            params![broker_id, profile_query_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let Some((preferred_run_date, last_run_date)) = scan else {
        return Ok(None);
    };
    let Some(data_broker) = load_broker(conn, broker_id)? else {
        return Ok(None);
    };
    let Some(profile_query) = load_profile_query(conn, profile_query_id)? else {
        return Ok(None);
    };

    let (scan_events, opt_out_events): (Vec<_>, Vec<_>) =
        load_events(conn, broker_id, profile_query_id)?
            .into_iter()
            .partition(|e| e.extracted_profile_id.is_none());

    let mut stmt = conn.prepare(
        "SELECT e.id, e.profile, e.removed_date,
                o.created_date, o.preferred_run_date, o.last_run_date, o.attempt_count,
                o.submitted_successfully_date, o.seven_days_confirmation_fired,
                o.fourteen_days_confirmation_fired, o.twenty_one_days_confirmation_fired
         FROM opt_out_jobs o JOIN extracted_profiles e ON e.id = o.extracted_profile_id
         WHERE o.broker_id = ?1 AND o.profile_query_id = ?2
         ORDER BY e.id",
    )?;
    let rows = stmt.query_map(params![broker_id, profile_query_id], |row| {
        Ok(OptOutJobData {
            broker_id,
            profile_query_id,
            extracted_profile: map_profile_row(row)?,
            created_date: row.get(3)?,
            preferred_run_date: row.get(4)?,
            last_run_date: row.get(5)?,
            attempt_count: row.get(6)?,
            submitted_successfully_date: row.get(7)?,
            seven_days_confirmation_fired: row.get(8)?,
            fourteen_days_confirmation_fired: row.get(9)?,
            twenty_one_days_confirmation_fired: row.get(10)?,
            history_events: Vec::new(),
        })
    })?;
    let mut opt_out_jobs = rows.collect::<rusqlite::Result<Vec<_>>>()?;
    for job in &mut opt_out_jobs {
        job.history_events = opt_out_events
            .iter()
            .filter(|e| e.extracted_profile_id == job.extracted_profile.id)
            .cloned()
            .collect();
    }

    Ok(Some(BrokerProfileQueryData {
        data_broker,
        profile_query,
        scan_job_data: ScanJobData {
            broker_id,
            profile_query_id,
            preferred_run_date,
            last_run_date,
            history_events: scan_events,
        },
        opt_out_jobs,
    }))
}
