use rusqlite::Connection;

const MIGRATIONS: &[&str] = &[
    // Migration 1: Initial schema
    "CREATE TABLE IF NOT EXISTS brokers (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        url TEXT NOT NULL,
        version TEXT NOT NULL,
        parent TEXT,
        definition TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS profile_queries (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        first_name TEXT NOT NULL,
        last_name TEXT NOT NULL,
        middle_name TEXT,
        city TEXT NOT NULL,
        state TEXT NOT NULL,
        birth_year INTEGER NOT NULL,
        deprecated INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS scan_jobs (
        broker_id INTEGER NOT NULL REFERENCES brokers(id) ON DELETE CASCADE,
        profile_query_id INTEGER NOT NULL REFERENCES profile_queries(id) ON DELETE CASCADE,
        preferred_run_date TEXT,
        last_run_date TEXT,
        PRIMARY KEY (broker_id, profile_query_id)
    );

    CREATE TABLE IF NOT EXISTS extracted_profiles (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        broker_id INTEGER NOT NULL REFERENCES brokers(id) ON DELETE CASCADE,
        profile_query_id INTEGER NOT NULL REFERENCES profile_queries(id) ON DELETE CASCADE,
        identity TEXT,
        profile TEXT NOT NULL,
        removed_date TEXT
    );

    CREATE TABLE IF NOT EXISTS opt_out_jobs (
        extracted_profile_id INTEGER PRIMARY KEY REFERENCES extracted_profiles(id) ON DELETE CASCADE,
        broker_id INTEGER NOT NULL REFERENCES brokers(id) ON DELETE CASCADE,
        profile_query_id INTEGER NOT NULL REFERENCES profile_queries(id) ON DELETE CASCADE,
        created_date TEXT NOT NULL,
        preferred_run_date TEXT,
        last_run_date TEXT,
        attempt_count INTEGER NOT NULL DEFAULT 0,
        submitted_successfully_date TEXT,
        seven_days_confirmation_fired INTEGER NOT NULL DEFAULT 0,
        fourteen_days_confirmation_fired INTEGER NOT NULL DEFAULT 0,
        twenty_one_days_confirmation_fired INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE IF NOT EXISTS history_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        broker_id INTEGER NOT NULL REFERENCES brokers(id) ON DELETE CASCADE,
        profile_query_id INTEGER NOT NULL REFERENCES profile_queries(id) ON DELETE CASCADE,
        extracted_profile_id INTEGER,
        event TEXT NOT NULL,
        date TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_history_events_pair
        ON history_events (broker_id, profile_query_id, date);

    CREATE TABLE IF NOT EXISTS opt_out_attempts (
        extracted_profile_id INTEGER PRIMARY KEY REFERENCES extracted_profiles(id) ON DELETE CASCADE,
        data_broker TEXT NOT NULL,
        attempt_id TEXT NOT NULL,
        last_stage_date TEXT NOT NULL,
        start_date TEXT NOT NULL
    );",
];

pub fn run_migrations(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS _migrations (version INTEGER PRIMARY KEY)")?;

    let current_version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |row| row.get(0),
    )?;

    for (i, sql) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i64;
        if version > current_version {
            conn.execute_batch(sql)?;
            conn.execute("INSERT INTO _migrations (version) VALUES (?1)", [version])?;
            tracing::info!("Applied migration {version}");
        }
    }

    Ok(())
}
