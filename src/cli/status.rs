use chrono::{DateTime, Utc};
use comfy_table::{Cell, Table};
use serde::Serialize;

use crate::db::models::{BrokerProfileQueryData, HistoryEvent, HistoryEventKind};
use crate::db::{Database, Repository};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JobRow {
    broker: String,
    profile_query_id: Option<i64>,
    kind: &'static str,
    record: Option<String>,
    preferred_run_date: Option<DateTime<Utc>>,
    last_run_date: Option<DateTime<Utc>>,
    last_event: Option<String>,
    removed_date: Option<DateTime<Utc>>,
}

fn last_label(events: &[HistoryEvent]) -> Option<String> {
    events.last().map(|e| e.kind.label().to_string())
}

fn rows(all: &[BrokerProfileQueryData]) -> Vec<JobRow> {
    let mut rows = Vec::new();
    for data in all {
        let broker = &data.data_broker.name;
        rows.push(JobRow {
            broker: broker.clone(),
            profile_query_id: data.profile_query.id,
            kind: "scan",
            record: None,
            preferred_run_date: data.scan_job_data.preferred_run_date,
            last_run_date: data.scan_job_data.last_run_date,
            last_event: last_label(&data.scan_job_data.history_events),
            removed_date: None,
        });
        for job in &data.opt_out_jobs {
            rows.push(JobRow {
                broker: broker.clone(),
                profile_query_id: data.profile_query.id,
                kind: "opt-out",
                record: job.extracted_profile.identity().map(str::to_string),
                preferred_run_date: job.preferred_run_date,
                last_run_date: job.last_run_date,
                last_event: last_label(&job.history_events),
                removed_date: job.extracted_profile.removed_date,
            });
        }
    }
    rows
}

fn date(d: Option<DateTime<Utc>>) -> String {
    d.map(|d| d.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string())
}

pub fn status(db: &Database, json: bool) -> anyhow::Result<()> {
    let all = db.fetch_all_query_data()?;
    let rows = rows(&all);

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    if rows.is_empty() {
        println!("No jobs yet. Set a profile and import brokers first.");
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec!["Broker", "Job", "Record", "Next run", "Last run", "Last event"]);
    for row in &rows {
        let record = match (&row.record, row.removed_date) {
            (Some(r), Some(_)) => format!("{r} (removed)"),
            (Some(r), None) => r.clone(),
            (None, _) => "-".to_string(),
        };
        table.add_row(vec![
            Cell::new(&row.broker),
            Cell::new(row.kind),
            Cell::new(record),
            Cell::new(date(row.preferred_run_date)),
            Cell::new(date(row.last_run_date)),
            Cell::new(row.last_event.as_deref().unwrap_or("-")),
        ]);
    }
    println!("{table}");

    let found = rows.iter().filter(|r| r.kind == "opt-out").count();
    let removed = rows.iter().filter(|r| r.removed_date.is_some()).count();
    println!("{found} records found, {removed} removed.");
    Ok(())
}

fn describe(kind: &HistoryEventKind) -> String {
    match kind {
        HistoryEventKind::MatchesFound { count } => format!("{} ({count})", kind.label()),
        HistoryEventKind::Error { error } => format!("{}: {error}", kind.label()),
        other => other.label().to_string(),
    }
}

pub fn history(db: &Database, broker_name: &str) -> anyhow::Result<()> {
    let broker = db
        .get_broker_by_name(broker_name)?
        .ok_or_else(|| anyhow::anyhow!("Broker '{}' not found", broker_name))?;
    let broker_id = broker
        .id
        .ok_or_else(|| anyhow::anyhow!("Broker '{}' has no id", broker_name))?;

    let mut events = Vec::new();
    for query in db.list_profile_queries()? {
        if let Some(query_id) = query.id {
            events.extend(db.fetch_history_events(broker_id, query_id)?);
        }
    }
    events.sort_by_key(|e| e.date);

    if events.is_empty() {
        println!("No history for {broker_name}.");
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec!["Date", "Profile", "Record", "Event"]);
    for e in &events {
        table.add_row(vec![
            Cell::new(e.date.format("%Y-%m-%d %H:%M:%S")),
            Cell::new(e.profile_query_id),
            Cell::new(
                e.extracted_profile_id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "-".to_string()),
            ),
            Cell::new(describe(&e.kind)),
        ]);
    }
    println!("{table}");
    Ok(())
}
