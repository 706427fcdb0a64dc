use std::cmp::Ordering;
use std::path::Path;

use super::DataBroker;
use crate::db::Database;
use crate::db::queries::BrokerUpsert;

/// Counts reported after a definition import.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestSummary {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub scan_jobs_created: usize,
}

/// Compare dotted version strings numerically. Non-numeric parts compare as 0.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.trim_start_matches('v')
            .split('.')
            .map(|p| p.parse().unwrap_or(0))
            .collect()
    };
    let (a, b) = (parse(a), parse(b));
    let len = a.len().max(b.len());
    for i in 0..len {
        let ord = a.get(i).unwrap_or(&0).cmp(b.get(i).unwrap_or(&0));
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

pub fn is_newer_version(candidate: &str, stored: &str) -> bool {
    compare_versions(candidate, stored) == Ordering::Greater
}

/// Read broker definitions from a JSON file or a directory of JSON files.
/// A file may hold a single definition or an array of them.
pub fn load_definitions(path: &Path) -> anyhow::Result<Vec<DataBroker>> {
    if path.is_dir() {
        let mut entries = std::fs::read_dir(path)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect::<Vec<_>>();
        entries.sort();

        let mut brokers = Vec::new();
        for entry in entries {
            brokers.extend(load_definitions(&entry)?);
        }
        return Ok(brokers);
    }

    let text = std::fs::read_to_string(path)?;
    parse_definitions(&text)
        .map_err(|e| anyhow::anyhow!("Invalid broker definition in {}: {e}", path.display()))
}

fn parse_definitions(text: &str) -> Result<Vec<DataBroker>, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    if value.is_array() {
        serde_json::from_value(value)
    } else {
        Ok(vec![serde_json::from_value(value)?])
    }
}

/// Fetch broker definitions from the remote registry.
pub async fn fetch_registry(registry_url: &str) -> anyhow::Result<Vec<DataBroker>> {
    let client = reqwest::Client::new();
    let resp = client
        .get(registry_url)
        .header("User-Agent", "data-breaker-agent")
        .send()
        .await?;

    if !resp.status().is_success() {
        anyhow::bail!("Failed to fetch registry: HTTP {}", resp.status());
    }

    let text = resp.text().await?;
    Ok(parse_definitions(&text)?)
}

/// Store definitions, then make sure every broker has a scan job for the
/// active profile.
pub fn ingest(db: &Database, brokers: &[DataBroker]) -> anyhow::Result<IngestSummary> {
    let mut summary = IngestSummary::default();
    for broker in brokers {
        match db.upsert_broker(broker)? {
            BrokerUpsert::Inserted(_) => {
                tracing::info!("Added broker {} ({})", broker.name, broker.version);
                summary.inserted += 1;
            }
            BrokerUpsert::Updated(_) => {
                tracing::info!("Updated broker {} to {}", broker.name, broker.version);
                summary.updated += 1;
            }
            BrokerUpsert::Unchanged(_) => summary.unchanged += 1,
        }
    }
    summary.scan_jobs_created = db.sync_scan_jobs()?;
    Ok(summary)
}
