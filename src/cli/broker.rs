use std::path::Path;

use comfy_table::{Cell, Table};

use crate::broker::registry::{self, IngestSummary};
use crate::db::Database;

pub async fn import_brokers(
    db: &Database,
    path: Option<&Path>,
    remote: bool,
    registry_url: &str,
) -> anyhow::Result<()> {
    let brokers = if remote {
        println!("Fetching broker registry...");
        registry::fetch_registry(registry_url).await?
    } else {
        let dir;
        let path = match path {
            Some(path) => path,
            None => {
                dir = crate::config::brokers_dir()?;
                dir.as_path()
            }
        };
        if !path.exists() {
            anyhow::bail!("No broker definitions at {}", path.display());
        }
        registry::load_definitions(path)?
    };

    let IngestSummary {
        inserted,
        updated,
        unchanged,
        scan_jobs_created,
    } = registry::ingest(db, &brokers)?;
    println!(
        "Imported {} brokers: {inserted} new, {updated} updated, {unchanged} unchanged.",
        brokers.len()
    );
    if scan_jobs_created > 0 {
        println!("Scheduled {scan_jobs_created} new scans.");
    }
    Ok(())
}

pub fn list_brokers(db: &Database) -> anyhow::Result<()> {
    let brokers = db.list_brokers()?;

    if brokers.is_empty() {
        println!("No brokers found. Run `data-breaker-agent broker import` first.");
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec!["Name", "Website", "Version", "Opt-out", "Maintenance scan"]);

    for b in &brokers {
        let opt_out = match (&b.parent, b.opt_out_step()) {
            (Some(parent), _) => format!("via {parent}"),
            (None, Some(_)) => "yes".to_string(),
            (None, None) => "-".to_string(),
        };
        table.add_row(vec![
            Cell::new(&b.name),
            Cell::new(&b.url),
            Cell::new(&b.version),
            Cell::new(opt_out),
            Cell::new(format!("{}h", b.scheduling_config.maintenance_scan)),
        ]);
    }

    println!("{table}");
    Ok(())
}
