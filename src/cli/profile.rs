use crate::broker::ProfileQuery;
use crate::db::Database;

pub fn set_profile(db: &Database, query: ProfileQuery) -> anyhow::Result<()> {
    if query.first_name.trim().is_empty() || query.last_name.trim().is_empty() {
        anyhow::bail!("First and last name are required");
    }
    if query.state.len() != 2 {
        anyhow::bail!("State must be a two-letter code, got '{}'", query.state);
    }

    let previous = db.active_profile_query()?;
    let id = db.save_profile_query(&query)?;
    let created = db.sync_scan_jobs()?;

    match previous {
        Some(p) if p.id == Some(id) => println!("Profile unchanged."),
        Some(_) => println!("Profile updated. The previous profile stays tracked until its records are removed."),
        None => println!("Profile saved."),
    }
    if created > 0 {
        println!("Scheduled {created} new scans.");
    }
    tracing::info!(profile_query_id = id, "Profile saved");
    Ok(())
}

pub fn show_profile(db: &Database) -> anyhow::Result<()> {
    match db.active_profile_query()? {
        Some(q) => {
            println!("Name:       {}", q.full_name());
            println!("Location:   {}, {}", q.city, q.state);
            println!("Birth year: {}", q.birth_year);
            let deprecated = db
                .list_profile_queries()?
                .iter()
                .filter(|p| p.deprecated)
                .count();
            if deprecated > 0 {
                println!("Previous:   {deprecated} still tracked");
            }
        }
        None => {
            println!("No profile set. Run `data-breaker-agent profile set` first.");
        }
    }
    Ok(())
}
