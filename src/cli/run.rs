use std::sync::Arc;
use std::time::Duration;

use comfy_table::{Cell, Table};
use tokio::sync::broadcast;

use crate::config::AgentConfig;
use crate::db::Database;
use crate::error::QueueError;
use crate::executor::dummy::DummyExecutor;
use crate::notify::{BroadcastNotifier, Notification, TracingTelemetry};
use crate::scheduler::collection::CollectionReport;
use crate::scheduler::job::JobDependencies;
use crate::scheduler::manager::OperationManager;
use crate::scheduler::queue::{QueueManager, RunMode};
use crate::scheduler::{OperationType, Scheduler};
use crate::services::captcha::HttpCaptchaService;
use crate::services::email::HttpEmailService;

fn build_queue(
    db: Arc<Database>,
    config: &AgentConfig,
) -> anyhow::Result<(Arc<QueueManager>, Arc<BroadcastNotifier>)> {
    let service_url = config.service_url()?;
    let deps = JobDependencies {
        executor: Arc::new(DummyExecutor),
        captcha: Arc::new(HttpCaptchaService::new(
            service_url.clone(),
            config.captcha_submit_retries,
            config.captcha_result_retries,
            config.captcha_polling_interval(),
        )),
        email: Arc::new(HttpEmailService::new(service_url)),
    };
    let notifier = Arc::new(BroadcastNotifier::new(64));
    let manager = OperationManager::new(
        db,
        deps,
        notifier.clone(),
        Arc::new(TracingTelemetry),
        config.scan_settings(),
        config.opt_out_settings(),
    );
    let scheduler = Scheduler::new(
        Arc::new(manager),
        config.max_concurrency,
        config.operation_interval(),
    );
    Ok((Arc::new(QueueManager::new(Arc::new(scheduler))), notifier))
}

/// Print the notifications a user cares about as they happen.
fn announce(mut notifications: broadcast::Receiver<Notification>) {
    tokio::spawn(async move {
        loop {
            match notifications.recv().await {
                Ok(Notification::FirstRemoval) => {
                    println!("A broker has removed one of your records.")
                }
                Ok(Notification::AllRecordsRemoved) => {
                    println!("Every record found so far has been removed.")
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!("Missed {n} notifications")
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn print_reports(reports: &[CollectionReport]) {
    if reports.is_empty() {
        println!("Nothing was due.");
        return;
    }

    let mut table = Table::new();
    table.set_header(vec!["Broker", "Completed", "Failed", "Last error"]);
    for r in reports {
        let error = match (&r.last_error, r.cancelled) {
            (Some(e), _) => e.to_string(),
            (None, true) => "cancelled".to_string(),
            (None, false) => "-".to_string(),
        };
        table.add_row(vec![
            Cell::new(&r.broker_name),
            Cell::new(r.completed),
            Cell::new(r.failed),
            Cell::new(error),
        ]);
    }
    println!("{table}");
}

/// Run one pass. Ctrl-C lets in-flight operations finish, then stops.
pub async fn run_once(
    db: Arc<Database>,
    config: &AgentConfig,
    operation_type: OperationType,
    force: bool,
    show_ui: bool,
) -> anyhow::Result<()> {
    let (queue, notifier) = build_queue(db, config)?;
    announce(notifier.subscribe());

    let mode = if force {
        RunMode::Immediate
    } else {
        RunMode::Scheduled
    };
    let pass = queue.start(mode, operation_type, show_ui);
    tokio::pin!(pass);

    let result = tokio::select! {
        result = &mut pass => result,
        _ = tokio::signal::ctrl_c() => {
            println!("Stopping after in-flight operations finish...");
            queue.stop();
            pass.await
        }
    };

    match result {
        Ok(reports) => print_reports(&reports),
        Err(QueueError::Interrupted) => println!("Pass stopped early."),
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Run a scheduled pass now and then every `run_frequency` until Ctrl-C.
pub async fn run_agent(db: Arc<Database>, config: &AgentConfig, show_ui: bool) -> anyhow::Result<()> {
    let (queue, notifier) = build_queue(db, config)?;
    announce(notifier.subscribe());
    let frequency = config.run_frequency().max(Duration::from_secs(60));
    println!(
        "Agent started, running every {}h. Press Ctrl-C to stop.",
        frequency.as_secs() / 3600
    );

    loop {
        let pass = queue.start(RunMode::Scheduled, OperationType::All, show_ui);
        tokio::pin!(pass);
        let result = tokio::select! {
            result = &mut pass => result,
            _ = tokio::signal::ctrl_c() => {
                println!("Stopping after in-flight operations finish...");
                queue.stop();
                if let Err(e) = pass.await {
                    tracing::debug!("Final pass ended: {e}");
                }
                return Ok(());
            }
        };

        match result {
            Ok(reports) => {
                let failed: usize = reports.iter().map(|r| r.failed).sum();
                let completed: usize = reports.iter().map(|r| r.completed).sum();
                tracing::info!(completed, failed, "Pass finished");
            }
            Err(QueueError::CannotInterrupt) => tracing::info!("Previous pass still running"),
            Err(e) => tracing::warn!("Pass failed: {e}"),
        }

        tokio::select! {
            _ = tokio::time::sleep(frequency) => {}
            _ = tokio::signal::ctrl_c() => {
                queue.stop();
                println!("Agent stopped.");
                return Ok(());
            }
        }
    }
}
