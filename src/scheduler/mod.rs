pub mod calculator;
pub mod collection;
pub mod job;
pub mod manager;
pub mod queue;
pub mod stage;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use collection::{CollectionReport, build_collections};
use manager::OperationManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OperationType {
    Scan,
    OptOut,
    All,
}

impl OperationType {
    pub fn includes_scans(self) -> bool {
        matches!(self, Self::Scan | Self::All)
    }

    pub fn includes_opt_outs(self) -> bool {
        matches!(self, Self::OptOut | Self::All)
    }
}

/// Runs one pass over all due work, one collection per broker, with at most
/// `max_concurrency` brokers in flight.
pub struct Scheduler {
    manager: Arc<OperationManager>,
    max_concurrency: usize,
    operation_interval: Duration,
}

impl Scheduler {
    pub fn new(
        manager: Arc<OperationManager>,
        max_concurrency: usize,
        operation_interval: Duration,
    ) -> Self {
        Self {
            manager,
            max_concurrency,
            operation_interval,
        }
    }

    /// `priority_date` of `None` runs everything that has a preferred run
    /// date, regardless of when.
    pub async fn run_operations(
        &self,
        operation_type: OperationType,
        priority_date: Option<DateTime<Utc>>,
        show_ui: bool,
        cancel: CancellationToken,
    ) -> anyhow::Result<Vec<CollectionReport>> {
        let all = self.manager.repository().fetch_all_query_data()?;
        self.manager.fire_confirmation_checkpoints(&all, Utc::now())?;

        let collections = build_collections(&all, operation_type, priority_date);
        let total: usize = collections.iter().map(|c| c.operations.len()).sum();
        tracing::info!(
            "Running {total} {operation_type:?} operations across {} brokers",
            collections.len()
        );

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for collection in collections {
            if cancel.is_cancelled() {
                break;
            }
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(err) => {
                        tracing::error!("scheduler semaphore closed: {err}");
                        break;
                    }
                },
            };
            let manager = self.manager.clone();
            let interval = self.operation_interval;
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let _permit = permit;
                collection.run(manager, interval, show_ui, cancel).await
            });
        }

        let mut reports = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => {
                    tracing::debug!(
                        broker = %report.broker_name,
                        completed = report.completed,
                        failed = report.failed,
                        "Collection finished"
                    );
                    reports.push(report);
                }
                Err(err) => tracing::error!("collection task failed: {err}"),
            }
        }
        reports.sort_by_key(|r| r.broker_id);
        Ok(reports)
    }
}
