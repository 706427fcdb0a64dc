use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use super::OperationType;
use super::manager::OperationManager;
use crate::db::models::BrokerProfileQueryData;
use crate::error::{BrokerError, OperationError};
use crate::notify::TelemetryEvent;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueuedOperation {
    Scan {
        broker_id: i64,
        profile_query_id: i64,
        preferred_run_date: DateTime<Utc>,
    },
    OptOut {
        broker_id: i64,
        profile_query_id: i64,
        extracted_profile_id: i64,
        preferred_run_date: DateTime<Utc>,
    },
}

impl QueuedOperation {
    pub fn broker_id(&self) -> i64 {
        match *self {
            Self::Scan { broker_id, .. } | Self::OptOut { broker_id, .. } => broker_id,
        }
    }

    pub fn preferred_run_date(&self) -> DateTime<Utc> {
        match *self {
            Self::Scan {
                preferred_run_date,
                ..
            }
            | Self::OptOut {
                preferred_run_date,
                ..
            } => preferred_run_date,
        }
    }
}

/// `None` priority means everything that is scheduled at all.
fn due(date: Option<DateTime<Utc>>, priority_date: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    let date = date?;
    match priority_date {
        Some(priority) if date > priority => None,
        _ => Some(date),
    }
}

/// The due operations of one broker, run one after another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationsCollection {
    pub broker_id: i64,
    pub broker_name: String,
    pub operations: Vec<QueuedOperation>,
}

/// Group due operations by broker. Operations within a collection, and the
/// collections themselves, are ordered by earliest due date.
pub fn build_collections(
    all: &[BrokerProfileQueryData],
    operation_type: OperationType,
    priority_date: Option<DateTime<Utc>>,
) -> Vec<OperationsCollection> {
    let mut operations = Vec::new();
    let mut names = HashMap::new();

    for data in all {
        let broker_id = data.scan_job_data.broker_id;
        let profile_query_id = data.scan_job_data.profile_query_id;
        names.insert(broker_id, data.data_broker.name.clone());

        if operation_type.includes_scans()
            && (!data.profile_query.deprecated || data.has_tracked_profiles())
            && let Some(preferred_run_date) = due(data.scan_job_data.preferred_run_date, priority_date)
        {
            operations.push(QueuedOperation::Scan {
                broker_id,
                profile_query_id,
                preferred_run_date,
            });
        }

        if !operation_type.includes_opt_outs() || data.data_broker.performs_opt_outs_in_parent() {
            continue;
        }
        for job in &data.opt_out_jobs {
            if job.extracted_profile.removed_date.is_some() {
                continue;
            }
            let (Some(extracted_profile_id), Some(preferred_run_date)) = (
                job.extracted_profile_id(),
                due(job.preferred_run_date, priority_date),
            ) else {
                continue;
            };
            operations.push(QueuedOperation::OptOut {
                broker_id,
                profile_query_id,
                extracted_profile_id,
                preferred_run_date,
            });
        }
    }

    operations.sort_by_key(|op| op.preferred_run_date());

    let mut collections: Vec<OperationsCollection> = Vec::new();
    let mut index: HashMap<i64, usize> = HashMap::new();
    for op in operations {
        let broker_id = op.broker_id();
        let slot = *index.entry(broker_id).or_insert_with(|| {
            collections.push(OperationsCollection {
                broker_id,
                broker_name: names.get(&broker_id).cloned().unwrap_or_default(),
                operations: Vec::new(),
            });
            collections.len() - 1
        });
        collections[slot].operations.push(op);
    }
    collections
}

/// What happened to one collection during a pass.
#[derive(Debug)]
pub struct CollectionReport {
    pub broker_id: i64,
    pub broker_name: String,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: bool,
    pub last_error: Option<OperationError>,
}

impl OperationsCollection {
    pub async fn run(
        self,
        manager: Arc<OperationManager>,
        operation_interval: Duration,
        show_ui: bool,
        cancel: CancellationToken,
    ) -> CollectionReport {
        let mut report = CollectionReport {
            broker_id: self.broker_id,
            broker_name: self.broker_name.clone(),
            completed: 0,
            failed: 0,
            cancelled: false,
            last_error: None,
        };

        for (i, op) in self.operations.iter().enumerate() {
            if i > 0 && !operation_interval.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(operation_interval) => {}
                }
            }
            if cancel.is_cancelled() {
                tracing::info!(broker = %self.broker_name, "Collection cancelled");
                report.cancelled = true;
                break;
            }

            let result = match *op {
                QueuedOperation::Scan {
                    broker_id,
                    profile_query_id,
                    ..
                } => {
                    manager
                        .run_scan(broker_id, profile_query_id, show_ui, &cancel)
                        .await
                }
                QueuedOperation::OptOut {
                    broker_id,
                    profile_query_id,
                    extracted_profile_id,
                    ..
                } => {
                    manager
                        .run_opt_out(
                            broker_id,
                            profile_query_id,
                            extracted_profile_id,
                            show_ui,
                            &cancel,
                        )
                        .await
                }
            };

            match result {
                Ok(()) => report.completed += 1,
                Err(error) => {
                    match error.broker_error() {
                        Some(BrokerError::Cancelled) => report.cancelled = true,
                        Some(broker_error) => manager
                            .telemetry()
                            .fire(TelemetryEvent::from_error(&self.broker_name, broker_error)),
                        None => {
                            tracing::error!(broker = %self.broker_name, "Operation failed: {error}")
                        }
                    }
                    report.failed += 1;
                    report.last_error = Some(error);
                }
            }
        }
        report
    }
}
