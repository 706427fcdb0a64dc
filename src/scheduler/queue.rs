use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use super::collection::CollectionReport;
use super::{OperationType, Scheduler};
use crate::error::QueueError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// User-requested: runs everything scheduled and replaces a running pass.
    Immediate,
    /// Timer-driven: runs only what is due and never interrupts.
    Scheduled,
}

struct RunningPass {
    generation: u64,
    cancel: CancellationToken,
}

/// Guarantees at most one pass at a time.
pub struct QueueManager {
    scheduler: Arc<Scheduler>,
    shutdown: CancellationToken,
    running: Mutex<Option<RunningPass>>,
    generation: Mutex<u64>,
}

impl QueueManager {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self {
            scheduler,
            shutdown: CancellationToken::new(),
            running: Mutex::new(None),
            generation: Mutex::new(0),
        }
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.running.lock().unwrap().is_some()
    }

    pub async fn start(
        &self,
        mode: RunMode,
        operation_type: OperationType,
        show_ui: bool,
    ) -> Result<Vec<CollectionReport>, QueueError> {
        let (generation, cancel) = {
            let mut running = self.running.lock().unwrap();
            if let Some(pass) = running.as_ref() {
                match mode {
                    RunMode::Scheduled => return Err(QueueError::CannotInterrupt),
                    RunMode::Immediate => {
                        tracing::info!("Interrupting running pass");
                        pass.cancel.cancel();
                    }
                }
            }
            let generation = {
                let mut counter = self.generation.lock().unwrap();
                *counter += 1;
                *counter
            };
            let cancel = self.shutdown.child_token();
            *running = Some(RunningPass {
                generation,
                cancel: cancel.clone(),
            });
            (generation, cancel)
        };

        let priority_date = match mode {
            RunMode::Immediate => None,
            RunMode::Scheduled => Some(Utc::now()),
        };
        tracing::info!("Starting {mode:?} pass for {operation_type:?} operations");
        let result = self
            .scheduler
            .run_operations(operation_type, priority_date, show_ui, cancel.clone())
            .await;

        {
            let mut running = self.running.lock().unwrap();
            if running.as_ref().is_some_and(|p| p.generation == generation) {
                *running = None;
            }
        }

        let reports = result.map_err(|e| QueueError::Startup(e.to_string()))?;
        if cancel.is_cancelled() {
            return Err(QueueError::Interrupted);
        }
        Ok(reports)
    }

    /// Cancel the running pass and every later one.
    pub fn stop(&self) {
        tracing::info!("Stopping operation queue");
        self.shutdown.cancel();
    }
}
