use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use super::calculator::{next_opt_out_date, next_scan_date};
use super::job::{JobDependencies, JobSettings, OptOutJob, ScanJob};
use super::stage::AttemptTracker;
use crate::broker::ExtractedProfile;
use crate::db::Repository;
use crate::db::models::{
    AttemptInformation, BrokerProfileQueryData, ConfirmationCheckpoint, HistoryEvent,
    HistoryEventKind,
};
use crate::error::{BrokerError, OperationError};
use crate::notify::{Notification, NotificationSink, Telemetry, TelemetryEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Scan,
    OptOut(i64),
}

/// A stored date that is already due was consumed by the run that just
/// finished and must not win the earliest-date rule.
fn pending(date: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    date.filter(|d| *d > now)
}

/// Runs single scans and opt-outs and keeps the repository in step with
/// their outcomes.
pub struct OperationManager {
    repository: Arc<dyn Repository>,
    deps: JobDependencies,
    notifier: Arc<dyn NotificationSink>,
    telemetry: Arc<dyn Telemetry>,
    scan_settings: JobSettings,
    opt_out_settings: JobSettings,
}

impl OperationManager {
    pub fn new(
        repository: Arc<dyn Repository>,
        deps: JobDependencies,
        notifier: Arc<dyn NotificationSink>,
        telemetry: Arc<dyn Telemetry>,
        scan_settings: JobSettings,
        opt_out_settings: JobSettings,
    ) -> Self {
        Self {
            repository,
            deps,
            notifier,
            telemetry,
            scan_settings,
            opt_out_settings,
        }
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repository
    }

    pub fn telemetry(&self) -> &Arc<dyn Telemetry> {
        &self.telemetry
    }

    pub async fn run_scan(
        &self,
        broker_id: i64,
        profile_query_id: i64,
        show_ui: bool,
        cancel: &CancellationToken,
    ) -> Result<(), OperationError> {
        let data = self
            .repository
            .fetch_query_data(broker_id, profile_query_id)?
            .ok_or(BrokerError::DataNotInDatabase)?;
        let broker_name = data.data_broker.name.clone();
        tracing::info!(broker = %broker_name, profile_query_id, "Running scan");

        self.repository.add_history_event(&HistoryEvent::new(
            broker_id,
            profile_query_id,
            None,
            HistoryEventKind::ScanStarted,
        ))?;

        let job = ScanJob::new(
            data.data_broker.clone(),
            data.profile_query.clone(),
            self.scan_settings.clone(),
            self.deps.clone(),
            show_ui,
        );
        let outcome = match job.run(cancel.clone()).await {
            Ok(profiles) => self.handle_scan_results(&data, profiles),
            Err(error) => Err(error.into()),
        };
        let outcome = self.record_failure(outcome, broker_id, profile_query_id, None);

        let finalized = self.update_dates(Origin::Scan, broker_id, profile_query_id);
        self.notifier.notify(Notification::DidFinishScan {
            broker_name,
        });
        outcome.and(finalized)
    }

    pub async fn run_opt_out(
        &self,
        broker_id: i64,
        profile_query_id: i64,
        extracted_profile_id: i64,
        show_ui: bool,
        cancel: &CancellationToken,
    ) -> Result<(), OperationError> {
        let data = self
            .repository
            .fetch_query_data(broker_id, profile_query_id)?
            .ok_or(BrokerError::DataNotInDatabase)?;
        let job_data = data
            .opt_out_job(extracted_profile_id)
            .ok_or(BrokerError::DataNotInDatabase)?;

        if job_data.extracted_profile.removed_date.is_some() {
            tracing::debug!(extracted_profile_id, "Record already removed, skipping opt-out");
            return Ok(());
        }
        if data.data_broker.performs_opt_outs_in_parent() {
            tracing::debug!(broker = %data.data_broker.name, "Opt-out handled by parent broker");
            return Ok(());
        }

        let broker_name = data.data_broker.name.clone();
        tracing::info!(broker = %broker_name, extracted_profile_id, "Running opt-out");
        self.repository.add_history_event(&HistoryEvent::new(
            broker_id,
            profile_query_id,
            Some(extracted_profile_id),
            HistoryEventKind::OptOutStarted,
        ))?;

        let tracker = Arc::new(AttemptTracker::new(broker_name.clone()));
        let job = OptOutJob::new(
            data.data_broker.clone(),
            data.profile_query.clone(),
            job_data.extracted_profile.clone(),
            self.opt_out_settings.clone(),
            self.deps.clone(),
            show_ui,
            tracker.clone(),
        );
        let outcome = match job.run(cancel.clone()).await {
            Ok(()) => self.handle_opt_out_success(
                broker_id,
                profile_query_id,
                extracted_profile_id,
                &tracker,
            ),
            Err(error) => {
                tracing::warn!(
                    broker = %broker_name,
                    extracted_profile_id,
                    stage = ?tracker.stage(),
                    "Opt-out stopped"
                );
                Err(error.into())
            }
        };
        let outcome =
            self.record_failure(outcome, broker_id, profile_query_id, Some(extracted_profile_id));

        let finalized = self.update_dates(
            Origin::OptOut(extracted_profile_id),
            broker_id,
            profile_query_id,
        );
        self.notifier.notify(Notification::DidFinishOptOut {
            broker_name,
        });
        outcome.and(finalized)
    }

    fn handle_scan_results(
        &self,
        data: &BrokerProfileQueryData,
        profiles: Vec<ExtractedProfile>,
    ) -> Result<(), OperationError> {
        let broker_id = data.scan_job_data.broker_id;
        let profile_query_id = data.scan_job_data.profile_query_id;
        let now = Utc::now();

        let mut known = self
            .repository
            .fetch_extracted_profiles(broker_id, profile_query_id)?;
        let tracked: Vec<i64> = known
            .iter()
            .filter(|p| p.removed_date.is_none())
            .filter_map(|p| p.id)
            .collect();
        let mut present = HashSet::new();

        for profile in &profiles {
            match known.iter().find(|k| k.same_record(profile)) {
                Some(existing) => {
                    let id = existing.id.ok_or(BrokerError::DataNotInDatabase)?;
                    present.insert(id);
                    if existing.removed_date.is_some() {
                        tracing::info!(extracted_profile_id = id, "Removed record reappeared");
                        self.repository.update_removed_date(id, None)?;
                    }
                }
                None => {
                    let id = self.repository.save_opt_out_job(
                        broker_id,
                        profile_query_id,
                        profile,
                        Some(now),
                    )?;
                    tracing::info!(extracted_profile_id = id, "New record found");
                    present.insert(id);
                    known.push(ExtractedProfile {
                        id: Some(id),
                        ..profile.clone()
                    });
                }
            }
        }

        let kind = if profiles.is_empty() {
            HistoryEventKind::NoMatchFound
        } else {
            HistoryEventKind::MatchesFound {
                count: profiles.len(),
            }
        };
        self.repository.add_history_event(&HistoryEvent::new(
            broker_id,
            profile_query_id,
            None,
            kind,
        ))?;

        let mut confirmed = 0;
        for id in tracked.into_iter().filter(|id| !present.contains(id)) {
            tracing::info!(extracted_profile_id = id, "Record no longer listed, removal confirmed");
            self.repository.update_removed_date(id, Some(now))?;
            self.repository.add_history_event(&HistoryEvent::new(
                broker_id,
                profile_query_id,
                Some(id),
                HistoryEventKind::OptOutConfirmed,
            ))?;
            confirmed += 1;

            if let Some(attempt) = self.repository.fetch_attempt_information(id)? {
                self.telemetry.fire(TelemetryEvent::OptOutConfirmed {
                    broker: attempt.data_broker,
                    attempt_id: attempt.attempt_id,
                    duration_ms: (now - attempt.start_date).num_milliseconds(),
                });
            }
        }

        if confirmed > 0 {
            self.notify_removals(confirmed)?;
        }
        Ok(())
    }

    fn notify_removals(&self, confirmed_now: usize) -> Result<(), OperationError> {
        let all = self.repository.fetch_all_extracted_profiles()?;
        let removed = all.iter().filter(|p| p.removed_date.is_some()).count();
        if removed == all.len() {
            self.notifier.notify(Notification::AllRecordsRemoved);
        } else if removed == confirmed_now {
            self.notifier.notify(Notification::FirstRemoval);
        }
        Ok(())
    }

    fn handle_opt_out_success(
        &self,
        broker_id: i64,
        profile_query_id: i64,
        extracted_profile_id: i64,
        tracker: &AttemptTracker,
    ) -> Result<(), OperationError> {
        let now = Utc::now();
        self.repository.add_history_event(&HistoryEvent::new(
            broker_id,
            profile_query_id,
            Some(extracted_profile_id),
            HistoryEventKind::OptOutRequested,
        ))?;
        self.repository.record_opt_out_submitted(
            now,
            broker_id,
            profile_query_id,
            extracted_profile_id,
        )?;
        self.repository.add_attempt(&AttemptInformation {
            extracted_profile_id,
            data_broker: tracker.broker().to_string(),
            attempt_id: tracker.attempt_id(),
            last_stage_date: tracker.last_stage_date(),
            start_date: tracker.started_at(),
        })?;
        self.telemetry.fire(TelemetryEvent::OptOutSubmitSuccess {
            broker: tracker.broker().to_string(),
            attempt_id: tracker.attempt_id(),
            duration_ms: tracker.duration_ms(),
        });
        Ok(())
    }

    /// Job failures become `error` history events. Storage failures are
    /// passed through untouched.
    fn record_failure(
        &self,
        outcome: Result<(), OperationError>,
        broker_id: i64,
        profile_query_id: i64,
        extracted_profile_id: Option<i64>,
    ) -> Result<(), OperationError> {
        let Err(OperationError::Job(error)) = outcome else {
            return outcome;
        };
        tracing::warn!(broker_id, profile_query_id, ?extracted_profile_id, "Operation failed: {error}");
        self.repository.add_history_event(&HistoryEvent::new(
            broker_id,
            profile_query_id,
            extracted_profile_id,
            HistoryEventKind::Error {
                error: error.clone(),
            },
        ))?;
        Err(OperationError::Job(error))
    }

    /// Stamp the last run and recompute preferred run dates from history.
    /// A scan recomputes every opt-out of the pair; an opt-out only its own.
    fn update_dates(
        &self,
        origin: Origin,
        broker_id: i64,
        profile_query_id: i64,
    ) -> Result<(), OperationError> {
        let now = Utc::now();
        match origin {
            Origin::Scan => {
                self.repository
                    .update_scan_last_run_date(now, broker_id, profile_query_id)?
            }
            Origin::OptOut(ep) => self.repository.update_opt_out_last_run_date(
                now,
                broker_id,
                profile_query_id,
                ep,
            )?,
        }

        let data = self
            .repository
            .fetch_query_data(broker_id, profile_query_id)?
            .ok_or(BrokerError::DataNotInDatabase)?;
        let config = data.data_broker.scheduling_config;
        let events = data.events();

        let stored = data.scan_job_data.preferred_run_date;
        let current = match origin {
            Origin::Scan => pending(stored, now),
            Origin::OptOut(_) => stored,
        };
        let next = next_scan_date(now, current, &events, &config)?;
        if next != stored {
            tracing::debug!(broker_id, profile_query_id, "Next scan at {next:?}");
            self.repository
                .update_scan_preferred_run_date(next, broker_id, profile_query_id)?;
        }

        for job in &data.opt_out_jobs {
            let Some(ep) = job.extracted_profile_id() else {
                continue;
            };
            let current = match origin {
                Origin::OptOut(origin_ep) if origin_ep != ep => continue,
                Origin::OptOut(_) => pending(job.preferred_run_date, now),
                Origin::Scan => job.preferred_run_date,
            };
            let next = next_opt_out_date(now, current, &events, ep, &config)?;
            if next != job.preferred_run_date {
                tracing::debug!(extracted_profile_id = ep, "Next opt-out at {next:?}");
                self.repository.update_opt_out_preferred_run_date(
                    next,
                    broker_id,
                    profile_query_id,
                    ep,
                )?;
            }
        }
        Ok(())
    }

    /// Report opt-outs that were submitted but are still unconfirmed 7, 14 and
    /// 21 days later. Each checkpoint fires once per record.
    pub fn fire_confirmation_checkpoints(
        &self,
        all: &[BrokerProfileQueryData],
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        for data in all {
            for job in &data.opt_out_jobs {
                let (Some(ep), Some(submitted)) =
                    (job.extracted_profile_id(), job.submitted_successfully_date)
                else {
                    continue;
                };
                if job.extracted_profile.removed_date.is_some() {
                    continue;
                }
                for checkpoint in ConfirmationCheckpoint::ALL {
                    if job.checkpoint_fired(checkpoint)
                        || now - submitted < chrono::Duration::days(checkpoint.days())
                    {
                        continue;
                    }
                    if let Some(attempt) = self.repository.fetch_attempt_information(ep)? {
                        self.telemetry
                            .fire(TelemetryEvent::OptOutSubmittedNotConfirmed {
                                broker: data.data_broker.name.clone(),
                                attempt_id: attempt.attempt_id,
                                days: checkpoint.days(),
                            });
                    }
                    self.repository.mark_confirmation_checkpoint(
                        checkpoint,
                        job.broker_id,
                        job.profile_query_id,
                        ep,
                    )?;
                }
            }
        }
        Ok(())
    }
}
