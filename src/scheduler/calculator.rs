//! Next-run date computation. Everything here is pure: callers pass `now`.

use chrono::{DateTime, Utc};

use crate::broker::SchedulingConfig;
use crate::db::models::{HistoryEvent, HistoryEventKind};
use crate::error::ScheduleError;

enum Decision {
    Keep,
    Clear,
    At(DateTime<Utc>),
}

impl Decision {
    fn resolve(self, current: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
        match self {
            Decision::Keep => current,
            Decision::Clear => None,
            Decision::At(date) => Some(earliest(current, date)),
        }
    }
}

/// A newly computed date never pushes back one that is already scheduled.
fn earliest(current: Option<DateTime<Utc>>, proposed: DateTime<Utc>) -> DateTime<Utc> {
    match current {
        Some(current) if current < proposed => current,
        _ => proposed,
    }
}

pub fn next_scan_date(
    now: DateTime<Utc>,
    current: Option<DateTime<Utc>>,
    events: &[HistoryEvent],
    config: &SchedulingConfig,
) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    let last = events.last().ok_or(ScheduleError::EmptyHistory)?;
    let decision = match last.kind {
        HistoryEventKind::Error { .. } => Decision::At(now + config.retry_error_interval()),
        HistoryEventKind::MatchesFound { .. }
        | HistoryEventKind::NoMatchFound
        | HistoryEventKind::OptOutConfirmed => {
            Decision::At(now + config.maintenance_scan_interval())
        }
        HistoryEventKind::OptOutRequested => {
            Decision::At(now + config.confirm_opt_out_scan_interval())
        }
        HistoryEventKind::ScanStarted | HistoryEventKind::OptOutStarted => Decision::Keep,
    };
    Ok(decision.resolve(current))
}

/// `events` may hold the whole pair's history; only events for
/// `extracted_profile_id` and scan-level outcomes are considered. A failed
/// scan says nothing about a record, so scan-level errors are skipped.
pub fn next_opt_out_date(
    now: DateTime<Utc>,
    current: Option<DateTime<Utc>>,
    events: &[HistoryEvent],
    extracted_profile_id: i64,
    config: &SchedulingConfig,
) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    if events.is_empty() {
        return Err(ScheduleError::EmptyHistory);
    }
    let relevant = events
        .iter()
        .filter(|e| match e.extracted_profile_id {
            Some(id) => id == extracted_profile_id,
            None => !matches!(e.kind, HistoryEventKind::Error { .. }),
        })
        .collect::<Vec<_>>();
    let Some(last) = relevant.last() else {
        return Ok(current);
    };

    let decision = match last.kind {
        HistoryEventKind::Error { .. } => Decision::At(now + config.retry_error_interval()),
        HistoryEventKind::MatchesFound { .. } => {
            // The record is still listed. If it was handed to the broker's
            // removal process more than a maintenance interval ago, the broker
            // did not honor it and we opt out again.
            let last_removal = relevant
                .iter()
                .rev()
                .find(|e| e.extracted_profile_id == Some(extracted_profile_id) && e.is_removal());
            match last_removal {
                Some(removal) if now - removal.date >= config.maintenance_scan_interval() => {
                    Decision::At(now)
                }
                _ => Decision::Keep,
            }
        }
        HistoryEventKind::NoMatchFound
        | HistoryEventKind::ScanStarted
        | HistoryEventKind::OptOutStarted => Decision::Keep,
        HistoryEventKind::OptOutRequested | HistoryEventKind::OptOutConfirmed => Decision::Clear,
    };
    Ok(decision.resolve(current))
}
