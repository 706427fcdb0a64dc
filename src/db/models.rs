use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::broker::{DataBroker, ExtractedProfile, ProfileQuery};
use crate::error::BrokerError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HistoryEventKind {
    ScanStarted,
    MatchesFound { count: usize },
    NoMatchFound,
    OptOutStarted,
    OptOutRequested,
    OptOutConfirmed,
    Error { error: BrokerError },
}

impl HistoryEventKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::ScanStarted => "scan started",
            Self::MatchesFound { .. } => "matches found",
            Self::NoMatchFound => "no match found",
            Self::OptOutStarted => "opt-out started",
            Self::OptOutRequested => "opt-out requested",
            Self::OptOutConfirmed => "opt-out confirmed",
            Self::Error { .. } => "error",
        }
    }
}

/// Append-only fact about one operation. `extracted_profile_id` is `None`
/// for scan-level events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub broker_id: i64,
    pub profile_query_id: i64,
    pub extracted_profile_id: Option<i64>,
    pub kind: HistoryEventKind,
    pub date: DateTime<Utc>,
}

impl HistoryEvent {
    pub fn new(
        broker_id: i64,
        profile_query_id: i64,
        extracted_profile_id: Option<i64>,
        kind: HistoryEventKind,
    ) -> Self {
        Self {
            broker_id,
            profile_query_id,
            extracted_profile_id,
            kind,
            date: Utc::now(),
        }
    }

    #[cfg(test)]
    pub fn at(mut self, date: DateTime<Utc>) -> Self {
        self.date = date;
        self
    }

    /// Events that mark a record as handed to, or confirmed by, the broker's
    /// removal process.
    pub fn is_removal(&self) -> bool {
        matches!(
            self.kind,
            HistoryEventKind::OptOutRequested | HistoryEventKind::OptOutConfirmed
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanJobData {
    pub broker_id: i64,
    pub profile_query_id: i64,
    pub preferred_run_date: Option<DateTime<Utc>>,
    pub last_run_date: Option<DateTime<Utc>>,
    pub history_events: Vec<HistoryEvent>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptOutJobData {
    pub broker_id: i64,
    pub profile_query_id: i64,
    pub extracted_profile: ExtractedProfile,
    pub created_date: DateTime<Utc>,
    pub preferred_run_date: Option<DateTime<Utc>>,
    pub last_run_date: Option<DateTime<Utc>>,
    pub attempt_count: i64,
    pub submitted_successfully_date: Option<DateTime<Utc>>,
    pub seven_days_confirmation_fired: bool,
    pub fourteen_days_confirmation_fired: bool,
    pub twenty_one_days_confirmation_fired: bool,
    pub history_events: Vec<HistoryEvent>,
}

impl OptOutJobData {
    pub fn extracted_profile_id(&self) -> Option<i64> {
        self.extracted_profile.id
    }

    pub fn checkpoint_fired(&self, checkpoint: ConfirmationCheckpoint) -> bool {
        match checkpoint {
            ConfirmationCheckpoint::SevenDays => self.seven_days_confirmation_fired,
            ConfirmationCheckpoint::FourteenDays => self.fourteen_days_confirmation_fired,
            ConfirmationCheckpoint::TwentyOneDays => self.twenty_one_days_confirmation_fired,
        }
    }
}

/// Days after a successful submission at which an unconfirmed opt-out is
/// reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationCheckpoint {
    SevenDays,
    FourteenDays,
    TwentyOneDays,
}

impl ConfirmationCheckpoint {
    pub const ALL: [ConfirmationCheckpoint; 3] = [
        ConfirmationCheckpoint::SevenDays,
        ConfirmationCheckpoint::FourteenDays,
        ConfirmationCheckpoint::TwentyOneDays,
    ];

    pub fn days(&self) -> i64 {
        match self {
            Self::SevenDays => 7,
            Self::FourteenDays => 14,
            Self::TwentyOneDays => 21,
        }
    }

    pub(crate) fn column(&self) -> &'static str {
        match self {
            Self::SevenDays => "seven_days_confirmation_fired",
            Self::FourteenDays => "fourteen_days_confirmation_fired",
            Self::TwentyOneDays => "twenty_one_days_confirmation_fired",
        }
    }
}

/// Most recent opt-out attempt for one extracted profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptInformation {
    pub extracted_profile_id: i64,
    pub data_broker: String,
    pub attempt_id: Uuid,
    pub last_stage_date: DateTime<Utc>,
    pub start_date: DateTime<Utc>,
}

/// Everything the scheduler knows about one (broker, profile query) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerProfileQueryData {
    pub data_broker: DataBroker,
    pub profile_query: ProfileQuery,
    pub scan_job_data: ScanJobData,
    pub opt_out_jobs: Vec<OptOutJobData>,
}

impl BrokerProfileQueryData {
    /// Scan and opt-out events for the pair, oldest first.
    pub fn events(&self) -> Vec<HistoryEvent> {
        let mut events: Vec<HistoryEvent> = self
            .scan_job_data
            .history_events
            .iter()
            .chain(self.opt_out_jobs.iter().flat_map(|j| j.history_events.iter()))
            .cloned()
            .collect();
        events.sort_by_key(|e| e.date);
        events
    }

    pub fn extracted_profiles(&self) -> impl Iterator<Item = &ExtractedProfile> {
        self.opt_out_jobs.iter().map(|j| &j.extracted_profile)
    }

    pub fn opt_out_job(&self, extracted_profile_id: i64) -> Option<&OptOutJobData> {
        self.opt_out_jobs
            .iter()
            .find(|j| j.extracted_profile.id == Some(extracted_profile_id))
    }

    /// Deprecated queries are only worth scanning while a record is still
    /// awaiting confirmed removal.
    pub fn has_tracked_profiles(&self) -> bool {
        self.extracted_profiles().any(|p| p.removed_date.is_none())
    }
}
