use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure kinds a broker job can resolve with.
///
/// These are persisted inside `error` history events, so the serialized form
/// is part of the database format.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum BrokerError {
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Broker has no opt-out step")]
    NoOptOutStep,

    #[error("Broker has no scan step")]
    NoScanStep,

    #[error("HTTP error {code}")]
    HttpError { code: u16 },

    #[error("Action {action_id} failed: {message}")]
    ActionFailed { action_id: String, message: String },

    #[error("Email error{}", .error.as_ref().map(|e| format!(": {e}")).unwrap_or_default())]
    EmailError { error: Option<EmailError> },

    #[error("Captcha service error: {error}")]
    CaptchaServiceError { error: CaptchaError },

    #[error("Captcha callback could not be evaluated")]
    SolvingCaptchaWithCallbackError,

    #[error("Data not in database")]
    DataNotInDatabase,

    #[error("Malformed URL: {url}")]
    MalformedUrl { url: String },

    #[error("{message}")]
    Unknown { message: String },
}

impl BrokerError {
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::Unknown {
            message: message.into(),
        }
    }

    /// Whether a job should spend a retry on this failure.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Cancelled | Self::NoOptOutStep | Self::NoScanStep | Self::DataNotInDatabase
        )
    }
}

impl From<CaptchaError> for BrokerError {
    fn from(error: CaptchaError) -> Self {
        match error {
            CaptchaError::Cancelled => Self::Cancelled,
            error => Self::CaptchaServiceError { error },
        }
    }
}

impl From<EmailError> for BrokerError {
    fn from(error: EmailError) -> Self {
        match error {
            EmailError::Cancelled => Self::Cancelled,
            error => Self::EmailError { error: Some(error) },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CaptchaError {
    #[error("error when submitting captcha")]
    ErrorWhenSubmittingCaptcha,
    #[error("critical failure when submitting captcha")]
    CriticalFailureWhenSubmittingCaptcha,
    #[error("invalid request when submitting captcha")]
    InvalidRequestWhenSubmittingCaptcha,
    #[error("timed out when submitting captcha")]
    TimedOutWhenSubmittingCaptcha,
    #[error("error when fetching captcha result")]
    ErrorWhenFetchingCaptchaResult,
    #[error("captcha service could not solve the captcha")]
    FailureWhenFetchingCaptchaResult,
    #[error("invalid request when fetching captcha result")]
    InvalidRequestWhenFetchingCaptchaResult,
    #[error("no data when fetching captcha result")]
    NilDataWhenFetchingCaptchaResult,
    #[error("timed out when fetching captcha result")]
    TimedOutWhenFetchingCaptchaResult,
    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EmailError {
    #[error("no email address for this profile")]
    CantFindEmail,
    #[error("could not generate an email alias: {0}")]
    CantGenerateEmail(String),
    #[error("email service request failed: {0}")]
    RequestFailed(String),
    #[error("confirmation link retrieval failed with status {0}")]
    LinkRetrievalFailed(String),
    #[error("timed out waiting for the confirmation link")]
    LinkTimedOut,
    #[error("cancelled")]
    Cancelled,
}

/// What the operation manager reports for one scan or opt-out run.
#[derive(Debug, Error)]
pub enum OperationError {
    #[error(transparent)]
    Job(#[from] BrokerError),

    #[error("Scheduling error: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("Storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl OperationError {
    pub fn broker_error(&self) -> Option<&BrokerError> {
        match self {
            Self::Job(error) => Some(error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("No history events to schedule from")]
    EmptyHistory,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("A scheduled pass cannot interrupt the running pass")]
    CannotInterrupt,

    #[error("Pass was interrupted by a newer pass")]
    Interrupted,

    #[error("Could not start the pass: {0}")]
    Startup(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_round_trips_through_json() {
        let error = BrokerError::EmailError {
            error: Some(EmailError::LinkTimedOut),
        };
        let json = serde_json::to_string(&error).unwrap();
        assert!(json.contains("\"kind\":\"emailError\""));
        let back: BrokerError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, error);
    }

    #[test]
    fn test_service_cancellation_maps_to_cancelled() {
        assert_eq!(BrokerError::from(CaptchaError::Cancelled), BrokerError::Cancelled);
        assert_eq!(BrokerError::from(EmailError::Cancelled), BrokerError::Cancelled);
        assert_eq!(
            BrokerError::from(CaptchaError::TimedOutWhenFetchingCaptchaResult),
            BrokerError::CaptchaServiceError {
                error: CaptchaError::TimedOutWhenFetchingCaptchaResult
            }
        );
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(BrokerError::HttpError { code: 500 }.is_retryable());
        assert!(BrokerError::unknown("boom").is_retryable());
        assert!(!BrokerError::Cancelled.is_retryable());
        assert!(!BrokerError::NoOptOutStep.is_retryable());
    }

    #[test]
    fn test_email_error_display() {
        assert_eq!(BrokerError::EmailError { error: None }.to_string(), "Email error");
        assert_eq!(
            BrokerError::EmailError {
                error: Some(EmailError::CantFindEmail)
            }
            .to_string(),
            "Email error: no email address for this profile"
        );
    }
}
