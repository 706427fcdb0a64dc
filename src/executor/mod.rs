pub mod dummy;

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

use crate::broker::{Action, ActionType, ExtractedProfile, ProfileQuery};
use crate::error::BrokerError;

/// Site key and page URL a captcha solver needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptchaInfo {
    pub site_key: String,
    pub url: String,
    pub captcha_type: Option<String>,
}

/// Results an automation surface reports back to the job driving it.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutorEvent {
    Success {
        action_id: String,
        action_type: ActionType,
    },
    ExtractedProfiles {
        action_id: String,
        profiles: Vec<ExtractedProfile>,
    },
    CaptchaInformation {
        action_id: String,
        info: CaptchaInfo,
    },
    /// The page wants this script evaluated with the solved token applied.
    SolveCaptcha {
        action_id: String,
        callback: String,
    },
    Error {
        action_id: String,
        error: BrokerError,
    },
}

impl ExecutorEvent {
    pub fn action_id(&self) -> &str {
        match self {
            Self::Success { action_id, .. }
            | Self::ExtractedProfiles { action_id, .. }
            | Self::CaptchaInformation { action_id, .. }
            | Self::SolveCaptcha { action_id, .. }
            | Self::Error { action_id, .. } => action_id,
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<ExecutorEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<ExecutorEvent>;

/// Data handed to an action along with its recipe.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionInput {
    UserData {
        profile_query: ProfileQuery,
        extracted_profile: Option<ExtractedProfile>,
    },
    SolveCaptcha {
        token: String,
    },
}

/// Creates one automation surface per job.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn initialize(
        &self,
        show_ui: bool,
        events: EventSender,
    ) -> Result<Box<dyn AutomationSurface>, BrokerError>;
}

/// A single page context. `execute` only reports dispatch failures; action
/// results arrive on the event channel given to `initialize`.
#[async_trait]
pub trait AutomationSurface: Send {
    /// Load a page. A non-success response is `BrokerError::HttpError`.
    async fn load(&mut self, url: &Url) -> Result<(), BrokerError>;

    async fn execute(&mut self, action: &Action, input: ActionInput) -> Result<(), BrokerError>;

    async fn evaluate_script(&mut self, script: &str) -> Result<(), BrokerError>;

    /// Release the surface. Called exactly once when the job completes.
    async fn finish(&mut self);
}
