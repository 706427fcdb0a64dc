//! Fixtures and scripted collaborators shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use crate::broker::{
    Action, ActionKind, DataBroker, ExtractedProfile, PageElement, ProfileQuery,
    SchedulingConfig, Step, StepType,
};
use crate::db::models::BrokerProfileQueryData;
use crate::db::{Database, Repository};
use crate::error::{BrokerError, CaptchaError, EmailError};
use crate::executor::{
    ActionExecutor, ActionInput, AutomationSurface, CaptchaInfo, EventSender, ExecutorEvent,
};
use crate::notify::{Notification, NotificationSink, Telemetry, TelemetryEvent};
use crate::scheduler::job::{JobDependencies, JobSettings};
use crate::scheduler::manager::OperationManager;
use crate::services::captcha::CaptchaService;
use crate::services::email::{EmailData, EmailService};

fn action(id: &str, kind: ActionKind) -> Action {
    Action {
        id: id.into(),
        kind,
    }
}

pub fn test_broker() -> DataBroker {
    DataBroker {
        id: None,
        name: "test-broker".into(),
        url: "test-broker.example.com".into(),
        version: "1.0.0".into(),
        parent: None,
        steps: vec![
            Step {
                step_type: StepType::Scan,
                actions: vec![
                    action(
                        "n0",
                        ActionKind::Navigate {
                            url: "https://test-broker.example.com/search/${firstName|downcase}-${lastName|downcase}/${state}".into(),
                        },
                    ),
                    action(
                        "x1",
                        ActionKind::Extract {
                            selector: ".result".into(),
                            profile: serde_json::Value::Null,
                        },
                    ),
                ],
            },
            Step {
                step_type: StepType::OptOut,
                actions: vec![
                    action(
                        "n1",
                        ActionKind::Navigate {
                            url: "${profileUrl}".into(),
                        },
                    ),
                    action(
                        "f1",
                        ActionKind::FillForm {
                            selector: "form".into(),
                            elements: vec![PageElement {
                                kind: "email".into(),
                                selector: Some("#email".into()),
                            }],
                        },
                    ),
                    action("k1", ActionKind::Click { elements: vec![] }),
                    action("e1", ActionKind::EmailConfirmation { polling_time: 0 }),
                ],
            },
        ],
        scheduling_config: SchedulingConfig {
            retry_error: 48,
            confirm_opt_out_scan: 72,
            maintenance_scan: 240,
        },
    }
}

pub fn profile_query() -> ProfileQuery {
    ProfileQuery {
        id: None,
        first_name: "Jane".into(),
        last_name: "Smith".into(),
        middle_name: None,
        city: "Austin".into(),
        state: "TX".into(),
        birth_year: 1980,
        deprecated: false,
    }
}

pub fn extracted(id: &str) -> ExtractedProfile {
    ExtractedProfile {
        name: Some("Jane Smith".into()),
        profile_url: Some(format!("https://test-broker.example.com/p/{id}")),
        identifier: Some(id.into()),
        ..Default::default()
    }
}

pub fn captcha_info() -> CaptchaInfo {
    CaptchaInfo {
        site_key: "site-key".into(),
        url: "https://test-broker.example.com/optout".into(),
        captcha_type: Some("recaptcha".into()),
    }
}

/// No waiting anywhere.
pub fn fast_settings(retries: u32) -> JobSettings {
    JobSettings {
        retries_on_error: retries,
        click_await: Duration::ZERO,
        retry_cooldown: Duration::ZERO,
        email_polling_retries: 3,
    }
}

#[track_caller]
pub fn assert_close(actual: DateTime<Utc>, expected: DateTime<Utc>) {
    let drift = (actual - expected).num_seconds().abs();
    assert!(drift <= 5, "{actual} is {drift}s away from {expected}");
}

/// What the scripted page answers to a dispatched action.
#[derive(Debug, Clone)]
pub enum Reply {
    Success,
    Profiles(Vec<ExtractedProfile>),
    Captcha(CaptchaInfo),
    Callback(String),
    Fail(BrokerError),
}

#[derive(Debug, Clone, Default)]
pub struct ExecutorLog {
    pub initialized: usize,
    pub dispatched: Vec<String>,
    pub loaded: Vec<String>,
    pub scripts: Vec<String>,
    pub finished: usize,
    pub inputs: Vec<ActionInput>,
}

#[derive(Default)]
struct Script {
    queued: HashMap<String, VecDeque<Reply>>,
    always: HashMap<String, Reply>,
    load_failure: Option<BrokerError>,
    fail_scripts: bool,
}

impl Script {
    fn reply_for(&mut self, action: &Action) -> Reply {
        if let Some(reply) = self.queued.get_mut(&action.id).and_then(|q| q.pop_front()) {
            return reply;
        }
        if let Some(reply) = self.always.get(&action.id) {
            return reply.clone();
        }
        match action.kind {
            ActionKind::Extract { .. } => Reply::Profiles(Vec::new()),
            ActionKind::GetCaptchaInfo { .. } => Reply::Captcha(captcha_info()),
            ActionKind::SolveCaptcha { .. } => Reply::Callback("cb".into()),
            _ => Reply::Success,
        }
    }
}

#[derive(Default)]
struct Shared {
    script: Mutex<Script>,
    log: Mutex<ExecutorLog>,
    finished: Notify,
}

/// Executor whose pages answer from a script and record every call.
#[derive(Default)]
pub struct ScriptedExecutor {
    shared: Arc<Shared>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a one-shot reply for `action_id`. Replies are used in order.
    pub fn reply(&self, action_id: &str, reply: Reply) {
        self.shared
            .script
            .lock()
            .unwrap()
            .queued
            .entry(action_id.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn always(&self, action_id: &str, reply: Reply) {
        self.shared
            .script
            .lock()
            .unwrap()
            .always
            .insert(action_id.to_string(), reply);
    }

    pub fn fail_next_load(&self, error: BrokerError) {
        self.shared.script.lock().unwrap().load_failure = Some(error);
    }

    pub fn fail_scripts(&self) {
        self.shared.script.lock().unwrap().fail_scripts = true;
    }

    pub fn log(&self) -> ExecutorLog {
        self.shared.log.lock().unwrap().clone()
    }

    pub async fn wait_finished(&self) {
        loop {
            let notified = self.shared.finished.notified();
            if self.log().finished > 0 {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl ActionExecutor for ScriptedExecutor {
    async fn initialize(
        &self,
        _show_ui: bool,
        events: EventSender,
    ) -> Result<Box<dyn AutomationSurface>, BrokerError> {
        self.shared.log.lock().unwrap().initialized += 1;
        Ok(Box::new(ScriptedSurface {
            shared: self.shared.clone(),
            events,
        }))
    }
}

struct ScriptedSurface {
    shared: Arc<Shared>,
    events: EventSender,
}

#[async_trait]
impl AutomationSurface for ScriptedSurface {
    async fn load(&mut self, url: &Url) -> Result<(), BrokerError> {
        self.shared.log.lock().unwrap().loaded.push(url.to_string());
        match self.shared.script.lock().unwrap().load_failure.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn execute(&mut self, action: &Action, input: ActionInput) -> Result<(), BrokerError> {
        {
            let mut log = self.shared.log.lock().unwrap();
            log.dispatched.push(action.id.clone());
            log.inputs.push(input);
        }
        let reply = self.shared.script.lock().unwrap().reply_for(action);
        let action_id = action.id.clone();
        let event = match reply {
            Reply::Success => ExecutorEvent::Success {
                action_id,
                action_type: action.action_type(),
            },
            Reply::Profiles(profiles) => ExecutorEvent::ExtractedProfiles {
                action_id,
                profiles,
            },
            Reply::Captcha(info) => ExecutorEvent::CaptchaInformation { action_id, info },
            Reply::Callback(callback) => ExecutorEvent::SolveCaptcha {
                action_id,
                callback,
            },
            Reply::Fail(error) => ExecutorEvent::Error { action_id, error },
        };
        self.events
            .send(event)
            .map_err(|_| BrokerError::unknown("job stopped listening"))
    }

    async fn evaluate_script(&mut self, script: &str) -> Result<(), BrokerError> {
        self.shared.log.lock().unwrap().scripts.push(script.to_string());
        if self.shared.script.lock().unwrap().fail_scripts {
            return Err(BrokerError::unknown("script threw"));
        }
        Ok(())
    }

    async fn finish(&mut self) {
        self.shared.log.lock().unwrap().finished += 1;
        self.shared.finished.notify_waiters();
    }
}

#[derive(Default)]
pub struct FakeCaptchaService {
    submitted: Mutex<usize>,
}

impl FakeCaptchaService {
    pub fn submitted(&self) -> usize {
        *self.submitted.lock().unwrap()
    }
}

#[async_trait]
impl CaptchaService for FakeCaptchaService {
    async fn submit_captcha_information(
        &self,
        _info: &CaptchaInfo,
        _attempt_id: Uuid,
        _cancel: &CancellationToken,
    ) -> Result<String, CaptchaError> {
        *self.submitted.lock().unwrap() += 1;
        Ok("tx-1".into())
    }

    async fn submit_captcha_to_be_resolved(
        &self,
        transaction_id: &str,
        _attempt_id: Uuid,
        _cancel: &CancellationToken,
    ) -> Result<String, CaptchaError> {
        Ok(format!("token-{transaction_id}"))
    }
}

#[derive(Default)]
pub struct FakeEmailService {
    generated: Mutex<usize>,
    polled_for: Mutex<Vec<String>>,
    link_failure: Mutex<Option<EmailError>>,
}

impl FakeEmailService {
    pub const ALIAS: &'static str = "alias-1@dbp.example.com";
    pub const LINK: &'static str = "https://test-broker.example.com/confirm?token=abc";

    pub fn generated(&self) -> usize {
        *self.generated.lock().unwrap()
    }

    pub fn polled_for(&self) -> Vec<String> {
        self.polled_for.lock().unwrap().clone()
    }

    pub fn fail_links(&self, error: EmailError) {
        *self.link_failure.lock().unwrap() = Some(error);
    }
}

#[async_trait]
impl EmailService for FakeEmailService {
    async fn get_email(&self, _broker_url: &str, _attempt_id: Uuid) -> Result<EmailData, EmailError> {
        *self.generated.lock().unwrap() += 1;
        Ok(EmailData {
            email_address: Self::ALIAS.into(),
            pattern: None,
        })
    }

    async fn get_confirmation_link(
        &self,
        email: &str,
        _retries: u32,
        _interval: Duration,
        _attempt_id: Uuid,
        _cancel: &CancellationToken,
    ) -> Result<Url, EmailError> {
        self.polled_for.lock().unwrap().push(email.to_string());
        if let Some(error) = self.link_failure.lock().unwrap().clone() {
            return Err(error);
        }
        Url::parse(Self::LINK).map_err(|e| EmailError::LinkRetrievalFailed(e.to_string()))
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    seen: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn take(&self) -> Vec<Notification> {
        std::mem::take(&mut *self.seen.lock().unwrap())
    }
}

impl NotificationSink for RecordingNotifier {
    fn notify(&self, notification: Notification) {
        self.seen.lock().unwrap().push(notification);
    }
}

#[derive(Default)]
pub struct RecordingTelemetry {
    fired: Mutex<Vec<TelemetryEvent>>,
}

impl RecordingTelemetry {
    pub fn take(&self) -> Vec<TelemetryEvent> {
        std::mem::take(&mut *self.fired.lock().unwrap())
    }
}

impl Telemetry for RecordingTelemetry {
    fn fire(&self, event: TelemetryEvent) {
        self.fired.lock().unwrap().push(event);
    }
}

/// An in-memory database holding one broker and one active profile query,
/// with its scan job due now.
pub struct Fixture {
    pub db: Arc<Database>,
    pub executor: Arc<ScriptedExecutor>,
    pub captcha: Arc<FakeCaptchaService>,
    pub email: Arc<FakeEmailService>,
    pub notifier: Arc<RecordingNotifier>,
    pub telemetry: Arc<RecordingTelemetry>,
    pub broker_id: i64,
    pub query_id: i64,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_broker(test_broker())
    }

    pub fn with_broker(broker: DataBroker) -> Self {
        let db = Database::open_in_memory().expect("in-memory database");
        let broker_id = db.upsert_broker(&broker).expect("insert broker").id();
        let query_id = db
            .save_profile_query(&profile_query())
            .expect("insert profile query");
        db.sync_scan_jobs().expect("create scan jobs");
        Self {
            db: Arc::new(db),
            executor: Arc::new(ScriptedExecutor::new()),
            captcha: Arc::new(FakeCaptchaService::default()),
            email: Arc::new(FakeEmailService::default()),
            notifier: Arc::new(RecordingNotifier::default()),
            telemetry: Arc::new(RecordingTelemetry::default()),
            broker_id,
            query_id,
        }
    }

    pub fn deps(&self) -> JobDependencies {
        JobDependencies {
            executor: self.executor.clone(),
            captcha: self.captcha.clone(),
            email: self.email.clone(),
        }
    }

    pub fn manager(&self) -> OperationManager {
        OperationManager::new(
            self.db.clone(),
            self.deps(),
            self.notifier.clone(),
            self.telemetry.clone(),
            fast_settings(0),
            fast_settings(0),
        )
    }

    pub fn save_profile(
        &self,
        profile: &ExtractedProfile,
        preferred_run_date: Option<DateTime<Utc>>,
    ) -> i64 {
        self.db
            .save_opt_out_job(self.broker_id, self.query_id, profile, preferred_run_date)
            .expect("insert opt-out job")
    }

    pub fn query_data(&self) -> BrokerProfileQueryData {
        self.db
            .fetch_query_data(self.broker_id, self.query_id)
            .expect("query data")
            .expect("pair exists")
    }
}
