use std::sync::{Arc, LazyLock};
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use super::stage::{AttemptTracker, Stage};
use crate::broker::{Action, ActionKind, ActionType, DataBroker, ExtractedProfile, ProfileQuery};
use crate::error::{BrokerError, CaptchaError, EmailError};
use crate::executor::{
    ActionExecutor, ActionInput, AutomationSurface, EventReceiver, ExecutorEvent,
};
use crate::services::captcha::CaptchaService;
use crate::services::email::EmailService;

/// Timing and retry knobs for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSettings {
    /// Failed dispatches a job may retry, counted across all of its actions.
    pub retries_on_error: u32,
    /// Wait after a successful click before the next action.
    pub click_await: Duration,
    pub retry_cooldown: Duration,
    pub email_polling_retries: u32,
}

impl JobSettings {
    pub fn scan() -> Self {
        Self {
            retries_on_error: 3,
            click_await: Duration::ZERO,
            retry_cooldown: Duration::from_secs(3),
            email_polling_retries: 100,
        }
    }

    pub fn opt_out() -> Self {
        Self {
            retries_on_error: 0,
            click_await: Duration::from_secs(40),
            retry_cooldown: Duration::from_secs(3),
            email_polling_retries: 100,
        }
    }
}

/// Collaborators injected into every job.
#[derive(Clone)]
pub struct JobDependencies {
    pub executor: Arc<dyn ActionExecutor>,
    pub captcha: Arc<dyn CaptchaService>,
    pub email: Arc<dyn EmailService>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalEvent {
    Captcha,
    Email,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Initializing,
    Running { action_index: usize },
    AwaitingExternalEvent(ExternalEvent),
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobKind {
    Scan,
    OptOut,
}

type JobResult = Result<Vec<ExtractedProfile>, BrokerError>;

/// Hands the job's result to its caller. Only the first call has an effect.
struct JobResolver {
    sender: Option<oneshot::Sender<JobResult>>,
}

impl JobResolver {
    fn new(sender: oneshot::Sender<JobResult>) -> Self {
        Self {
            sender: Some(sender),
        }
    }

    fn resolve(&mut self, result: JobResult) -> bool {
        match self.sender.take() {
            Some(sender) => {
                // The caller may have stopped waiting.
                let _ = sender.send(result);
                true
            }
            None => {
                if let Err(error) = result {
                    tracing::debug!("Job already resolved, dropping late error: {error}");
                }
                false
            }
        }
    }
}

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{(\w+)(?:\|(\w+))?\}").expect("placeholder pattern is valid")
});

/// Fill `${field}` placeholders in a recipe URL. A `|downcase` or `|upcase`
/// suffix transforms the value.
pub fn resolve_url(
    template: &str,
    query: &ProfileQuery,
    profile: Option<&ExtractedProfile>,
) -> Result<Url, BrokerError> {
    let malformed = || BrokerError::MalformedUrl {
        url: template.to_string(),
    };

    let mut resolved = String::with_capacity(template.len());
    let mut last = 0;
    for caps in PLACEHOLDER.captures_iter(template) {
        let (Some(whole), Some(field)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let value = match field.as_str() {
            "firstName" => Some(query.first_name.clone()),
            "lastName" => Some(query.last_name.clone()),
            "middleName" => query.middle_name.clone(),
            "fullName" => Some(query.full_name()),
            "city" => Some(query.city.clone()),
            "state" => Some(query.state.clone()),
            "age" => Some(query.age(Utc::now()).to_string()),
            "birthYear" => Some(query.birth_year.to_string()),
            "profileUrl" => profile.and_then(|p| p.profile_url.clone()),
            "identifier" => profile.and_then(|p| p.identifier.clone()),
            _ => None,
        }
        .ok_or_else(malformed)?;

        let value = match caps.get(2).map(|m| m.as_str()) {
            Some("downcase") => value.to_lowercase(),
            Some("upcase") => value.to_uppercase(),
            Some(_) => return Err(malformed()),
            None => value,
        };

        resolved.push_str(&template[last..whole.start()]);
        // A whole-URL placeholder is inserted verbatim; path segments are encoded.
        if whole.start() == 0 && whole.end() == template.len() {
            resolved.push_str(&value);
        } else {
            resolved.push_str(&value.replace(' ', "%20"));
        }
        last = whole.end();
    }
    resolved.push_str(&template[last..]);

    Url::parse(&resolved).map_err(|_| BrokerError::MalformedUrl { url: resolved })
}

/// One scan run for a (broker, profile query) pair.
pub struct ScanJob {
    broker: DataBroker,
    profile_query: ProfileQuery,
    settings: JobSettings,
    deps: JobDependencies,
    show_ui: bool,
}

impl ScanJob {
    pub fn new(
        broker: DataBroker,
        profile_query: ProfileQuery,
        settings: JobSettings,
        deps: JobDependencies,
        show_ui: bool,
    ) -> Self {
        Self {
            broker,
            profile_query,
            settings,
            deps,
            show_ui,
        }
    }

    /// Resolves as soon as records are extracted; remaining actions keep
    /// running in the background. Resolves with an empty list when the recipe
    /// finishes without extracting anything.
    pub async fn run(self, cancel: CancellationToken) -> Result<Vec<ExtractedProfile>, BrokerError> {
        let actions = self
            .broker
            .scan_step()
            .ok_or(BrokerError::NoScanStep)?
            .actions
            .clone();

        let (sender, receiver) = oneshot::channel();
        let driver = JobDriver {
            kind: JobKind::Scan,
            broker: self.broker,
            actions,
            profile_query: self.profile_query,
            extracted_profile: None,
            settings: self.settings,
            deps: self.deps,
            cancel,
            show_ui: self.show_ui,
            attempt_id: Uuid::new_v4(),
            tracker: None,
            state: JobState::Initializing,
            profiles: Vec::new(),
            captcha_transaction: None,
            resolver: JobResolver::new(sender),
        };
        tokio::spawn(driver.run());
        receiver
            .await
            .unwrap_or_else(|_| Err(BrokerError::unknown("scan job ended without a result")))
    }
}

/// One opt-out run for an extracted record.
pub struct OptOutJob {
    broker: DataBroker,
    profile_query: ProfileQuery,
    extracted_profile: ExtractedProfile,
    settings: JobSettings,
    deps: JobDependencies,
    show_ui: bool,
    tracker: Arc<AttemptTracker>,
}

impl OptOutJob {
    pub fn new(
        broker: DataBroker,
        profile_query: ProfileQuery,
        extracted_profile: ExtractedProfile,
        settings: JobSettings,
        deps: JobDependencies,
        show_ui: bool,
        tracker: Arc<AttemptTracker>,
    ) -> Self {
        Self {
            broker,
            profile_query,
            extracted_profile,
            settings,
            deps,
            show_ui,
            tracker,
        }
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<(), BrokerError> {
        let actions = self
            .broker
            .opt_out_step()
            .ok_or(BrokerError::NoOptOutStep)?
            .actions
            .clone();

        let (sender, receiver) = oneshot::channel();
        let driver = JobDriver {
            kind: JobKind::OptOut,
            broker: self.broker,
            actions,
            profile_query: self.profile_query,
            extracted_profile: Some(self.extracted_profile),
            settings: self.settings,
            deps: self.deps,
            cancel,
            show_ui: self.show_ui,
            attempt_id: self.tracker.attempt_id(),
            tracker: Some(self.tracker),
            state: JobState::Initializing,
            profiles: Vec::new(),
            captcha_transaction: None,
            resolver: JobResolver::new(sender),
        };
        tokio::spawn(driver.run());
        receiver
            .await
            .unwrap_or_else(|_| Err(BrokerError::unknown("opt-out job ended without a result")))
            .map(|_| ())
    }
}

struct JobDriver {
    kind: JobKind,
    broker: DataBroker,
    actions: Vec<Action>,
    profile_query: ProfileQuery,
    extracted_profile: Option<ExtractedProfile>,
    settings: JobSettings,
    deps: JobDependencies,
    cancel: CancellationToken,
    show_ui: bool,
    attempt_id: Uuid,
    tracker: Option<Arc<AttemptTracker>>,
    state: JobState,
    profiles: Vec<ExtractedProfile>,
    captcha_transaction: Option<String>,
    resolver: JobResolver,
}

impl JobDriver {
    async fn run(mut self) {
        let result = self.drive().await;
        match result {
            Ok(()) => {
                let profiles = std::mem::take(&mut self.profiles);
                self.resolver.resolve(Ok(profiles));
            }
            Err(error) => {
                tracing::debug!(broker = %self.broker.name, "Job failed: {error}");
                self.resolver.resolve(Err(error));
            }
        }
    }

    fn transition(&mut self, state: JobState) {
        tracing::trace!(broker = %self.broker.name, "{:?} -> {:?}", self.state, state);
        self.state = state;
    }

    fn stage(&self, stage: Stage) {
        if let Some(tracker) = &self.tracker {
            tracker.set_stage(stage);
        }
    }

    async fn drive(&mut self) -> Result<(), BrokerError> {
        if self.cancel.is_cancelled() {
            self.transition(JobState::Failed);
            return Err(BrokerError::Cancelled);
        }

        self.transition(JobState::Initializing);
        let (events, mut receiver) = mpsc::unbounded_channel();
        let mut surface = self.deps.executor.initialize(self.show_ui, events).await?;

        let result = self.run_actions(surface.as_mut(), &mut receiver).await;
        surface.finish().await;

        self.transition(if result.is_ok() {
            JobState::Completed
        } else {
            JobState::Failed
        });
        result
    }

    async fn run_actions(
        &mut self,
        surface: &mut dyn AutomationSurface,
        events: &mut EventReceiver,
    ) -> Result<(), BrokerError> {
        let mut index = 0;
        let mut retries_left = self.settings.retries_on_error;

        while let Some(action) = self.actions.get(index).cloned() {
            if self.cancel.is_cancelled() {
                return Err(BrokerError::Cancelled);
            }
            self.transition(JobState::Running {
                action_index: index,
            });

            match self.run_action(surface, events, &action).await {
                Ok(()) => index += 1,
                Err(error) if error.is_retryable() && retries_left > 0 => {
                    retries_left -= 1;
                    tracing::warn!(
                        broker = %self.broker.name,
                        action = %action.id,
                        "Action failed, {retries_left} retries left: {error}"
                    );
                    self.sleep(self.settings.retry_cooldown).await?;
                }
                Err(error) => return Err(error),
            }
        }
        Ok(())
    }

    async fn run_action(
        &mut self,
        surface: &mut dyn AutomationSurface,
        events: &mut EventReceiver,
        action: &Action,
    ) -> Result<(), BrokerError> {
        tracing::debug!(broker = %self.broker.name, action = %action.id, "Dispatching {:?}", action.action_type());
        match &action.kind {
            ActionKind::Navigate { url } => {
                let url = resolve_url(url, &self.profile_query, self.extracted_profile.as_ref())?;
                match surface.load(&url).await {
                    Err(BrokerError::HttpError { code: 404 }) if self.kind == JobKind::Scan => {
                        tracing::debug!("Tolerating 404 for {url}");
                        Ok(())
                    }
                    other => other,
                }
            }
            ActionKind::EmailConfirmation { polling_time } => {
                self.transition(JobState::AwaitingExternalEvent(ExternalEvent::Email));
                self.stage(Stage::EmailReceive);
                let email = self
                    .extracted_profile
                    .as_ref()
                    .and_then(|p| p.email.clone())
                    .ok_or(EmailError::CantFindEmail)?;
                let link = self
                    .deps
                    .email
                    .get_confirmation_link(
                        &email,
                        self.settings.email_polling_retries,
                        Duration::from_secs(*polling_time),
                        self.attempt_id,
                        &self.cancel,
                    )
                    .await?;
                self.stage(Stage::EmailConfirm);
                surface.load(&link).await
            }
            ActionKind::SolveCaptcha { .. } => {
                let transaction = self.captcha_transaction.clone().ok_or(
                    BrokerError::CaptchaServiceError {
                        error: CaptchaError::NilDataWhenFetchingCaptchaResult,
                    },
                )?;
                self.transition(JobState::AwaitingExternalEvent(ExternalEvent::Captcha));
                self.stage(Stage::CaptchaSolve);
                let token = self
                    .deps
                    .captcha
                    .submit_captcha_to_be_resolved(&transaction, self.attempt_id, &self.cancel)
                    .await?;
                surface
                    .execute(action, ActionInput::SolveCaptcha { token })
                    .await?;
                self.await_result(surface, events, action).await
            }
            _ => {
                if action.needs_email() {
                    self.ensure_email().await?;
                }
                match action.action_type() {
                    ActionType::FillForm | ActionType::Click => self.stage(Stage::FillForm),
                    ActionType::Expectation => self.stage(Stage::Submit),
                    ActionType::GetCaptchaInfo => self.stage(Stage::CaptchaParse),
                    _ => {}
                }
                let input = ActionInput::UserData {
                    profile_query: self.profile_query.clone(),
                    extracted_profile: self.extracted_profile.clone(),
                };
                surface.execute(action, input).await?;
                self.await_result(surface, events, action).await
            }
        }
    }

    async fn ensure_email(&mut self) -> Result<(), BrokerError> {
        if self.extracted_profile.as_ref().is_some_and(|p| p.email.is_some()) {
            return Ok(());
        }
        self.stage(Stage::EmailGenerate);
        let data = self
            .deps
            .email
            .get_email(&self.broker.url, self.attempt_id)
            .await?;
        tracing::debug!(broker = %self.broker.name, "Generated email alias");
        self.extracted_profile
            .get_or_insert_with(ExtractedProfile::default)
            .email = Some(data.email_address);
        Ok(())
    }

    /// Wait for the executor's answer to `action`. Events for other actions
    /// are leftovers from earlier dispatches and are dropped.
    async fn await_result(
        &mut self,
        surface: &mut dyn AutomationSurface,
        events: &mut EventReceiver,
        action: &Action,
    ) -> Result<(), BrokerError> {
        loop {
            let event = events
                .recv()
                .await
                .ok_or_else(|| BrokerError::unknown("executor closed its event channel"))?;
            if event.action_id() != action.id {
                tracing::trace!("Dropping event for {}", event.action_id());
                continue;
            }

            return match event {
                ExecutorEvent::Success { action_type, .. } => {
                    if action_type == ActionType::Click {
                        self.sleep(self.settings.click_await).await?;
                    }
                    Ok(())
                }
                ExecutorEvent::ExtractedProfiles { profiles, .. } => {
                    tracing::info!(broker = %self.broker.name, "Extracted {} profiles", profiles.len());
                    self.profiles.extend(profiles);
                    if self.kind == JobKind::Scan {
                        self.resolver.resolve(Ok(self.profiles.clone()));
                    }
                    Ok(())
                }
                ExecutorEvent::CaptchaInformation { info, .. } => {
                    self.transition(JobState::AwaitingExternalEvent(ExternalEvent::Captcha));
                    self.stage(Stage::CaptchaSend);
                    let transaction = self
                        .deps
                        .captcha
                        .submit_captcha_information(&info, self.attempt_id, &self.cancel)
                        .await?;
                    self.captcha_transaction = Some(transaction);
                    Ok(())
                }
                ExecutorEvent::SolveCaptcha { callback, .. } => {
                    surface
                        .evaluate_script(&callback)
                        .await
                        .map_err(|_| BrokerError::SolvingCaptchaWithCallbackError)?;
                    self.captcha_transaction = None;
                    Ok(())
                }
                ExecutorEvent::Error { error, .. } => Err(error),
            };
        }
    }

    async fn sleep(&self, duration: Duration) -> Result<(), BrokerError> {
        if duration.is_zero() {
            return Ok(());
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(BrokerError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Step, StepType};
    use crate::test_support::{
        FakeCaptchaService, FakeEmailService, Reply, ScriptedExecutor, extracted, fast_settings,
        profile_query, test_broker,
    };

    struct Harness {
        executor: Arc<ScriptedExecutor>,
        captcha: Arc<FakeCaptchaService>,
        email: Arc<FakeEmailService>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                executor: Arc::new(ScriptedExecutor::new()),
                captcha: Arc::new(FakeCaptchaService::default()),
                email: Arc::new(FakeEmailService::default()),
            }
        }

        fn deps(&self) -> JobDependencies {
            JobDependencies {
                executor: self.executor.clone(),
                captcha: self.captcha.clone(),
                email: self.email.clone(),
            }
        }

        fn scan(&self, broker: DataBroker, retries: u32) -> ScanJob {
            ScanJob::new(broker, profile_query(), fast_settings(retries), self.deps(), false)
        }

        fn opt_out(&self, broker: DataBroker, retries: u32) -> OptOutJob {
            OptOutJob::new(
                broker,
                profile_query(),
                extracted("p-1"),
                fast_settings(retries),
                self.deps(),
                false,
                Arc::new(AttemptTracker::new("test-broker")),
            )
        }
    }

    fn with_opt_out_actions(actions: Vec<Action>) -> DataBroker {
        let mut broker = test_broker();
        broker.steps.retain(|s| s.step_type == StepType::Scan);
        broker.steps.push(Step {
            step_type: StepType::OptOut,
            actions,
        });
        broker
    }

    fn action(id: &str, kind: ActionKind) -> Action {
        Action {
            id: id.into(),
            kind,
        }
    }

    #[tokio::test]
    async fn test_scan_resolves_with_extracted_profiles() {
        let h = Harness::new();
        h.executor
            .reply("x1", Reply::Profiles(vec![extracted("p-1"), extracted("p-2")]));

        let profiles = h.scan(test_broker(), 0).run(CancellationToken::new()).await.unwrap();
        assert_eq!(profiles.len(), 2);

        let log = h.executor.log();
        assert_eq!(log.initialized, 1);
        assert_eq!(log.loaded, vec!["https://test-broker.example.com/search/jane-smith/TX"]);
    }

    #[tokio::test]
    async fn test_scan_keeps_running_after_extraction() {
        let h = Harness::new();
        let mut broker = test_broker();
        let scan = broker
            .steps
            .iter_mut()
            .find(|s| s.step_type == StepType::Scan)
            .unwrap();
        scan.actions
            .push(action("k9", ActionKind::Click { elements: vec![] }));
        h.executor.reply("x1", Reply::Profiles(vec![extracted("p-1")]));

        let profiles = h.scan(broker, 0).run(CancellationToken::new()).await.unwrap();
        assert_eq!(profiles.len(), 1);

        h.executor.wait_finished().await;
        let log = h.executor.log();
        assert_eq!(log.dispatched, vec!["x1", "k9"]);
        assert_eq!(log.finished, 1);
    }

    #[tokio::test]
    async fn test_scan_without_matches_resolves_empty() {
        let h = Harness::new();
        let profiles = h.scan(test_broker(), 0).run(CancellationToken::new()).await.unwrap();
        assert!(profiles.is_empty());
        assert_eq!(h.executor.log().finished, 1);
    }

    #[tokio::test]
    async fn test_scan_tolerates_404_on_navigate() {
        let h = Harness::new();
        h.executor.fail_next_load(BrokerError::HttpError { code: 404 });
        h.executor.reply("x1", Reply::Profiles(vec![extracted("p-1")]));

        let profiles = h.scan(test_broker(), 0).run(CancellationToken::new()).await.unwrap();
        assert_eq!(profiles.len(), 1);
    }

    #[tokio::test]
    async fn test_opt_out_propagates_404() {
        let h = Harness::new();
        let broker = with_opt_out_actions(vec![action(
            "n1",
            ActionKind::Navigate {
                url: "${profileUrl}".into(),
            },
        )]);
        h.executor.fail_next_load(BrokerError::HttpError { code: 404 });

        let result = h.opt_out(broker, 0).run(CancellationToken::new()).await;
        assert_eq!(result, Err(BrokerError::HttpError { code: 404 }));
        assert_eq!(
            h.executor.log().loaded,
            vec!["https://test-broker.example.com/p/p-1"]
        );
    }

    #[tokio::test]
    async fn test_retry_exhaustion_dispatches_retries_plus_one_times() {
        let h = Harness::new();
        let error = BrokerError::ActionFailed {
            action_id: "x1".into(),
            message: "selector not found".into(),
        };
        h.executor.always("x1", Reply::Fail(error.clone()));

        let result = h.scan(test_broker(), 2).run(CancellationToken::new()).await;
        assert_eq!(result, Err(error));

        let log = h.executor.log();
        assert_eq!(log.dispatched, vec!["x1", "x1", "x1"]);
        assert_eq!(log.finished, 1);
    }

    #[tokio::test]
    async fn test_retry_redispatches_same_action_then_continues() {
        let h = Harness::new();
        h.executor.reply("x1", Reply::Fail(BrokerError::unknown("flaky")));
        h.executor.reply("x1", Reply::Profiles(vec![extracted("p-1")]));

        let profiles = h.scan(test_broker(), 1).run(CancellationToken::new()).await.unwrap();
        assert_eq!(profiles.len(), 1);
        assert_eq!(h.executor.log().dispatched, vec!["x1", "x1"]);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_action_runs_nothing() {
        let h = Harness::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = h.scan(test_broker(), 3).run(cancel.clone()).await;
        assert_eq!(result, Err(BrokerError::Cancelled));

        let result = h.opt_out(test_broker(), 3).run(cancel).await;
        assert_eq!(result, Err(BrokerError::Cancelled));

        let log = h.executor.log();
        assert_eq!(log.initialized, 0);
        assert!(log.dispatched.is_empty());
        assert!(log.loaded.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_during_cooldown_stops_retrying() {
        let h = Harness::new();
        h.executor.always("x1", Reply::Fail(BrokerError::unknown("down")));
        let mut settings = fast_settings(5);
        settings.retry_cooldown = Duration::from_secs(60);
        let job = ScanJob::new(test_broker(), profile_query(), settings, h.deps(), false);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        assert_eq!(job.run(cancel).await, Err(BrokerError::Cancelled));
        assert_eq!(h.executor.log().dispatched, vec!["x1"]);
    }

    #[tokio::test]
    async fn test_opt_out_without_step_never_touches_executor() {
        let h = Harness::new();
        let mut broker = test_broker();
        broker.steps.retain(|s| s.step_type == StepType::Scan);

        let result = h.opt_out(broker, 3).run(CancellationToken::new()).await;
        assert_eq!(result, Err(BrokerError::NoOptOutStep));
        assert_eq!(h.executor.log().initialized, 0);
    }

    #[tokio::test]
    async fn test_opt_out_generates_email_and_follows_confirmation_link() {
        let h = Harness::new();
        let result = h.opt_out(test_broker(), 0).run(CancellationToken::new()).await;
        assert_eq!(result, Ok(()));

        let log = h.executor.log();
        assert_eq!(log.dispatched, vec!["f1", "k1"]);
        match &log.inputs[0] {
            ActionInput::UserData {
                extracted_profile: Some(profile),
                ..
            } => assert_eq!(profile.email.as_deref(), Some(FakeEmailService::ALIAS)),
            other => panic!("unexpected input {other:?}"),
        }
        assert_eq!(
            log.loaded,
            vec![
                "https://test-broker.example.com/p/p-1".to_string(),
                FakeEmailService::LINK.to_string(),
            ]
        );
        assert_eq!(h.email.generated(), 1);
        assert_eq!(h.email.polled_for(), vec![FakeEmailService::ALIAS.to_string()]);
    }

    #[tokio::test]
    async fn test_form_actions_and_expectations_set_stages() {
        let h = Harness::new();
        let run = |actions: Vec<Action>| {
            let tracker = Arc::new(AttemptTracker::new("test-broker"));
            let job = OptOutJob::new(
                with_opt_out_actions(actions),
                profile_query(),
                extracted("p-1"),
                fast_settings(0),
                h.deps(),
                false,
                tracker.clone(),
            );
            async move {
                job.run(CancellationToken::new()).await.unwrap();
                tracker.stage()
            }
        };

        let click = action("k1", ActionKind::Click { elements: vec![] });
        assert_eq!(run(vec![click.clone()]).await, Stage::FillForm);
        let expect = action(
            "v1",
            ActionKind::Expectation {
                expectations: vec![],
            },
        );
        assert_eq!(run(vec![click, expect]).await, Stage::Submit);
    }

    #[tokio::test]
    async fn test_email_timeout_fails_opt_out() {
        let h = Harness::new();
        h.email.fail_links(EmailError::LinkTimedOut);
        let result = h.opt_out(test_broker(), 0).run(CancellationToken::new()).await;
        assert_eq!(
            result,
            Err(BrokerError::EmailError {
                error: Some(EmailError::LinkTimedOut)
            })
        );
        assert_eq!(h.executor.log().finished, 1);
    }

    #[tokio::test]
    async fn test_captcha_flow() {
        let h = Harness::new();
        let broker = with_opt_out_actions(vec![
            action("c1", ActionKind::GetCaptchaInfo { selector: ".g".into() }),
            action("c2", ActionKind::SolveCaptcha { selector: ".g".into() }),
        ]);
        h.executor.reply("c2", Reply::Callback("cb()".into()));

        h.opt_out(broker, 0).run(CancellationToken::new()).await.unwrap();

        let log = h.executor.log();
        assert_eq!(log.dispatched, vec!["c1", "c2"]);
        assert_eq!(
            log.inputs[1],
            ActionInput::SolveCaptcha {
                token: "token-tx-1".into()
            }
        );
        assert_eq!(log.scripts, vec!["cb()"]);
        assert_eq!(h.captcha.submitted(), 1);
    }

    #[tokio::test]
    async fn test_solve_captcha_without_transaction_fails() {
        let h = Harness::new();
        let broker = with_opt_out_actions(vec![action(
            "c2",
            ActionKind::SolveCaptcha { selector: ".g".into() },
        )]);
        let result = h.opt_out(broker, 0).run(CancellationToken::new()).await;
        assert_eq!(
            result,
            Err(BrokerError::CaptchaServiceError {
                error: CaptchaError::NilDataWhenFetchingCaptchaResult
            })
        );
        assert!(h.executor.log().dispatched.is_empty());
    }

    #[tokio::test]
    async fn test_failed_callback_evaluation() {
        let h = Harness::new();
        let broker = with_opt_out_actions(vec![
            action("c1", ActionKind::GetCaptchaInfo { selector: ".g".into() }),
            action("c2", ActionKind::SolveCaptcha { selector: ".g".into() }),
        ]);
        h.executor.fail_scripts();
        let result = h.opt_out(broker, 0).run(CancellationToken::new()).await;
        assert_eq!(result, Err(BrokerError::SolvingCaptchaWithCallbackError));
    }

    #[test]
    fn test_resolver_only_resolves_once() {
        let (sender, mut receiver) = oneshot::channel();
        let mut resolver = JobResolver::new(sender);
        assert!(resolver.resolve(Ok(vec![extracted("p-1")])));
        assert!(!resolver.resolve(Err(BrokerError::Cancelled)));
        assert_eq!(receiver.try_recv().unwrap().unwrap().len(), 1);
    }

    #[test]
    fn test_resolve_url_placeholders() {
        let query = profile_query();
        let url = resolve_url(
            "https://example.com/${firstName|downcase}-${lastName|downcase}/${city}?y=${birthYear}",
            &query,
            None,
        )
        .unwrap();
        assert_eq!(url.as_str(), "https://example.com/jane-smith/Austin?y=1980");

        let profile = extracted("p-1");
        let url = resolve_url("${profileUrl}", &query, Some(&profile)).unwrap();
        assert_eq!(url.as_str(), "https://test-broker.example.com/p/p-1");
    }

    #[test]
    fn test_resolve_url_rejects_unknown_fields() {
        let query = profile_query();
        assert!(matches!(
            resolve_url("https://example.com/${ssn}", &query, None),
            Err(BrokerError::MalformedUrl { .. })
        ));
        assert!(matches!(
            resolve_url("${profileUrl}", &query, None),
            Err(BrokerError::MalformedUrl { .. })
        ));
        assert!(matches!(
            resolve_url("not a url", &query, None),
            Err(BrokerError::MalformedUrl { .. })
        ));
    }
}
