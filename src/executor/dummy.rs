use async_trait::async_trait;
use url::Url;

use super::{ActionExecutor, ActionInput, AutomationSurface, CaptchaInfo, EventSender, ExecutorEvent};
use crate::broker::{Action, ActionKind, ExtractedProfile, ProfileQuery};
use crate::error::BrokerError;

/// An executor that never touches the network.
/// Returns a fake record for every extract action, useful for checking the
/// whole scan and opt-out pipeline end-to-end.
pub struct DummyExecutor;

#[async_trait]
impl ActionExecutor for DummyExecutor {
    async fn initialize(
        &self,
        show_ui: bool,
        events: EventSender,
    ) -> Result<Box<dyn AutomationSurface>, BrokerError> {
        if show_ui {
            tracing::debug!("Dummy executor has no UI to show");
        }
        Ok(Box::new(DummySurface {
            events,
            current_url: None,
        }))
    }
}

struct DummySurface {
    events: EventSender,
    current_url: Option<Url>,
}

impl DummySurface {
    fn send(&self, event: ExecutorEvent) -> Result<(), BrokerError> {
        self.events
            .send(event)
            .map_err(|_| BrokerError::unknown("job stopped listening"))
    }
}

fn fake_profile(query: &ProfileQuery) -> ExtractedProfile {
    let slug = format!("{}-{}", query.first_name, query.last_name).to_lowercase();
    ExtractedProfile {
        name: Some(query.full_name()),
        addresses: vec![format!("123 Main St, {}, {}", query.city, query.state)],
        profile_url: Some(format!("https://dummy-broker.example.com/profile/{slug}")),
        identifier: Some(format!("dummy-{slug}")),
        ..Default::default()
    }
}

#[async_trait]
impl AutomationSurface for DummySurface {
    async fn load(&mut self, url: &Url) -> Result<(), BrokerError> {
        tracing::debug!("Dummy load {url}");
        self.current_url = Some(url.clone());
        Ok(())
    }

    async fn execute(&mut self, action: &Action, input: ActionInput) -> Result<(), BrokerError> {
        let action_id = action.id.clone();
        let event = match (&action.kind, input) {
            (ActionKind::Extract { .. }, ActionInput::UserData { profile_query, .. }) => {
                ExecutorEvent::ExtractedProfiles {
                    action_id,
                    profiles: vec![fake_profile(&profile_query)],
                }
            }
            (ActionKind::GetCaptchaInfo { .. }, _) => ExecutorEvent::CaptchaInformation {
                action_id,
                info: CaptchaInfo {
                    site_key: "dummy-site-key".into(),
                    url: self
                        .current_url
                        .as_ref()
                        .map(|u| u.to_string())
                        .unwrap_or_default(),
                    captcha_type: Some("recaptcha".into()),
                },
            },
            (ActionKind::SolveCaptcha { .. }, ActionInput::SolveCaptcha { token }) => {
                ExecutorEvent::SolveCaptcha {
                    action_id,
                    callback: format!("window.__captchaCallback('{token}')"),
                }
            }
            (ActionKind::Extract { .. } | ActionKind::SolveCaptcha { .. }, input) => {
                ExecutorEvent::Error {
                    error: BrokerError::ActionFailed {
                        action_id: action_id.clone(),
                        message: format!("unexpected input {input:?}"),
                    },
                    action_id,
                }
            }
            _ => ExecutorEvent::Success {
                action_id,
                action_type: action.action_type(),
            },
        };
        self.send(event)
    }

    async fn evaluate_script(&mut self, script: &str) -> Result<(), BrokerError> {
        tracing::trace!("Dummy evaluate {script}");
        Ok(())
    }

    async fn finish(&mut self) {
        self.current_url = None;
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::broker::ActionType;
    use crate::test_support::profile_query;

    fn action(id: &str, kind: ActionKind) -> Action {
        Action {
            id: id.into(),
            kind,
        }
    }

    #[tokio::test]
    async fn test_dummy_extract_returns_profile_for_query() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut surface = DummyExecutor.initialize(false, tx).await.unwrap();

        let extract = action(
            "x1",
            ActionKind::Extract {
                selector: ".card".into(),
                profile: serde_json::Value::Null,
            },
        );
        surface
            .execute(
                &extract,
                ActionInput::UserData {
                    profile_query: profile_query(),
                    extracted_profile: None,
                },
            )
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            ExecutorEvent::ExtractedProfiles { action_id, profiles } => {
                assert_eq!(action_id, "x1");
                assert_eq!(profiles.len(), 1);
                assert_eq!(profiles[0].name.as_deref(), Some("Jane Smith"));
                assert_eq!(profiles[0].identity(), Some("dummy-jane-smith"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dummy_extract_without_user_data_reports_error() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut surface = DummyExecutor.initialize(false, tx).await.unwrap();
        let extract = action(
            "x1",
            ActionKind::Extract {
                selector: ".card".into(),
                profile: serde_json::Value::Null,
            },
        );
        surface
            .execute(&extract, ActionInput::SolveCaptcha { token: "t".into() })
            .await
            .unwrap();
        match rx.recv().await.unwrap() {
            ExecutorEvent::Error {
                action_id,
                error: BrokerError::ActionFailed { .. },
            } => assert_eq!(action_id, "x1"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dummy_click_reports_success() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut surface = DummyExecutor.initialize(true, tx).await.unwrap();
        let click = action("k1", ActionKind::Click { elements: vec![] });
        surface
            .execute(&click, ActionInput::SolveCaptcha { token: "t".into() })
            .await
            .unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            ExecutorEvent::Success {
                action_id: "k1".into(),
                action_type: ActionType::Click
            }
        );
        surface.finish().await;
    }
}
