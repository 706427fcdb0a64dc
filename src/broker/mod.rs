pub mod registry;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Scheduling intervals for a broker, in hours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulingConfig {
    pub retry_error: i64,
    pub confirm_opt_out_scan: i64,
    pub maintenance_scan: i64,
}

impl SchedulingConfig {
    pub fn retry_error_interval(&self) -> Duration {
        Duration::hours(self.retry_error)
    }

    pub fn confirm_opt_out_scan_interval(&self) -> Duration {
        Duration::hours(self.confirm_opt_out_scan)
    }

    pub fn maintenance_scan_interval(&self) -> Duration {
        Duration::hours(self.maintenance_scan)
    }
}

/// A broker definition as ingested from the registry.
///
/// Definitions are immutable per `version`; a newer version replaces the
/// stored one wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataBroker {
    #[serde(default, skip_serializing)]
    pub id: Option<i64>,
    pub name: String,
    pub url: String,
    pub version: String,
    /// Set on mirror sites whose opt-out is handled by the parent broker.
    #[serde(default)]
    pub parent: Option<String>,
    pub steps: Vec<Step>,
    pub scheduling_config: SchedulingConfig,
}

impl DataBroker {
    pub fn scan_step(&self) -> Option<&Step> {
        self.steps.iter().find(|s| s.step_type == StepType::Scan)
    }

    pub fn opt_out_step(&self) -> Option<&Step> {
        self.steps.iter().find(|s| s.step_type == StepType::OptOut)
    }

    pub fn performs_opt_outs_in_parent(&self) -> bool {
        self.parent.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepType {
    Scan,
    OptOut,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub step_type: StepType,
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub id: String,
    #[serde(flatten)]
    pub kind: ActionKind,
}

/// Every action a recipe can contain. The job dispatches on this variant;
/// new kinds are added here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "actionType", rename_all = "camelCase")]
pub enum ActionKind {
    Navigate {
        url: String,
    },
    Extract {
        selector: String,
        #[serde(default)]
        profile: serde_json::Value,
    },
    FillForm {
        selector: String,
        elements: Vec<PageElement>,
    },
    Click {
        #[serde(default)]
        elements: Vec<PageElement>,
    },
    Expectation {
        #[serde(default)]
        expectations: Vec<serde_json::Value>,
    },
    GetCaptchaInfo {
        selector: String,
    },
    SolveCaptcha {
        selector: String,
    },
    EmailConfirmation {
        /// Seconds between confirmation-link polls.
        #[serde(rename = "pollingTime")]
        polling_time: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionType {
    Navigate,
    Extract,
    FillForm,
    Click,
    Expectation,
    GetCaptchaInfo,
    SolveCaptcha,
    EmailConfirmation,
}

impl Action {
    pub fn action_type(&self) -> ActionType {
        match self.kind {
            ActionKind::Navigate { .. } => ActionType::Navigate,
            ActionKind::Extract { .. } => ActionType::Extract,
            ActionKind::FillForm { .. } => ActionType::FillForm,
            ActionKind::Click { .. } => ActionType::Click,
            ActionKind::Expectation { .. } => ActionType::Expectation,
            ActionKind::GetCaptchaInfo { .. } => ActionType::GetCaptchaInfo,
            ActionKind::SolveCaptcha { .. } => ActionType::SolveCaptcha,
            ActionKind::EmailConfirmation { .. } => ActionType::EmailConfirmation,
        }
    }

    /// A form that asks for an email address needs an alias generated first.
    pub fn needs_email(&self) -> bool {
        match &self.kind {
            ActionKind::FillForm { elements, .. } => elements.iter().any(|e| e.kind == "email"),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageElement {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub selector: Option<String>,
}

/// The identity searched for on broker sites.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileQuery {
    #[serde(default, skip_serializing)]
    pub id: Option<i64>,
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub middle_name: Option<String>,
    pub city: String,
    pub state: String,
    pub birth_year: i32,
    #[serde(default)]
    pub deprecated: bool,
}

impl ProfileQuery {
    pub fn full_name(&self) -> String {
        match &self.middle_name {
            Some(middle) => format!("{} {} {}", self.first_name, middle, self.last_name),
            None => format!("{} {}", self.first_name, self.last_name),
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> i32 {
        use chrono::Datelike;
        now.year() - self.birth_year
    }

    /// Two queries describe the same person when every search field matches.
    pub fn same_identity(&self, other: &ProfileQuery) -> bool {
        self.first_name.eq_ignore_ascii_case(&other.first_name)
            && self.last_name.eq_ignore_ascii_case(&other.last_name)
            && self.middle_name == other.middle_name
            && self.city.eq_ignore_ascii_case(&other.city)
            && self.state.eq_ignore_ascii_case(&other.state)
            && self.birth_year == other.birth_year
    }
}

/// A record found on a broker site that is believed to be the user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedProfile {
    #[serde(default, skip_serializing)]
    pub id: Option<i64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub alternative_names: Vec<String>,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub phone_numbers: Vec<String>,
    #[serde(default)]
    pub relatives: Vec<String>,
    #[serde(default)]
    pub age: Option<String>,
    #[serde(default)]
    pub profile_url: Option<String>,
    #[serde(default)]
    pub identifier: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, skip_serializing)]
    pub removed_date: Option<DateTime<Utc>>,
}

impl ExtractedProfile {
    /// Broker-specific identity used to recognise the same record across scans.
    pub fn identity(&self) -> Option<&str> {
        self.identifier
            .as_deref()
            .or(self.profile_url.as_deref())
            .or(self.name.as_deref())
    }

    pub fn same_record(&self, other: &ExtractedProfile) -> bool {
        match (self.identity(), other.identity()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BROKER_JSON: &str = r##"{
        "name": "peoplefinders",
        "url": "peoplefinders.example.com",
        "version": "0.3.1",
        "schedulingConfig": { "retryError": 48, "confirmOptOutScan": 72, "maintenanceScan": 240 },
        "steps": [
            {
                "stepType": "scan",
                "actions": [
                    { "id": "n1", "actionType": "navigate", "url": "https://peoplefinders.example.com/name/${firstName}-${lastName}/${state}" },
                    { "id": "x1", "actionType": "extract", "selector": ".card", "profile": { "name": ".name" } }
                ]
            },
            {
                "stepType": "optOut",
                "actions": [
                    { "id": "f1", "actionType": "fillForm", "selector": "form", "elements": [ { "type": "fullName" }, { "type": "email", "selector": "#email" } ] },
                    { "id": "c1", "actionType": "getCaptchaInfo", "selector": ".g-recaptcha" },
                    { "id": "c2", "actionType": "solveCaptcha", "selector": ".g-recaptcha" },
                    { "id": "k1", "actionType": "click", "elements": [ { "type": "button", "selector": "#submit" } ] },
                    { "id": "e1", "actionType": "emailConfirmation", "pollingTime": 30 }
                ]
            }
        ]
    }"##;

    #[test]
    fn test_parse_broker_definition() {
        let broker: DataBroker = serde_json::from_str(BROKER_JSON).unwrap();
        assert_eq!(broker.name, "peoplefinders");
        assert!(broker.id.is_none());
        assert_eq!(broker.scheduling_config.maintenance_scan, 240);

        let scan = broker.scan_step().unwrap();
        assert_eq!(scan.actions.len(), 2);
        assert_eq!(scan.actions[0].action_type(), ActionType::Navigate);

        let opt_out = broker.opt_out_step().unwrap();
        assert_eq!(opt_out.actions.len(), 5);
        assert_eq!(
            opt_out.actions[4].kind,
            ActionKind::EmailConfirmation { polling_time: 30 }
        );
    }

    #[test]
    fn test_needs_email_only_for_forms_with_email_field() {
        let broker: DataBroker = serde_json::from_str(BROKER_JSON).unwrap();
        let actions = &broker.opt_out_step().unwrap().actions;
        assert!(actions[0].needs_email());
        assert!(!actions[3].needs_email());
    }

    #[test]
    fn test_broker_without_opt_out_step() {
        let mut broker: DataBroker = serde_json::from_str(BROKER_JSON).unwrap();
        broker.steps.retain(|s| s.step_type == StepType::Scan);
        assert!(broker.opt_out_step().is_none());
        assert!(!broker.performs_opt_outs_in_parent());
    }

    #[test]
    fn test_extracted_profile_identity_prefers_identifier() {
        let profile = ExtractedProfile {
            name: Some("Jane Smith".into()),
            profile_url: Some("https://example.com/p/1".into()),
            identifier: Some("p-1".into()),
            ..Default::default()
        };
        assert_eq!(profile.identity(), Some("p-1"));

        let by_url = ExtractedProfile {
            name: Some("Jane Smith".into()),
            profile_url: Some("https://example.com/p/1".into()),
            ..Default::default()
        };
        assert_eq!(by_url.identity(), Some("https://example.com/p/1"));
        assert!(!profile.same_record(&by_url));
        assert!(by_url.same_record(&by_url.clone()));
    }

    #[test]
    fn test_profile_query_identity_ignores_case() {
        let a = ProfileQuery {
            id: None,
            first_name: "Jane".into(),
            last_name: "Smith".into(),
            middle_name: None,
            city: "Austin".into(),
            state: "TX".into(),
            birth_year: 1980,
            deprecated: false,
        };
        let mut b = a.clone();
        b.first_name = "jane".into();
        assert!(a.same_identity(&b));
        b.birth_year = 1981;
        assert!(!a.same_identity(&b));
        assert_eq!(a.full_name(), "Jane Smith");
    }
}
