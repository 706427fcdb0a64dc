use std::sync::Mutex;

use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Start,
    EmailGenerate,
    EmailReceive,
    EmailConfirm,
    CaptchaParse,
    CaptchaSend,
    CaptchaSolve,
    FillForm,
    Submit,
}

/// Tracks how far one opt-out attempt got and when.
#[derive(Debug)]
pub struct AttemptTracker {
    attempt_id: Uuid,
    broker: String,
    started_at: DateTime<Utc>,
    last: Mutex<(Stage, DateTime<Utc>)>,
}

impl AttemptTracker {
    pub fn new(broker: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            attempt_id: Uuid::new_v4(),
            broker: broker.into(),
            started_at: now,
            last: Mutex::new((Stage::Start, now)),
        }
    }

    pub fn attempt_id(&self) -> Uuid {
        self.attempt_id
    }

    pub fn broker(&self) -> &str {
        &self.broker
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn set_stage(&self, stage: Stage) {
        let mut last = self.last.lock().unwrap();
        tracing::trace!(attempt = %self.attempt_id, "{:?} -> {:?}", last.0, stage);
        *last = (stage, Utc::now());
    }

    pub fn stage(&self) -> Stage {
        self.last.lock().unwrap().0
    }

    pub fn last_stage_date(&self) -> DateTime<Utc> {
        self.last.lock().unwrap().1
    }

    pub fn duration_ms(&self) -> i64 {
        (Utc::now() - self.started_at).num_milliseconds()
    }
}
