use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::scheduler::job::JobSettings;

pub const REGISTRY_URL: &str =
    "https://raw.githubusercontent.com/bombfork/data-breaker-registry/main/brokers.json";

pub const DEFAULT_SERVICE_URL: &str = "http://127.0.0.1:8787/";

pub fn project_dirs() -> anyhow::Result<ProjectDirs> {
    ProjectDirs::from("", "bombfork", "data-breaker-agent")
        .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))
}

pub fn db_path() -> anyhow::Result<PathBuf> {
    let dirs = project_dirs()?;
    let data_dir = dirs.data_dir();
    std::fs::create_dir_all(data_dir)?;
    Ok(data_dir.join("data-breaker-agent.db"))
}

/// Local broker definitions picked up by `broker import` without a path.
pub fn brokers_dir() -> anyhow::Result<PathBuf> {
    Ok(project_dirs()?.data_dir().join("brokers"))
}

pub fn config_path() -> anyhow::Result<PathBuf> {
    Ok(project_dirs()?.config_dir().join("config.json"))
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
}

/// Tunables for the agent. Durations are in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentConfig {
    pub run_frequency_hours: u64,
    pub max_concurrency: usize,
    pub operation_interval_secs: u64,
    pub scan_retries: u32,
    pub opt_out_retries: u32,
    pub scan_click_await_secs: u64,
    pub opt_out_click_await_secs: u64,
    pub retry_cooldown_secs: u64,
    pub email_polling_retries: u32,
    pub captcha_submit_retries: u32,
    pub captcha_result_retries: u32,
    pub captcha_polling_interval_secs: u64,
    pub service_url: String,
    pub registry_url: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let scan = JobSettings::scan();
        let opt_out = JobSettings::opt_out();
        Self {
            run_frequency_hours: 4,
            max_concurrency: default_concurrency(),
            operation_interval_secs: 2,
            scan_retries: scan.retries_on_error,
            opt_out_retries: opt_out.retries_on_error,
            scan_click_await_secs: scan.click_await.as_secs(),
            opt_out_click_await_secs: opt_out.click_await.as_secs(),
            retry_cooldown_secs: scan.retry_cooldown.as_secs(),
            email_polling_retries: scan.email_polling_retries,
            captcha_submit_retries: 5,
            captcha_result_retries: 60,
            captcha_polling_interval_secs: 5,
            service_url: DEFAULT_SERVICE_URL.to_string(),
            registry_url: REGISTRY_URL.to_string(),
        }
    }
}

impl AgentConfig {
    /// Read `path` if it exists, otherwise fall back to defaults. Missing
    /// keys take their default value.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("Invalid config in {}", path.display()))
    }

    pub fn run_frequency(&self) -> Duration {
        Duration::from_secs(self.run_frequency_hours * 60 * 60)
    }

    pub fn operation_interval(&self) -> Duration {
        Duration::from_secs(self.operation_interval_secs)
    }

    pub fn captcha_polling_interval(&self) -> Duration {
        Duration::from_secs(self.captcha_polling_interval_secs)
    }

    pub fn service_url(&self) -> anyhow::Result<Url> {
        let mut url = Url::parse(&self.service_url)
            .with_context(|| format!("Invalid service URL '{}'", self.service_url))?;
        // Endpoints are joined onto the base, which needs a trailing slash
        // to keep its last path segment.
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        Ok(url)
    }

    pub fn scan_settings(&self) -> JobSettings {
        JobSettings {
            retries_on_error: self.scan_retries,
            click_await: Duration::from_secs(self.scan_click_await_secs),
            retry_cooldown: Duration::from_secs(self.retry_cooldown_secs),
            email_polling_retries: self.email_polling_retries,
        }
    }

    pub fn opt_out_settings(&self) -> JobSettings {
        JobSettings {
            retries_on_error: self.opt_out_retries,
            click_await: Duration::from_secs(self.opt_out_click_await_secs),
            retry_cooldown: Duration::from_secs(self.retry_cooldown_secs),
            email_polling_retries: self.email_polling_retries,
        }
    }
}
