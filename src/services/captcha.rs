use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use super::{Attempt, PollError, endpoint, http_client, poll_until};
use crate::error::CaptchaError;
use crate::executor::CaptchaInfo;

/// Remote captcha solver. Submitting returns a transaction id; resolving a
/// transaction returns the token to hand back to the page.
#[async_trait]
pub trait CaptchaService: Send + Sync {
    async fn submit_captcha_information(
        &self,
        info: &CaptchaInfo,
        attempt_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<String, CaptchaError>;

    async fn submit_captcha_to_be_resolved(
        &self,
        transaction_id: &str,
        attempt_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<String, CaptchaError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmitStatus {
    Success,
    FailureTransient,
    FailureCritical,
    InvalidRequest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptchaTransaction {
    pub message: SubmitStatus,
    #[serde(default)]
    pub transaction_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultStatus {
    SolutionReady,
    SolutionNotReady,
    Failure,
    InvalidRequest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptchaResult {
    pub message: ResultStatus,
    #[serde(default)]
    pub data: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitRequest<'a> {
    site_key: &'a str,
    url: &'a str,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    captcha_type: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ResultRequest<'a> {
    transaction_id: &'a str,
}

fn interpret_submit(response: CaptchaTransaction) -> Result<Attempt<String>, CaptchaError> {
    match response.message {
        SubmitStatus::Success => response
            .transaction_id
            .map(Attempt::Done)
            .ok_or(CaptchaError::ErrorWhenSubmittingCaptcha),
        SubmitStatus::FailureTransient => Ok(Attempt::Retry),
        SubmitStatus::FailureCritical => Err(CaptchaError::CriticalFailureWhenSubmittingCaptcha),
        SubmitStatus::InvalidRequest => Err(CaptchaError::InvalidRequestWhenSubmittingCaptcha),
    }
}

fn interpret_result(response: CaptchaResult) -> Result<Attempt<String>, CaptchaError> {
    match response.message {
        ResultStatus::SolutionReady => response
            .data
            .map(Attempt::Done)
            .ok_or(CaptchaError::NilDataWhenFetchingCaptchaResult),
        ResultStatus::SolutionNotReady => Ok(Attempt::Retry),
        ResultStatus::Failure => Err(CaptchaError::FailureWhenFetchingCaptchaResult),
        ResultStatus::InvalidRequest => Err(CaptchaError::InvalidRequestWhenFetchingCaptchaResult),
    }
}

fn map_poll_error(error: PollError<CaptchaError>, timed_out: CaptchaError) -> CaptchaError {
    match error {
        PollError::Failed(error) => error,
        PollError::Exhausted => timed_out,
        PollError::Cancelled => CaptchaError::Cancelled,
    }
}

pub struct HttpCaptchaService {
    client: reqwest::Client,
    base_url: Url,
    submit_retries: u32,
    result_retries: u32,
    polling_interval: Duration,
}

impl HttpCaptchaService {
    pub fn new(
        base_url: Url,
        submit_retries: u32,
        result_retries: u32,
        polling_interval: Duration,
    ) -> Self {
        Self {
            client: http_client(),
            base_url,
            submit_retries,
            result_retries,
            polling_interval,
        }
    }

    async fn post<B: Serialize + Sync, R: DeserializeOwned>(
        &self,
        path: &str,
        attempt_id: Uuid,
        body: &B,
    ) -> anyhow::Result<R> {
        let url = endpoint(&self.base_url, path)?;
        let resp = self
            .client
            .post(url)
            .header("X-Attempt-Id", attempt_id.to_string())
            .json(body)
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("HTTP {}", resp.status());
        }
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl CaptchaService for HttpCaptchaService {
    async fn submit_captcha_information(
        &self,
        info: &CaptchaInfo,
        attempt_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<String, CaptchaError> {
        let body = SubmitRequest {
            site_key: &info.site_key,
            url: &info.url,
            captcha_type: info.captcha_type.as_deref(),
        };
        let body = &body;
        poll_until(self.submit_retries, self.polling_interval, cancel, || async move {
            let response: CaptchaTransaction = self
                .post("dbp/captcha/v0/submit", attempt_id, body)
                .await
                .map_err(|e| {
                    tracing::warn!("Captcha submit failed: {e:#}");
                    CaptchaError::ErrorWhenSubmittingCaptcha
                })?;
            interpret_submit(response)
        })
        .await
        .map_err(|e| map_poll_error(e, CaptchaError::TimedOutWhenSubmittingCaptcha))
    }

    async fn submit_captcha_to_be_resolved(
        &self,
        transaction_id: &str,
        attempt_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<String, CaptchaError> {
        let body = ResultRequest { transaction_id };
        let body = &body;
        poll_until(self.result_retries, self.polling_interval, cancel, || async move {
            let response: CaptchaResult = self
                .post("dbp/captcha/v0/result", attempt_id, body)
                .await
                .map_err(|e| {
                    tracing::warn!("Captcha result fetch failed: {e:#}");
                    CaptchaError::ErrorWhenFetchingCaptchaResult
                })?;
            interpret_result(response)
        })
        .await
        .map_err(|e| map_poll_error(e, CaptchaError::TimedOutWhenFetchingCaptchaResult))
    }
}
