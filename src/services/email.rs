use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use super::{Attempt, PollError, endpoint, http_client, poll_until};
use crate::error::EmailError;

/// A generated alias for one opt-out attempt.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailData {
    pub email_address: String,
    #[serde(default)]
    pub pattern: Option<String>,
}

#[async_trait]
pub trait EmailService: Send + Sync {
    async fn get_email(&self, broker_url: &str, attempt_id: Uuid) -> Result<EmailData, EmailError>;

    /// Poll for the confirmation link sent to `email`, at most `retries + 1`
    /// times.
    async fn get_confirmation_link(
        &self,
        email: &str,
        retries: u32,
        interval: Duration,
        attempt_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Url, EmailError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    Ready,
    Pending,
    Error,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LinkResponse {
    pub status: LinkStatus,
    #[serde(default)]
    pub link: Option<String>,
}

fn interpret_link(response: LinkResponse) -> Result<Attempt<Url>, EmailError> {
    match (response.status, response.link) {
        (LinkStatus::Ready, Some(link)) => Url::parse(&link)
            .map(Attempt::Done)
            .map_err(|e| EmailError::LinkRetrievalFailed(format!("malformed link: {e}"))),
        (LinkStatus::Ready, None) => Err(EmailError::LinkRetrievalFailed("ready".into())),
        (LinkStatus::Pending, _) => Ok(Attempt::Retry),
        (LinkStatus::Error, _) => Err(EmailError::LinkRetrievalFailed("error".into())),
        (LinkStatus::Unknown, _) => Err(EmailError::LinkRetrievalFailed("unknown".into())),
    }
}

pub struct HttpEmailService {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpEmailService {
    pub fn new(base_url: Url) -> Self {
        Self {
            client: http_client(),
            base_url,
        }
    }

    fn url(&self, path: &str, query: &[(&str, &str)]) -> Result<Url, EmailError> {
        let mut url = endpoint(&self.base_url, path)
            .map_err(|e| EmailError::RequestFailed(e.to_string()))?;
        url.query_pairs_mut().extend_pairs(query);
        Ok(url)
    }
}

#[async_trait]
impl EmailService for HttpEmailService {
    async fn get_email(&self, broker_url: &str, attempt_id: Uuid) -> Result<EmailData, EmailError> {
        let attempt = attempt_id.to_string();
        let url = self.url(
            "dbp/em/v0/generate",
            &[("dataBroker", broker_url), ("attemptId", &attempt)],
        )?;
        let resp = self
            .client
            .post(url)
            .send()
            .await
            .map_err(|e| EmailError::RequestFailed(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(EmailError::CantGenerateEmail(format!("HTTP {}", resp.status())));
        }
        resp.json()
            .await
            .map_err(|e| EmailError::CantGenerateEmail(e.to_string()))
    }

    async fn get_confirmation_link(
        &self,
        email: &str,
        retries: u32,
        interval: Duration,
        attempt_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Url, EmailError> {
        let attempt = attempt_id.to_string();
        let url = self.url("dbp/em/v0/links", &[("e", email), ("attemptId", &attempt)])?;
        let url = &url;

        let result = poll_until(retries, interval, cancel, || async move {
            let resp = self
                .client
                .get(url.clone())
                .send()
                .await
                .map_err(|e| EmailError::RequestFailed(e.to_string()))?;
            if !resp.status().is_success() {
                return Err(EmailError::RequestFailed(format!("HTTP {}", resp.status())));
            }
            let response: LinkResponse = resp
                .json()
                .await
                .map_err(|e| EmailError::RequestFailed(e.to_string()))?;
            tracing::debug!("Confirmation link status {:?}", response.status);
            interpret_link(response)
        })
        .await;

        result.map_err(|e| match e {
            PollError::Failed(error) => error,
            PollError::Exhausted => EmailError::LinkTimedOut,
            PollError::Cancelled => EmailError::Cancelled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_email_data() {
        let data: EmailData =
            serde_json::from_str(r#"{"emailAddress":"abc@relay.example","pattern":"x"}"#).unwrap();
        assert_eq!(data.email_address, "abc@relay.example");
        assert_eq!(data.pattern.as_deref(), Some("x"));
    }

    #[test]
    fn test_link_statuses() {
        let ready: LinkResponse =
            serde_json::from_str(r#"{"status":"ready","link":"https://broker.example.com/confirm?t=1"}"#)
                .unwrap();
        assert_eq!(
            interpret_link(ready),
            Ok(Attempt::Done(
                Url::parse("https://broker.example.com/confirm?t=1").unwrap()
            ))
        );

        let pending: LinkResponse = serde_json::from_str(r#"{"status":"pending"}"#).unwrap();
        assert_eq!(interpret_link(pending), Ok(Attempt::Retry));

        let odd: LinkResponse = serde_json::from_str(r#"{"status":"expired"}"#).unwrap();
        assert_eq!(odd.status, LinkStatus::Unknown);
        assert!(matches!(
            interpret_link(odd),
            Err(EmailError::LinkRetrievalFailed(_))
        ));
    }

    #[test]
    fn test_ready_without_link_fails() {
        let response = LinkResponse {
            status: LinkStatus::Ready,
            link: None,
        };
        assert!(interpret_link(response).is_err());
    }

    #[test]
    fn test_query_parameters_are_encoded() {
        let service = HttpEmailService::new(Url::parse("http://127.0.0.1:8787/").unwrap());
        let url = service
            .url("dbp/em/v0/links", &[("e", "a+b@relay.example")])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://127.0.0.1:8787/dbp/em/v0/links?e=a%2Bb%40relay.example"
        );
    }
}
