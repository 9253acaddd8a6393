//! HTTP client for the coordinator API.

use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use bespoke_flow::coordinator::{SubmissionDetail, SubmissionPage};
use bespoke_flow::workflow::BespokeWorkflow;

use crate::exit::CliError;
use crate::Config;

/// One accepted submission, as returned by `POST /submissions`.
#[derive(Debug, Deserialize)]
pub struct SubmissionLink {
    /// Assigned submission id.
    pub id: u64,
    /// URL of the submission resource.
    #[serde(rename = "self")]
    pub self_url: String,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    submissions: Vec<SubmissionLink>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: String,
    message: String,
}

/// API client for coordinator endpoints.
pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    /// Creates a new API client from configuration.
    ///
    /// # Errors
    ///
    /// Returns a [`CliError::Other`] if the HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self, CliError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| CliError::Other(anyhow::anyhow!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
        })
    }

    /// Submits workflows and returns the assigned ids.
    ///
    /// # Errors
    ///
    /// `CliError::User` on schema rejection, `CliError::Unreachable` when
    /// the coordinator cannot be reached.
    pub async fn submit(
        &self,
        workflows: Vec<BespokeWorkflow>,
    ) -> Result<Vec<SubmissionLink>, CliError> {
        let url = format!("{}/submissions", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&json!({ "workflows": workflows }))
            .send()
            .await
            .map_err(connection_error)?;

        let response = Self::check(response).await?;
        let parsed: SubmitResponse = response
            .json()
            .await
            .map_err(|e| CliError::Other(anyhow::anyhow!("failed to parse response: {e}")))?;
        Ok(parsed.submissions)
    }

    /// Fetches the full state of one submission.
    ///
    /// # Errors
    ///
    /// `CliError::User` for unknown ids, `CliError::Unreachable` on
    /// connection failure.
    pub async fn get_detail(&self, id: u64) -> Result<SubmissionDetail, CliError> {
        let url = format!("{}/submissions/{id}", self.base_url);
        let response = self.client.get(&url).send().await.map_err(connection_error)?;
        let response = Self::check(response).await?;
        response
            .json()
            .await
            .map_err(|e| CliError::Other(anyhow::anyhow!("failed to parse response: {e}")))
    }

    /// Lists submissions, optionally filtered by status.
    ///
    /// # Errors
    ///
    /// `CliError::Unreachable` on connection failure.
    pub async fn list(&self, status: Option<&str>) -> Result<SubmissionPage, CliError> {
        let mut url = format!("{}/submissions", self.base_url);
        if let Some(status) = status {
            url = format!("{url}?status={status}");
        }
        let response = self.client.get(&url).send().await.map_err(connection_error)?;
        let response = Self::check(response).await?;
        response
            .json()
            .await
            .map_err(|e| CliError::Other(anyhow::anyhow!("failed to parse response: {e}")))
    }

    /// Cancels a submission.
    ///
    /// # Errors
    ///
    /// `CliError::User` for unknown ids, `CliError::Unreachable` on
    /// connection failure.
    pub async fn cancel(&self, id: u64) -> Result<(), CliError> {
        let url = format!("{}/submissions/{id}", self.base_url);
        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(connection_error)?;
        Self::check(response).await?;
        Ok(())
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, CliError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body: Option<ErrorBody> = response.json().await.ok();
        match body {
            Some(body) => Err(CliError::User(format!("{} ({})", body.message, body.code))),
            None => Err(CliError::User(format!("coordinator returned {status}"))),
        }
    }
}

fn connection_error(error: reqwest::Error) -> CliError {
    if error.is_connect() || error.is_timeout() {
        CliError::Unreachable(error.to_string())
    } else {
        CliError::Other(anyhow::anyhow!(error))
    }
}
