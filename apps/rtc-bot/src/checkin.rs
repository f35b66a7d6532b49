//! HTTP client for the facial check-in service.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;
use media_session::{IdentityVerifier, Verification, VerifyError};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

pub const ACCOUNT_HEADER: &str = "X-Account-Id";
pub const DEFAULT_THRESHOLD: f64 = 0.6;

#[derive(Debug, Clone)]
pub struct CheckinSettings {
    pub endpoint: Url,
    pub account_id: String,
    /// Minimum match probability accepted as a successful check-in.
    pub threshold: f64,
    pub request_timeout: Duration,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CheckinRequest<'a> {
    current_date_time: String,
    #[serde(rename = "employeeFacialSetupDTO")]
    employee_facial_setup: FacialSetup<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FacialSetup<'a> {
    time_verify: &'a str,
    seconds_time: &'a str,
    imgs: [&'a str; 1],
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CheckinResponse {
    pub employee_id: String,
    pub first_name: String,
    pub last_name: String,
    pub probability: f64,
    pub identity_verified: bool,
}

#[derive(Debug, Clone)]
pub struct CheckinClient {
    client: Client,
    settings: CheckinSettings,
}

impl CheckinClient {
    pub fn new(settings: CheckinSettings, accept_invalid_certs: bool) -> Result<Self, VerifyError> {
        let client = Client::builder()
            .timeout(settings.request_timeout)
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()
            .map_err(|err| VerifyError::Transport(err.to_string()))?;
        Ok(Self { client, settings })
    }

    pub fn settings(&self) -> &CheckinSettings {
        &self.settings
    }

    fn body<'a>(still_base64: &'a str) -> CheckinRequest<'a> {
        CheckinRequest {
            current_date_time: Local::now().format("%Y-%m-%dT%H:%M:%S").to_string(),
            employee_facial_setup: FacialSetup {
                time_verify: "",
                seconds_time: "",
                imgs: [still_base64],
            },
        }
    }
}

/// Maps a check-in answer onto a verification verdict.
pub fn verdict(response: &CheckinResponse, threshold: f64) -> Verification {
    if response.probability >= threshold {
        Verification::Verified
    } else {
        Verification::Retry
    }
}

#[async_trait]
impl IdentityVerifier for CheckinClient {
    async fn verify(&self, still_base64: &str) -> Result<Verification, VerifyError> {
        let response = self
            .client
            .post(self.settings.endpoint.clone())
            .header(ACCOUNT_HEADER, &self.settings.account_id)
            .header(reqwest::header::ACCEPT, "application/json, text/plain, */*")
            .json(&Self::body(still_base64))
            .send()
            .await
            .map_err(|err| VerifyError::Transport(err.to_string()))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let text = response.text().await.unwrap_or_default();
            return Ok(Verification::Rejected(format!("check-in refused ({status}): {text}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VerifyError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let text = response
            .text()
            .await
            .map_err(|err| VerifyError::Transport(err.to_string()))?;
        let answer: CheckinResponse =
            serde_json::from_str(&text).map_err(|err| VerifyError::Malformed(err.to_string()))?;
        let verdict = verdict(&answer, self.settings.threshold);
        match verdict {
            Verification::Verified => info!(
                employee_id = %answer.employee_id,
                probability = answer.probability,
                "check-in matched"
            ),
            _ => debug!(probability = answer.probability, "check-in below threshold"),
        }
        Ok(verdict)
    }
}
