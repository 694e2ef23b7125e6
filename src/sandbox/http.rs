//! HTTP client for the remote sandbox service.
//!
//! Endpoints (all authenticated with the credential's bearer token):
//! - `POST   {base}/sandboxes`              `{ "timeout_secs": n }` -> `{ "id": "..." }`
//! - `DELETE {base}/sandboxes/{id}`
//! - `POST   {base}/sandboxes/{id}/execute` `{ "code": "...", "language": "..." }`

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use super::{ExecutionOutput, ProvisionError, SandboxHandle, SandboxProvider};
use crate::credentials::{Credential, FailureReason};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Sandbox provider backed by a REST API.
pub struct HttpSandboxProvider {
    client: Client,
    base_url: String,
}

impl HttpSandboxProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Map a non-success response to a provision error.
    fn classify(status: StatusCode, body: &str) -> ProvisionError {
        let message = format!("HTTP {}: {}", status.as_u16(), body.trim());
        if status == StatusCode::PAYMENT_REQUIRED
            || status == StatusCode::TOO_MANY_REQUESTS
            || FailureReason::from_message(body).is_quota()
        {
            ProvisionError::Quota(message)
        } else {
            ProvisionError::Other(message)
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<String, ProvisionError> {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ProvisionError::Other(format!("Request timeout: {}", e))
            } else if e.is_connect() {
                ProvisionError::Other(format!("Connection failed: {}", e))
            } else {
                ProvisionError::Other(format!("Request failed: {}", e))
            }
        })?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(Self::classify(status, &body));
        }
        Ok(body)
    }
}

#[derive(Debug, Serialize)]
struct CreateRequest {
    timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    id: String,
}

#[derive(Debug, Serialize)]
struct ExecuteRequest<'a> {
    code: &'a str,
    language: &'a str,
}

#[async_trait]
impl SandboxProvider for HttpSandboxProvider {
    async fn create(
        &self,
        credential: &Credential,
        timeout: Duration,
    ) -> Result<SandboxHandle, ProvisionError> {
        let body = self
            .send(
                self.client
                    .post(self.url("/sandboxes"))
                    .bearer_auth(&credential.token)
                    .json(&CreateRequest {
                        timeout_secs: timeout.as_secs(),
                    }),
            )
            .await?;

        let parsed: CreateResponse = serde_json::from_str(&body).map_err(|e| {
            ProvisionError::Other(format!("Failed to parse create response: {}, body: {}", e, body))
        })?;

        tracing::debug!(sandbox_id = %parsed.id, credential_id = %credential.id, "Sandbox created");
        Ok(SandboxHandle {
            id: parsed.id,
            credential_id: credential.id.clone(),
            token: credential.token.clone(),
        })
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), ProvisionError> {
        self.send(
            self.client
                .delete(self.url(&format!("/sandboxes/{}", handle.id)))
                .bearer_auth(&handle.token),
        )
        .await
        .map(|_| ())
    }

    async fn run_code(
        &self,
        handle: &SandboxHandle,
        code: &str,
        language: &str,
    ) -> Result<ExecutionOutput, ProvisionError> {
        let body = self
            .send(
                self.client
                    .post(self.url(&format!("/sandboxes/{}/execute", handle.id)))
                    .bearer_auth(&handle.token)
                    .json(&ExecuteRequest { code, language }),
            )
            .await?;

        serde_json::from_str(&body).map_err(|e| {
            ProvisionError::Other(format!("Failed to parse execution output: {}", e))
        })
    }
}
