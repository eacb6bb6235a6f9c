//! `reqwest` client for the wrapped grant API.
//!
//! | Call | Request | Success |
//! |------|---------|---------|
//! | grant | `POST {base}/grants` `{registrationNumber, purpose?}` | 200/201 `{receiptId, grantedAt}` |
//! | revoke | `DELETE {base}/grants/{registrationNumber}` | 2xx, or 404 (already revoked) |
//! | status | `GET {base}/grants/{registrationNumber}` | 200 `{granted}`, or 404 (not granted) |
//!
//! Mutating calls carry an `Idempotency-Key` header.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Response, StatusCode};
use serde::Serialize;
use tracing::{debug, instrument};

use handoff_core::RegistrationNumber;

use super::api::{GrantApi, GrantConfirmation, GrantRequest, GrantStatus, RevokeRequest};
use super::error::{DownstreamError, parse_retry_after};

const IDEMPOTENCY_KEY: &str = "Idempotency-Key";

/// Longest downstream error body echoed into our own error messages.
const MAX_ERROR_BODY: usize = 256;

#[derive(Clone)]
pub struct HttpGrantApi {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl core::fmt::Debug for HttpGrantApi {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HttpGrantApi")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GrantBody<'a> {
    registration_number: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    purpose: Option<&'a str>,
}

impl HttpGrantApi {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, DownstreamError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DownstreamError::unavailable(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }
}

/// Turn a non-success response into a classified error.
async fn error_from_response(response: Response) -> DownstreamError {
    let status = response.status();
    let retry_after = parse_retry_after(
        response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok()),
    );
    let body = response.text().await.unwrap_or_default();
    DownstreamError::from_status(status.as_u16(), retry_after, error_message(status, &body))
}

fn error_message(status: StatusCode, body: &str) -> String {
    let detail = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.chars().take(MAX_ERROR_BODY).collect());

    if detail.is_empty() {
        format!("downstream returned {status}")
    } else {
        format!("downstream returned {status}: {detail}")
    }
}

#[async_trait]
impl GrantApi for HttpGrantApi {
    #[instrument(skip(self, request), fields(registration_number = %request.registration_number), err)]
    async fn grant(&self, request: &GrantRequest) -> Result<GrantConfirmation, DownstreamError> {
        let body = GrantBody {
            registration_number: request.registration_number.as_str(),
            purpose: request.purpose.as_deref(),
        };
        let response = self
            .authorize(self.client.post(self.url("/grants")))
            .header(IDEMPOTENCY_KEY, &request.idempotency_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        Ok(response.json::<GrantConfirmation>().await?)
    }

    #[instrument(skip(self, request), fields(registration_number = %request.registration_number), err)]
    async fn revoke(&self, request: &RevokeRequest) -> Result<(), DownstreamError> {
        let path = format!("/grants/{}", request.registration_number);
        let response = self
            .authorize(self.client.delete(self.url(&path)))
            .header(IDEMPOTENCY_KEY, &request.idempotency_key)
            .send()
            .await?;

        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => {
                debug!("grant already absent downstream");
                Ok(())
            }
            _ => Err(error_from_response(response).await),
        }
    }

    #[instrument(skip(self), err)]
    async fn status(
        &self,
        registration_number: &RegistrationNumber,
    ) -> Result<GrantStatus, DownstreamError> {
        let path = format!("/grants/{registration_number}");
        let response = self
            .authorize(self.client.get(self.url(&path)))
            .send()
            .await?;

        match response.status() {
            s if s.is_success() => Ok(response.json::<GrantStatus>().await?),
            StatusCode::NOT_FOUND => Ok(GrantStatus { granted: false }),
            _ => Err(error_from_response(response).await),
        }
    }
}
