//! One-time code verification. Issuing and checking codes is delegated to
//! an external service.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::VerificationError;

/// Opaque handle returned when a code is issued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt(pub String);

/// Result of checking a submitted code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeCheck {
    Valid,
    Invalid,
}

#[async_trait]
pub trait VerificationService: Send + Sync {
    /// Send a fresh code to `contact`.
    async fn issue(&self, contact: &str) -> Result<Receipt, VerificationError>;

    /// Check `code` for `contact`. The service is authoritative.
    async fn check(&self, contact: &str, code: &str) -> Result<CodeCheck, VerificationError>;
}

#[derive(Serialize)]
struct SendRequest<'a> {
    phone: &'a str,
}

#[derive(Deserialize)]
struct SendResponse {
    #[serde(default)]
    sid: Option<String>,
}

#[derive(Serialize)]
struct CheckRequest<'a> {
    phone: &'a str,
    code: &'a str,
}

#[derive(Deserialize)]
struct CheckResponse {
    valid: bool,
}

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Verification service reached over HTTP:
/// `POST {base}/api/verify/send` and `POST {base}/api/verify/check`.
pub struct HttpVerificationService {
    base_url: String,
    client: reqwest::Client,
}

impl HttpVerificationService {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn post<B: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, VerificationError> {
        let resp = self
            .client
            .post(format!("{}{path}", self.base_url))
            .timeout(REQUEST_TIMEOUT)
            .json(body)
            .send()
            .await
            .map_err(|e| VerificationError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(VerificationError::Status(resp.status().as_u16()));
        }

        resp.json()
            .await
            .map_err(|e| VerificationError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl VerificationService for HttpVerificationService {
    async fn issue(&self, contact: &str) -> Result<Receipt, VerificationError> {
        let resp: SendResponse = self
            .post("/api/verify/send", &SendRequest { phone: contact })
            .await?;
        Ok(Receipt(resp.sid.unwrap_or_default()))
    }

    async fn check(&self, contact: &str, code: &str) -> Result<CodeCheck, VerificationError> {
        let resp: CheckResponse = self
            .post(
                "/api/verify/check",
                &CheckRequest {
                    phone: contact,
                    code,
                },
            )
            .await?;
        Ok(if resp.valid {
            CodeCheck::Valid
        } else {
            CodeCheck::Invalid
        })
    }
}
