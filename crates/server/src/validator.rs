use anyhow::{Context, Result};
use async_trait::async_trait;
use engine::SessionValidator;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use shared::domain::SupervisorIdentity;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ValidateRequest<'a> {
    session_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct ValidateResponse {
    ok: bool,
    #[serde(default)]
    supervisor: Option<SupervisorIdentity>,
}

/// Resolves controller sessions against the external identity service.
///
/// One POST per auth attempt. A reply of `{ok: false}` (or a 401/404
/// status) means the session is dead; transport and server errors bubble
/// up as `Err`, and the engine turns either shape into `auth_failed`.
pub struct HttpSessionValidator {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpSessionValidator {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl SessionValidator for HttpSessionValidator {
    async fn validate(&self, session_id: &str) -> Result<Option<SupervisorIdentity>> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(&ValidateRequest { session_id })
            .send()
            .await
            .context("session validator unreachable")?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let body: ValidateResponse = response
            .error_for_status()
            .context("session validator refused the lookup")?
            .json()
            .await
            .context("session validator returned an unreadable body")?;

        Ok(if body.ok { body.supervisor } else { None })
    }
}
