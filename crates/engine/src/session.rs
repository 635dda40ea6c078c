use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use shared::domain::SupervisorIdentity;

/// Resolves controller session tokens against the external identity store.
///
/// `Ok(Some(_))` is a live session, `Ok(None)` an invalid or expired one,
/// and `Err(_)` means the validator itself could not be reached. Either
/// failure shape ends the auth attempt; the engine never retries
/// validation on its own.
#[async_trait]
pub trait SessionValidator: Send + Sync {
    async fn validate(&self, session_id: &str) -> Result<Option<SupervisorIdentity>>;
}

/// Fixed in-memory session table for development and tests.
#[derive(Default)]
pub struct StaticSessionValidator {
    sessions: HashMap<String, SupervisorIdentity>,
}

impl StaticSessionValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(
        mut self,
        session_id: impl Into<String>,
        identity: SupervisorIdentity,
    ) -> Self {
        self.sessions.insert(session_id.into(), identity);
        self
    }

    pub fn insert(&mut self, session_id: impl Into<String>, identity: SupervisorIdentity) {
        self.sessions.insert(session_id.into(), identity);
    }
}

#[async_trait]
impl SessionValidator for StaticSessionValidator {
    async fn validate(&self, session_id: &str) -> Result<Option<SupervisorIdentity>> {
        Ok(self.sessions.get(session_id).cloned())
    }
}
