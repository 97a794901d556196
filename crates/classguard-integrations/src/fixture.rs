//! Offline backend serving a fixed policy.
//!
//! Used by the `check` dry run and by tests. Everything the agent posts is
//! recorded for inspection.

use async_trait::async_trait;
use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
};

use crate::error::BackendError;
use crate::traits::PolicyBackend;
use crate::types::{
    AgentCommand, BypassDecision, BypassRequest, HeartbeatPayload, HeartbeatResponse,
    OfftaskCheck, PolicyDocument, PollResponse,
};

#[derive(Default)]
struct FixtureState {
    policy: PolicyDocument,
    command_batches: VecDeque<Vec<AgentCommand>>,
    bypass_decision: BypassDecision,
    heartbeat_reply: HeartbeatResponse,
    offline: bool,
    policy_fetches: usize,
    heartbeats: Vec<HeartbeatPayload>,
    bypass_requests: Vec<BypassRequest>,
    poll_responses: Vec<PollResponse>,
    offtask_checks: Vec<OfftaskCheck>,
}

#[derive(Default)]
pub struct FixtureBackend {
    state: Mutex<FixtureState>,
}

impl FixtureBackend {
    #[must_use]
    pub fn new(policy: PolicyDocument) -> Self {
        let backend = Self::default();
        backend.set_policy(policy);
        backend
    }

    fn lock(&self) -> MutexGuard<'_, FixtureState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_online(&self, api: &'static str) -> Result<(), BackendError> {
        if self.lock().offline {
            return Err(BackendError::Status {
                api,
                status: 503,
                body: "fixture backend offline".to_string(),
            });
        }
        Ok(())
    }

    pub fn set_policy(&self, policy: PolicyDocument) {
        self.lock().policy = policy;
    }

    /// Queue one batch of commands for the next `fetch_commands`.
    pub fn push_commands(&self, commands: Vec<AgentCommand>) {
        self.lock().command_batches.push_back(commands);
    }

    pub fn set_bypass_decision(&self, decision: BypassDecision) {
        self.lock().bypass_decision = decision;
    }

    pub fn set_extension_enabled(&self, enabled: Option<bool>) {
        self.lock().heartbeat_reply.extension_enabled = enabled;
    }

    /// Make every call fail with a 503.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    #[must_use]
    pub fn policy_fetches(&self) -> usize {
        self.lock().policy_fetches
    }

    #[must_use]
    pub fn heartbeats(&self) -> Vec<HeartbeatPayload> {
        self.lock().heartbeats.clone()
    }

    #[must_use]
    pub fn bypass_requests(&self) -> Vec<BypassRequest> {
        self.lock().bypass_requests.clone()
    }

    #[must_use]
    pub fn poll_responses(&self) -> Vec<PollResponse> {
        self.lock().poll_responses.clone()
    }

    #[must_use]
    pub fn offtask_checks(&self) -> Vec<OfftaskCheck> {
        self.lock().offtask_checks.clone()
    }
}

#[async_trait]
impl PolicyBackend for FixtureBackend {
    async fn fetch_policy(&self, _student: &str) -> Result<PolicyDocument, BackendError> {
        self.check_online("policy")?;
        let mut state = self.lock();
        state.policy_fetches += 1;
        Ok(state.policy.clone())
    }

    async fn fetch_commands(&self, _student: &str) -> Result<Vec<AgentCommand>, BackendError> {
        self.check_online("commands")?;
        Ok(self.lock().command_batches.pop_front().unwrap_or_default())
    }

    async fn exchange_bypass(
        &self,
        request: &BypassRequest,
    ) -> Result<BypassDecision, BackendError> {
        self.check_online("bypass")?;
        let mut state = self.lock();
        state.bypass_requests.push(request.clone());
        Ok(state.bypass_decision)
    }

    async fn post_heartbeat(
        &self,
        payload: &HeartbeatPayload,
    ) -> Result<HeartbeatResponse, BackendError> {
        self.check_online("heartbeat")?;
        let mut state = self.lock();
        state.heartbeats.push(payload.clone());
        Ok(state.heartbeat_reply)
    }

    async fn post_poll_response(&self, response: &PollResponse) -> Result<(), BackendError> {
        self.check_online("poll_response")?;
        self.lock().poll_responses.push(response.clone());
        Ok(())
    }

    async fn check_offtask(&self, check: &OfftaskCheck) -> Result<(), BackendError> {
        self.check_online("offtask/check")?;
        self.lock().offtask_checks.push(check.clone());
        Ok(())
    }

    fn base_url(&self) -> &str {
        "fixture://"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_commands_are_served_once() {
        let backend = FixtureBackend::default();
        backend.push_commands(vec![AgentCommand::PolicyRefresh]);

        assert_eq!(
            backend.fetch_commands("s").await.unwrap(),
            vec![AgentCommand::PolicyRefresh]
        );
        assert!(backend.fetch_commands("s").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_offline_fails_every_call() {
        let backend = FixtureBackend::default();
        backend.set_offline(true);

        let err = backend.fetch_policy("s").await.unwrap_err();
        assert_eq!(err.api(), Some("policy"));
        assert!(backend.post_heartbeat(&HeartbeatPayload::default()).await.is_err());
        assert_eq!(backend.policy_fetches(), 0);
    }

    #[tokio::test]
    async fn test_records_posts() {
        let backend = FixtureBackend::default();
        backend.set_extension_enabled(Some(false));
        let reply = backend
            .post_heartbeat(&HeartbeatPayload::tabshot("s", 3, "data:x".to_string()))
            .await
            .unwrap();

        assert_eq!(reply.extension_enabled, Some(false));
        assert_eq!(backend.heartbeats().len(), 1);
        assert_eq!(backend.heartbeats()[0].tabshots["3"], "data:x");
    }
}
