use async_trait::async_trait;

use crate::error::BackendError;
use crate::types::{
    AgentCommand, BypassDecision, BypassRequest, HeartbeatPayload, HeartbeatResponse,
    OfftaskCheck, PolicyDocument, PollResponse,
};

/// The central policy server as seen by the agent.
#[async_trait]
pub trait PolicyBackend: Send + Sync {
    /// Fetch the current policy for `student`
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails, the status is not 2xx, or the body does not decode
    async fn fetch_policy(&self, student: &str) -> Result<PolicyDocument, BackendError>;

    /// Pull pending one-shot commands for `student`
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the envelope does not decode
    async fn fetch_commands(&self, student: &str) -> Result<Vec<AgentCommand>, BackendError>;

    /// Exchange a bypass code for an allow/deny decision
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the decision does not decode
    async fn exchange_bypass(&self, request: &BypassRequest)
        -> Result<BypassDecision, BackendError>;

    /// Post telemetry; the reply may carry the global enable toggle
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the reply does not decode
    async fn post_heartbeat(
        &self,
        payload: &HeartbeatPayload,
    ) -> Result<HeartbeatResponse, BackendError>;

    /// Forward a poll answer given in-page
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails
    async fn post_poll_response(&self, response: &PollResponse) -> Result<(), BackendError>;

    /// Ask the server to evaluate the active URL for off-task browsing
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails
    async fn check_offtask(&self, check: &OfftaskCheck) -> Result<(), BackendError>;

    /// Base URL requests are sent to
    fn base_url(&self) -> &str;
}
