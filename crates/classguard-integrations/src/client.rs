use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;

use crate::error::BackendError;
use crate::http::ResponseExt;
use crate::traits::PolicyBackend;
use crate::types::{
    AgentCommand, BypassDecision, BypassRequest, CommandsEnvelope, HeartbeatPayload,
    HeartbeatResponse, OfftaskCheck, PolicyDocument, PollResponse,
};

#[derive(Serialize)]
struct StudentBody<'a> {
    student: &'a str,
}

/// reqwest-backed client for the policy server.
pub struct BackendClient {
    base_url: String,
    client: reqwest::Client,
}

impl BackendClient {
    /// Create a client for `base_url` with a per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL is empty or the HTTP client cannot be created
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, BackendError> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(BackendError::NotConfigured);
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| BackendError::Transport {
                api: "client",
                source,
            })?;

        Ok(Self { base_url, client })
    }

    fn build_url(&self, path: &str) -> String {
        format!("{}/api/{}", self.base_url, path)
    }

    async fn decode<T: DeserializeOwned>(
        response: reqwest::Response,
        api: &'static str,
    ) -> Result<T, BackendError> {
        let bytes = response
            .bytes()
            .await
            .map_err(|source| BackendError::Transport { api, source })?;
        serde_json::from_slice(&bytes).map_err(|e| BackendError::Decode {
            api,
            reason: e.to_string(),
        })
    }

    async fn get<T: DeserializeOwned>(&self, url: &str, api: &'static str) -> Result<T, BackendError> {
        log::debug!("GET {url}");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| BackendError::Transport { api, source })?
            .ensure_success(api)
            .await?;

        Self::decode(response, api).await
    }

    async fn post_raw<B: Serialize + Sync>(
        &self,
        url: &str,
        body: &B,
        api: &'static str,
    ) -> Result<reqwest::Response, BackendError> {
        log::debug!("POST {url}");

        self.client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|source| BackendError::Transport { api, source })?
            .ensure_success(api)
            .await
    }

    async fn post<T: DeserializeOwned, B: Serialize + Sync>(
        &self,
        url: &str,
        body: &B,
        api: &'static str,
    ) -> Result<T, BackendError> {
        let response = self.post_raw(url, body, api).await?;
        Self::decode(response, api).await
    }
}

/// Percent-encode one path segment.
fn encode_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~') {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

#[async_trait]
impl PolicyBackend for BackendClient {
    async fn fetch_policy(&self, student: &str) -> Result<PolicyDocument, BackendError> {
        self.post(&self.build_url("policy"), &StudentBody { student }, "policy")
            .await
    }

    async fn fetch_commands(&self, student: &str) -> Result<Vec<AgentCommand>, BackendError> {
        let url = self.build_url(&format!("commands/{}", encode_segment(student)));
        let envelope: CommandsEnvelope = self.get(&url, "commands").await?;
        Ok(envelope.into_commands())
    }

    async fn exchange_bypass(
        &self,
        request: &BypassRequest,
    ) -> Result<BypassDecision, BackendError> {
        self.post(&self.build_url("bypass"), request, "bypass").await
    }

    async fn post_heartbeat(
        &self,
        payload: &HeartbeatPayload,
    ) -> Result<HeartbeatResponse, BackendError> {
        self.post(&self.build_url("heartbeat"), payload, "heartbeat")
            .await
    }

    async fn post_poll_response(&self, response: &PollResponse) -> Result<(), BackendError> {
        self.post_raw(&self.build_url("poll_response"), response, "poll_response")
            .await?;
        Ok(())
    }

    async fn check_offtask(&self, check: &OfftaskCheck) -> Result<(), BackendError> {
        self.post_raw(&self.build_url("offtask/check"), check, "offtask")
            .await?;
        Ok(())
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }
}
