use thiserror::Error;

/// Failure talking to the policy backend.
///
/// Every variant is treated as transient by the agent: the cycle that hit it
/// is skipped and the next poll retries.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend base URL is not configured")]
    NotConfigured,

    #[error("{api} request failed: {source}")]
    Transport {
        api: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{api} API error ({status}): {body}")]
    Status {
        api: &'static str,
        status: u16,
        body: String,
    },

    #[error("failed to decode {api} response: {reason}")]
    Decode { api: &'static str, reason: String },
}

impl BackendError {
    /// Name of the endpoint that failed, if any.
    #[must_use]
    pub fn api(&self) -> Option<&'static str> {
        match self {
            Self::NotConfigured => None,
            Self::Transport { api, .. } | Self::Status { api, .. } | Self::Decode { api, .. } => {
                Some(api)
            }
        }
    }
}
