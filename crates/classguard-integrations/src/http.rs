//! HTTP utilities for backend calls.

use crate::error::BackendError;

/// Extension trait for `reqwest::Response` to handle common error patterns.
#[async_trait::async_trait]
pub trait ResponseExt {
    /// Ensure the response status is successful, returning an error with details if not.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Status`] carrying the status code and response body
    /// when the status is not 2xx.
    async fn ensure_success(self, api: &'static str) -> Result<Self, BackendError>
    where
        Self: Sized;
}

#[async_trait::async_trait]
impl ResponseExt for reqwest::Response {
    async fn ensure_success(self, api: &'static str) -> Result<Self, BackendError> {
        if !self.status().is_success() {
            let status = self.status().as_u16();
            let body = self.text().await.unwrap_or_default();
            return Err(BackendError::Status { api, status, body });
        }
        Ok(self)
    }
}
