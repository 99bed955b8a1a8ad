//! REST call executor.
//!
//! Default [`RemoteCall`] implementation posting JSON to the venue and
//! mapping transport failures and HTTP status codes into the gateway error
//! taxonomy. Business-level response shapes stay opaque (`serde_json::Value`
//! in, `Value` out).

use std::time::Duration;

use clob_core::{CoreResult, EndpointClass, GateError, Identity};
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use crate::error::{GatewayError, GatewayResult};
use crate::remote::{BoxFuture, RemoteCall};

/// Default timeout for API requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Wait assumed for a venue 429 without a Retry-After header.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Error body length kept in error messages.
const ERROR_BODY_LIMIT: usize = 200;

/// JSON-over-HTTP executor for one venue base URL.
///
/// Each endpoint class maps to `{base_url}/{class}`; the identity rides in
/// a header so venue-side accounting can attribute the call.
pub struct RestExecutor {
    client: Client,
    base_url: String,
}

impl RestExecutor {
    /// Create an executor with the default request timeout.
    pub fn new(base_url: impl Into<String>) -> GatewayResult<Self> {
        Self::with_timeout(base_url, DEFAULT_TIMEOUT)
    }

    /// Create an executor with an explicit request timeout.
    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> GatewayResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Http(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }
}

impl RemoteCall for RestExecutor {
    fn execute<'a>(
        &'a self,
        endpoint_class: &'a EndpointClass,
        identity: Option<&'a Identity>,
        payload: Value,
    ) -> BoxFuture<'a, CoreResult<Value>> {
        Box::pin(async move {
            let url = format!(
                "{}/{}",
                self.base_url.trim_end_matches('/'),
                endpoint_class.as_str()
            );
            debug!(%url, identity = ?identity, "dispatching venue request");

            let mut request = self.client.post(&url).json(&payload);
            if let Some(identity) = identity {
                request = request.header("X-Account", identity.as_str());
            }

            let response = request.send().await.map_err(|e| {
                if e.is_timeout() {
                    GateError::transport(format!("request timed out: {e}"))
                } else {
                    GateError::transport(format!("HTTP request failed: {e}"))
                }
            })?;

            let status = response.status();
            if status.is_success() {
                return response
                    .json()
                    .await
                    .map_err(|e| GateError::transport(format!("Failed to parse response: {e}")));
            }

            match status.as_u16() {
                401 | 403 => Err(GateError::Auth),
                429 => {
                    let retry_after = response
                        .headers()
                        .get("Retry-After")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.parse::<u64>().ok())
                        .map_or(DEFAULT_RETRY_AFTER, Duration::from_secs);
                    Err(GateError::RateLimitExceeded {
                        endpoint_class: endpoint_class.clone(),
                        retry_after,
                    })
                }
                code => {
                    let body = response.text().await.unwrap_or_default();
                    Err(GateError::Upstream {
                        status: Some(code),
                        message: body.chars().take(ERROR_BODY_LIMIT).collect(),
                    })
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executor_builds() {
        let executor = RestExecutor::new("https://venue.example/api/");
        assert!(executor.is_ok());
    }
}
