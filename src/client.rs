//! HTTP clients for the downstream hops of the chain.
//!
//! Both clients share one pooled `reqwest::Client` per process. A
//! non-success status is treated the same as a transport failure: the
//! caller gets a [`CallError`] and decides what the outcome means.

use std::future::Future;
use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::admission::Forward;
use crate::error::{CallError, Error, Result};
use crate::generator::CallTarget;
use crate::types::{Call, EchoResult, ForwardResult};

fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))
}

async fn post_call<T: DeserializeOwned>(
    http: &reqwest::Client,
    url: &str,
    call: &Call,
) -> std::result::Result<T, CallError> {
    let transport = |source| CallError::Transport {
        url: url.to_string(),
        source,
    };

    let response = http.post(url).json(call).send().await.map_err(transport)?;

    let status = response.status();
    if !status.is_success() {
        return Err(CallError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }

    response.json::<T>().await.map_err(transport)
}

/// Forwards admitted calls to the sink's `/echo` endpoint.
#[derive(Debug, Clone)]
pub struct SinkClient {
    http: reqwest::Client,
    base_url: String,
    echo_url: String,
}

impl SinkClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        Ok(Self {
            http: http_client(timeout)?,
            echo_url: format!("{}/echo", base_url),
            base_url,
        })
    }
}

impl Forward for SinkClient {
    fn forward(
        &self,
        call: &Call,
    ) -> impl Future<Output = std::result::Result<EchoResult, CallError>> + Send {
        post_call(&self.http, &self.echo_url, call)
    }

    fn target(&self) -> &str {
        &self.base_url
    }
}

/// Sends generated calls to the controller's `/throttle` endpoint.
#[derive(Debug, Clone)]
pub struct ControllerClient {
    http: reqwest::Client,
    base_url: String,
    throttle_url: String,
}

impl ControllerClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        Ok(Self {
            http: http_client(timeout)?,
            throttle_url: format!("{}/throttle", base_url),
            base_url,
        })
    }
}

impl CallTarget for ControllerClient {
    fn call(
        &self,
        call: Call,
    ) -> impl Future<Output = std::result::Result<ForwardResult, CallError>> + Send {
        async move { post_call(&self.http, &self.throttle_url, &call).await }
    }

    fn target(&self) -> &str {
        &self.base_url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls_are_normalised() {
        let sink = SinkClient::new("http://localhost:3002/", Duration::from_secs(1)).unwrap();
        assert_eq!(sink.target(), "http://localhost:3002");
        assert_eq!(sink.echo_url, "http://localhost:3002/echo");

        let controller =
            ControllerClient::new("http://localhost:3001", Duration::from_secs(1)).unwrap();
        assert_eq!(controller.target(), "http://localhost:3001");
        assert_eq!(controller.throttle_url, "http://localhost:3001/throttle");
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_transport_error() {
        let sink = SinkClient::new("http://127.0.0.1:1", Duration::from_secs(2)).unwrap();

        let err = sink.forward(&Call::new(1, "1")).await.unwrap_err();
        assert!(matches!(err, CallError::Transport { .. }));
    }
}
