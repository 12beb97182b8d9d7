//! Per-call HTTP transport
//!
//! The client never shares mutable request state between calls: each call
//! hands its own body to [`Transport::post`] and gets back an owned response.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::TransportError;
use crate::router::NodeEndpoint;

/// Status and raw body of a node answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).trim().to_string()
    }
}

/// Capability to POST a JSON body to a node
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post(
        &self,
        endpoint: &NodeEndpoint,
        path: &str,
        body: Vec<u8>,
        deadline: Duration,
    ) -> Result<TransportResponse, TransportError>;
}

/// reqwest backed transport; the inner client is a cheap, shareable pool handle
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(
        &self,
        endpoint: &NodeEndpoint,
        path: &str,
        body: Vec<u8>,
        deadline: Duration,
    ) -> Result<TransportResponse, TransportError> {
        let url = endpoint.url(path);
        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .timeout(deadline)
            .send()
            .await
            .map_err(|e| map_reqwest_error(endpoint, e))?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| map_reqwest_error(endpoint, e))?
            .to_vec();

        Ok(TransportResponse { status, body })
    }
}

fn map_reqwest_error(endpoint: &NodeEndpoint, err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout {
            endpoint: endpoint.to_string(),
        }
    } else {
        TransportError::Connect {
            endpoint: endpoint.to_string(),
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_range() {
        let ok = TransportResponse { status: 202, body: b" queued \n".to_vec() };
        assert!(ok.is_success());
        assert_eq!(ok.body_text(), "queued");

        let rejected = TransportResponse { status: 400, body: Vec::new() };
        assert!(!rejected.is_success());
        assert!(!TransportResponse { status: 302, body: Vec::new() }.is_success());
    }

    #[tokio::test]
    async fn test_connection_refused_is_connect_error() {
        // Bind then drop to get a local port with no listener.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let endpoint = NodeEndpoint::parse(&format!("127.0.0.1:{}", port)).unwrap();

        let err = HttpTransport::new()
            .post(&endpoint, "/read", b"{}".to_vec(), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
        assert_eq!(err.endpoint(), endpoint.as_str());
    }
}
