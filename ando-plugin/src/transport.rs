use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Wire body sent to an external plugin filter. A stand-in for the
/// out-of-scope gRPC collaborator protocol (spec §6): HTTP/JSON over
/// `reqwest` instead, which is the transport the rest of this workspace
/// already standardizes on for outbound calls.
#[derive(Debug, Serialize)]
pub struct FilterRequestBody {
    pub route_id: String,
    pub phase: &'static str,
    pub method: String,
    pub uri: String,
    pub host: String,
    pub headers: HashMap<String, String>,
    pub response_status: Option<u16>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum FilterResponseBody {
    Continue {
        #[serde(default)]
        set_headers: HashMap<String, String>,
        #[serde(default)]
        remove_headers: Vec<String>,
    },
    Respond {
        status: u16,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        body: Option<String>,
    },
}

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("plugin filter call timed out")]
    Timeout,
    #[error("plugin filter unavailable: {0}")]
    Unavailable(String),
}

/// Abstracts the wire call so the pipeline can be tested with a fake
/// transport instead of a real HTTP server.
#[async_trait]
pub trait PluginTransport: Send + Sync {
    async fn call(
        &self,
        addr: &str,
        body: FilterRequestBody,
        timeout_ms: u64,
    ) -> Result<FilterResponseBody, TransportError>;
}

pub struct HttpJsonTransport {
    client: reqwest::Client,
}

impl Default for HttpJsonTransport {
    fn default() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

#[async_trait]
impl PluginTransport for HttpJsonTransport {
    async fn call(
        &self,
        addr: &str,
        body: FilterRequestBody,
        timeout_ms: u64,
    ) -> Result<FilterResponseBody, TransportError> {
        let url = format!("http://{addr}/filter");
        let request = self.client.post(&url).json(&body);
        let response = tokio::time::timeout(Duration::from_millis(timeout_ms), request.send())
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;

        response
            .json::<FilterResponseBody>()
            .await
            .map_err(|e| TransportError::Unavailable(e.to_string()))
    }
}
