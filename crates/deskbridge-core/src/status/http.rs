//! Peer-list queries over HTTP.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use crate::capability::LivenessDiscovery;

/// Fetches a broker's JSON array of connected identifiers.
#[derive(Debug, Clone)]
pub struct HttpDiscovery {
    client: Client,
    timeout: Duration,
}

impl HttpDiscovery {
    /// Create a discovery that gives up on a URL after `timeout`.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            timeout,
        }
    }
}

#[async_trait]
impl LivenessDiscovery for HttpDiscovery {
    async fn query_online(&self, url: &str) -> Option<Vec<String>> {
        let response = match self
            .client
            .get(url)
            .header("Accept", "application/json")
            .timeout(self.timeout)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                debug!(url, error = %e, "Peer list unreachable");
                return None;
            }
        };

        if !response.status().is_success() {
            debug!(url, status = %response.status(), "Peer list refused");
            return None;
        }

        match response.json::<Vec<String>>().await {
            Ok(ids) => Some(ids),
            Err(e) => {
                debug!(url, error = %e, "Peer list is not a JSON array");
                None
            }
        }
    }
}
