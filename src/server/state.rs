use std::sync::Arc;

use pagepulse_health_breaker::HealthProxy;
use pagepulse_live_refresh::RefreshPoller;
use tokio::time::Duration;

use crate::errors::RelayError;

/// Shared state handed to every relay route.
#[derive(Clone)]
pub struct ServeState {
    pub(crate) proxy: Arc<HealthProxy>,
    pub(crate) poller: Arc<RefreshPoller>,
    pub(crate) forwarder: Arc<BeaconForwarder>,
}

impl ServeState {
    pub fn new(
        proxy: Arc<HealthProxy>,
        poller: Arc<RefreshPoller>,
        forwarder: Arc<BeaconForwarder>,
    ) -> Self {
        Self {
            proxy,
            poller,
            forwarder,
        }
    }
}

/// Forwards runtime-beacon payloads verbatim to the backend events
/// endpoint, echoing the upstream response back to the caller.
pub struct BeaconForwarder {
    client: reqwest::Client,
    events_url: String,
    timeout: Duration,
}

impl BeaconForwarder {
    pub fn new(client: reqwest::Client, events_url: String, timeout: Duration) -> Self {
        Self {
            client,
            events_url,
            timeout,
        }
    }

    pub async fn forward(&self, body: Vec<u8>) -> Result<(u16, String), RelayError> {
        let response = tokio::time::timeout(
            self.timeout,
            self.client
                .post(&self.events_url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body)
                .send(),
        )
        .await
        .map_err(|_| {
            RelayError::Upstream(format!(
                "timed out after {}ms posting to {}",
                self.timeout.as_millis(),
                self.events_url
            ))
        })?
        .map_err(|err| RelayError::Upstream(err.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|err| RelayError::Upstream(err.to_string()))?;
        Ok((status, body))
    }
}
