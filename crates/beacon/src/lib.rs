//! Beacon records and delivery sinks.
//!
//! A beacon is a single aggregated telemetry record: one finished view
//! session or one health-proxy call outcome. Delivery is best-effort and
//! fire-and-forget; a failed or dropped beacon is logged at `warn` and
//! never surfaced to application code.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::warn;

/// Default queue depth for the queued sink.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;
/// Default per-delivery timeout.
pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Wire shape accepted by the backend's `/api/runtime/events` endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RuntimeBeacon {
    pub source: String,
    pub endpoint: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub runtime_ms: u64,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

/// Fire-and-forget delivery capability.
///
/// `dispatch` must never block the caller and must never fail into it;
/// implementations swallow delivery errors after logging them.
pub trait BeaconSink: Send + Sync {
    fn dispatch(&self, beacon: RuntimeBeacon);
}

enum QueueMessage {
    Deliver(RuntimeBeacon),
    Flush(oneshot::Sender<()>),
}

/// Preferred sink: beacons are queued on a bounded channel and drained by
/// a background task, so a shutting-down process still gets a best-effort
/// send via [`QueuedBeaconSink::flush`]. A full queue drops the beacon.
pub struct QueuedBeaconSink {
    tx: mpsc::Sender<QueueMessage>,
}

/// Owns the drain task spawned by [`QueuedBeaconSink::spawn`].
pub struct QueueWorker {
    task: Option<JoinHandle<()>>,
}

impl QueuedBeaconSink {
    pub fn spawn(
        client: reqwest::Client,
        target_url: String,
        capacity: usize,
        timeout: Duration,
    ) -> (Arc<Self>, QueueWorker) {
        let (tx, mut rx) = mpsc::channel(capacity.max(1));
        let task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    QueueMessage::Deliver(beacon) => {
                        deliver(&client, &target_url, &beacon, timeout).await;
                    }
                    QueueMessage::Flush(ack) => {
                        // The channel is FIFO, so everything dispatched
                        // before the flush request has already been sent.
                        let _ = ack.send(());
                    }
                }
            }
        });
        (Arc::new(Self { tx }), QueueWorker { task: Some(task) })
    }

    /// Wait until every beacon dispatched before this call has been
    /// attempted. Used on graceful shutdown.
    pub async fn flush(&self, grace: Duration) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(QueueMessage::Flush(ack_tx)).await.is_err() {
            return;
        }
        if tokio::time::timeout(grace, ack_rx).await.is_err() {
            warn!(target: "beacon", "beacon flush timed out");
        }
    }
}

impl BeaconSink for QueuedBeaconSink {
    fn dispatch(&self, beacon: RuntimeBeacon) {
        if self.tx.try_send(QueueMessage::Deliver(beacon)).is_err() {
            warn!(target: "beacon", "beacon queue full or closed, dropping record");
        }
    }
}

impl QueueWorker {
    pub async fn shutdown(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for QueueWorker {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Fallback sink: posts each beacon from a freshly spawned task. Requires
/// a running runtime; without one the beacon is dropped with a warning.
pub struct DirectBeaconSink {
    client: reqwest::Client,
    target_url: String,
    timeout: Duration,
}

impl DirectBeaconSink {
    pub fn new(client: reqwest::Client, target_url: String, timeout: Duration) -> Self {
        Self {
            client,
            target_url,
            timeout,
        }
    }
}

impl BeaconSink for DirectBeaconSink {
    fn dispatch(&self, beacon: RuntimeBeacon) {
        if Handle::try_current().is_err() {
            warn!(target: "beacon", "no async runtime, dropping beacon");
            return;
        }
        let client = self.client.clone();
        let url = self.target_url.clone();
        let timeout = self.timeout;
        tokio::spawn(async move {
            deliver(&client, &url, &beacon, timeout).await;
        });
    }
}

async fn deliver(client: &reqwest::Client, url: &str, beacon: &RuntimeBeacon, timeout: Duration) {
    match tokio::time::timeout(timeout, client.post(url).json(beacon).send()).await {
        Ok(Ok(_)) => {}
        Ok(Err(err)) => warn!(target: "beacon", ?err, "beacon delivery failed"),
        Err(_) => warn!(target: "beacon", "beacon delivery timed out"),
    }
}

/// Capability detection: queue when a runtime is available to host the
/// drain task, otherwise fall back to per-beacon spawned sends.
pub fn preferred_sink(
    client: reqwest::Client,
    target_url: String,
) -> (Arc<dyn BeaconSink>, Option<QueueWorker>) {
    if Handle::try_current().is_ok() {
        let (sink, worker) = QueuedBeaconSink::spawn(
            client,
            target_url,
            DEFAULT_QUEUE_CAPACITY,
            DEFAULT_DELIVERY_TIMEOUT,
        );
        (sink, Some(worker))
    } else {
        let sink = DirectBeaconSink::new(client, target_url, DEFAULT_DELIVERY_TIMEOUT);
        (Arc::new(sink), None)
    }
}

/// In-memory sink for unit tests and early integration.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<RuntimeBeacon>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn records(&self) -> Vec<RuntimeBeacon> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl BeaconSink for MemorySink {
    fn dispatch(&self, beacon: RuntimeBeacon) {
        self.records.lock().push(beacon);
    }
}
