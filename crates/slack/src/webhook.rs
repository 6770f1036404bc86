use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use runwarden_core::alerts::{AlertEvent, AlertSink};

use crate::message::{render, WebhookPayload};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("webhook client could not be built: {0}")]
    Client(String),
    #[error("webhook request failed: {0}")]
    Request(String),
    #[error("webhook rejected the alert with status {0}")]
    Status(u16),
}

#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn post(&self, payload: &WebhookPayload) -> Result<(), DeliveryError>;
}

pub struct ReqwestWebhookTransport {
    client: reqwest::Client,
    url: SecretString,
}

impl ReqwestWebhookTransport {
    pub fn new(url: SecretString, timeout: Duration) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| DeliveryError::Client(error.to_string()))?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl WebhookTransport for ReqwestWebhookTransport {
    async fn post(&self, payload: &WebhookPayload) -> Result<(), DeliveryError> {
        // The webhook URL embeds its credential; strip it from any error text.
        let response = self
            .client
            .post(self.url.expose_secret())
            .json(payload)
            .send()
            .await
            .map_err(|error| DeliveryError::Request(error.without_url().to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::Status(status.as_u16()));
        }
        Ok(())
    }
}

/// Non-blocking alert sink backed by a bounded queue and one delivery task.
///
/// Each event is posted at most once and stamped with the time it was raised,
/// not the time it was posted. A full queue or a failed post is logged and
/// dropped; neither ever reaches the caller. Queue drops are counted.
#[derive(Clone)]
pub struct SlackAlertDispatcher {
    sender: mpsc::Sender<QueuedAlert>,
    dropped: Arc<AtomicU64>,
}

struct QueuedAlert {
    event: AlertEvent,
    raised_at: DateTime<Utc>,
}

pub struct DispatcherWorker {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl SlackAlertDispatcher {
    pub fn spawn(
        transport: Arc<dyn WebhookTransport>,
        queue_capacity: usize,
    ) -> (Self, DispatcherWorker) {
        let (sender, receiver) = mpsc::channel(queue_capacity.max(1));
        let (shutdown, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(deliver_loop(transport, receiver, shutdown_rx));
        let dropped = Arc::new(AtomicU64::new(0));
        (Self { sender, dropped }, DispatcherWorker { shutdown, handle })
    }

    /// Alerts discarded because the queue was full or the worker had stopped.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl AlertSink for SlackAlertDispatcher {
    fn notify(&self, event: AlertEvent) {
        let queued = QueuedAlert { event, raised_at: Utc::now() };
        let (QueuedAlert { event, .. }, event_name, message) = match self.sender.try_send(queued) {
            Ok(()) => return,
            Err(mpsc::error::TrySendError::Full(queued)) => {
                (queued, "alerts.queue.full", "alert queue full, dropping alert")
            }
            Err(mpsc::error::TrySendError::Closed(queued)) => {
                (queued, "alerts.queue.closed", "alert dispatcher stopped, dropping alert")
            }
        };
        let dropped_total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(
            event_name,
            run_id = %event.run_id(),
            kind = event.kind().as_str(),
            dropped_total,
            "{message}"
        );
    }
}

impl DispatcherWorker {
    /// Stops accepting alerts, delivers what is already queued, and waits up
    /// to `grace` for the worker to finish.
    pub async fn shutdown(self, grace: Duration) {
        let _ = self.shutdown.send(());
        let mut handle = self.handle;
        match tokio::time::timeout(grace, &mut handle).await {
            Ok(Ok(())) => info!(event_name = "alerts.dispatcher.stopped", "alert dispatcher stopped"),
            Ok(Err(error)) => {
                warn!(event_name = "alerts.dispatcher.crashed", error = %error, "alert worker failed")
            }
            Err(_) => {
                handle.abort();
                warn!(
                    event_name = "alerts.dispatcher.abandoned",
                    grace_ms = grace.as_millis() as u64,
                    "alert queue not drained before shutdown"
                );
            }
        }
    }
}

async fn deliver_loop(
    transport: Arc<dyn WebhookTransport>,
    mut receiver: mpsc::Receiver<QueuedAlert>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                receiver.close();
                while let Some(queued) = receiver.recv().await {
                    deliver(transport.as_ref(), queued).await;
                }
                return;
            }
            next = receiver.recv() => match next {
                Some(queued) => deliver(transport.as_ref(), queued).await,
                None => return,
            },
        }
    }
}

async fn deliver(transport: &dyn WebhookTransport, queued: QueuedAlert) {
    let QueuedAlert { event, raised_at } = queued;
    let payload = render(&event, raised_at);
    match transport.post(&payload).await {
        Ok(()) => debug!(
            event_name = "alerts.delivery.sent",
            run_id = %event.run_id(),
            kind = event.kind().as_str(),
            "alert delivered"
        ),
        Err(error) => warn!(
            event_name = "alerts.delivery.failed",
            run_id = %event.run_id(),
            kind = event.kind().as_str(),
            error = %error,
            "alert delivery failed"
        ),
    }
}
