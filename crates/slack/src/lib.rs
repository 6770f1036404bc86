//! Slack alert delivery for run lifecycle events.
//!
//! - **Message** (`message`) - incoming-webhook attachment payloads per alert kind
//! - **Webhook** (`webhook`) - HTTP transport and the queued `AlertSink` dispatcher
//!
//! ```text
//! RunRegistry → AlertSink::notify → bounded queue → worker → POST webhook
//! ```
//!
//! When alerts are disabled or no webhook is configured the sink is a no-op.

pub mod message;
pub mod webhook;

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use runwarden_core::alerts::{AlertSink, NoopAlertSink};
use runwarden_core::config::AlertsConfig;

pub use message::{render, WebhookPayload};
pub use webhook::{
    DeliveryError, DispatcherWorker, ReqwestWebhookTransport, SlackAlertDispatcher,
    WebhookTransport,
};

/// Builds the process-wide alert sink from configuration. The returned worker
/// is `None` when delivery is disabled.
pub fn build_alert_sink(
    config: &AlertsConfig,
) -> Result<(Arc<dyn AlertSink>, Option<DispatcherWorker>), DeliveryError> {
    let Some(url) = config.webhook_url.clone().filter(|_| config.is_deliverable()) else {
        info!(
            event_name = "alerts.disabled",
            enabled = config.enabled,
            "alert delivery disabled; events will be discarded"
        );
        return Ok((Arc::new(NoopAlertSink), None));
    };

    let transport =
        ReqwestWebhookTransport::new(url, Duration::from_secs(config.timeout_secs))?;
    let (dispatcher, worker) =
        SlackAlertDispatcher::spawn(Arc::new(transport), config.queue_capacity);
    info!(
        event_name = "alerts.enabled",
        queue_capacity = config.queue_capacity,
        timeout_secs = config.timeout_secs,
        "alert delivery enabled"
    );
    Ok((Arc::new(dispatcher), Some(worker)))
}
