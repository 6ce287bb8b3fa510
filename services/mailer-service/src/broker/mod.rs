//! AMQP broker integration (§4.2/§4.3/§4.4): topology declaration, the
//! shared reconnecting channel, the outbox's AMQP publisher, and the
//! worker consumer driver.

pub mod channel;
pub mod consumer;
pub mod payload;
pub mod publisher;
pub mod topology;

use std::sync::Arc;

use lapin::options::{BasicPublishOptions, ConfirmSelectOptions};
use lapin::BasicProperties;

use error_types::{ErrorContext, MailerResult};

use channel::BrokerChannel;

/// Publish a payload directly to `queue`, bypassing the outbox. Used
/// by the worker's finalize step (§4.4 Step 7) to republish to a retry
/// queue or the terminal DLQ — these are direct, synchronous publishes
/// made while the worker still holds the delivery, not outbox rows.
///
/// Published through the default (nameless) exchange with `queue` as
/// the routing key rather than the `mailings` exchange: the retry and
/// DLQ queues are never bound to `mailings` (only the main queue is —
/// they only need to accept a direct enqueue, not exchange routing),
/// so publishing to the named exchange would be unroutable and, under
/// publisher confirms, silently confirmed rather than nacked. Every
/// queue is implicitly bound to the default exchange under its own
/// name, so this always routes.
pub async fn publish_direct(
    broker: &Arc<BrokerChannel>,
    queue: &str,
    payload: &impl serde::Serialize,
) -> MailerResult<()> {
    let channel = broker.channel().await?;
    channel
        .confirm_select(ConfirmSelectOptions::default())
        .await
        .context("failed to enable publisher confirms for direct publish")?;

    let body = serde_json::to_vec(payload)
        .map_err(|e| error_types::MailerError::internal(anyhow::anyhow!("failed to serialize payload: {e}")))?;

    let properties = BasicProperties::default()
        .with_content_type("application/json".into())
        .with_delivery_mode(2);

    let confirm = channel
        .basic_publish("", queue, BasicPublishOptions::default(), &body, properties)
        .await
        .context("failed to publish directly to queue")?;

    let confirmation = confirm.await.context("broker confirm failed for direct publish")?;
    if confirmation.is_nack() {
        return Err(error_types::MailerError::BrokerFailure {
            detail: format!("broker nacked direct publish to {queue}"),
        });
    }

    Ok(())
}
