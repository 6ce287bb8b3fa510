//! `OutboxPublisher` implementation over the shared broker channel
//! (§4.2). Publishes with persistent delivery and waits for the
//! broker's confirm before returning `Ok`, per the outbox contract.

use std::sync::Arc;

use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions};
use lapin::{BasicProperties, Promise};
use transactional_outbox::{OutboxError, OutboxMessage, OutboxPublisher, OutboxResult};

use super::channel::BrokerChannel;
use super::topology::EXCHANGE;

pub struct AmqpOutboxPublisher {
    channel: Arc<BrokerChannel>,
}

impl AmqpOutboxPublisher {
    pub fn new(channel: Arc<BrokerChannel>) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl OutboxPublisher for AmqpOutboxPublisher {
    async fn publish(&self, message: &OutboxMessage) -> OutboxResult<()> {
        let channel = self
            .channel
            .channel()
            .await
            .map_err(|e| OutboxError::PublishFailed(e.to_string()))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| OutboxError::PublishFailed(format!("failed to enable publisher confirms: {e}")))?;

        let body = serde_json::to_vec(&message.payload)?;

        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2) // persistent
            .with_message_id(message.id.to_string().into());

        let confirm: Promise<lapin::publisher_confirm::Confirmation> = channel
            .basic_publish(
                EXCHANGE,
                &message.target_queue,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await
            .map_err(|e| OutboxError::PublishFailed(format!("publish failed: {e}")))?;

        let confirmation = confirm
            .await
            .map_err(|e| OutboxError::PublishFailed(format!("broker confirm failed: {e}")))?;

        if confirmation.is_nack() {
            return Err(OutboxError::PublishFailed("broker nacked the publish".to_string()));
        }

        Ok(())
    }
}
