//! Channel-level consumer driver around `mailing.jobs.process` (§4.4).
//! Wiring only — payload parsing, lock acquisition, and delivery
//! finalization live in [`crate::worker`]; this module owns the lapin
//! plumbing (prefetch, ack/nack, reconnect-transparent re-subscribe).

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions};
use lapin::types::FieldTable;

use error_types::{ErrorContext, MailerResult};

use super::channel::BrokerChannel;
use super::payload::MailingJobPayload;
use super::topology::QUEUE_MAIN;

/// Implemented by the worker. `handle` owns the entire per-delivery
/// lifecycle (lock, CSV processing, finalize) and is expected to
/// complete normally — returning `Err` signals a genuinely unexpected
/// failure (not a validated job-level failure, which is absorbed
/// internally and always resolves to `Ok`).
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, payload: MailingJobPayload) -> MailerResult<()>;
}

pub struct WorkerConsumer<H: DeliveryHandler> {
    channel: Arc<BrokerChannel>,
    prefetch: u16,
    handler: Arc<H>,
}

impl<H: DeliveryHandler + 'static> WorkerConsumer<H> {
    pub fn new(channel: Arc<BrokerChannel>, prefetch: u16, handler: Arc<H>) -> Self {
        Self { channel, prefetch, handler }
    }

    /// Run the consume loop until cancelled. Intended to be driven
    /// inside a `tokio::select!` against a shutdown signal.
    pub async fn run(&self) -> MailerResult<()> {
        let channel = self.channel.channel().await?;

        channel
            .basic_qos(self.prefetch, BasicQosOptions::default())
            .await
            .context("failed to set consumer prefetch")?;

        let mut consumer = channel
            .basic_consume(
                QUEUE_MAIN,
                "mailer-worker",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .context("failed to start consuming from main queue")?;

        while let Some(delivery) = consumer.next().await {
            let delivery = match delivery {
                Ok(d) => d,
                Err(e) => {
                    tracing::error!(error = %e, "consumer stream error");
                    continue;
                }
            };

            let payload = match serde_json::from_slice::<MailingJobPayload>(&delivery.data) {
                Ok(p) => p,
                Err(e) => {
                    tracing::error!(error = %e, "failed to parse delivery payload, routing to DLX");
                    if let Err(e) = delivery.nack(BasicNackOptions { requeue: false, ..Default::default() }).await
                    {
                        tracing::error!(error = %e, "failed to nack unparseable delivery");
                    }
                    continue;
                }
            };

            match self.handler.handle(payload).await {
                Ok(()) => {
                    if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                        tracing::error!(error = %e, "failed to ack delivery");
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "unexpected failure processing delivery, routing to DLX");
                    if let Err(e) = delivery.nack(BasicNackOptions { requeue: false, ..Default::default() }).await
                    {
                        tracing::error!(error = %e, "failed to nack delivery after handler error");
                    }
                }
            }
        }

        Ok(())
    }
}
