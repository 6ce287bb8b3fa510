//! Broker topology declaration (§4.3). Idempotent: every declare call
//! uses `durable` exchanges/queues and is safe to repeat on reconnect.

use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{Channel, ExchangeKind};

use error_types::{ErrorContext, MailerResult};

pub const EXCHANGE: &str = "mailings";
pub const QUEUE_MAIN: &str = "mailing.jobs.process";
pub const QUEUE_RETRY_1: &str = "mailing.jobs.retry.1";
pub const QUEUE_RETRY_2: &str = "mailing.jobs.retry.2";
pub const QUEUE_DLQ: &str = "mailing.jobs.dlq";

const RETRY_1_TTL_MS: i32 = 60_000;
const RETRY_2_TTL_MS: i32 = 300_000;

/// Declare the exchange, main queue, two TTL-based retry queues that
/// dead-letter back into the main queue, and the terminal DLQ.
pub async fn declare(channel: &Channel) -> MailerResult<()> {
    channel
        .exchange_declare(
            EXCHANGE,
            ExchangeKind::Direct,
            ExchangeDeclareOptions { durable: true, ..Default::default() },
            FieldTable::default(),
        )
        .await
        .context("failed to declare mailings exchange")?;

    declare_main_queue(channel).await?;
    declare_retry_queue(channel, QUEUE_RETRY_1, RETRY_1_TTL_MS).await?;
    declare_retry_queue(channel, QUEUE_RETRY_2, RETRY_2_TTL_MS).await?;
    declare_dlq(channel).await?;

    Ok(())
}

async fn declare_main_queue(channel: &Channel) -> MailerResult<()> {
    channel
        .queue_declare(
            QUEUE_MAIN,
            QueueDeclareOptions { durable: true, ..Default::default() },
            FieldTable::default(),
        )
        .await
        .context("failed to declare main queue")?;

    channel
        .queue_bind(QUEUE_MAIN, EXCHANGE, QUEUE_MAIN, QueueBindOptions::default(), FieldTable::default())
        .await
        .context("failed to bind main queue")?;

    Ok(())
}

async fn declare_retry_queue(channel: &Channel, name: &str, ttl_ms: i32) -> MailerResult<()> {
    let mut args = FieldTable::default();
    args.insert("x-message-ttl".into(), ttl_ms.into());
    args.insert("x-dead-letter-exchange".into(), EXCHANGE.into());
    args.insert("x-dead-letter-routing-key".into(), QUEUE_MAIN.into());

    channel
        .queue_declare(name, QueueDeclareOptions { durable: true, ..Default::default() }, args)
        .await
        .context("failed to declare retry queue")?;

    Ok(())
}

async fn declare_dlq(channel: &Channel) -> MailerResult<()> {
    channel
        .queue_declare(
            QUEUE_DLQ,
            QueueDeclareOptions { durable: true, ..Default::default() },
            FieldTable::default(),
        )
        .await
        .context("failed to declare terminal dead-letter queue")?;

    Ok(())
}

/// Route the retry for `next_attempt` to the matching TTL queue:
/// attempt 1 (first retry) → retry.1, attempt ≥ 2 → retry.2.
pub fn retry_queue_for_attempt(next_attempt: u32) -> &'static str {
    if next_attempt <= 1 {
        QUEUE_RETRY_1
    } else {
        QUEUE_RETRY_2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_retry_routes_to_queue_one() {
        assert_eq!(retry_queue_for_attempt(1), QUEUE_RETRY_1);
    }

    #[test]
    fn later_retries_route_to_queue_two() {
        assert_eq!(retry_queue_for_attempt(2), QUEUE_RETRY_2);
        assert_eq!(retry_queue_for_attempt(5), QUEUE_RETRY_2);
    }
}
