//! Shared broker connection with reconnect-under-lock (§5: "Broker
//! channel — single writer per channel; reconnect under internal lock
//! with 5 s back-off"). Both the outbox publisher and the worker
//! consumer obtain their channel through this handle rather than
//! dialing the broker themselves.

use std::time::Duration;

use lapin::{Connection, ConnectionProperties};
use tokio::sync::Mutex;

use error_types::{ErrorContext, MailerResult};

use super::topology;

const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

struct State {
    connection: Option<Connection>,
}

/// Holds the live AMQP connection and re-dials it on demand. Declares
/// topology on every fresh connection so a reconnect after a broker
/// restart is self-healing.
pub struct BrokerChannel {
    url: String,
    state: Mutex<State>,
}

impl BrokerChannel {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), state: Mutex::new(State { connection: None }) }
    }

    /// Open (or reuse) a connection and return a fresh `lapin::Channel`
    /// on it, declaring topology first. Retries the dial once after a
    /// fixed 5 s back-off if the connection has gone away.
    pub async fn channel(&self) -> MailerResult<lapin::Channel> {
        let mut state = self.state.lock().await;

        if let Some(conn) = &state.connection {
            if conn.status().connected() {
                if let Ok(channel) = conn.create_channel().await {
                    return Ok(channel);
                }
            }
        }

        match self.dial().await {
            Ok(conn) => {
                let channel = conn
                    .create_channel()
                    .await
                    .context("failed to open channel on freshly dialed broker connection")?;
                topology::declare(&channel).await?;
                state.connection = Some(conn);
                Ok(channel)
            }
            Err(e) => {
                tracing::warn!(error = %e, "broker dial failed, backing off before retry");
                tokio::time::sleep(RECONNECT_BACKOFF).await;
                let conn = self.dial().await?;
                let channel = conn
                    .create_channel()
                    .await
                    .context("failed to open channel after broker reconnect")?;
                topology::declare(&channel).await?;
                state.connection = Some(conn);
                Ok(channel)
            }
        }
    }

    async fn dial(&self) -> MailerResult<Connection> {
        Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .context("failed to connect to broker")
    }

    /// Used by graceful shutdown: drop the connection so no further
    /// publishes or deliveries can flow through this handle.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if let Some(conn) = state.connection.take() {
            if let Err(e) = conn.close(0, "shutting down").await {
                tracing::warn!(error = %e, "error closing broker connection");
            }
        }
    }
}
