//! NATS transport for both directions.

use crate::{Adaptor, NatsSettings, Publisher};
use async_trait::async_trait;
use tracebus::error::{ConfigError, SinkError};

#[derive(Clone)]
pub struct NatsPublisher {
    connection: nats::asynk::Connection,
}

impl NatsPublisher {
    pub async fn connect(settings: &NatsSettings) -> Result<Self, ConfigError> {
        let connection = nats::asynk::connect(settings.url.as_str())
            .await
            .map_err(|e| ConfigError::Client(format!("nats {}: {e}", settings.url)))?;
        Ok(Self { connection })
    }

    pub fn from_connection(connection: nats::asynk::Connection) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl Publisher for NatsPublisher {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), SinkError> {
        self.connection.publish(subject, payload).await.map_err(SinkError::Io)
    }
}

/// Consume `<prefix>.*` in the configured queue group until the subscription closes.
pub async fn run_adaptor(
    connection: &nats::asynk::Connection,
    settings: &NatsSettings,
    adaptor: &Adaptor,
) -> std::io::Result<()> {
    let subject = adaptor.subscription();
    let subscription = connection.queue_subscribe(&subject, &settings.queue_group).await?;
    tracing::info!(subject = %subject, group = %settings.queue_group, "bridge adaptor subscribed");
    while let Some(message) = subscription.next().await {
        adaptor.handle(&message.subject, &message.data);
    }
    tracing::info!(subject = %subject, stats = ?adaptor.stats(), "bridge adaptor subscription closed");
    Ok(())
}
