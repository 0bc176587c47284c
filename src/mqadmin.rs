//! Broker queue administration helpers.
//!
//! Used by operators and test harnesses to set up and tear down queues
//! outside the normal server lifecycle. Only the broker connection keys are
//! needed, so the global configuration section is enough.

use lapin::options::{QueueDeclareOptions, QueueDeleteOptions};
use lapin::types::FieldTable;

use crate::config::Config;
use crate::transport::{connect_broker, TransportError};

/// Declares a durable queue named `queue_name` on the configured broker.
pub async fn create_queue(config: &Config, queue_name: &str) -> Result<(), TransportError> {
    let connection = connect_broker(config).await?;
    let channel = connection.create_channel().await?;
    channel
        .queue_declare(
            queue_name,
            QueueDeclareOptions {
                durable: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await?;
    connection.close(0, "").await?;
    Ok(())
}

/// Deletes the queue named `queue_name` from the configured broker.
pub async fn delete_queue(config: &Config, queue_name: &str) -> Result<(), TransportError> {
    let connection = connect_broker(config).await?;
    let channel = connection.create_channel().await?;
    channel
        .queue_delete(queue_name, QueueDeleteOptions::default())
        .await?;
    connection.close(0, "").await?;
    Ok(())
}
