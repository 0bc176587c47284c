//! Fire-and-forget publisher.

use lapin::options::{BasicPublishOptions, ConfirmSelectOptions};
use lapin::{BasicProperties, Channel, Connection};
use serde_yaml::Value;
use tracing::{debug, error, info, warn};

use crate::codec;
use crate::config::{Config, ConfigError};
use crate::result::{status, CallResult};

use super::{publish_backoff, warn_if_blocked, Endpoint, TransportError, PUBLISH_ATTEMPTS};

/// Persistent delivery, survives a broker restart.
const DELIVERY_MODE_PERSISTENT: u8 = 2;

struct Wire {
    connection: Connection,
    channel: Channel,
}

/// Publishes request envelopes to a durable queue and relies on publisher
/// confirms for durability. Does not wait for any application-level reply.
pub struct Producer {
    endpoint: Endpoint,
    wire: Option<Wire>,
}

impl Producer {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            endpoint: Endpoint::from_config(config)?,
            wire: None,
        })
    }

    /// Connects and enables publisher confirms on the channel.
    pub async fn connect(&mut self) -> Result<(), TransportError> {
        let connection = self.endpoint.connect().await?;
        let channel = connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        info!(
            host = self.endpoint.host(),
            port = self.endpoint.port(),
            queue = self.endpoint.queue(),
            "producer connected"
        );
        self.wire = Some(Wire { connection, channel });
        Ok(())
    }

    /// Closes the connection. Safe to call more than once.
    pub async fn close(&mut self) {
        if let Some(wire) = self.wire.take() {
            if let Err(err) = wire.connection.close(0, "").await {
                warn!("closing the producer connection failed: {}", err);
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.wire
            .as_ref()
            .is_some_and(|wire| wire.connection.status().connected())
    }

    /// Publishes one value to the configured queue.
    ///
    /// Serialization failure is reported as status 453 without touching the
    /// broker. Delivery is retried with a linear backoff and a reconnect
    /// when the connection dropped; exhausting the attempts yields 470.
    pub async fn send(&mut self, payload: &Value) -> CallResult {
        let message = match codec::encode(payload) {
            Ok(message) => message,
            Err(err) => {
                error!("refusing to publish: {}", err);
                return CallResult::error(
                    status::ENCODE_FAILED,
                    "could not serialize the message as YAML",
                );
            }
        };
        debug!(queue = self.endpoint.queue(), "publishing {}", message.trim_end());

        let mut attempt: u32 = 1;
        loop {
            match self.publish(&message).await {
                Ok(()) => {
                    debug!("delivery confirmed");
                    return CallResult::new(0, Value::Null);
                }
                Err(err) => {
                    if let Some(wire) = &self.wire {
                        warn_if_blocked(&wire.connection);
                    }
                    if attempt >= PUBLISH_ATTEMPTS {
                        error!(
                            queue = self.endpoint.queue(),
                            "message could not be delivered: {}", err
                        );
                        return CallResult::error(
                            status::DELIVERY_FAILED,
                            "message could not be delivered",
                        );
                    }
                    tokio::time::sleep(publish_backoff(attempt)).await;
                    if !self.is_connected() {
                        warn!(attempt, "connection closed, reconnecting");
                        if let Err(err) = self.connect().await {
                            warn!(attempt, "reconnect failed: {}", err);
                        }
                    }
                    attempt += 1;
                }
            }
        }
    }

    async fn publish(&self, message: &str) -> Result<(), TransportError> {
        let wire = self.wire.as_ref().ok_or(TransportError::NotConnected)?;
        let confirm = wire
            .channel
            .basic_publish(
                "",
                self.endpoint.queue(),
                BasicPublishOptions {
                    mandatory: true,
                    ..BasicPublishOptions::default()
                },
                message.as_bytes(),
                BasicProperties::default().with_delivery_mode(DELIVERY_MODE_PERSISTENT),
            )
            .await?;
        confirm.await?;
        Ok(())
    }
}
