//! Correlated request/reply client.

use futures::StreamExt;
use lapin::options::{BasicConsumeOptions, BasicPublishOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection};
use serde_yaml::Value;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::codec;
use crate::config::{Config, ConfigError};
use crate::result::{status, CallResult};

use super::{
    publish_backoff, Endpoint, TransportError, PUBLISH_ATTEMPTS, REPLY_POLL, REPLY_POLL_BUDGET,
};

struct Wire {
    connection: Connection,
    channel: Channel,
    reply_queue: String,
    replies: lapin::Consumer,
}

/// Sends request envelopes and blocks for the matching reply.
///
/// Each client owns one private reply queue, exclusive and deleted with the
/// connection. Requests carry a fresh UUID correlation id; replies with any
/// other id are stale leftovers of timed-out calls and are skipped.
pub struct RpcClient {
    endpoint: Endpoint,
    wire: Option<Wire>,
}

impl RpcClient {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            endpoint: Endpoint::from_config(config)?,
            wire: None,
        })
    }

    /// Connects and sets up the private reply queue.
    pub async fn connect(&mut self) -> Result<(), TransportError> {
        let connection = self.endpoint.connect().await?;
        let channel = connection.create_channel().await?;
        // Broker-named, exclusive to this connection, removed with it.
        let queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        let reply_queue = queue.name().as_str().to_owned();
        // Replies need no acknowledgement; a lost reply is a timeout.
        let replies = channel
            .basic_consume(
                &reply_queue,
                "rpc-client",
                BasicConsumeOptions {
                    no_ack: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        info!(
            host = self.endpoint.host(),
            port = self.endpoint.port(),
            reply_queue = reply_queue.as_str(),
            "rpc client connected"
        );
        self.wire = Some(Wire {
            connection,
            channel,
            reply_queue,
            replies,
        });
        Ok(())
    }

    /// Closes the connection; the reply queue goes with it.
    pub async fn close(&mut self) {
        if let Some(wire) = self.wire.take() {
            if let Err(err) = wire.connection.close(0, "").await {
                warn!("closing the rpc client connection failed: {}", err);
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.wire
            .as_ref()
            .is_some_and(|wire| wire.connection.status().connected())
    }

    /// Sends one request and waits for its reply.
    ///
    /// Returns 453 when the request cannot be serialized, 470 when it cannot
    /// be delivered, 471 when no reply arrives inside the deadline, and 454
    /// when the reply does not decode. A reply arriving after the deadline
    /// is ignored by the next call's correlation check.
    pub async fn send(&mut self, payload: &Value) -> CallResult {
        let message = match codec::encode(payload) {
            Ok(message) => message,
            Err(err) => {
                error!("refusing to publish: {}", err);
                return CallResult::new(status::ENCODE_FAILED, Value::Null);
            }
        };
        let correlation_id = Uuid::new_v4().to_string();
        debug!(
            queue = self.endpoint.queue(),
            correlation_id = correlation_id.as_str(),
            "sending {}",
            message.trim_end()
        );

        if let Err(result) = self.deliver(&message, &correlation_id).await {
            return result;
        }

        let deadline = REPLY_POLL * REPLY_POLL_BUDGET;
        match tokio::time::timeout(deadline, self.await_reply(&correlation_id)).await {
            Ok(Ok(body)) => match codec::decode(&body).map_err(anyhow::Error::from).and_then(
                |value| CallResult::from_wire(&value).map_err(anyhow::Error::from),
            ) {
                Ok(result) => result,
                Err(err) => {
                    error!("reply did not decode: {:#}", err);
                    CallResult::new(status::DECODE_FAILED, Value::Null)
                }
            },
            Ok(Err(err)) => {
                error!("reply queue failed while waiting: {}", err);
                CallResult::error(status::DELIVERY_FAILED, "reply queue failed")
            }
            Err(_) => {
                error!(
                    correlation_id = correlation_id.as_str(),
                    "no reply within {} seconds",
                    deadline.as_secs()
                );
                CallResult::error(status::RPC_TIMEOUT, "timed out waiting for a reply")
            }
        }
    }

    /// Publishes with the producer's retry policy, but without publisher
    /// confirms: the reply is the confirmation.
    async fn deliver(&mut self, message: &str, correlation_id: &str) -> Result<(), CallResult> {
        let mut attempt: u32 = 1;
        loop {
            match self.publish(message, correlation_id).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    if attempt >= PUBLISH_ATTEMPTS {
                        error!(queue = self.endpoint.queue(), "request could not be delivered: {}", err);
                        return Err(CallResult::error(
                            status::DELIVERY_FAILED,
                            "message could not be delivered",
                        ));
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

    async fn publish(&self, message: &str, correlation_id: &str) -> Result<(), TransportError> {
        let wire = self.wire.as_ref().ok_or(TransportError::NotConnected)?;
        let _confirm = wire
            .channel
            .basic_publish(
                "",
                self.endpoint.queue(),
                BasicPublishOptions::default(),
                message.as_bytes(),
                BasicProperties::default()
                    .with_reply_to(wire.reply_queue.clone().into())
                    .with_correlation_id(correlation_id.to_owned().into()),
            )
            .await?;
        Ok(())
    }

    /// Reads replies until one matches `correlation_id`.
    async fn await_reply(&mut self, correlation_id: &str) -> Result<Vec<u8>, TransportError> {
        let wire = self.wire.as_mut().ok_or(TransportError::NotConnected)?;
        while let Some(delivery) = wire.replies.next().await {
            let delivery = delivery?;
            let matches = delivery
                .properties
                .correlation_id()
                .as_ref()
                .is_some_and(|id| id.as_str() == correlation_id);
            if matches {
                return Ok(delivery.data);
            }
            debug!("skipping stale reply");
        }
        Err(TransportError::ReplyChannelClosed)
    }
}
