//! Durable queue consumer feeding a handler.

use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicQosOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection};
use tracing::{debug, error, info, warn};

use crate::codec;
use crate::config::{Config, ConfigError};
use crate::dispatch::{Dispatcher, Handler};

use super::{
    connect_backoff, shutdown_signal, Endpoint, TransportError, CLOSE_SENTINEL, CONNECT_ATTEMPTS,
};

/// Consumes one message at a time from the role's durable queue and
/// dispatches each onto the configured handler. Event-style: no replies.
///
/// The consumer owns its handler for the life of the loop and finalizes it
/// on the way out, whatever ended the loop.
pub struct Consumer {
    endpoint: Endpoint,
    handler: Box<dyn Handler>,
    exit_requested: bool,
}

impl Consumer {
    pub fn new(config: &Config, handler: Box<dyn Handler>) -> Result<Self, ConfigError> {
        Ok(Self {
            endpoint: Endpoint::from_config(config)?,
            handler,
            exit_requested: false,
        })
    }

    /// Runs the consume loop until shutdown is requested or the connect
    /// budget runs out.
    pub async fn run(&mut self) -> Result<(), TransportError> {
        if let Err(err) = self.handler.initialize().await {
            self.handler.finalize().await;
            return Err(TransportError::Handler(err));
        }
        info!(queue = self.endpoint.queue(), "starting consume loop");

        let mut attempt: u32 = 1;
        let mut exhausted = false;
        while !self.exit_requested {
            if attempt >= CONNECT_ATTEMPTS {
                exhausted = true;
                break;
            }
            match self.bind().await {
                Err(err) => {
                    info!(
                        attempt,
                        backoff = connect_backoff(attempt).as_secs(),
                        "connect failed, will retry: {}",
                        err
                    );
                    tokio::time::sleep(connect_backoff(attempt)).await;
                    attempt += 1;
                }
                Ok((connection, channel, deliveries)) => {
                    info!(
                        host = self.endpoint.host(),
                        port = self.endpoint.port(),
                        attempt,
                        "connected to the broker"
                    );
                    attempt = 1;
                    if let Err(err) = self.consume(deliveries).await {
                        error!("consume loop dropped, will reconnect: {}", err);
                    }
                    quiet_close(channel, connection).await;
                }
            }
        }

        self.handler.finalize().await;
        if exhausted && !self.exit_requested {
            return Err(TransportError::ConnectRetriesExhausted {
                attempts: CONNECT_ATTEMPTS,
            });
        }
        Ok(())
    }

    /// Declares the durable queue and opens a prefetch-1 consumer on it.
    /// Server roles, not clients, declare the queue.
    async fn bind(&self) -> Result<(Connection, Channel, lapin::Consumer), TransportError> {
        let connection = self.endpoint.connect().await?;
        let channel = connection.create_channel().await?;
        channel
            .queue_declare(
                self.endpoint.queue(),
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        channel.basic_qos(1, BasicQosOptions::default()).await?;
        let deliveries = channel
            .basic_consume(
                self.endpoint.queue(),
                "consumer",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok((connection, channel, deliveries))
    }

    async fn consume(&mut self, mut deliveries: lapin::Consumer) -> Result<(), TransportError> {
        loop {
            tokio::select! {
                biased;

                () = shutdown_signal() => {
                    warn!("shutdown signal received");
                    self.exit_requested = true;
                    return Ok(());
                }

                delivery = deliveries.next() => {
                    let Some(delivery) = delivery else {
                        warn!("consumer cancelled by the broker");
                        return Ok(());
                    };
                    self.on_delivery(delivery?).await;
                    if self.exit_requested {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Handles one delivery. The message is acknowledged in every branch:
    /// failures are reported inside result envelopes, never back to the
    /// broker.
    async fn on_delivery(&mut self, delivery: Delivery) {
        debug!("consumed message");
        match codec::decode(&delivery.data) {
            Err(err) => {
                error!("discarding undecodable message: {}", err);
                error!("body: {}", String::from_utf8_lossy(&delivery.data));
            }
            Ok(message) => {
                if message.as_str() == Some(CLOSE_SENTINEL) {
                    self.exit_requested = true;
                } else {
                    let result = Dispatcher::dispatch(self.handler.as_mut(), &message).await;
                    if result.is_error() {
                        debug!(result.status, "request failed");
                    }
                }
            }
        }
        if let Err(err) = delivery.ack(BasicAckOptions::default()).await {
            error!("could not acknowledge message: {}", err);
        }
    }
}

/// Closes channel then connection, logging rather than propagating; close
/// must be idempotent and quiet during reconnect cycles.
pub(crate) async fn quiet_close(channel: Channel, connection: Connection) {
    if let Err(err) = channel.close(0, "").await {
        debug!("channel close failed: {}", err);
    }
    if let Err(err) = connection.close(0, "").await {
        debug!("connection close failed: {}", err);
    }
}
