//! Request/reply server.

use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection};
use serde_yaml::Value;
use tracing::{debug, error, info, warn};

use crate::codec;
use crate::config::{Config, ConfigError};
use crate::dispatch::{Dispatcher, Handler};
use crate::result::{status, CallResult};

use super::consumer::quiet_close;
use super::{
    connect_backoff, shutdown_signal, Endpoint, TransportError, CLOSE_SENTINEL, CONNECT_ATTEMPTS,
    SHUTDOWN_REPLY,
};

/// The [`Consumer`](super::Consumer) with replies: every request, including
/// ones that fail to decode and the shutdown sentinel, gets exactly one
/// response on its `reply_to` queue, keyed by the request's correlation id
/// and published before the request is acknowledged.
pub struct RpcServer {
    endpoint: Endpoint,
    handler: Box<dyn Handler>,
    exit_requested: bool,
}

impl RpcServer {
    pub fn new(config: &Config, handler: Box<dyn Handler>) -> Result<Self, ConfigError> {
        Ok(Self {
            endpoint: Endpoint::from_config(config)?,
            handler,
            exit_requested: false,
        })
    }

    /// Runs the serve loop until shutdown is requested or the connect
    /// budget runs out.
    pub async fn run(&mut self) -> Result<(), TransportError> {
        if let Err(err) = self.handler.initialize().await {
            self.handler.finalize().await;
            return Err(TransportError::Handler(err));
        }
        info!(queue = self.endpoint.queue(), "starting rpc serve loop");

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
                    if let Err(err) = self.serve(&channel, deliveries).await {
                        error!("serve loop dropped, will reconnect: {}", err);
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
                "rpc-server",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok((connection, channel, deliveries))
    }

    async fn serve(
        &mut self,
        channel: &Channel,
        mut deliveries: lapin::Consumer,
    ) -> Result<(), TransportError> {
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
                    self.on_delivery(channel, delivery?).await;
                    if self.exit_requested {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn on_delivery(&mut self, channel: &Channel, delivery: Delivery) {
        debug!("consumed request");
        let result = match codec::decode(&delivery.data) {
            Err(err) => {
                error!("request did not decode: {}", err);
                error!("body: {}", String::from_utf8_lossy(&delivery.data));
                CallResult::new(status::MALFORMED_ENVELOPE, Value::Null)
            }
            Ok(message) => {
                if message.as_str() == Some(CLOSE_SENTINEL) {
                    self.exit_requested = true;
                    CallResult::ok(Value::String(SHUTDOWN_REPLY.to_owned()))
                } else {
                    Dispatcher::dispatch(self.handler.as_mut(), &message).await
                }
            }
        };

        // The reply goes out before the request is acknowledged, so a crash
        // between the two re-delivers the request rather than losing the
        // response.
        self.reply(channel, &delivery, &result).await;
        if let Err(err) = delivery.ack(BasicAckOptions::default()).await {
            error!("could not acknowledge request: {}", err);
        }
    }

    async fn reply(&self, channel: &Channel, delivery: &Delivery, result: &CallResult) {
        let Some(reply_to) = delivery.properties.reply_to() else {
            warn!("request carries no reply_to queue; response dropped");
            return;
        };
        let mut properties = BasicProperties::default();
        if let Some(correlation_id) = delivery.properties.correlation_id() {
            properties = properties.with_correlation_id(correlation_id.clone());
        } else {
            warn!("request carries no correlation id; the caller may not match this reply");
        }
        let body = match codec::encode(&result.to_wire()) {
            Ok(body) => body,
            Err(err) => {
                error!("could not serialize reply: {}", err);
                return;
            }
        };
        match channel
            .basic_publish(
                "",
                reply_to.as_str(),
                BasicPublishOptions::default(),
                body.as_bytes(),
                properties,
            )
            .await
        {
            Ok(_confirm) => debug!(reply_to = reply_to.as_str(), "reply published"),
            Err(err) => error!("could not publish reply: {}", err),
        }
    }
}
