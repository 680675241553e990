// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel over lapin
//!
//! `LapinTransport` dials the broker (optionally over TLS) and wraps the
//! resulting `lapin` connection and channels behind the transport traits.
//! Connection and channel error callbacks become close notifications, and
//! every `PublisherConfirm` future is awaited in the background and turned
//! into a `Confirm` on the channel's confirm stream.

use crate::{
    config::AmqpConfigs,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::Envelope,
    queue::{QueueBinding, QueueDefinition},
    transport::{
        close_signal, BrokerChannel, BrokerConnection, CloseHandle, CloseNotifier, Confirm,
        DeliveryStream, InboundMessage, Transport,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    tcp::OwnedTLSConfig,
    types::{FieldTable, LongString},
    Channel, Connection, ConnectionProperties,
};
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

const REPLY_SUCCESS: u16 = 200;

/// Dials the broker described by the configuration.
pub struct LapinTransport {
    url: String,
    connection_name: String,
    tls_enabled: bool,
    ca_cert: Option<std::path::PathBuf>,
}

impl LapinTransport {
    pub fn new(cfgs: &AmqpConfigs) -> LapinTransport {
        LapinTransport {
            url: cfgs.url.clone(),
            connection_name: cfgs.connection_name(),
            tls_enabled: cfgs.tls.enabled,
            ca_cert: cfgs.tls.ca_cert.clone(),
        }
    }

    fn tls_config(&self) -> Result<OwnedTLSConfig, AmqpError> {
        let cert_chain = match &self.ca_cert {
            Some(path) => Some(std::fs::read_to_string(path).map_err(|err| {
                error!(error = err.to_string(), "failure to read the ca bundle");
                AmqpError::ConnectionError(err.to_string())
            })?),
            None => None,
        };

        Ok(OwnedTLSConfig {
            cert_chain,
            ..Default::default()
        })
    }
}

#[async_trait]
impl Transport for LapinTransport {
    async fn dial(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        let result = if self.tls_enabled {
            Connection::connect_with_config(&self.url, options, self.tls_config()?).await
        } else {
            Connection::connect(&self.url, options).await
        };

        let conn = match result {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;
        debug!("amqp connected");

        let (closed, _) = close_signal();
        let on_error = closed.clone();
        conn.on_error(move |err| {
            warn!(error = err.to_string(), "amqp connection error");
            on_error.close(&err.to_string());
        });

        Ok(Arc::new(LapinConnection { conn, closed }))
    }
}

pub struct LapinConnection {
    conn: Connection,
    closed: CloseHandle,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        debug!("creating amqp channel...");
        let channel = match self.conn.create_channel().await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }?;
        debug!("channel created");

        let (closed, _) = close_signal();
        let on_error = closed.clone();
        channel.on_error(move |err| {
            warn!(error = err.to_string(), "amqp channel error");
            on_error.close(&err.to_string());
        });

        Ok(Arc::new(LapinChannel {
            channel,
            closed,
            confirms: Mutex::new(None),
            published: AtomicU64::new(0),
        }))
    }

    fn notify_close(&self) -> CloseNotifier {
        self.closed.subscribe()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let result = self.conn.close(REPLY_SUCCESS, "closing").await;
        self.closed.close("closed by client");

        result.map_err(|err| {
            error!(error = err.to_string(), "failure to close the connection");
            AmqpError::ConnectionError(err.to_string())
        })
    }
}

pub struct LapinChannel {
    channel: Channel,
    closed: CloseHandle,
    confirms: Mutex<Option<mpsc::UnboundedSender<Confirm>>>,
    published: AtomicU64,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn confirm_select(&self) -> Result<(), AmqpError> {
        self.channel
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to enable publisher confirms");
                AmqpError::ConfirmSelectError(err.to_string())
            })
    }

    fn notify_close(&self) -> CloseNotifier {
        self.closed.subscribe()
    }

    fn notify_publish(&self) -> mpsc::UnboundedReceiver<Confirm> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.confirms.lock() = Some(tx);
        rx
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(
                &def.name,
                (&def.kind).into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|_| AmqpError::DeclareExchangeError(def.name.clone()))
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(|_| AmqpError::DeclareQueueError(def.name.clone()))
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|_| {
                AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                )
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<u64, AmqpError> {
        let confirm = match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &envelope.body,
                envelope.properties.clone(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError(err.to_string()))
            }
            Ok(confirm) => Ok(confirm),
        }?;

        // every PublisherConfirm resolves for its own publish, so a local
        // sequence is enough to correlate confirms on this channel
        let delivery_tag = self.published.fetch_add(1, Ordering::SeqCst) + 1;
        let sender = self.confirms.lock().clone();

        tokio::spawn(async move {
            let ack = matches!(confirm.await, Ok(confirmation) if confirmation.is_ack());

            if let Some(sender) = sender {
                // the publisher may have moved on to a newer channel
                let _ = sender.send(Confirm { delivery_tag, ack });
            }
        });

        Ok(delivery_tag)
    }

    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "failure to create the consumer");
                Err(AmqpError::ConsumerDeclarationError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|result| match result {
                Ok(delivery) => Ok(InboundMessage {
                    delivery_tag: delivery.delivery_tag,
                    exchange: delivery.exchange.as_str().to_owned(),
                    routing_key: delivery.routing_key.as_str().to_owned(),
                    redelivered: delivery.redelivered,
                    properties: delivery.properties,
                    data: delivery.data,
                }),
                Err(err) => Err(AmqpError::ConsumerError(err.to_string())),
            })
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| AmqpError::ChannelError(err.to_string()))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let result = self.channel.close(REPLY_SUCCESS, "closing").await;
        self.closed.close("closed by client");

        result.map_err(|err| AmqpError::ChannelError(err.to_string()))
    }
}
