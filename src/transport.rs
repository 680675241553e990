// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport Seam
//!
//! The connection manager, publisher and dispatcher never talk to `lapin`
//! directly. They drive the broker through the `Transport`,
//! `BrokerConnection` and `BrokerChannel` traits, which mirror the handful of
//! AMQP primitives the bus needs plus the three broker-originated
//! notifications it reacts to: connection closed, channel closed and publish
//! confirms.
//!
//! `crate::channel` provides the `lapin` implementation.

use crate::{
    errors::AmqpError, exchange::ExchangeDefinition, message::Envelope, queue::QueueBinding,
    queue::QueueDefinition,
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::BasicProperties;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Broker acknowledgment of one published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirm {
    pub delivery_tag: u64,
    pub ack: bool,
}

/// A message delivered to one of our consumers.
#[derive(Debug, Clone, Default)]
pub struct InboundMessage {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
}

pub type DeliveryStream = BoxStream<'static, Result<InboundMessage, AmqpError>>;

/// Opens connections to the broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn dial(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}

/// One live broker connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    /// Resolves once the connection is lost, with the reason.
    fn notify_close(&self) -> CloseNotifier;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// One broker channel multiplexed over a connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Puts the channel in publisher confirm mode.
    async fn confirm_select(&self) -> Result<(), AmqpError>;

    /// Resolves once the channel is closed by the broker or the connection.
    fn notify_close(&self) -> CloseNotifier;

    /// Subscribes to publish confirms. A new subscription replaces the
    /// previous one.
    fn notify_publish(&self) -> mpsc::UnboundedReceiver<Confirm>;

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Publishes without `mandatory` nor `immediate` and returns the delivery
    /// tag assigned to the message. Its confirm arrives on the
    /// `notify_publish` stream carrying the same tag.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<u64, AmqpError>;

    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    /// Starts an explicit-ack, non-exclusive consumer on the queue.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError>;

    /// Stops the consumer registered under `consumer_tag`.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// Creates a close signal pair: the transport keeps the handle, subscribers
/// get notifiers.
pub fn close_signal() -> (CloseHandle, CloseNotifier) {
    let (tx, rx) = watch::channel(None);
    (CloseHandle(Arc::new(tx)), CloseNotifier(rx))
}

/// Fires the close notification of a connection or channel.
#[derive(Debug, Clone)]
pub struct CloseHandle(Arc<watch::Sender<Option<String>>>);

impl CloseHandle {
    /// Marks the resource closed. Only the first reason is kept.
    pub fn close(&self, reason: &str) {
        self.0.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason.to_owned());
            true
        });
    }

    pub fn is_closed(&self) -> bool {
        self.0.borrow().is_some()
    }

    pub fn subscribe(&self) -> CloseNotifier {
        CloseNotifier(self.0.subscribe())
    }
}

/// Waits for a close notification.
#[derive(Debug, Clone)]
pub struct CloseNotifier(watch::Receiver<Option<String>>);

impl CloseNotifier {
    /// Resolves with the close reason. A dropped handle counts as closed.
    pub async fn closed(&mut self) -> String {
        match self.0.wait_for(|reason| reason.is_some()).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            Err(_) => "close signal dropped".to_owned(),
        }
    }
}
