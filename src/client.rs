// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Bus Client
//!
//! `BusClient` is the entry point of the crate. `init` validates the
//! configuration, spawns the connection manager and returns immediately;
//! the client becomes ready in the background once a connection, a
//! confirm-mode channel and the topology are in place.
//!
//! ```no_run
//! use amqp_bus::{client::BusClient, config::AmqpConfigs, message::Envelope};
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), amqp_bus::errors::AmqpError> {
//! let client = BusClient::init(AmqpConfigs::load(Some("amqp.toml"))?)?;
//! client.wait_ready(Duration::from_secs(10)).await?;
//!
//! let envelope = Envelope::task("email.send", vec![], Default::default())?;
//! client.push("tasks", "email.send", envelope).await?;
//!
//! client.close().await
//! # }
//! ```

use crate::{
    channel::LapinTransport,
    config::AmqpConfigs,
    connection::ConnectionManager,
    dispatcher::{AmqpDispatcher, Dispatcher},
    errors::AmqpError,
    handler::{HandlerFactory, HandlerRegistry},
    message::Envelope,
    publisher::{AmqpPublisher, Publisher},
    state::{ConnectionState, SessionState, Shutdown},
    transport::Transport,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use tokio::{sync::Notify, task::JoinHandle, time::timeout};
use tracing::{debug, error, info};

/// Reliable publish/consume client over one broker connection.
pub struct BusClient {
    namespace: String,
    session: Arc<SessionState>,
    shutdown: Shutdown,
    publisher: AmqpPublisher,
    dispatcher: Arc<AmqpDispatcher>,
    manager: Mutex<Option<JoinHandle<()>>>,
}

impl BusClient {
    /// Starts a client dialing the broker with `lapin`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn init(cfgs: AmqpConfigs) -> Result<BusClient, AmqpError> {
        let transport = Arc::new(LapinTransport::new(&cfgs));
        BusClient::with_transport(cfgs, transport)
    }

    /// Starts a client over the given transport.
    pub fn with_transport(
        cfgs: AmqpConfigs,
        transport: Arc<dyn Transport>,
    ) -> Result<BusClient, AmqpError> {
        cfgs.validate()?;

        let session = Arc::new(SessionState::new());
        let shutdown = Shutdown::new();
        let blocked = Arc::new(Notify::new());

        let publisher = AmqpPublisher::new(&cfgs, session.clone(), shutdown.clone(), blocked.clone());
        let dispatcher = Arc::new(AmqpDispatcher::new(
            &cfgs,
            session.clone(),
            shutdown.clone(),
            HandlerRegistry::new(),
        ));

        let manager = ConnectionManager {
            transport,
            topology: cfgs.topology(),
            session: session.clone(),
            shutdown: shutdown.clone(),
            blocked,
            dispatcher: dispatcher.clone(),
            reconnect_delay: cfgs.reconnect_delay(),
            reinit_delay: cfgs.reinit_delay(),
        };

        info!(namespace = cfgs.namespace.as_str(), "starting amqp bus client");
        let handle = tokio::spawn(manager.run());

        Ok(BusClient {
            namespace: cfgs.namespace,
            session,
            shutdown,
            publisher,
            dispatcher,
            manager: Mutex::new(Some(handle)),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// True while connection, channel and topology are all valid.
    pub fn is_ready(&self) -> bool {
        self.session.is_ready()
    }

    pub fn state(&self) -> ConnectionState {
        self.session.state()
    }

    /// Waits until the client is ready, at most `limit`.
    pub async fn wait_ready(&self, limit: Duration) -> Result<(), AmqpError> {
        let mut changes = self.session.subscribe_state();

        let wait = async {
            loop {
                if self.shutdown.is_triggered() {
                    return Err(AmqpError::ShuttingDown);
                }

                if self.is_ready() {
                    return Ok(());
                }

                if changes.changed().await.is_err() {
                    return Err(AmqpError::NotConnected);
                }
            }
        };

        timeout(limit, wait).await.map_err(|_| AmqpError::Timeout)?
    }

    /// Publishes `envelope` and waits for the broker confirm.
    pub async fn push(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: Envelope,
    ) -> Result<(), AmqpError> {
        self.publisher.push(exchange, routing_key, envelope).await
    }

    /// Registers the handler factory for `routing_key`.
    pub fn register<F>(&self, routing_key: &str, factory: F) -> Result<(), AmqpError>
    where
        F: HandlerFactory + 'static,
    {
        self.dispatcher.register(routing_key, Arc::new(factory))
    }

    /// Consumes every configured queue until the client is closed.
    pub async fn consume(&self) -> Result<(), AmqpError> {
        self.dispatcher.consume().await
    }

    /// Stops the background tasks and closes the channel and the
    /// connection. Only valid while the client is ready.
    pub async fn close(&self) -> Result<(), AmqpError> {
        if self.shutdown.is_triggered() {
            return Err(AmqpError::AlreadyClosed);
        }

        if !self.is_ready() {
            return Err(AmqpError::NotConnected);
        }

        if !self.shutdown.trigger() {
            return Err(AmqpError::AlreadyClosed);
        }

        info!(namespace = self.namespace.as_str(), "closing amqp bus client");

        let manager = self.manager.lock().take();
        if let Some(manager) = manager {
            if manager.await.is_err() {
                error!("tokio process error");
            }
        }

        let previous = self.session.clear();

        if let Some(channel) = &previous.channel {
            if let Err(err) = channel.close().await {
                debug!(error = err.to_string(), "failure to close the channel");
            }
        }

        let result = match &previous.connection {
            Some(connection) => connection.close().await,
            None => Ok(()),
        };

        self.session.set_state(ConnectionState::Closed);
        result
    }
}

#[async_trait]
impl Publisher for BusClient {
    async fn push(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: Envelope,
    ) -> Result<(), AmqpError> {
        self.publisher.push(exchange, routing_key, envelope).await
    }
}

#[async_trait]
impl Dispatcher for BusClient {
    fn register(
        &self,
        routing_key: &str,
        factory: Arc<dyn HandlerFactory>,
    ) -> Result<(), AmqpError> {
        self.dispatcher.register(routing_key, factory)
    }

    async fn consume(&self) -> Result<(), AmqpError> {
        self.dispatcher.consume().await
    }
}

impl Drop for BusClient {
    fn drop(&mut self) {
        if self.shutdown.trigger() {
            debug!("amqp bus client dropped without close");
        }
    }
}
