// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Manager
//!
//! A single background task owns the broker connection and its channel. It
//! dials until a connection is up, then opens a channel, enables publisher
//! confirms, installs the topology and restarts the consumers if consuming
//! was started. Once all of that succeeded it swaps in a ready session and
//! waits for one of:
//!
//! - the shutdown signal, which ends the task;
//! - the connection closing, which goes back to dialing;
//! - the channel closing, which reinitializes a channel on the same
//!   connection;
//! - a blocked publish reported by the publisher, which drops the stale
//!   channel and reinitializes.
//!
//! Every wait in here also observes the shutdown signal.

use crate::{
    dispatcher::AmqpDispatcher,
    errors::AmqpError,
    state::{ConnectionState, SessionState, Shutdown},
    topology::AmqpTopology,
    transport::{BrokerChannel, BrokerConnection, CloseNotifier, Transport},
};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::Notify,
    time::{sleep, timeout},
};
use tracing::{debug, error, info, warn};

/// How a channel generation ended.
#[derive(Debug, PartialEq, Eq)]
enum ChannelOutcome {
    Shutdown,
    ConnectionClosed,
    Reinit,
}

pub(crate) struct ConnectionManager {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) topology: AmqpTopology,
    pub(crate) session: Arc<SessionState>,
    pub(crate) shutdown: Shutdown,
    pub(crate) blocked: Arc<Notify>,
    pub(crate) dispatcher: Arc<AmqpDispatcher>,
    pub(crate) reconnect_delay: Duration,
    pub(crate) reinit_delay: Duration,
}

impl ConnectionManager {
    /// Runs until the shutdown signal fires.
    pub(crate) async fn run(self) {
        loop {
            self.session.set_state(ConnectionState::Connecting);
            info!("connecting to the broker");

            let dialed = tokio::select! {
                _ = self.shutdown.wait() => break,
                dialed = self.transport.dial() => dialed,
            };

            let conn = match dialed {
                Ok(conn) => conn,
                Err(err) => {
                    error!(error = err.to_string(), "failure to connect, retrying");
                    self.session.set_state(ConnectionState::Disconnected);

                    if !self.pause(self.reconnect_delay).await {
                        break;
                    }
                    continue;
                }
            };

            self.session.set_state(ConnectionState::Connected);
            info!("connected to the broker");

            let mut conn_closed = conn.notify_close();

            let outcome = loop {
                match self.serve_channel(&conn, &mut conn_closed).await {
                    ChannelOutcome::Reinit => continue,
                    outcome => break outcome,
                }
            };

            if outcome == ChannelOutcome::Shutdown {
                break;
            }

            self.session.mark_not_ready();
            self.session.set_state(ConnectionState::Disconnected);
        }

        debug!("connection manager stopped");
    }

    /// Sleeps for `delay`. Returns false if shutdown fired first.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.wait() => false,
            _ = sleep(delay) => true,
        }
    }

    async fn serve_channel(
        &self,
        conn: &Arc<dyn BrokerConnection>,
        conn_closed: &mut CloseNotifier,
    ) -> ChannelOutcome {
        self.session.set_state(ConnectionState::Initializing);

        let channel = loop {
            let attempt = tokio::select! {
                _ = self.shutdown.wait() => return ChannelOutcome::Shutdown,
                reason = conn_closed.closed() => {
                    warn!(reason = %reason, "connection closed while initializing");
                    return ChannelOutcome::ConnectionClosed;
                }
                attempt = self.init_channel(conn.as_ref()) => attempt,
            };

            match attempt {
                Ok(channel) => break channel,
                Err(err) => {
                    error!(error = err.to_string(), "failure to initialize channel, retrying");

                    tokio::select! {
                        _ = self.shutdown.wait() => return ChannelOutcome::Shutdown,
                        reason = conn_closed.closed() => {
                            warn!(reason = %reason, "connection closed while initializing");
                            return ChannelOutcome::ConnectionClosed;
                        }
                        _ = sleep(self.reinit_delay) => {}
                    }
                }
            }
        };

        let mut channel_closed = channel.notify_close();
        let confirms = channel.notify_publish();
        let generation = self
            .session
            .publish_ready(conn.clone(), channel.clone(), confirms);

        self.session.set_state(ConnectionState::Ready);
        info!(generation, "amqp session ready");

        let outcome = loop {
            tokio::select! {
                _ = self.shutdown.wait() => return ChannelOutcome::Shutdown,
                reason = conn_closed.closed() => {
                    warn!(reason = %reason, "connection closed");
                    break ChannelOutcome::ConnectionClosed;
                }
                reason = channel_closed.closed() => {
                    warn!(reason = %reason, "channel closed, reinitializing");
                    break ChannelOutcome::Reinit;
                }
                _ = self.blocked.notified() => {
                    // a permit left by a push against an earlier generation
                    if self.session.is_ready() {
                        debug!(generation, "ignored blocked signal of a previous channel");
                        continue;
                    }

                    warn!(generation, "publish blocked, reinitializing channel");
                    self.discard(channel);
                    break ChannelOutcome::Reinit;
                }
            }
        };

        self.session.mark_not_ready();
        outcome
    }

    async fn init_channel(
        &self,
        conn: &dyn BrokerConnection,
    ) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let channel = conn.open_channel().await?;

        let installed = match channel.confirm_select().await {
            Ok(_) => self.topology.install(channel.as_ref()).await,
            Err(err) => Err(err),
        };

        // consumers come back before the session is ready again
        let installed = match installed {
            Ok(_) if self.dispatcher.is_consuming() => {
                self.dispatcher.start(channel.clone()).await
            }
            installed => installed,
        };

        if let Err(err) = installed {
            self.discard(channel);
            return Err(err);
        }

        Ok(channel)
    }

    /// Closes a channel we no longer use without waiting on it.
    fn discard(&self, channel: Arc<dyn BrokerChannel>) {
        let limit = self.reinit_delay;
        tokio::spawn(async move {
            match timeout(limit, channel.close()).await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => debug!(error = err.to_string(), "failure to close stale channel"),
                Err(_) => debug!("stale channel close timed out"),
            }
        });
    }
}
