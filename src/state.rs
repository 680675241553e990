// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Shared Client State
//!
//! The connection manager is the only writer of the session: every (re)init
//! builds a new immutable `Session` and swaps it in whole, so the publisher
//! and the dispatcher never observe a channel from one generation paired
//! with the readiness of another.

use crate::transport::{BrokerChannel, BrokerConnection, Confirm};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::debug;

/// Lifecycle of the broker connection as driven by the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Initializing,
    Ready,
    Closed,
}

pub(crate) type ConfirmStream = Arc<Mutex<mpsc::UnboundedReceiver<Confirm>>>;

/// One generation of connection, channel and readiness.
#[derive(Clone, Default)]
pub(crate) struct Session {
    pub(crate) connection: Option<Arc<dyn BrokerConnection>>,
    pub(crate) channel: Option<Arc<dyn BrokerChannel>>,
    pub(crate) confirms: Option<ConfirmStream>,
    pub(crate) ready: bool,
    pub(crate) generation: u64,
}

/// Holder of the current session and connection state.
pub(crate) struct SessionState {
    current: RwLock<Arc<Session>>,
    state: watch::Sender<ConnectionState>,
}

impl SessionState {
    pub(crate) fn new() -> SessionState {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        SessionState {
            current: RwLock::new(Arc::new(Session::default())),
            state,
        }
    }

    pub(crate) fn current(&self) -> Arc<Session> {
        self.current.read().clone()
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.current.read().ready
    }

    /// Installs a ready session on `channel` and returns its generation.
    pub(crate) fn publish_ready(
        &self,
        connection: Arc<dyn BrokerConnection>,
        channel: Arc<dyn BrokerChannel>,
        confirms: mpsc::UnboundedReceiver<Confirm>,
    ) -> u64 {
        let mut current = self.current.write();
        let generation = current.generation + 1;

        *current = Arc::new(Session {
            connection: Some(connection),
            channel: Some(channel),
            confirms: Some(Arc::new(Mutex::new(confirms))),
            ready: true,
            generation,
        });

        generation
    }

    /// Keeps the handles but clears readiness.
    pub(crate) fn mark_not_ready(&self) {
        let mut current = self.current.write();
        if current.ready {
            let mut next = Session::clone(&current);
            next.ready = false;
            *current = Arc::new(next);
        }
    }

    /// Clears readiness only if `generation` is still the current session.
    pub(crate) fn mark_not_ready_if(&self, generation: u64) -> bool {
        let mut current = self.current.write();
        if current.generation != generation || !current.ready {
            return false;
        }

        let mut next = Session::clone(&current);
        next.ready = false;
        *current = Arc::new(next);
        true
    }

    /// Replaces the session with an empty, not-ready one.
    pub(crate) fn clear(&self) -> Arc<Session> {
        let mut current = self.current.write();
        let previous = current.clone();

        *current = Arc::new(Session {
            generation: previous.generation,
            ..Session::default()
        });

        previous
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub(crate) fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            debug!("connection state: {:?} -> {:?}", *state, next);
            *state = next;
            true
        });
    }
}

/// Process-wide shutdown signal, set once and observed by every wait.
#[derive(Clone)]
pub(crate) struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub(crate) fn new() -> Shutdown {
        let (tx, _) = watch::channel(false);
        Shutdown { tx: Arc::new(tx) }
    }

    /// Sets the signal. Returns false if it was already set.
    pub(crate) fn trigger(&self) -> bool {
        self.tx.send_if_modified(|fired| {
            if *fired {
                return false;
            }
            *fired = true;
            true
        })
    }

    pub(crate) fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub(crate) async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // the sender lives as long as `self`, so this only returns once fired
        let _ = rx.wait_for(|fired| *fired).await;
    }
}
