// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Dispatcher
//!
//! Consumes every configured queue concurrently, one worker task per queue,
//! and routes each delivery to the handler registered for its routing key.
//!
//! Workers are bound to the channel they were started on. When the
//! connection manager installs a new channel it restarts the workers on it;
//! the old workers end with their delivery stream.

use crate::{
    config::AmqpConfigs,
    consumer::consume,
    errors::AmqpError,
    handler::{HandlerFactory, HandlerRegistry},
    state::{SessionState, Shutdown},
    transport::{BrokerChannel, DeliveryStream},
};
use async_trait::async_trait;
use futures_util::{future::join_all, StreamExt};
use opentelemetry::global;
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Registers handlers and consumes the configured queues.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Registers the handler factory for a routing key. Each routing key can
    /// be registered once.
    fn register(
        &self,
        routing_key: &str,
        factory: Arc<dyn HandlerFactory>,
    ) -> Result<(), AmqpError>;

    /// Starts consuming and blocks until shutdown, then joins every worker.
    async fn consume(&self) -> Result<(), AmqpError>;
}

pub struct AmqpDispatcher {
    session: Arc<SessionState>,
    shutdown: Shutdown,
    handlers: HandlerRegistry,
    queues: Vec<String>,
    consumer_tag: String,
    prefetch_count: u16,
    consuming: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl AmqpDispatcher {
    pub(crate) fn new(
        cfgs: &AmqpConfigs,
        session: Arc<SessionState>,
        shutdown: Shutdown,
        handlers: HandlerRegistry,
    ) -> AmqpDispatcher {
        AmqpDispatcher {
            session,
            shutdown,
            handlers,
            queues: cfgs.queues.clone(),
            consumer_tag: cfgs.consumer_tag(),
            prefetch_count: cfgs.prefetch_count,
            consuming: AtomicBool::new(false),
            workers: Mutex::new(vec![]),
        }
    }

    pub(crate) fn is_consuming(&self) -> bool {
        self.consuming.load(Ordering::SeqCst)
    }

    /// Sets QoS on `channel` and spawns one worker per configured queue.
    pub(crate) async fn start(&self, channel: Arc<dyn BrokerChannel>) -> Result<(), AmqpError> {
        channel.qos(self.prefetch_count).await?;

        let mut streams = Vec::with_capacity(self.queues.len());
        for queue in &self.queues {
            // consumer tags must be unique per channel
            let tag = format!("{}-{}", self.consumer_tag, queue);
            match channel.consume(queue, &tag).await {
                Ok(stream) => streams.push((queue.clone(), tag, stream)),
                Err(err) => {
                    cancel_all(channel.as_ref(), &mut streams).await;
                    return Err(err);
                }
            }
        }

        let mut workers = self.workers.lock();
        workers.retain(|worker| !worker.is_finished());

        for (queue, _, stream) in streams {
            debug!(queue = %queue, "starting consumer");
            workers.push(tokio::spawn(worker(
                queue,
                stream,
                channel.clone(),
                self.handlers.clone(),
                self.shutdown.clone(),
            )));
        }

        Ok(())
    }
}

/// Cancels the consumers opened by a start that did not complete.
async fn cancel_all(
    channel: &dyn BrokerChannel,
    started: &mut [(String, String, DeliveryStream)],
) {
    for (queue, tag, _) in started {
        if let Err(err) = channel.cancel(tag).await {
            debug!(queue = %queue, error = err.to_string(), "failure to cancel consumer");
        }
    }
}

#[async_trait]
impl Dispatcher for AmqpDispatcher {
    fn register(
        &self,
        routing_key: &str,
        factory: Arc<dyn HandlerFactory>,
    ) -> Result<(), AmqpError> {
        if self.shutdown.is_triggered() {
            return Err(AmqpError::AlreadyClosed);
        }

        self.handlers.register(routing_key, factory)
    }

    async fn consume(&self) -> Result<(), AmqpError> {
        if self.shutdown.is_triggered() {
            return Err(AmqpError::ShuttingDown);
        }

        if self.queues.is_empty() {
            return Err(AmqpError::NoQueuesConfigured);
        }

        let session = self.session.current();
        if !session.ready {
            return Err(AmqpError::NotReady);
        }

        let Some(channel) = session.channel.clone() else {
            return Err(AmqpError::NotConnected);
        };

        if self.consuming.swap(true, Ordering::SeqCst) {
            return Err(AmqpError::AlreadyConsuming);
        }

        if let Err(err) = self.start(channel).await {
            error!(error = err.to_string(), "failure to start consumers");
            self.consuming.store(false, Ordering::SeqCst);
            return Err(err);
        }

        self.shutdown.wait().await;

        let workers = std::mem::take(&mut *self.workers.lock());
        for res in join_all(workers).await {
            if res.is_err() {
                error!("tokio process error");
            }
        }

        debug!("all consumers stopped");
        Ok(())
    }
}

async fn worker(
    queue: String,
    mut stream: DeliveryStream,
    channel: Arc<dyn BrokerChannel>,
    handlers: HandlerRegistry,
    shutdown: Shutdown,
) {
    let tracer = global::tracer("amqp consumer");

    loop {
        let next = tokio::select! {
            _ = shutdown.wait() => {
                debug!(queue = %queue, "consumer stopped by shutdown");
                return;
            }
            next = stream.next() => next,
        };

        match next {
            Some(Ok(delivery)) => {
                if let Err(err) = consume(&tracer, &delivery, &handlers, channel.as_ref()).await {
                    error!(
                        error = err.to_string(),
                        queue = %queue,
                        routing_key = delivery.routing_key.as_str(),
                        "error consume msg"
                    );
                }
            }
            Some(Err(err)) => error!(error = err.to_string(), queue = %queue, "errors consume msg"),
            None => {
                debug!(queue = %queue, "delivery stream ended");
                return;
            }
        }
    }
}
