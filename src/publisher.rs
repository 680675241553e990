// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Confirmed Message Publisher
//!
//! `push` publishes one envelope and only reports success once the broker
//! acknowledged it. Pushes are serialized so a confirm can never be consumed
//! by a concurrent call, every attempt first discards confirms left behind by
//! earlier attempts, and each call runs under a hard deadline. A push that
//! misses its deadline means the broker stopped answering on a connection
//! that still looks alive, so it clears readiness and asks the connection
//! manager to rebuild the channel.

use crate::{
    config::AmqpConfigs,
    errors::AmqpError,
    message::Envelope,
    otel,
    state::{ConfirmStream, SessionState, Shutdown},
    transport::{BrokerChannel, Confirm},
};
use async_trait::async_trait;
use opentelemetry::Context;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc::UnboundedReceiver, Mutex, Notify},
    time::{sleep, timeout},
};
use tracing::{debug, error, warn};

/// Publishes envelopes to the broker.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes `envelope` to `exchange` with `routing_key` and waits for the
    /// broker confirm. Never retries across reconnects.
    async fn push(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: Envelope,
    ) -> Result<(), AmqpError>;
}

enum ConfirmOutcome {
    Ack,
    Nack,
    Closed,
    TimedOut,
}

/// Publisher bound to the sessions installed by the connection manager.
pub struct AmqpPublisher {
    session: Arc<SessionState>,
    shutdown: Shutdown,
    blocked: Arc<Notify>,
    in_flight: Mutex<()>,
    publish_retry: u32,
    resend_delay: Duration,
    push_timeout: Duration,
}

impl AmqpPublisher {
    pub(crate) fn new(
        cfgs: &AmqpConfigs,
        session: Arc<SessionState>,
        shutdown: Shutdown,
        blocked: Arc<Notify>,
    ) -> AmqpPublisher {
        AmqpPublisher {
            session,
            shutdown,
            blocked,
            in_flight: Mutex::new(()),
            publish_retry: cfgs.publish_retry,
            resend_delay: cfgs.resend_delay(),
            push_timeout: cfgs.push_timeout(),
        }
    }

    fn check_usable(&self) -> Result<(), AmqpError> {
        if self.shutdown.is_triggered() {
            return Err(AmqpError::ShuttingDown);
        }

        if !self.session.is_ready() {
            return Err(AmqpError::NotReady);
        }

        Ok(())
    }

    async fn publish_with_retry(
        &self,
        channel: &dyn BrokerChannel,
        confirms: &ConfirmStream,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), AmqpError> {
        let mut confirms = confirms.lock().await;
        let attempts = self.publish_retry + 1;

        for attempt in 1..=attempts {
            let stale = drain_confirms(&mut confirms);
            if stale > 0 {
                debug!(stale, "discarded stale publish confirms");
            }

            let delivery_tag = match channel.publish(exchange, routing_key, envelope).await {
                Ok(delivery_tag) => delivery_tag,
                Err(err) => {
                    warn!(error = err.to_string(), attempt, "failure to publish");
                    if attempt < attempts {
                        self.backoff().await?;
                    }
                    continue;
                }
            };

            match self.await_confirm(&mut confirms, delivery_tag).await {
                ConfirmOutcome::Ack => {
                    debug!(exchange, routing_key, attempt, "message confirmed");
                    return Ok(());
                }
                ConfirmOutcome::Nack => {
                    warn!(delivery_tag, attempt, "message nacked by the broker");
                }
                ConfirmOutcome::Closed => {
                    warn!(attempt, "confirm stream closed");
                    if attempt < attempts {
                        self.backoff().await?;
                    }
                }
                ConfirmOutcome::TimedOut => {
                    warn!(delivery_tag, attempt, "no confirm received in time");
                }
            }
        }

        error!(exchange, routing_key, attempts, "giving up publishing message");
        Err(AmqpError::PublishRetriesExhausted(attempts))
    }

    /// Waits up to `resend_delay` for the confirm of `delivery_tag`. Confirms
    /// of earlier publishes that show up late are skipped.
    async fn await_confirm(
        &self,
        confirms: &mut UnboundedReceiver<Confirm>,
        delivery_tag: u64,
    ) -> ConfirmOutcome {
        let wait = async {
            loop {
                match confirms.recv().await {
                    Some(confirm) if confirm.delivery_tag == delivery_tag => {
                        return if confirm.ack {
                            ConfirmOutcome::Ack
                        } else {
                            ConfirmOutcome::Nack
                        };
                    }
                    Some(stale) => {
                        debug!(
                            expected = delivery_tag,
                            received = stale.delivery_tag,
                            "skipped late confirm"
                        );
                    }
                    None => return ConfirmOutcome::Closed,
                }
            }
        };

        timeout(self.resend_delay, wait)
            .await
            .unwrap_or(ConfirmOutcome::TimedOut)
    }

    async fn backoff(&self) -> Result<(), AmqpError> {
        tokio::select! {
            _ = self.shutdown.wait() => Err(AmqpError::ShuttingDown),
            _ = sleep(self.resend_delay) => Ok(()),
        }
    }
}

#[async_trait]
impl Publisher for AmqpPublisher {
    async fn push(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: Envelope,
    ) -> Result<(), AmqpError> {
        self.check_usable()?;

        let _in_flight = self.in_flight.lock().await;

        // the previous holder may have timed out while we were queued
        self.check_usable()?;

        let session = self.session.current();
        let (Some(channel), Some(confirms)) = (session.channel.clone(), session.confirms.clone())
        else {
            return Err(AmqpError::NotConnected);
        };

        let envelope = otel::inject_context(&Context::current(), envelope);

        match timeout(
            self.push_timeout,
            self.publish_with_retry(channel.as_ref(), &confirms, exchange, routing_key, &envelope),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                error!(exchange, routing_key, "push timed out, broker presumed blocked");
                if self.session.mark_not_ready_if(session.generation) {
                    self.blocked.notify_one();
                }
                Err(AmqpError::Timeout)
            }
        }
    }
}

fn drain_confirms(confirms: &mut UnboundedReceiver<Confirm>) -> usize {
    let mut drained = 0;
    while confirms.try_recv().is_ok() {
        drained += 1;
    }
    drained
}
