// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Declaration
//!
//! The topology is the set of exchanges, queues and bindings the bus expects
//! to exist before publishing or consuming. It is declared again on every
//! fresh channel, so a broker restart or a channel reset never leaves the
//! client publishing into a missing exchange.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    transport::BrokerChannel,
};
use tracing::{debug, error};

/// Exchanges, queues and bindings declared on every fresh channel.
#[derive(Debug, Clone, Default)]
pub struct AmqpTopology {
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) bindings: Vec<QueueBinding>,
}

impl AmqpTopology {
    pub fn new(
        exchanges: Vec<ExchangeDefinition>,
        queues: Vec<QueueDefinition>,
        bindings: Vec<QueueBinding>,
    ) -> AmqpTopology {
        AmqpTopology {
            exchanges,
            queues,
            bindings,
        }
    }

    /// Adds an exchange definition to the topology.
    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    /// Adds a queue definition to the topology.
    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    /// Adds a queue-to-exchange binding to the topology.
    pub fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    /// Declares the topology on the channel.
    ///
    /// This method performs the following operations in order:
    /// 1. Declares all exchanges
    /// 2. Declares all queues
    /// 3. Binds queues to exchanges
    ///
    /// The first failure aborts the installation.
    pub async fn install(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        self.install_exchanges(channel).await?;
        self.install_queues(channel).await?;
        self.binding_queues(channel).await
    }

    async fn install_exchanges(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name);

            if let Err(err) = channel.declare_exchange(exch).await {
                error!(
                    error = err.to_string(),
                    name = exch.name.as_str(),
                    "error to declare the exchange"
                );
                return Err(err);
            }

            debug!("exchange: {} was created", exch.name);
        }

        Ok(())
    }

    async fn install_queues(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        for def in &self.queues {
            debug!("creating queue: {}", def.name);

            if let Err(err) = channel.declare_queue(def).await {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the queue"
                );
                return Err(err);
            }

            debug!("queue: {} was created", def.name);
        }

        Ok(())
    }

    async fn binding_queues(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        for binding in &self.bindings {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );

            if let Err(err) = channel.bind_queue(binding).await {
                error!(error = err.to_string(), "error to bind queue to exchange");
                return Err(err);
            }
        }

        debug!("queues were bound");

        Ok(())
    }
}
