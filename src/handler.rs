// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! A handler decodes the payload of one delivery and runs the business logic
//! for it. Handlers keep per-message state between `parse_payload` and
//! `run`, so the registry stores factories and every delivery gets its own
//! handler instance.

use crate::errors::AmqpError;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};

/// Business logic invoked for one consumed message.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Handler: Send {
    /// Receives the positional (`args`) and keyword (`kwargs`) segments of
    /// the message body.
    fn parse_payload(&mut self, args: &Value, kwargs: &Value) -> anyhow::Result<()>;

    async fn run(&mut self) -> anyhow::Result<()>;
}

/// Builds a fresh handler for every delivery of a routing key.
pub trait HandlerFactory: Send + Sync {
    fn build(&self) -> Box<dyn Handler>;
}

impl<F, H> HandlerFactory for F
where
    F: Fn() -> H + Send + Sync,
    H: Handler + 'static,
{
    fn build(&self) -> Box<dyn Handler> {
        Box::new(self())
    }
}

/// Append-only mapping from routing key to handler factory.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<RwLock<HashMap<String, Arc<dyn HandlerFactory>>>>,
}

impl HandlerRegistry {
    pub fn new() -> HandlerRegistry {
        HandlerRegistry::default()
    }

    pub fn register(
        &self,
        routing_key: &str,
        factory: Arc<dyn HandlerFactory>,
    ) -> Result<(), AmqpError> {
        let mut handlers = self.handlers.write();
        if handlers.contains_key(routing_key) {
            return Err(AmqpError::HandlerAlreadyRegistered(routing_key.to_owned()));
        }

        handlers.insert(routing_key.to_owned(), factory);
        Ok(())
    }

    pub fn resolve(&self, routing_key: &str) -> Option<Arc<dyn HandlerFactory>> {
        self.handlers.read().get(routing_key).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }
}
