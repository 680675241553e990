// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Reliable AMQP 0-9-1 message bus client: confirmed publishing with bounded
//! retries, automatic reconnection and channel reinitialization, and
//! concurrent consumption of task messages dispatched by routing key.

mod connection;
mod consumer;
mod otel;
mod state;

pub mod channel;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod message;
pub mod publisher;
pub mod queue;
pub mod topology;
pub mod transport;

pub use client::BusClient;
pub use state::ConnectionState;
