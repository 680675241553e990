// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the AMQP Bus Client
//!
//! `AmqpError` covers every failure the client can observe: transport errors
//! raised while dialing or declaring topology, publish and ack failures, and
//! the caller-facing errors returned by `push`, `consume`, `register` and
//! `close`. None of them is fatal to the process.

use thiserror::Error;

/// Represents errors that can occur during AMQP bus operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// The client holds no live connection
    #[error("not connected to the broker")]
    NotConnected,

    /// `close` was already called on this client
    #[error("client already closed")]
    AlreadyClosed,

    /// The shutdown signal fired while the operation was pending
    #[error("client is shutting down")]
    ShuttingDown,

    /// Connection, channel or topology is not currently valid
    #[error("client is not ready")]
    NotReady,

    /// The push deadline elapsed before the broker confirmed the message
    #[error("push timed out")]
    Timeout,

    /// Error establishing a connection to the broker
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    /// Error enabling publisher confirms on a channel
    #[error("failure to enable publisher confirms `{0}`")]
    ConfirmSelectError(String),

    /// Error loading or validating configuration
    #[error("invalid configuration `{0}`")]
    ConfigError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{1}` to exchange `{0}`")]
    BindingExchangeToQueueError(String, String),

    /// Error returned by the broker publish primitive
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// Every publish attempt failed or went unconfirmed
    #[error("failure to publish after {0} attempts")]
    PublishRetriesExhausted(u32),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer on a queue
    #[error("failure to declare consumer on queue `{0}`")]
    ConsumerDeclarationError(String),

    /// `consume` is already running on this client
    #[error("already consuming")]
    AlreadyConsuming,

    /// `consume` was called without any configured queue
    #[error("no queues configured")]
    NoQueuesConfigured,

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// The delivery carried no headers table
    #[error("delivery without headers")]
    MissingHeaders,

    /// The delivery content type is not `application/json`
    #[error("unsupported content type `{0}`")]
    InvalidContentType(String),

    /// The delivery content encoding is not `utf-8`
    #[error("unsupported content encoding `{0}`")]
    InvalidContentEncoding(String),

    /// No handler registered for the delivery routing key
    #[error("no handler registered for `{0}`")]
    UnregisteredRoutingKey(String),

    /// A handler is already registered for this routing key
    #[error("handler already registered for `{0}`")]
    HandlerAlreadyRegistered(String),

    /// Error encoding or decoding a message payload
    #[error("failure to parse payload `{0}`")]
    ParsePayloadError(String),

    /// The handler returned an error while executing
    #[error("handler failure `{0}`")]
    HandlerError(String),
}
