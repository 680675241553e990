// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Processing
//!
//! Processes one delivery pulled by a queue consumer. The delivery is
//! acknowledged before anything else, so a malformed message or a failing
//! handler never comes back: validation failures, unknown routing keys and
//! handler errors are reported to the caller, which logs them, and the
//! message is dropped.

use crate::{
    errors::AmqpError,
    handler::HandlerRegistry,
    message::{decode_payload, JSON_CONTENT_TYPE, UTF8_CONTENT_ENCODING},
    otel,
    transport::{BrokerChannel, InboundMessage},
};
use lapin::protocol::basic::AMQPProperties;
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use std::borrow::Cow;
use tracing::{debug, error, warn};

/// Local attempts to acknowledge a delivery before giving up
pub const ACK_ATTEMPTS: usize = 3;

/// Acknowledges, validates and dispatches one delivery.
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    delivery: &InboundMessage,
    handlers: &HandlerRegistry,
    channel: &dyn BrokerChannel,
) -> Result<(), AmqpError> {
    let (_ctx, mut span) = otel::new_span(&delivery.properties, tracer, &delivery.routing_key);

    debug!(
        "received: {} - exchange: {}",
        delivery.routing_key, delivery.exchange,
    );

    if let Err(err) = ack(channel, delivery.delivery_tag).await {
        span.record_error(&err);
    }

    let result = dispatch(delivery, handlers).await;

    match &result {
        Ok(_) => {
            debug!("message successfully processed");
            span.set_status(Status::Ok);
        }
        Err(err) => {
            span.record_error(err);
            span.set_status(Status::Error {
                description: Cow::from(err.to_string()),
            });
        }
    }

    result
}

async fn ack(channel: &dyn BrokerChannel, delivery_tag: u64) -> Result<(), AmqpError> {
    for attempt in 1..=ACK_ATTEMPTS {
        match channel.ack(delivery_tag).await {
            Ok(_) => return Ok(()),
            Err(err) => warn!(error = err.to_string(), delivery_tag, attempt, "error whiling ack msg"),
        }
    }

    error!(delivery_tag, "giving up acking msg");
    Err(AmqpError::AckMessageError)
}

async fn dispatch(delivery: &InboundMessage, handlers: &HandlerRegistry) -> Result<(), AmqpError> {
    validate(&delivery.properties)?;

    let Some(factory) = handlers.resolve(&delivery.routing_key) else {
        return Err(AmqpError::UnregisteredRoutingKey(
            delivery.routing_key.clone(),
        ));
    };

    let payload = decode_payload(&delivery.data)?;

    let mut handler = factory.build();
    handler
        .parse_payload(&payload.args, &payload.kwargs)
        .map_err(|err| AmqpError::ParsePayloadError(err.to_string()))?;

    handler
        .run()
        .await
        .map_err(|err| AmqpError::HandlerError(err.to_string()))
}

/// Checks the envelope metadata of a delivery.
pub(crate) fn validate(props: &AMQPProperties) -> Result<(), AmqpError> {
    if props.headers().is_none() {
        return Err(AmqpError::MissingHeaders);
    }

    let content_type = props
        .content_type()
        .as_ref()
        .map(|v| v.as_str())
        .unwrap_or_default();
    if content_type != JSON_CONTENT_TYPE {
        return Err(AmqpError::InvalidContentType(content_type.to_owned()));
    }

    let content_encoding = props
        .content_encoding()
        .as_ref()
        .map(|v| v.as_str())
        .unwrap_or_default();
    if content_encoding != UTF8_CONTENT_ENCODING {
        return Err(AmqpError::InvalidContentEncoding(
            content_encoding.to_owned(),
        ));
    }

    Ok(())
}
