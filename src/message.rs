// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelope Codec
//!
//! Builds outbound task envelopes and decodes inbound payloads. The wire
//! format follows the task-message protocol used by Celery-style workers:
//! the task metadata travels in the AMQP headers and the body is the JSON
//! array `[args, kwargs, embedded]`, where `embedded` carries the
//! callbacks/errbacks/chain/chord slots (always empty here).

use crate::{config::host_name, errors::AmqpError};
use lapin::{
    types::{AMQPValue, FieldArray, FieldTable, LongInt, LongString, ShortString},
    BasicProperties,
};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Content type every envelope is published with and every delivery must carry
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Content encoding every envelope is published with and every delivery must carry
pub const UTF8_CONTENT_ENCODING: &str = "utf-8";
/// AMQP delivery mode for messages persisted by the broker
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;
/// Value of the `lang` header
pub const TASK_LANG: &str = "rust";

pub const HEADER_ID: &str = "id";
pub const HEADER_ROOT_ID: &str = "root_id";
pub const HEADER_PARENT_ID: &str = "parent_id";
pub const HEADER_TASK: &str = "task";
pub const HEADER_LANG: &str = "lang";
pub const HEADER_RETRIES: &str = "retries";

/// A message ready to be pushed: AMQP properties plus the raw body.
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    pub(crate) properties: BasicProperties,
    pub(crate) body: Vec<u8>,
}

#[derive(Serialize)]
struct EmbeddedMetadata {
    callbacks: Option<Value>,
    errbacks: Option<Value>,
    chain: Option<Value>,
    chord: Option<Value>,
}

impl Envelope {
    /// Wraps pre-built properties and body.
    pub fn new(properties: BasicProperties, body: Vec<u8>) -> Envelope {
        Envelope { properties, body }
    }

    /// Builds a task envelope for `routing_key` with positional and keyword
    /// arguments.
    ///
    /// A fresh UUID is used as task id, root id, parent id and correlation id.
    pub fn task(
        routing_key: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Envelope, AmqpError> {
        let id = Uuid::new_v4().to_string();
        let args = Value::Array(args);
        let kwargs = Value::Object(kwargs);

        let args_repr = serde_json::to_string(&args)
            .map_err(|err| AmqpError::ParsePayloadError(err.to_string()))?;
        let kwargs_repr = serde_json::to_string(&kwargs)
            .map_err(|err| AmqpError::ParsePayloadError(err.to_string()))?;

        let embedded = EmbeddedMetadata {
            callbacks: None,
            errbacks: None,
            chain: None,
            chord: None,
        };

        let body = serde_json::to_vec(&(args, kwargs, embedded))
            .map_err(|err| AmqpError::ParsePayloadError(err.to_string()))?;

        let mut headers = BTreeMap::<ShortString, AMQPValue>::default();
        let long_string = |v: &str| AMQPValue::LongString(LongString::from(v));

        headers.insert(ShortString::from(HEADER_LANG), long_string(TASK_LANG));
        headers.insert(ShortString::from(HEADER_TASK), long_string(routing_key));
        headers.insert(ShortString::from(HEADER_ID), long_string(&id));
        headers.insert(ShortString::from(HEADER_ROOT_ID), long_string(&id));
        headers.insert(ShortString::from(HEADER_PARENT_ID), long_string(&id));
        headers.insert(ShortString::from("shadow"), AMQPValue::Void);
        headers.insert(ShortString::from("eta"), AMQPValue::Void);
        headers.insert(ShortString::from("expires"), AMQPValue::Void);
        headers.insert(ShortString::from("group"), AMQPValue::Void);
        headers.insert(
            ShortString::from(HEADER_RETRIES),
            AMQPValue::LongInt(LongInt::from(0)),
        );
        headers.insert(
            ShortString::from("timelimit"),
            AMQPValue::FieldArray(FieldArray::from(vec![AMQPValue::Void, AMQPValue::Void])),
        );
        headers.insert(ShortString::from("argsrepr"), long_string(&args_repr));
        headers.insert(ShortString::from("kwargsrepr"), long_string(&kwargs_repr));
        headers.insert(ShortString::from("origin"), long_string(&host_name()));

        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_content_encoding(ShortString::from(UTF8_CONTENT_ENCODING))
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
            .with_priority(0)
            .with_correlation_id(ShortString::from(id.as_str()))
            .with_headers(FieldTable::from(headers));

        Ok(Envelope { properties, body })
    }

    pub fn properties(&self) -> &BasicProperties {
        &self.properties
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The task id header, if present.
    pub fn id(&self) -> Option<String> {
        header_string(&self.properties, HEADER_ID)
    }

    pub(crate) fn with_headers(mut self, headers: FieldTable) -> Envelope {
        self.properties = self.properties.with_headers(headers);
        self
    }
}

/// Reads a string-valued header.
pub fn header_string(props: &BasicProperties, key: &str) -> Option<String> {
    let headers = props.headers().as_ref()?;

    match headers.inner().get(key)? {
        AMQPValue::LongString(v) => Some(String::from_utf8_lossy(v.as_bytes()).into_owned()),
        AMQPValue::ShortString(v) => Some(v.as_str().to_owned()),
        _ => None,
    }
}

/// Positional and keyword arguments of an inbound task.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    pub args: Value,
    pub kwargs: Value,
}

/// Decodes a task body: `[args, kwargs]`, optionally followed by the embedded
/// metadata segment, which is ignored.
pub fn decode_payload(data: &[u8]) -> Result<Payload, AmqpError> {
    let segments: Vec<Value> = serde_json::from_slice(data)
        .map_err(|err| AmqpError::ParsePayloadError(err.to_string()))?;

    let mut segments = segments.into_iter();
    match (segments.next(), segments.next(), segments.len()) {
        (Some(args), Some(kwargs), 0 | 1) => Ok(Payload { args, kwargs }),
        _ => Err(AmqpError::ParsePayloadError(
            "expected a [args, kwargs] body".to_owned(),
        )),
    }
}
