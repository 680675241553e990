// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker implementing the transport traits, with knobs to make
//! it fail, stall or nack, and counters to observe what the client did.

#![allow(dead_code)]

use amqp_bus::{
    config::{AmqpConfigs, BindingConfigs},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::Envelope,
    queue::{QueueBinding, QueueDefinition},
    transport::{
        close_signal, BrokerChannel, BrokerConnection, CloseHandle, CloseNotifier, Confirm,
        DeliveryStream, InboundMessage, Transport,
    },
    BusClient,
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::mpsc;

type DeliverySender = mpsc::UnboundedSender<Result<InboundMessage, AmqpError>>;

#[derive(Default)]
struct QueueState {
    pending: VecDeque<InboundMessage>,
    // (channel id, consumer tag, sender)
    consumers: Vec<(u64, String, DeliverySender)>,
    next_consumer: usize,
}

#[derive(Default)]
struct Topology {
    exchanges: Vec<String>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<(String, String, String)>,
}

#[derive(Default)]
struct Inner {
    topology: Mutex<Topology>,
    connection: Mutex<Option<CloseHandle>>,
    channels: Mutex<Vec<(u64, CloseHandle, Arc<Mutex<Option<mpsc::UnboundedSender<Confirm>>>>)>>,
    acked: Mutex<Vec<u64>>,

    stall_publish: AtomicBool,
    hold_confirms: AtomicBool,
    held_confirms: Mutex<VecDeque<Confirm>>,
    nacks: AtomicUsize,
    publish_delay_ms: AtomicU64,
    failing_dials: AtomicUsize,
    failing_declares: AtomicUsize,
    failing_consumes: AtomicUsize,

    dials: AtomicUsize,
    channels_opened: AtomicU64,
    published: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    next_delivery_tag: AtomicU64,
}

/// Shared handle on the fake broker.
#[derive(Clone, Default)]
pub struct FakeBroker {
    inner: Arc<Inner>,
}

impl FakeBroker {
    pub fn new() -> FakeBroker {
        FakeBroker::default()
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(FakeTransport {
            inner: self.inner.clone(),
        })
    }

    /// Publishes never return until cleared.
    pub fn stall_publish(&self, stall: bool) {
        self.inner.stall_publish.store(stall, Ordering::SeqCst);
    }

    /// Keeps confirms back until released one by one.
    pub fn hold_confirms(&self, hold: bool) {
        self.inner.hold_confirms.store(hold, Ordering::SeqCst);
    }

    /// Sends the oldest held confirm on the latest channel.
    pub fn release_held_confirm(&self) {
        let held = self.inner.held_confirms.lock().pop_front();
        if let Some(confirm) = held {
            self.inject_confirm(confirm);
        }
    }

    /// Nacks the next `count` publishes.
    pub fn nack_next(&self, count: usize) {
        self.inner.nacks.store(count, Ordering::SeqCst);
    }

    pub fn publish_delay(&self, delay: Duration) {
        self.inner
            .publish_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn fail_next_dials(&self, count: usize) {
        self.inner.failing_dials.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_declares(&self, count: usize) {
        self.inner.failing_declares.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_consumes(&self, count: usize) {
        self.inner.failing_consumes.store(count, Ordering::SeqCst);
    }

    /// Number of consumers attached to `queue`.
    pub fn consumers(&self, queue: &str) -> usize {
        self.inner
            .topology
            .lock()
            .queues
            .get(queue)
            .map(|q| q.consumers.iter().filter(|(_, _, tx)| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Drops the connection and every channel on it.
    pub fn kill_connection(&self) {
        if let Some(conn) = self.inner.connection.lock().as_ref() {
            conn.close("connection reset by peer");
        }

        let channels: Vec<u64> = self.inner.channels.lock().iter().map(|c| c.0).collect();
        for id in channels {
            self.inner.close_channel(id, "connection reset by peer");
        }
    }

    /// Closes the most recently opened channel.
    pub fn close_channel(&self) {
        let last = self.inner.channels.lock().last().map(|c| c.0);
        if let Some(id) = last {
            self.inner.close_channel(id, "PRECONDITION_FAILED");
        }
    }

    /// Pushes a confirm nobody asked for on the latest channel.
    pub fn inject_confirm(&self, confirm: Confirm) {
        let channels = self.inner.channels.lock();
        if let Some((_, _, confirms)) = channels.last() {
            if let Some(sender) = confirms.lock().as_ref() {
                let _ = sender.send(confirm);
            }
        }
    }

    /// Routes a message as if published by another client.
    pub fn publish_raw(&self, exchange: &str, routing_key: &str, envelope: &Envelope) {
        self.inner.route(exchange, routing_key, envelope);
    }

    pub fn dials(&self) -> usize {
        self.inner.dials.load(Ordering::SeqCst)
    }

    pub fn channels_opened(&self) -> u64 {
        self.inner.channels_opened.load(Ordering::SeqCst)
    }

    pub fn published(&self) -> usize {
        self.inner.published.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn acked(&self) -> usize {
        self.inner.acked.lock().len()
    }

    pub fn connection_closed(&self) -> bool {
        self.inner
            .connection
            .lock()
            .as_ref()
            .map(CloseHandle::is_closed)
            .unwrap_or(false)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.inner.topology.lock().queues.contains_key(name)
    }

    pub fn pending(&self, queue: &str) -> usize {
        self.inner
            .topology
            .lock()
            .queues
            .get(queue)
            .map(|q| q.pending.len())
            .unwrap_or(0)
    }
}

impl Inner {
    fn close_channel(&self, id: u64, reason: &str) {
        if let Some((_, closed, _)) = self.channels.lock().iter().find(|c| c.0 == id) {
            closed.close(reason);
        }

        // ends the delivery streams of this channel
        for queue in self.topology.lock().queues.values_mut() {
            queue.consumers.retain(|(channel, _, _)| *channel != id);
        }
    }

    fn route(&self, exchange: &str, routing_key: &str, envelope: &Envelope) {
        let mut topology = self.topology.lock();

        let targets: Vec<String> = topology
            .bindings
            .iter()
            .filter(|(_, key, exch)| exch == exchange && topic_matches(key, routing_key))
            .map(|(queue, _, _)| queue.clone())
            .collect();

        for target in targets {
            let Some(queue) = topology.queues.get_mut(&target) else {
                continue;
            };

            let message = InboundMessage {
                delivery_tag: self.next_delivery_tag.fetch_add(1, Ordering::SeqCst) + 1,
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                redelivered: false,
                properties: envelope.properties().clone(),
                data: envelope.body().to_vec(),
            };

            queue.deliver(message);
        }
    }
}

impl QueueState {
    fn deliver(&mut self, message: InboundMessage) {
        self.consumers.retain(|(_, _, sender)| !sender.is_closed());

        if self.consumers.is_empty() {
            self.pending.push_back(message);
            return;
        }

        let index = self.next_consumer % self.consumers.len();
        self.next_consumer = self.next_consumer.wrapping_add(1);

        if let Err(mpsc::error::SendError(Ok(message))) = self.consumers[index].2.send(Ok(message))
        {
            self.pending.push_back(message);
        }
    }
}

/// AMQP topic matching: `*` is one word, `#` is zero or more words.
fn topic_matches(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    matches(&pattern, &key)
}

struct FakeTransport {
    inner: Arc<Inner>,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn dial(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        self.inner.dials.fetch_add(1, Ordering::SeqCst);

        let failing = self.inner.failing_dials.load(Ordering::SeqCst);
        if failing > 0 {
            self.inner.failing_dials.store(failing - 1, Ordering::SeqCst);
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }

        let (closed, _) = close_signal();
        *self.inner.connection.lock() = Some(closed.clone());

        Ok(Arc::new(FakeConnection {
            inner: self.inner.clone(),
            closed,
        }))
    }
}

struct FakeConnection {
    inner: Arc<Inner>,
    closed: CloseHandle,
}

#[async_trait]
impl BrokerConnection for FakeConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        if self.closed.is_closed() {
            return Err(AmqpError::ChannelError("connection closed".to_owned()));
        }

        let id = self.inner.channels_opened.fetch_add(1, Ordering::SeqCst) + 1;
        let (closed, _) = close_signal();
        let confirms = Arc::new(Mutex::new(None));

        self.inner
            .channels
            .lock()
            .push((id, closed.clone(), confirms.clone()));

        Ok(Arc::new(FakeChannel {
            id,
            inner: self.inner.clone(),
            closed,
            confirms,
            published: AtomicU64::new(0),
        }))
    }

    fn notify_close(&self) -> CloseNotifier {
        self.closed.subscribe()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.closed.close("closed by client");
        Ok(())
    }
}

struct FakeChannel {
    id: u64,
    inner: Arc<Inner>,
    closed: CloseHandle,
    confirms: Arc<Mutex<Option<mpsc::UnboundedSender<Confirm>>>>,
    published: AtomicU64,
}

impl FakeChannel {
    fn check_open(&self) -> Result<(), AmqpError> {
        if self.closed.is_closed() {
            return Err(AmqpError::ChannelError("channel closed".to_owned()));
        }
        Ok(())
    }

    fn fail_declare(&self) -> bool {
        take_one(&self.inner.failing_declares)
    }
}

/// Consumes one unit of a failure budget, if any is left.
fn take_one(budget: &AtomicUsize) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Decrements the in-flight counter even when the publish future is dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(inner: &'a Inner) -> InFlight<'a> {
        let now = inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        inner.max_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight(&inner.in_flight)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl BrokerChannel for FakeChannel {
    async fn confirm_select(&self) -> Result<(), AmqpError> {
        self.check_open()
    }

    fn notify_close(&self) -> CloseNotifier {
        self.closed.subscribe()
    }

    fn notify_publish(&self) -> mpsc::UnboundedReceiver<Confirm> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.confirms.lock() = Some(tx);
        rx
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.check_open()?;
        if self.fail_declare() {
            return Err(AmqpError::DeclareExchangeError(def.name().to_owned()));
        }

        let mut topology = self.inner.topology.lock();
        if !topology.exchanges.iter().any(|e| e == def.name()) {
            topology.exchanges.push(def.name().to_owned());
        }
        Ok(())
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.check_open()?;
        if self.fail_declare() {
            return Err(AmqpError::DeclareQueueError(def.name().to_owned()));
        }

        self.inner
            .topology
            .lock()
            .queues
            .entry(def.name().to_owned())
            .or_default();
        Ok(())
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.check_open()?;

        let entry = (
            binding.queue_name().to_owned(),
            binding.binding_key().to_owned(),
            binding.exchange_name().to_owned(),
        );

        let mut topology = self.inner.topology.lock();
        if !topology.bindings.contains(&entry) {
            topology.bindings.push(entry);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<u64, AmqpError> {
        let _in_flight = InFlight::enter(&self.inner);
        self.check_open()
            .map_err(|err| AmqpError::PublishingError(err.to_string()))?;

        let delay = self.inner.publish_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if self.inner.stall_publish.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        self.inner.published.fetch_add(1, Ordering::SeqCst);
        let delivery_tag = self.published.fetch_add(1, Ordering::SeqCst) + 1;
        let ack = !take_one(&self.inner.nacks);

        if ack {
            self.inner.route(exchange, routing_key, envelope);
        }

        let confirm = Confirm { delivery_tag, ack };
        if self.inner.hold_confirms.load(Ordering::SeqCst) {
            self.inner.held_confirms.lock().push_back(confirm);
        } else if let Some(sender) = self.confirms.lock().as_ref() {
            let _ = sender.send(confirm);
        }

        Ok(delivery_tag)
    }

    async fn qos(&self, _prefetch_count: u16) -> Result<(), AmqpError> {
        self.check_open()
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        self.check_open()?;
        if take_one(&self.inner.failing_consumes) {
            return Err(AmqpError::ConsumerDeclarationError(queue.to_owned()));
        }

        let (tx, rx) = mpsc::unbounded_channel();

        let mut topology = self.inner.topology.lock();
        let Some(state) = topology.queues.get_mut(queue) else {
            return Err(AmqpError::ConsumerDeclarationError(queue.to_owned()));
        };

        while let Some(message) = state.pending.pop_front() {
            let _ = tx.send(Ok(message));
        }
        state.consumers.push((self.id, consumer_tag.to_owned(), tx));

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|message| (message, rx))
        })
        .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.check_open()?;
        for queue in self.inner.topology.lock().queues.values_mut() {
            queue
                .consumers
                .retain(|(channel, tag, _)| *channel != self.id || tag != consumer_tag);
        }
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.check_open().map_err(|_| AmqpError::AckMessageError)?;
        self.inner.acked.lock().push(delivery_tag);
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.inner.close_channel(self.id, "closed by client");
        Ok(())
    }
}

/// Configuration with one exchange and two queues bound by topic.
pub fn configs() -> AmqpConfigs {
    AmqpConfigs {
        namespace: "test".to_owned(),
        url: "amqp://fake".to_owned(),
        consumer_tag: Some("test-host".to_owned()),
        exchanges: vec!["tasks".to_owned()],
        queues: vec!["emails".to_owned(), "sms".to_owned()],
        bindings: vec![
            BindingConfigs {
                queue: "emails".to_owned(),
                binding_key: "email.#".to_owned(),
                exchange: "tasks".to_owned(),
            },
            BindingConfigs {
                queue: "sms".to_owned(),
                binding_key: "sms.#".to_owned(),
                exchange: "tasks".to_owned(),
            },
        ],
        ..AmqpConfigs::default()
    }
}

/// Starts a client on `broker` and waits until it is ready.
pub async fn ready_client(broker: &FakeBroker, cfgs: AmqpConfigs) -> BusClient {
    let client = BusClient::with_transport(cfgs, broker.transport()).unwrap();
    client.wait_ready(Duration::from_secs(30)).await.unwrap();
    client
}

/// Polls `check` every 10ms until it holds, at most `limit`.
pub async fn eventually(limit: Duration, check: impl Fn() -> bool) -> bool {
    let wait = async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(limit, wait).await.is_ok()
}
