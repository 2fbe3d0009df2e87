//! In-process broker implementing the transport seam.
//!
//! Routes through direct, fanout, topic and headers exchanges, honours
//! per-consumer prefetch, settles publisher confirms, returns unroutable
//! mandatory messages and requeues unacknowledged deliveries when a
//! channel dies. Failure injection (refused dials, failed declarations,
//! dropped connections, killed channels) and accounting (dial times,
//! declarations, settlements per delivery tag) make it the broker used by
//! the test suites. The accounting is kept for the broker's lifetime, so
//! it is not meant for long-running processes.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc as stream_channel;
use futures::future::{self, FutureExt};
use futures::StreamExt;
use tokio::time::Instant;
use tracing::debug;

use super::errors::{BrokerError, Result};
use super::message::{AckHandle, Acknowledger, Delivery, Publishing};
use super::transport::{
    BrokerChannel, BrokerConnection, CloseListeners, CloseNotifier, ConfirmOutcome, Connector,
    DeliveryStream, PendingConfirm,
};
use crate::config::{ExchangeType, QueueConfig};

/// How the broker answers publisher confirms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfirmBehavior {
    #[default]
    Ack,
    Nack,
    /// Never confirm; the publisher's confirm wait times out.
    Silent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementKind {
    Ack,
    Reject { requeue: bool },
    Nack { requeue: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub channel: u64,
    pub delivery_tag: u64,
    pub message_id: Option<String>,
    pub kind: SettlementKind,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeclarationCounts {
    pub exchanges: usize,
    pub queues: usize,
    pub bindings: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub publishing: Publishing,
    pub routed: bool,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    publishing: Publishing,
    redelivered: bool,
}

struct QueueConsumer {
    channel: u64,
    tag: String,
    in_flight: usize,
    tx: stream_channel::UnboundedSender<Result<Delivery>>,
}

#[derive(Default)]
struct MemoryQueue {
    messages: VecDeque<StoredMessage>,
    consumers: Vec<QueueConsumer>,
    cursor: usize,
}

struct Unacked {
    queue: String,
    consumer: String,
    message: StoredMessage,
}

struct ConnectionSlot {
    open: bool,
    listeners: Arc<CloseListeners>,
    channels: Vec<u64>,
}

struct ChannelSlot {
    open: bool,
    confirm: bool,
    prefetch: u16,
    next_tag: u64,
    listeners: Arc<CloseListeners>,
    unacked: BTreeMap<u64, Unacked>,
}

struct BindingEntry {
    exchange: String,
    queue: String,
    routing_key: String,
}

struct BrokerState {
    available: bool,
    failing_dials: usize,
    failing_declarations: usize,
    failing_qos: usize,
    failing_channel_closes: bool,
    declaration_delay: Duration,
    confirm: ConfirmBehavior,
    dial_log: Vec<Instant>,
    declarations: DeclarationCounts,
    exchanges: BTreeMap<String, ExchangeType>,
    queues: BTreeMap<String, MemoryQueue>,
    bindings: Vec<BindingEntry>,
    connections: HashMap<u64, ConnectionSlot>,
    channels: HashMap<u64, ChannelSlot>,
    next_id: u64,
    settlements: Vec<Settlement>,
    published: Vec<PublishedMessage>,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            available: true,
            failing_dials: 0,
            failing_declarations: 0,
            failing_qos: 0,
            failing_channel_closes: false,
            declaration_delay: Duration::ZERO,
            confirm: ConfirmBehavior::Ack,
            dial_log: Vec::new(),
            declarations: DeclarationCounts::default(),
            exchanges: BTreeMap::new(),
            queues: BTreeMap::new(),
            bindings: Vec::new(),
            connections: HashMap::new(),
            channels: HashMap::new(),
            next_id: 0,
            settlements: Vec::new(),
            published: Vec::new(),
        }
    }
}

type Shared = Arc<Mutex<BrokerState>>;

fn lock(shared: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle to an in-process broker. Clones share the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Shared,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            shared: self.shared.clone(),
        }
    }

    /// While unavailable every dial is refused.
    pub fn set_available(&self, available: bool) {
        lock(&self.shared).available = available;
    }

    pub fn fail_next_dials(&self, count: usize) {
        lock(&self.shared).failing_dials = count;
    }

    pub fn fail_next_declarations(&self, count: usize) {
        lock(&self.shared).failing_declarations = count;
    }

    pub fn fail_next_qos(&self, count: usize) {
        lock(&self.shared).failing_qos = count;
    }

    /// While set, closing a channel reports an error and leaves it open,
    /// like a close racing a dying socket.
    pub fn fail_channel_closes(&self, failing: bool) {
        lock(&self.shared).failing_channel_closes = failing;
    }

    /// Every exchange declaration takes `delay` before the broker answers.
    pub fn set_declaration_delay(&self, delay: Duration) {
        lock(&self.shared).declaration_delay = delay;
    }

    pub fn set_confirm_behavior(&self, behavior: ConfirmBehavior) {
        lock(&self.shared).confirm = behavior;
    }

    pub fn dial_attempts(&self) -> usize {
        lock(&self.shared).dial_log.len()
    }

    pub fn dial_times(&self) -> Vec<Instant> {
        lock(&self.shared).dial_log.clone()
    }

    pub fn declarations(&self) -> DeclarationCounts {
        lock(&self.shared).declarations
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        lock(&self.shared).exchanges.contains_key(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        lock(&self.shared).queues.contains_key(name)
    }

    pub fn binding_count(&self) -> usize {
        lock(&self.shared).bindings.len()
    }

    pub fn open_connections(&self) -> usize {
        lock(&self.shared)
            .connections
            .values()
            .filter(|c| c.open)
            .count()
    }

    pub fn open_channels(&self) -> usize {
        lock(&self.shared).channels.values().filter(|c| c.open).count()
    }

    /// Messages waiting in `queue`, not counting unacknowledged deliveries.
    pub fn queue_depth(&self, queue: &str) -> usize {
        lock(&self.shared)
            .queues
            .get(queue)
            .map_or(0, |q| q.messages.len())
    }

    pub fn unacked_count(&self) -> usize {
        lock(&self.shared)
            .channels
            .values()
            .map(|c| c.unacked.len())
            .sum()
    }

    /// Put a message straight into `queue`, creating the queue if needed.
    pub fn enqueue(&self, queue: &str, publishing: Publishing) {
        let mut state = lock(&self.shared);
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .messages
            .push_back(StoredMessage {
                publishing,
                redelivered: false,
            });
        dispatch(&self.shared, &mut state, queue);
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.shared).published.clone()
    }

    pub fn settlements(&self) -> Vec<Settlement> {
        lock(&self.shared).settlements.clone()
    }

    pub fn acked_message_ids(&self) -> Vec<String> {
        self.message_ids_where(|kind| kind == SettlementKind::Ack)
    }

    pub fn rejected_message_ids(&self) -> Vec<String> {
        self.message_ids_where(|kind| matches!(kind, SettlementKind::Reject { .. }))
    }

    fn message_ids_where<F: Fn(SettlementKind) -> bool>(&self, keep: F) -> Vec<String> {
        lock(&self.shared)
            .settlements
            .iter()
            .filter(|s| keep(s.kind))
            .filter_map(|s| s.message_id.clone())
            .collect()
    }

    /// Settlement calls per (channel, delivery tag).
    pub fn settlements_per_delivery(&self) -> HashMap<(u64, u64), usize> {
        let mut counts = HashMap::new();
        for settlement in lock(&self.shared).settlements.iter() {
            *counts
                .entry((settlement.channel, settlement.delivery_tag))
                .or_insert(0) += 1;
        }
        counts
    }

    /// Simulate a network failure: every open connection dies with an
    /// error, its channels with it, and unacknowledged deliveries return
    /// to their queues.
    pub fn drop_connections(&self) {
        let mut state = lock(&self.shared);
        let ids: Vec<u64> = state
            .connections
            .iter()
            .filter(|(_, c)| c.open)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            close_connection(
                &self.shared,
                &mut state,
                id,
                Some("CONNECTION_FORCED - broker forced connection closure"),
            );
        }
    }

    /// Close every open channel with an error while keeping connections up.
    pub fn kill_channels(&self) {
        let mut state = lock(&self.shared);
        let ids: Vec<u64> = state
            .channels
            .iter()
            .filter(|(_, c)| c.open)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            close_channel(&self.shared, &mut state, id, Some("CHANNEL_ERROR - channel killed"));
        }
    }
}

#[derive(Clone)]
pub struct MemoryConnector {
    shared: Shared,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        uri: &str,
        connection_name: &str,
    ) -> Result<Arc<dyn BrokerConnection>> {
        let mut state = lock(&self.shared);
        state.dial_log.push(Instant::now());

        if !state.available {
            return Err(BrokerError::Transport(format!("connection refused: {}", uri)));
        }
        if state.failing_dials > 0 {
            state.failing_dials -= 1;
            return Err(BrokerError::Transport(format!("connection refused: {}", uri)));
        }

        state.next_id += 1;
        let id = state.next_id;
        state.connections.insert(
            id,
            ConnectionSlot {
                open: true,
                listeners: Arc::new(CloseListeners::default()),
                channels: Vec::new(),
            },
        );
        debug!(connection = id, connection_name, "Memory broker accepted connection");

        Ok(Arc::new(MemoryConnection {
            shared: self.shared.clone(),
            id,
        }))
    }
}

pub struct MemoryConnection {
    shared: Shared,
    id: u64,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let mut state = lock(&self.shared);
        let number = match state.connections.get(&self.id) {
            Some(connection) if connection.open => connection.channels.len() as u16 + 1,
            _ => return Err(BrokerError::Disconnected),
        };

        state.next_id += 1;
        let id = state.next_id;
        state.channels.insert(
            id,
            ChannelSlot {
                open: true,
                confirm: false,
                prefetch: 0,
                next_tag: 0,
                listeners: Arc::new(CloseListeners::default()),
                unacked: BTreeMap::new(),
            },
        );
        if let Some(connection) = state.connections.get_mut(&self.id) {
            connection.channels.push(id);
        }

        Ok(Arc::new(MemoryChannel {
            shared: self.shared.clone(),
            id,
            number,
        }))
    }

    fn is_open(&self) -> bool {
        lock(&self.shared)
            .connections
            .get(&self.id)
            .is_some_and(|c| c.open)
    }

    fn notify_close(&self) -> CloseNotifier {
        let state = lock(&self.shared);
        match state.connections.get(&self.id) {
            Some(connection) => connection.listeners.subscribe(!connection.open),
            None => CloseListeners::default().subscribe(true),
        }
    }

    async fn close(&self) -> Result<()> {
        let mut state = lock(&self.shared);
        close_connection(&self.shared, &mut state, self.id, None);
        Ok(())
    }
}

pub struct MemoryChannel {
    shared: Shared,
    id: u64,
    number: u16,
}

impl MemoryChannel {
    /// Lock the broker and check that this channel is still usable.
    fn open_state(&self) -> Result<MutexGuard<'_, BrokerState>> {
        let state = lock(&self.shared);
        match state.channels.get(&self.id) {
            Some(channel) if channel.open => Ok(state),
            _ => Err(BrokerError::Disconnected),
        }
    }

    fn take_declaration_failure(state: &mut BrokerState) -> Result<()> {
        if state.failing_declarations > 0 {
            state.failing_declarations -= 1;
            return Err(BrokerError::Transport(
                "injected declaration failure".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn id(&self) -> u16 {
        self.number
    }

    fn is_open(&self) -> bool {
        lock(&self.shared)
            .channels
            .get(&self.id)
            .is_some_and(|c| c.open)
    }

    fn notify_close(&self) -> CloseNotifier {
        let state = lock(&self.shared);
        match state.channels.get(&self.id) {
            Some(channel) => channel.listeners.subscribe(!channel.open),
            None => CloseListeners::default().subscribe(true),
        }
    }

    async fn confirm_select(&self) -> Result<()> {
        let mut state = self.open_state()?;
        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.confirm = true;
        }
        Ok(())
    }

    async fn exchange_declare(&self, name: &str, kind: ExchangeType) -> Result<()> {
        let delay = lock(&self.shared).declaration_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.open_state()?;
        Self::take_declaration_failure(&mut state)?;

        match state.exchanges.get(name) {
            Some(existing) if *existing != kind => {
                return Err(BrokerError::Transport(format!(
                    "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{}'",
                    name
                )));
            }
            Some(_) => {}
            None => {
                state.exchanges.insert(name.to_string(), kind);
            }
        }
        state.declarations.exchanges += 1;
        Ok(())
    }

    async fn queue_declare(&self, name: &str, _options: &QueueConfig) -> Result<()> {
        let mut state = self.open_state()?;
        Self::take_declaration_failure(&mut state)?;

        state.queues.entry(name.to_string()).or_default();
        state.declarations.queues += 1;
        Ok(())
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.open_state()?;
        Self::take_declaration_failure(&mut state)?;

        if !state.queues.contains_key(queue) {
            return Err(BrokerError::Transport(format!("NOT_FOUND - no queue '{}'", queue)));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::Transport(format!(
                "NOT_FOUND - no exchange '{}'",
                exchange
            )));
        }

        let exists = state.bindings.iter().any(|b| {
            b.exchange == exchange && b.queue == queue && b.routing_key == routing_key
        });
        if !exists {
            state.bindings.push(BindingEntry {
                exchange: exchange.to_string(),
                queue: queue.to_string(),
                routing_key: routing_key.to_string(),
            });
        }
        state.declarations.bindings += 1;
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<()> {
        let mut state = self.open_state()?;
        if state.failing_qos > 0 {
            state.failing_qos -= 1;
            return Err(BrokerError::Transport("injected qos failure".to_string()));
        }
        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.prefetch = prefetch_count;
        }
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        publishing: &Publishing,
    ) -> Result<PendingConfirm> {
        let mut state = self.open_state()?;

        let targets = route(&state, exchange, routing_key)?;
        let routed = !targets.is_empty();
        state.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            publishing: publishing.clone(),
            routed,
        });

        for queue in &targets {
            if let Some(q) = state.queues.get_mut(queue) {
                q.messages.push_back(StoredMessage {
                    publishing: publishing.clone(),
                    redelivered: false,
                });
            }
            dispatch(&self.shared, &mut state, queue);
        }

        let confirm_mode = state
            .channels
            .get(&self.id)
            .is_some_and(|c| c.confirm);
        let outcome = match (confirm_mode, state.confirm, routed) {
            (false, _, _) => ConfirmOutcome::NotRequested,
            (true, ConfirmBehavior::Silent, _) => {
                return Ok(future::pending::<Result<ConfirmOutcome>>().boxed())
            }
            (true, _, false) => ConfirmOutcome::Returned,
            (true, ConfirmBehavior::Nack, true) => ConfirmOutcome::Nack,
            (true, ConfirmBehavior::Ack, true) => ConfirmOutcome::Ack,
        };
        Ok(future::ready(Ok(outcome)).boxed())
    }

    async fn basic_consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let mut state = self.open_state()?;
        let (tx, rx) = stream_channel::unbounded();

        match state.queues.get_mut(queue) {
            Some(q) => q.consumers.push(QueueConsumer {
                channel: self.id,
                tag: consumer_tag.to_string(),
                in_flight: 0,
                tx,
            }),
            None => {
                return Err(BrokerError::Transport(format!("NOT_FOUND - no queue '{}'", queue)))
            }
        }
        dispatch(&self.shared, &mut state, queue);

        Ok(rx.boxed())
    }

    async fn close(&self) -> Result<()> {
        let mut state = lock(&self.shared);
        if state.failing_channel_closes {
            return Err(BrokerError::Disconnected);
        }
        close_channel(&self.shared, &mut state, self.id, None);
        Ok(())
    }
}

struct MemoryAcknowledger {
    shared: Weak<Mutex<BrokerState>>,
    channel: u64,
    message_id: String,
}

impl MemoryAcknowledger {
    fn settle(&self, delivery_tag: u64, multiple: bool, kind: SettlementKind) -> Result<()> {
        let shared = self.shared.upgrade().ok_or(BrokerError::Disconnected)?;
        let mut state = lock(&shared);

        state.settlements.push(Settlement {
            channel: self.channel,
            delivery_tag,
            message_id: Some(self.message_id.clone()),
            kind,
        });

        let channel = match state.channels.get_mut(&self.channel) {
            Some(channel) if channel.open => channel,
            _ => return Err(BrokerError::ChannelClosed),
        };

        let tags: Vec<u64> = if multiple {
            channel.unacked.range(..=delivery_tag).map(|(tag, _)| *tag).collect()
        } else if channel.unacked.contains_key(&delivery_tag) {
            vec![delivery_tag]
        } else {
            Vec::new()
        };
        if tags.is_empty() {
            return Err(BrokerError::Transport(format!(
                "PRECONDITION_FAILED - unknown delivery tag {}",
                delivery_tag
            )));
        }

        let requeue = match kind {
            SettlementKind::Ack => false,
            SettlementKind::Reject { requeue } | SettlementKind::Nack { requeue } => requeue,
        };

        let settled: Vec<Unacked> = tags
            .iter()
            .filter_map(|tag| channel.unacked.remove(tag))
            .collect();

        let mut touched = Vec::new();
        for entry in settled {
            if let Some(queue) = state.queues.get_mut(&entry.queue) {
                if let Some(consumer) = queue
                    .consumers
                    .iter_mut()
                    .find(|c| c.channel == self.channel && c.tag == entry.consumer)
                {
                    consumer.in_flight = consumer.in_flight.saturating_sub(1);
                }
                if requeue {
                    queue.messages.push_front(StoredMessage {
                        publishing: entry.message.publishing,
                        redelivered: true,
                    });
                }
            }
            if !touched.contains(&entry.queue) {
                touched.push(entry.queue);
            }
        }

        for queue in touched {
            dispatch(&shared, &mut state, &queue);
        }
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcknowledger {
    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<()> {
        self.settle(delivery_tag, multiple, SettlementKind::Ack)
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.settle(delivery_tag, false, SettlementKind::Reject { requeue })
    }

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<()> {
        self.settle(delivery_tag, multiple, SettlementKind::Nack { requeue })
    }
}

fn route(state: &BrokerState, exchange: &str, routing_key: &str) -> Result<Vec<String>> {
    if exchange.is_empty() {
        return Ok(if state.queues.contains_key(routing_key) {
            vec![routing_key.to_string()]
        } else {
            Vec::new()
        });
    }

    let kind = state.exchanges.get(exchange).ok_or_else(|| {
        BrokerError::Transport(format!("NOT_FOUND - no exchange '{}'", exchange))
    })?;

    let mut targets: Vec<String> = Vec::new();
    for binding in state.bindings.iter().filter(|b| b.exchange == exchange) {
        let matched = match kind {
            ExchangeType::Direct => binding.routing_key == routing_key,
            ExchangeType::Fanout | ExchangeType::Headers => true,
            ExchangeType::Topic => topic_matches(&binding.routing_key, routing_key),
        };
        if matched && !targets.contains(&binding.queue) {
            targets.push(binding.queue.clone());
        }
    }
    Ok(targets)
}

/// AMQP topic matching: `*` is exactly one word, `#` is zero or more.
fn topic_matches(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(word), Some(part)) if word == part => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if key.is_empty() {
        Vec::new()
    } else {
        key.split('.').collect()
    };
    matches(&pattern, &key)
}

/// Hand waiting messages to consumers with spare prefetch capacity,
/// round-robin.
fn dispatch(shared: &Shared, state: &mut BrokerState, queue_name: &str) {
    let BrokerState {
        queues, channels, ..
    } = state;
    let Some(queue) = queues.get_mut(queue_name) else {
        return;
    };

    loop {
        queue.consumers.retain(|c| !c.tx.is_closed());
        if queue.messages.is_empty() || queue.consumers.is_empty() {
            return;
        }

        let count = queue.consumers.len();
        let chosen = (0..count)
            .map(|offset| (queue.cursor + offset) % count)
            .find(|&index| {
                let consumer = &queue.consumers[index];
                let prefetch = channels
                    .get(&consumer.channel)
                    .map_or(0, |c| c.prefetch as usize);
                prefetch == 0 || consumer.in_flight < prefetch
            });
        let Some(index) = chosen else {
            return;
        };

        let Some(message) = queue.messages.pop_front() else {
            return;
        };
        let consumer = &mut queue.consumers[index];
        let Some(channel) = channels.get_mut(&consumer.channel) else {
            queue.messages.push_front(message);
            queue.consumers.remove(index);
            continue;
        };

        channel.next_tag += 1;
        let tag = channel.next_tag;
        let acker = MemoryAcknowledger {
            shared: Arc::downgrade(shared),
            channel: consumer.channel,
            message_id: message.publishing.message_id.clone(),
        };
        let delivery = Delivery::new(
            message.publishing.message_id.clone(),
            message.publishing.content_type.clone(),
            message.publishing.body.clone(),
            consumer.tag.clone(),
            message.redelivered,
            AckHandle::new(tag, Arc::new(acker)),
        );

        if consumer.tx.unbounded_send(Ok(delivery)).is_err() {
            channel.next_tag -= 1;
            queue.messages.push_front(message);
            queue.consumers.remove(index);
            continue;
        }

        consumer.in_flight += 1;
        channel.unacked.insert(
            tag,
            Unacked {
                queue: queue_name.to_string(),
                consumer: consumer.tag.clone(),
                message,
            },
        );
        queue.cursor = (index + 1) % count;
    }
}

/// Close a channel. `reason` set means an unexpected closure that close
/// listeners hear about; `None` is a graceful close.
fn close_channel(shared: &Shared, state: &mut BrokerState, id: u64, reason: Option<&str>) {
    let unacked = match state.channels.get_mut(&id) {
        Some(channel) if channel.open => {
            channel.open = false;
            match reason {
                Some(reason) => channel.listeners.fail(reason),
                None => channel.listeners.finish(),
            }
            std::mem::take(&mut channel.unacked)
        }
        _ => return,
    };

    let mut touched: Vec<String> = Vec::new();
    for queue in state.queues.values_mut() {
        queue.consumers.retain(|c| c.channel != id);
    }
    // Oldest first so requeued messages keep their original order.
    for (_, entry) in unacked.into_iter().rev() {
        if let Some(queue) = state.queues.get_mut(&entry.queue) {
            queue.messages.push_front(StoredMessage {
                publishing: entry.message.publishing,
                redelivered: true,
            });
        }
        if !touched.contains(&entry.queue) {
            touched.push(entry.queue);
        }
    }
    for queue in touched {
        dispatch(shared, state, &queue);
    }
}

fn close_connection(shared: &Shared, state: &mut BrokerState, id: u64, reason: Option<&str>) {
    let channels = match state.connections.get_mut(&id) {
        Some(connection) if connection.open => {
            connection.open = false;
            match reason {
                Some(reason) => connection.listeners.fail(reason),
                None => connection.listeners.finish(),
            }
            connection.channels.clone()
        }
        _ => return,
    };
    for channel in channels {
        close_channel(shared, state, channel, reason);
    }
}
