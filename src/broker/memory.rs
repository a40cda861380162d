//! In-process broker with AMQP-like queue semantics.
//!
//! Mirrors what the transport relies on from a real broker: durable, exclusive
//! and auto-delete flags, exclusive queues deleted with their owning connection,
//! round-robin delivery across consumers of a shared queue, explicit acks and
//! requeueing of unacked deliveries when a consumer goes away. Publishing to a
//! missing queue is silently dropped like a non-mandatory publish.
//!
//! Used for tests and local development; one [`MemoryBroker`] plays the server,
//! each [`MemoryBroker::connect`] call gives a new client connection.

use crate::broker::{Broker, BrokerChannel, ConsumeOptions, Delivery, DeliveryStream, PublishOptions};
use crate::errors::{PostmanError, PostmanResult};
use crate::topology::QueueDescriptor;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_stream::wrappers::UnboundedReceiverStream;

type ConnectionId = u64;
type ChannelId = u64;

#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        MemoryBroker::default()
    }

    /// Opens a new client connection.
    pub fn connect(&self) -> Arc<MemoryConnection> {
        let id = self.state.lock().next_id();
        debug!("Memory broker: connection {} opened", id);
        Arc::new(MemoryConnection {
            id,
            state: self.state.clone(),
            open: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.state.lock().queues.contains_key(name)
    }

    /// Number of explicitly acked deliveries of queue `name`.
    pub fn acked(&self, name: &str) -> usize {
        self.state.lock().queues.get(name).map_or(0, |queue| queue.acked)
    }

    /// Number of messages waiting in queue `name` for a consumer.
    pub fn ready(&self, name: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(name)
            .map_or(0, |queue| queue.messages.len())
    }

    /// Deletes queue `name` as an administrator would. Its consumers are cancelled.
    pub fn delete_queue(&self, name: &str) -> bool {
        self.state.lock().queues.remove(name).is_some()
    }

    pub fn consumers(&self, name: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(name)
            .map_or(0, |queue| queue.consumers.len())
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    next_id: u64,
    queues: HashMap<String, MemoryQueue>,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Delivery tags share the id sequence.
    fn deliver(&mut self, name: &str) {
        let mut next_tag = self.next_id;
        if let Some(queue) = self.queues.get_mut(name) {
            queue.deliver(&mut next_tag);
        }
        self.next_id = next_tag;
    }

    /// Drops consumers matching `predicate`, requeues their unacked messages
    /// and deletes queues that lost their owner or their last consumer.
    fn remove_consumers<P: Fn(&MemoryConsumer) -> bool>(
        &mut self,
        predicate: P,
        closed_connection: Option<ConnectionId>,
    ) {
        let mut to_delete = Vec::new();
        let mut to_deliver = Vec::new();
        for (name, queue) in self.queues.iter_mut() {
            let removed: Vec<MemoryConsumer> = queue
                .consumers
                .iter()
                .filter(|consumer| predicate(consumer))
                .cloned()
                .collect();
            if !removed.is_empty() {
                queue.consumers.retain(|consumer| !predicate(consumer));
                queue.requeue(&removed);
                to_deliver.push(name.clone());
            }
            let owner_gone = closed_connection.is_some() && queue.owner == closed_connection;
            let unused = *queue.descriptor.auto_delete()
                && !removed.is_empty()
                && queue.consumers.is_empty();
            if owner_gone || unused {
                to_delete.push(name.clone());
            }
        }
        for name in to_delete {
            debug!("Memory broker: deleting queue {}", name);
            self.queues.remove(&name);
        }
        for name in to_deliver {
            self.deliver(&name);
        }
    }
}

#[derive(Debug)]
struct MemoryQueue {
    descriptor: QueueDescriptor,
    owner: Option<ConnectionId>,
    messages: VecDeque<Bytes>,
    consumers: Vec<MemoryConsumer>,
    next_consumer: usize,
    unacked: HashMap<u64, (ChannelId, Bytes)>,
    acked: usize,
}

impl MemoryQueue {
    fn new(descriptor: QueueDescriptor, owner: Option<ConnectionId>) -> Self {
        MemoryQueue {
            descriptor,
            owner,
            messages: VecDeque::new(),
            consumers: Vec::new(),
            next_consumer: 0,
            unacked: HashMap::new(),
            acked: 0,
        }
    }

    fn deliver(&mut self, next_tag: &mut u64) {
        while !self.messages.is_empty() && !self.consumers.is_empty() {
            let index = self.next_consumer % self.consumers.len();
            let consumer = self.consumers[index].clone();
            let body = match self.messages.pop_front() {
                Some(body) => body,
                None => break,
            };
            *next_tag += 1;
            let tag = *next_tag;
            if consumer
                .sender
                .send(Ok(Delivery::new(body.clone(), tag)))
                .is_err()
            {
                // receiver dropped, consumer is gone
                self.consumers.remove(index);
                self.messages.push_front(body);
                continue;
            }
            if !consumer.auto_ack {
                self.unacked.insert(tag, (consumer.channel_id, body));
            }
            self.next_consumer = index + 1;
        }
    }

    fn requeue(&mut self, removed: &[MemoryConsumer]) {
        let channels: Vec<ChannelId> = removed.iter().map(|consumer| consumer.channel_id).collect();
        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, (channel_id, _))| channels.contains(channel_id))
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable();
        for tag in tags.into_iter().rev() {
            if let Some((_, body)) = self.unacked.remove(&tag) {
                self.messages.push_front(body);
            }
        }
    }
}

#[derive(Debug, Clone)]
struct MemoryConsumer {
    connection_id: ConnectionId,
    channel_id: ChannelId,
    auto_ack: bool,
    exclusive: bool,
    sender: UnboundedSender<PostmanResult<Delivery>>,
}

/// Client connection to a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemoryConnection {
    id: ConnectionId,
    state: Arc<Mutex<BrokerState>>,
    open: Arc<AtomicBool>,
}

impl MemoryConnection {
    /// Drops the connection from the broker side, as on a network failure.
    pub fn sever(&self) {
        warn!("Memory broker: severing connection {}", self.id);
        self.shutdown();
    }

    fn shutdown(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        let id = self.id;
        self.state
            .lock()
            .remove_consumers(|consumer| consumer.connection_id == id, Some(id));
    }
}

#[async_trait]
impl Broker for MemoryConnection {
    async fn open_channel(&self) -> PostmanResult<Arc<dyn BrokerChannel>> {
        if !self.is_connected() {
            return Err(PostmanError::BrokerUnreachable(format!(
                "Connection {} is closed",
                self.id
            )));
        }
        let id = self.state.lock().next_id();
        Ok(Arc::new(MemoryChannel {
            id,
            connection_id: self.id,
            connection_open: self.open.clone(),
            open: AtomicBool::new(true),
            state: self.state.clone(),
        }))
    }

    fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> PostmanResult<()> {
        debug!("Memory broker: connection {} closed", self.id);
        self.shutdown();
        Ok(())
    }
}

#[derive(Debug)]
pub struct MemoryChannel {
    id: ChannelId,
    connection_id: ConnectionId,
    connection_open: Arc<AtomicBool>,
    open: AtomicBool,
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryChannel {
    fn check_open(&self) -> PostmanResult<()> {
        if !self.connection_open.load(Ordering::SeqCst) {
            return Err(PostmanError::BrokerUnreachable(format!(
                "Connection {} is closed",
                self.connection_id
            )));
        }
        if !self.open.load(Ordering::SeqCst) {
            return Err(PostmanError::BrokerUnreachable(format!(
                "Channel {} is closed",
                self.id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_queue(&self, queue: &QueueDescriptor) -> PostmanResult<()> {
        self.check_open()?;
        let mut state = self.state.lock();
        match state.queues.get(queue.name()) {
            Some(existing) => {
                if *existing.descriptor.exclusive() && existing.owner != Some(self.connection_id)
                {
                    return Err(PostmanError::TopologyError(format!(
                        "Queue '{}' is locked by another connection",
                        queue.name()
                    )));
                }
                if existing.descriptor != *queue {
                    return Err(PostmanError::TopologyError(format!(
                        "Queue '{}' declared with different flags",
                        queue.name()
                    )));
                }
                Ok(())
            }
            None => {
                let owner = Some(self.connection_id).filter(|_| *queue.exclusive());
                state.queues.insert(
                    queue.name().clone(),
                    MemoryQueue::new(queue.clone(), owner),
                );
                Ok(())
            }
        }
    }

    /// Like a passive declare on a real broker, a missing queue or another
    /// connection's exclusive queue is a channel error that closes the channel.
    async fn queue_exists(&self, name: &str) -> PostmanResult<bool> {
        self.check_open()?;
        let (exists, soft_error) = match self.state.lock().queues.get(name) {
            Some(queue) => (
                true,
                *queue.descriptor.exclusive() && queue.owner != Some(self.connection_id),
            ),
            None => (false, true),
        };
        if soft_error {
            debug!("Memory broker: channel {} closed by passive declare of '{}'", self.id, name);
            self.close().await?;
        }
        Ok(exists)
    }

    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> PostmanResult<DeliveryStream> {
        self.check_open()?;
        let mut state = self.state.lock();
        let memory_queue = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| PostmanError::TopologyError(format!("No queue '{}'", queue)))?;
        if memory_queue.consumers.iter().any(|consumer| consumer.exclusive)
            || (options.exclusive && !memory_queue.consumers.is_empty())
        {
            return Err(PostmanError::TopologyError(format!(
                "Queue '{}' has an exclusive consumer",
                queue
            )));
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        memory_queue.consumers.push(MemoryConsumer {
            connection_id: self.connection_id,
            channel_id: self.id,
            auto_ack: options.auto_ack,
            exclusive: options.exclusive,
            sender,
        });
        state.deliver(queue);
        Ok(UnboundedReceiverStream::new(receiver).boxed())
    }

    async fn publish(
        &self,
        routing_key: &str,
        payload: &[u8],
        _options: &PublishOptions,
    ) -> PostmanResult<()> {
        self.check_open()?;
        let mut state = self.state.lock();
        match state.queues.get_mut(routing_key) {
            Some(queue) => queue.messages.push_back(Bytes::copy_from_slice(payload)),
            None => {
                trace!("Memory broker: dropping message for '{}'", routing_key);
                return Ok(());
            }
        }
        state.deliver(routing_key);
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> PostmanResult<()> {
        self.check_open()?;
        let mut state = self.state.lock();
        for queue in state.queues.values_mut() {
            if let Some((channel_id, _)) = queue.unacked.get(&delivery_tag) {
                if *channel_id != self.id {
                    break;
                }
                queue.unacked.remove(&delivery_tag);
                queue.acked += 1;
                return Ok(());
            }
        }
        Err(PostmanError::TopologyError(format!(
            "Unknown delivery tag {}",
            delivery_tag
        )))
    }

    async fn close(&self) -> PostmanResult<()> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let channel_id = self.id;
        self.state
            .lock()
            .remove_consumers(|consumer| consumer.channel_id == channel_id, None);
        Ok(())
    }
}
