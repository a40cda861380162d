use crate::errors::PostmanResult;
use crate::topology::QueueDescriptor;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::fmt::Debug;
use std::sync::Arc;

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

pub type DeliveryStream = BoxStream<'static, PostmanResult<Delivery>>;

/// A single message handed to a consumer.
#[derive(Debug, Clone, Getters, new)]
pub struct Delivery {
    #[get = "pub"]
    body: Bytes,
    /// Tag used to acknowledge the delivery on the channel it came from.
    #[get = "pub"]
    delivery_tag: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, new)]
pub struct ConsumeOptions {
    pub auto_ack: bool,
    pub exclusive: bool,
}

/// Properties of a direct-to-queue publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOptions {
    pub exchange: String,
    pub mandatory: bool,
    pub immediate: bool,
    pub content_type: String,
    pub persistent: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        PublishOptions {
            exchange: String::new(),
            mandatory: false,
            immediate: false,
            content_type: "application/octet-stream".to_string(),
            persistent: true,
        }
    }
}

/// Connection to a message broker.
#[async_trait]
pub trait Broker: Debug + Send + Sync {
    async fn open_channel(&self) -> PostmanResult<Arc<dyn BrokerChannel>>;

    fn is_connected(&self) -> bool;

    /// Closes the connection together with all its channels.
    async fn close(&self) -> PostmanResult<()>;
}

/// Broker channel. Implementations serialize concurrent calls internally.
#[async_trait]
pub trait BrokerChannel: Debug + Send + Sync {
    async fn declare_queue(&self, queue: &QueueDescriptor) -> PostmanResult<()>;

    /// Passive check whether queue `name` exists.
    async fn queue_exists(&self, name: &str) -> PostmanResult<bool>;

    async fn consume(&self, queue: &str, options: ConsumeOptions)
        -> PostmanResult<DeliveryStream>;

    /// Publishes `payload` with `routing_key` through `options.exchange`.
    async fn publish(
        &self,
        routing_key: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> PostmanResult<()>;

    /// Acks a single delivery.
    async fn ack(&self, delivery_tag: u64) -> PostmanResult<()>;

    async fn close(&self) -> PostmanResult<()>;
}
