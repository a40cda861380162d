use crate::broker::PublishOptions;
use crate::connection::pool::ChannelPool;
use crate::errors::PostmanResult;
use std::fmt::Debug;
use std::sync::Arc;
use strum_macros::Display;

pub mod pool;

/// Lifecycle of the broker connection owned by a [`Transport`](crate::Transport).
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Closed,
}

/// Publishes payloads straight to destination queues through the default exchange.
#[derive(Debug, new)]
pub struct Publisher {
    pool: Arc<ChannelPool>,
    #[new(default)]
    options: PublishOptions,
}

impl Publisher {
    pub async fn publish(&self, destination: &str, payload: &[u8]) -> PostmanResult<()> {
        let channel = self.pool.channel_for(destination).await?;
        trace!("Publishing {} bytes to '{}'", payload.len(), destination);
        channel.publish(destination, payload, &self.options).await
    }

    pub fn pool(&self) -> &Arc<ChannelPool> {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::broker::{Broker, ConsumeOptions};
    use crate::errors::PostmanError;
    use crate::topology::QueueDescriptor;
    use futures::StreamExt;

    #[tokio::test]
    async fn publishes_to_existing_queue() {
        // Given
        let broker = MemoryBroker::new();
        let consumer = broker.connect().open_channel().await.unwrap();
        consumer
            .declare_queue(&QueueDescriptor::request("foo"))
            .await
            .unwrap();
        let mut deliveries = consumer
            .consume("postman.req.foo", ConsumeOptions::new(true, false))
            .await
            .unwrap();
        let publisher = Publisher::new(Arc::new(ChannelPool::new(broker.connect())));

        // When
        let res = publisher.publish("postman.req.foo", b"hello").await;

        // Then
        assert_eq!(Ok(()), res);
        let delivery = deliveries.next().await.unwrap().unwrap();
        assert_eq!(&b"hello"[..], delivery.body().as_ref());
    }

    #[tokio::test]
    async fn refuses_unknown_destination() {
        let broker = MemoryBroker::new();
        let publisher = Publisher::new(Arc::new(ChannelPool::new(broker.connect())));

        let res = publisher.publish("postman.resp.missing", b"x").await;

        assert_eq!(
            Err(PostmanError::UnknownDestination("postman.resp.missing".to_string())),
            res
        );
        assert!(!publisher.pool().contains("postman.resp.missing").await);
    }
}
