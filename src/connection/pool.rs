use crate::broker::{Broker, BrokerChannel};
use crate::errors::{PostmanError, PostmanResult};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::RwLock;

type ChannelRef = Arc<dyn BrokerChannel>;

/// Publishing channels cached by destination queue name.
#[derive(Debug, new)]
pub struct ChannelPool {
    broker: Arc<dyn Broker>,
    #[new(default)]
    channels: RwLock<HashMap<String, ChannelRef>>,
}

impl ChannelPool {
    /// Returns cached channel for `destination` or opens a new one once the
    /// destination queue is known to exist.
    pub async fn channel_for(&self, destination: &str) -> PostmanResult<ChannelRef> {
        if let Some(channel) = self.channels.read().await.get(destination) {
            return Ok(channel.clone());
        }
        self.create_channel(destination).await
    }

    pub async fn contains(&self, destination: &str) -> bool {
        self.channels.read().await.contains_key(destination)
    }

    pub async fn len(&self) -> usize {
        self.channels.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.channels.read().await.is_empty()
    }

    async fn create_channel(&self, destination: &str) -> PostmanResult<ChannelRef> {
        debug!("Creating publishing channel for '{}'", destination);
        self.check_destination(destination).await?;
        let channel = self.broker.open_channel().await?;
        let mut channels = self.channels.write().await;
        if let Some(existing) = channels.get(destination) {
            let existing = existing.clone();
            drop(channels);
            debug!("Channel for '{}' created concurrently", destination);
            discard(&channel).await;
            return Ok(existing);
        }
        channels.insert(destination.to_string(), channel.clone());
        Ok(channel)
    }

    /// Checks `destination` on a throwaway channel, the broker may close it
    /// while answering a passive declare.
    async fn check_destination(&self, destination: &str) -> PostmanResult<()> {
        let inspect = self.broker.open_channel().await?;
        let res = inspect.queue_exists(destination).await;
        discard(&inspect).await;
        match res? {
            true => Ok(()),
            false => Err(PostmanError::UnknownDestination(destination.to_string())),
        }
    }
}

async fn discard(channel: &ChannelRef) {
    if let Err(err) = channel.close().await {
        warn!("Failed to close discarded channel: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::broker::{ConsumeOptions, PublishOptions};
    use crate::topology::QueueDescriptor;
    use futures::StreamExt;

    async fn pool_with_queue(queue: &str) -> (MemoryBroker, Arc<ChannelPool>) {
        let broker = MemoryBroker::new();
        let connection = broker.connect();
        let channel = connection.open_channel().await.unwrap();
        channel
            .declare_queue(&QueueDescriptor::request(queue))
            .await
            .unwrap();
        (broker, Arc::new(ChannelPool::new(connection)))
    }

    #[tokio::test]
    async fn same_channel_is_returned_for_a_destination() {
        // Given
        let (_broker, pool) = pool_with_queue("foo").await;

        // When
        let first = pool.channel_for("postman.req.foo").await.unwrap();
        let second = pool.channel_for("postman.req.foo").await.unwrap();

        // Then
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(1, pool.len().await);
    }

    #[tokio::test]
    async fn unknown_destination_is_not_cached() {
        // Given
        let (_broker, pool) = pool_with_queue("foo").await;

        // When
        let res = pool.channel_for("postman.resp.missing").await;

        // Then
        assert_eq!(
            PostmanError::UnknownDestination("postman.resp.missing".to_string()),
            res.unwrap_err()
        );
        assert!(!pool.contains("postman.resp.missing").await);
        assert!(pool.is_empty().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_one_channel() {
        // Given
        let (_broker, pool) = pool_with_queue("foo").await;

        // When
        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.channel_for("postman.req.foo").await })
            })
            .collect();
        let mut channels = Vec::new();
        for task in tasks {
            channels.push(task.await.unwrap().unwrap());
        }

        // Then
        assert_eq!(1, pool.len().await);
        let cached = pool.channel_for("postman.req.foo").await.unwrap();
        assert!(channels.iter().all(|channel| Arc::ptr_eq(channel, &cached)));
    }

    #[tokio::test]
    async fn publishes_to_exclusive_queue_of_another_connection() {
        // Given
        let broker = MemoryBroker::new();
        let owner = broker.connect().open_channel().await.unwrap();
        owner
            .declare_queue(&QueueDescriptor::response("postman.resp.A"))
            .await
            .unwrap();
        let mut responses = owner
            .consume("postman.resp.A", ConsumeOptions::new(true, true))
            .await
            .unwrap();
        let pool = ChannelPool::new(broker.connect());

        // When
        let channel = pool.channel_for("postman.resp.A").await.unwrap();
        let first = channel
            .publish("postman.resp.A", b"first", &PublishOptions::default())
            .await;
        let cached = pool.channel_for("postman.resp.A").await.unwrap();
        let second = cached
            .publish("postman.resp.A", b"second", &PublishOptions::default())
            .await;

        // Then
        assert_eq!(Ok(()), first);
        assert_eq!(Ok(()), second);
        let delivery = responses.next().await.unwrap().unwrap();
        assert_eq!(&b"first"[..], delivery.body().as_ref());
        let delivery = responses.next().await.unwrap().unwrap();
        assert_eq!(&b"second"[..], delivery.body().as_ref());
    }
}
