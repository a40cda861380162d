use crate::broker::{BrokerChannel, Delivery, DeliveryStream};
use crate::connection::ConnectionState;
use crate::errors::PostmanResult;
use crate::handler::RequestProcessor;
use crate::hooks::Hooks;
use crate::messages::{Response, WireFormat};
use crate::registry::CorrelationRegistry;
use futures::StreamExt;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, PartialEq, Eq)]
enum LoopExit {
    Shutdown,
    StreamClosed,
}

/// Pulls deliveries until the stream ends or `shutdown` fires, handing each
/// one to `handle` in broker order.
async fn drive<F, FUT>(
    mut deliveries: DeliveryStream,
    shutdown: &CancellationToken,
    mut handle: F,
) -> LoopExit
where
    F: FnMut(Delivery) -> FUT,
    FUT: futures::Future<Output = ()>,
{
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => return LoopExit::Shutdown,
            next = deliveries.next() => next,
        };
        match next {
            Some(Ok(delivery)) => handle(delivery).await,
            Some(Err(err)) => error!("Delivery failure: {}", err),
            None => return LoopExit::StreamClosed,
        }
    }
}

/// Consumes the exclusive response queue (auto-ack) and wakes waiting callers.
#[derive(Debug, new)]
pub(crate) struct ResponseConsumer {
    hooks: Arc<Hooks>,
    registry: Arc<CorrelationRegistry>,
    state: Arc<RwLock<ConnectionState>>,
    shutdown: CancellationToken,
    /// Fired when the broker ends the response stream of a connected transport.
    disconnected: CancellationToken,
}

impl ResponseConsumer {
    pub fn spawn(self, deliveries: DeliveryStream) -> JoinHandle<()> {
        tokio::spawn(async move {
            debug!("Starting response consumer");
            let exit = drive(deliveries, &self.shutdown, |delivery| {
                self.handle(delivery)
            })
            .await;
            if exit == LoopExit::StreamClosed {
                self.on_stream_closed();
            }
            debug!("Response consumer stopped");
        })
    }

    async fn handle(&self, delivery: Delivery) {
        self.hooks.notify_response(delivery.body());
        if let Err(err) = self.process(delivery.body()) {
            error!("Response processing failure: {}", err);
        }
    }

    fn process(&self, body: &[u8]) -> PostmanResult<()> {
        let response = Response::from_wire(body)?;
        let id = response.request_id.clone();
        if !self.registry.complete(&id, response) {
            warn!("Dropping response for unknown request {}", id);
        }
        Ok(())
    }

    /// Broker-initiated end of the response stream tears the connection down.
    fn on_stream_closed(&self) {
        let was_connected = {
            let mut state = self.state.write();
            let was_connected = *state == ConnectionState::Connected;
            if was_connected {
                *state = ConnectionState::Closed;
            }
            was_connected
        };
        if was_connected {
            warn!("Response stream closed by broker");
            self.disconnected.cancel();
        }
        let swept = self.registry.close_all();
        if swept > 0 {
            debug!("Failed {} pending calls on disconnect", swept);
        }
    }
}

/// Consumes the shared request queue and acks every delivery once processed.
#[derive(Debug, new)]
pub(crate) struct RequestConsumer {
    channel: Arc<dyn BrokerChannel>,
    hooks: Arc<Hooks>,
    processor: Arc<RequestProcessor>,
    shutdown: CancellationToken,
}

impl RequestConsumer {
    pub fn spawn(self, deliveries: DeliveryStream) -> JoinHandle<()> {
        tokio::spawn(async move {
            debug!("Starting request consumer");
            drive(deliveries, &self.shutdown, |delivery| {
                self.handle(delivery)
            })
            .await;
            debug!("Request consumer stopped");
        })
    }

    async fn handle(&self, delivery: Delivery) {
        self.hooks.notify_request(delivery.body());
        if let Err(err) = self.processor.process(delivery.body()).await {
            error!("Request processing failure: {}", err);
        }
        // acked even on failure, redelivery of a poison message would loop
        if let Err(err) = self.channel.ack(*delivery.delivery_tag()).await {
            error!(
                "Failed to ack delivery {}: {}",
                delivery.delivery_tag(),
                err
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::broker::{Broker, ConsumeOptions};
    use crate::connection::pool::ChannelPool;
    use crate::connection::Publisher;
    use crate::errors::CallError;
    use crate::handler::handler_fn;
    use crate::messages::{Request, STATUS_OK};
    use crate::middleware::Middleware;
    use crate::topology::QueueDescriptor;
    use bytes::Bytes;
    use futures::stream;
    use std::time::Duration;
    use tokio::time::Instant;
    use tokio_test::*;

    fn later() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[tokio::test]
    async fn response_consumer_completes_calls_and_sweeps_on_stream_end() {
        // Given
        let registry = Arc::new(CorrelationRegistry::new());
        let state = Arc::new(RwLock::new(ConnectionState::Connected));
        let shutdown = CancellationToken::new();
        let answered = registry.register("X", later()).unwrap();
        let orphaned = registry.register("Y", later()).unwrap();
        let deliveries = stream::iter(vec![
            Ok(Delivery::new(Response::new("Z", STATUS_OK, "stray").to_wire(), 1)),
            Ok(Delivery::new(Bytes::from_static(&[0xff, 0xff]), 2)),
            Ok(Delivery::new(Response::new("X", STATUS_OK, "pong").to_wire(), 3)),
        ])
        .boxed();
        let disconnected = CancellationToken::new();
        let consumer = ResponseConsumer::new(
            Arc::new(Hooks::new()),
            registry.clone(),
            state.clone(),
            shutdown.clone(),
            disconnected.clone(),
        );

        // When
        assert_ok!(consumer.spawn(deliveries).await);

        // Then
        assert_eq!(Ok(Response::new("X", STATUS_OK, "pong")), answered.wait().await);
        assert_eq!(Err(CallError::ConnectionClosed), orphaned.wait().await);
        assert_eq!(ConnectionState::Closed, *state.read());
        assert!(disconnected.is_cancelled());
    }

    #[tokio::test]
    async fn shutdown_stops_response_consumer_without_sweep() {
        let registry = Arc::new(CorrelationRegistry::new());
        let state = Arc::new(RwLock::new(ConnectionState::Connected));
        let shutdown = CancellationToken::new();
        let _pending = registry.register("X", later()).unwrap();
        let disconnected = CancellationToken::new();
        let consumer = ResponseConsumer::new(
            Arc::new(Hooks::new()),
            registry.clone(),
            state.clone(),
            shutdown.clone(),
            disconnected.clone(),
        );

        shutdown.cancel();
        assert_ok!(consumer.spawn(stream::pending().boxed()).await);

        assert!(registry.contains("X"));
        assert_eq!(ConnectionState::Connected, *state.read());
        assert!(!disconnected.is_cancelled());
    }

    #[tokio::test]
    async fn request_consumer_acks_every_delivery() {
        // Given
        let broker = MemoryBroker::new();
        let channel = broker.connect().open_channel().await.unwrap();
        channel
            .declare_queue(&QueueDescriptor::request("foo"))
            .await
            .unwrap();
        let deliveries = channel
            .consume("postman.req.foo", ConsumeOptions::new(false, false))
            .await
            .unwrap();
        let publisher = Arc::new(Publisher::new(Arc::new(ChannelPool::new(broker.connect()))));
        let processor = Arc::new(RequestProcessor::new(
            Arc::new(handler_fn(|_: Request| async { Ok((200, Bytes::new())) })),
            Arc::new(Middleware::new()),
            publisher,
        ));
        let shutdown = CancellationToken::new();
        let consumer = RequestConsumer::new(
            channel.clone(),
            Arc::new(Hooks::new()),
            processor,
            shutdown.clone(),
        );
        let task = consumer.spawn(deliveries);

        // When
        channel
            .publish("postman.req.foo", b"garbage", &Default::default())
            .await
            .unwrap();
        channel
            .publish(
                "postman.req.foo",
                &Request::new("/", "GET", Bytes::new()).to_wire(),
                &Default::default(),
            )
            .await
            .unwrap();

        // Then
        for _ in 0..100 {
            if broker.acked("postman.req.foo") == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(2, broker.acked("postman.req.foo"));
        shutdown.cancel();
        assert_ok!(task.await);
    }
}
