use crate::broker::{Broker, BrokerChannel, ConsumeOptions};
use crate::config::Config;
use crate::connection::pool::ChannelPool;
use crate::connection::{ConnectionState, Publisher};
use crate::dispatcher::{RequestConsumer, ResponseConsumer};
use crate::errors::{CallError, PostmanError, PostmanResult};
use crate::handler::{RequestHandler, RequestProcessor};
use crate::hooks::Hooks;
use crate::messages::{Request, Response, WireFormat};
use crate::middleware::Middleware;
use crate::naming::{request_queue_name, response_queue_name};
use crate::registry::{CorrelationRegistry, PendingReply, Reaper};
use crate::stats::{NoopStats, StatsSink};
use crate::topology::{declare_request_queue, declare_response_queue};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Collaborators shared between the transport and its background tasks.
#[derive(Debug, Clone)]
pub struct Collaborators {
    pub hooks: Arc<Hooks>,
    pub middleware: Arc<Middleware>,
    pub stats: Arc<dyn StatsSink>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Collaborators {
            hooks: Arc::new(Hooks::new()),
            middleware: Arc::new(Middleware::new()),
            stats: Arc::new(NoopStats),
        }
    }
}

/// Broker connection of a single service instance.
///
/// Owns the exclusive response queue, consumes the shared request queue of
/// its service and correlates responses with outstanding calls.
#[derive(Debug, Getters)]
pub struct Transport {
    #[get = "pub"]
    service_name: String,
    /// `reply_to` of every request sent by this instance.
    #[get = "pub"]
    response_queue: String,
    #[get = "pub"]
    request_queue: String,
    resources: Arc<Resources>,
    publisher: Arc<Publisher>,
    #[get = "pub"]
    registry: Arc<CorrelationRegistry>,
    #[get = "pub"]
    hooks: Arc<Hooks>,
    #[get = "pub"]
    middleware: Arc<Middleware>,
    stats: Arc<dyn StatsSink>,
    state: Arc<RwLock<ConnectionState>>,
    shutdown: CancellationToken,
    call_timeout: Duration,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

/// Broker connection, consumer channels and the tasks reading from them.
#[derive(Debug)]
struct Resources {
    broker: Arc<dyn Broker>,
    response_channel: Arc<dyn BrokerChannel>,
    request_channel: Arc<dyn BrokerChannel>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Resources {
    /// Waits for the background tasks to stop, so an in-flight request is
    /// acked on its channel, then closes both channels and the connection.
    /// Expects the tasks to be cancelled already.
    async fn release(&self) -> PostmanResult<()> {
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(err) = task.await {
                error!("Background task failure: {}", err);
            }
        }
        for channel in [&self.request_channel, &self.response_channel] {
            if let Err(err) = channel.close().await {
                warn!("Failed to close channel: {}", err);
            }
        }
        self.broker.close().await
    }

    /// Releases everything once the broker drops the response stream. Exits
    /// on `shutdown` when the transport is closed by its owner.
    fn watch(
        self: Arc<Self>,
        shutdown: CancellationToken,
        disconnected: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = disconnected.cancelled() => {
                    shutdown.cancel();
                    match self.release().await {
                        Ok(()) => debug!("Released broker resources after disconnect"),
                        Err(err) => warn!("Failed to release broker connection: {}", err),
                    }
                }
                _ = shutdown.cancelled() => {}
            }
        })
    }
}

impl Transport {
    /// Dials the AMQP broker at `config.uri` and starts serving `config.service_name`.
    #[cfg(feature = "amqp")]
    pub async fn connect(
        config: Config,
        handler: Arc<dyn RequestHandler>,
        collaborators: Collaborators,
    ) -> PostmanResult<Self> {
        let broker = crate::broker::amqp::AmqpBroker::dial(&config.uri).await?;
        Self::connect_with(Arc::new(broker), config, handler, collaborators).await
    }

    /// Sets up queues and consumers on an already open broker connection.
    ///
    /// Returns once both consumers are live. On failure the broker connection
    /// is closed before the error is returned.
    pub async fn connect_with(
        broker: Arc<dyn Broker>,
        config: Config,
        handler: Arc<dyn RequestHandler>,
        collaborators: Collaborators,
    ) -> PostmanResult<Self> {
        let state = Arc::new(RwLock::new(ConnectionState::Connecting));
        match Self::open(broker.clone(), config, handler, collaborators, state.clone()).await {
            Ok(transport) => {
                *state.write() = ConnectionState::Connected;
                info!(
                    "Connected service '{}' (response queue {})",
                    transport.service_name, transport.response_queue
                );
                Ok(transport)
            }
            Err(err) => {
                error!("Failed to connect: {}", err);
                *state.write() = ConnectionState::Closed;
                if let Err(close_err) = broker.close().await {
                    warn!("Failed to release broker connection: {}", close_err);
                }
                Err(err)
            }
        }
    }

    async fn open(
        broker: Arc<dyn Broker>,
        config: Config,
        handler: Arc<dyn RequestHandler>,
        collaborators: Collaborators,
        state: Arc<RwLock<ConnectionState>>,
    ) -> PostmanResult<Self> {
        let Collaborators {
            hooks,
            middleware,
            stats,
        } = collaborators;
        let shutdown = CancellationToken::new();
        let disconnected = CancellationToken::new();
        let registry = Arc::new(CorrelationRegistry::new());
        let pool = Arc::new(ChannelPool::new(broker.clone()));
        let publisher = Arc::new(Publisher::new(pool));

        let response_queue = response_queue_name();
        let response_channel = broker.open_channel().await?;
        declare_response_queue(response_channel.as_ref(), &response_queue).await?;
        let responses = response_channel
            .consume(&response_queue, ConsumeOptions::new(true, true))
            .await?;

        let request_channel = broker.open_channel().await?;
        let request_queue = declare_request_queue(request_channel.as_ref(), &config.service_name)
            .await?
            .name()
            .clone();
        let requests = request_channel
            .consume(&request_queue, ConsumeOptions::new(false, false))
            .await?;

        let response_consumer = ResponseConsumer::new(
            hooks.clone(),
            registry.clone(),
            state.clone(),
            shutdown.clone(),
            disconnected.clone(),
        );
        let processor = Arc::new(RequestProcessor::new(
            handler,
            middleware.clone(),
            publisher.clone(),
        ));
        let request_consumer = RequestConsumer::new(
            request_channel.clone(),
            hooks.clone(),
            processor,
            shutdown.clone(),
        );
        let tasks = vec![
            response_consumer.spawn(responses),
            request_consumer.spawn(requests),
            Reaper::spawn(registry.clone(), config.reaper_interval, shutdown.clone()),
        ];

        let resources = Arc::new(Resources {
            broker,
            response_channel,
            request_channel,
            tasks: Mutex::new(tasks),
        });
        let watchdog = resources.clone().watch(shutdown.clone(), disconnected);

        Ok(Transport {
            service_name: config.service_name,
            response_queue,
            request_queue,
            resources,
            publisher,
            registry,
            hooks,
            middleware,
            stats,
            state,
            shutdown,
            call_timeout: config.call_timeout,
            watchdog: Mutex::new(Some(watchdog)),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected && self.resources.broker.is_connected()
    }

    /// Sends `request` to `service` and waits for the response up to the
    /// configured call timeout.
    pub async fn call<STR: AsRef<str>>(
        &self,
        service: STR,
        request: Request,
    ) -> PostmanResult<Response> {
        self.call_with_timeout(service, request, self.call_timeout)
            .await
    }

    pub async fn call_with_timeout<STR: AsRef<str>>(
        &self,
        service: STR,
        request: Request,
        timeout: Duration,
    ) -> PostmanResult<Response> {
        let reply = self.start_call(service, request, timeout).await?;
        Ok(reply.wait().await?)
    }

    /// Publishes `request` and returns the pending reply without waiting for it.
    /// The reply can be cancelled with [`Transport::cancel`] using its id.
    pub async fn start_call<STR: AsRef<str>>(
        &self,
        service: STR,
        mut request: Request,
        timeout: Duration,
    ) -> PostmanResult<PendingReply> {
        if self.state() != ConnectionState::Connected {
            return Err(PostmanError::Call(CallError::ConnectionClosed));
        }
        request.reply_to = self.response_queue.clone();
        let destination = request_queue_name(service.as_ref());
        let reply = self
            .registry
            .register(request.id.clone(), Instant::now() + timeout)?;
        debug!("Sending request {} to '{}'", request.id, destination);
        if let Err(err) = self.publisher.publish(&destination, &request.to_wire()).await {
            self.registry.cancel(reply.id());
            return Err(err);
        }
        self.stats.record_request(service.as_ref(), SystemTime::now());
        Ok(reply)
    }

    /// Cancels the pending call `id`. Returns `false` if it already finished.
    pub fn cancel(&self, id: &str) -> bool {
        self.registry.cancel(id)
    }

    /// Publishes raw `payload` to `destination` queue.
    pub async fn publish(&self, destination: &str, payload: &[u8]) -> PostmanResult<()> {
        self.publisher.publish(destination, payload).await
    }

    pub fn channel_pool(&self) -> &Arc<ChannelPool> {
        self.publisher.pool()
    }

    /// Stops consumers, fails pending calls with [`CallError::ConnectionClosed`]
    /// and closes the broker connection. A request being handled is answered
    /// and acked first. No-op when already closed.
    pub async fn close(&self) -> PostmanResult<()> {
        let closing = {
            let mut state = self.state.write();
            match *state {
                ConnectionState::Closing | ConnectionState::Closed => false,
                _ => {
                    *state = ConnectionState::Closing;
                    true
                }
            }
        };
        if !closing {
            // after a broker-initiated disconnect the watchdog is releasing
            self.await_watchdog().await;
            return Ok(());
        }
        debug!("Closing transport of '{}'", self.service_name);
        self.shutdown.cancel();
        let swept = self.registry.close_all();
        if swept > 0 {
            debug!("Failed {} pending calls on close", swept);
        }
        let res = self.resources.release().await;
        self.await_watchdog().await;
        *self.state.write() = ConnectionState::Closed;
        res
    }

    async fn await_watchdog(&self) {
        let watchdog = self.watchdog.lock().take();
        if let Some(watchdog) = watchdog {
            if let Err(err) = watchdog.await {
                error!("Watchdog failure: {}", err);
            }
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
