//! Postman is a request/response RPC transport over an AMQP message broker.
//!
//! ## Overview
//!
//! Every service instance connected with a [`Transport`]:
//!
//! * owns an exclusive, auto-deleted response queue `postman.resp.<uuid>`,
//! * consumes the request queue `postman.req.<service>` shared by all instances of its service,
//! * correlates responses with outstanding calls by request id,
//! * fails outstanding calls with a timeout, on cancellation or when the broker connection drops.
//!
//! Messages are length-delimited protobuf ([`Request`], [`Response`]).
//! Deliveries can be observed with [`Hooks`] and inspected with [`Middleware`].
//!
//! Besides the AMQP broker (`amqp` feature, enabled by default) an in-process
//! [`MemoryBroker`](broker::memory::MemoryBroker) is provided for tests and local development.
//!
//! ### Disclaimer
//!
//! > Requests are delivered at most once to a handler and responses are not retried.
//! > Future [0.0.x releases may include API breaking changes](https://doc.rust-lang.org/cargo/reference/specifying-dependencies.html#caret-requirements).
//!
//! ## Examples
//!
//! ```
//! use bytes::Bytes;
//! use postman::broker::memory::MemoryBroker;
//! use postman::{handler_fn, Collaborators, ConfigBuilder, PostmanResult, Request, Transport};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> PostmanResult<()> {
//!     let broker = MemoryBroker::new();
//!
//!     // Server
//!     let handler = handler_fn(|request: Request| async move {
//!         Ok((200, Bytes::from(format!("Hello {}", request.method))))
//!     });
//!     let config = ConfigBuilder::default().service_name("greeter").build().unwrap();
//!     let server = Transport::connect_with(broker.connect(), config, Arc::new(handler), Collaborators::default()).await?;
//!
//!     // Client
//!     let client_handler = handler_fn(|_: Request| async { Ok((404, Bytes::new())) });
//!     let config = ConfigBuilder::default().service_name("client").build().unwrap();
//!     let client = Transport::connect_with(broker.connect(), config, Arc::new(client_handler), Collaborators::default()).await?;
//!     let response = client.call("greeter", Request::new("/greet", "world", Bytes::new())).await?;
//!
//!     client.close().await?;
//!     server.close().await?;
//!
//!     assert_eq!(200, response.status_code);
//!     assert_eq!("Hello world".as_bytes(), response.body.as_ref());
//!     Ok(())
//! }
//! ```

#[macro_use]
extern crate getset;
#[macro_use]
extern crate derive_builder;
#[macro_use]
extern crate derive_new;
#[macro_use]
extern crate log;

pub(crate) mod config;
pub(crate) mod dispatcher;
pub(crate) mod transport;

/// Broker abstraction with AMQP and in-memory implementations.
pub mod broker;
/// Channel pool and publisher of outbound messages.
pub mod connection;
/// Postman errors.
pub mod errors;
/// Handlers called with requests consumed from the service request queue.
pub mod handler;
/// Observers of raw deliveries.
pub mod hooks;
/// Messages exchanged between [`Transport`]s.
pub mod messages;
/// Callbacks inspecting decoded requests and responses.
pub mod middleware;
pub mod naming;
/// Outstanding calls awaiting responses.
pub mod registry;
pub mod stats;
/// Queue declarations.
pub mod topology;

pub use self::transport::Collaborators;
pub use self::transport::Transport;
pub use config::Config;
pub use config::ConfigBuilder;
pub use connection::ConnectionState;
pub use errors::{CallError, PostmanError, PostmanResult};
pub use handler::{handler_fn, HandlerResult, RequestHandler};
pub use hooks::Hooks;
pub use messages::{Request, Response, WireFormat};
pub use middleware::Middleware;
