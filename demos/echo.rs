/**
# Besides of `postman` the example requires following dependencies:
tokio =  { version = "^1", features = ["macros", "rt-multi-thread"] }
log = "^0"
env_logger = "^0" # to print logs

Run against a local RabbitMQ: `cargo run --example echo [amqp uri]`
 */
use bytes::Bytes;
use log::{error, info};
use postman::middleware::logger;
use postman::stats::RequestCounter;
use postman::{handler_fn, Collaborators, ConfigBuilder, Request, Transport};
use std::sync::Arc;

type Error = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
pub async fn main() -> Result<(), Error> {
    env_logger::init();
    if let Err(err) = run().await {
        error!("Failure: {:?}", err);
        return Err(err);
    }
    Ok(())
}

async fn run() -> Result<(), Error> {
    let uri = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "amqp://127.0.0.1:5672/%2f".to_string());

    // Server
    let collaborators = Collaborators::default();
    logger::install(&collaborators.middleware);
    collaborators.hooks.set_on_new_request(|body| async move {
        info!("Request delivered ({} bytes)", body.len());
    });
    let config = ConfigBuilder::default()
        .uri(uri.clone())
        .service_name("echo")
        .build()?;
    let echo = handler_fn(|request: Request| async move { Ok((200, request.body)) });
    let server = Transport::connect(config, Arc::new(echo), collaborators).await?;

    // Client
    let counter = Arc::new(RequestCounter::new());
    let collaborators = Collaborators {
        stats: counter.clone(),
        ..Collaborators::default()
    };
    let config = ConfigBuilder::default()
        .uri(uri)
        .service_name("echo-client")
        .build()?;
    let refuse = handler_fn(|_: Request| async { Ok((404, Bytes::new())) });
    let client = Transport::connect(config, Arc::new(refuse), collaborators).await?;

    info!("Sending 3 requests");
    for i in 0..3 {
        let request = Request::new("/echo", "POST", format!("Ping {}!", i));
        match client.call("echo", request).await {
            Ok(response) => info!("Response: {:?}", response),
            Err(error) => info!("Fail: {:?}", error),
        }
    }
    info!("Requests in last minute: {:?}", counter.requests_last_minute());

    client.close().await?;
    server.close().await?;
    Ok(())
}
