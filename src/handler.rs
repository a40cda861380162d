use crate::connection::Publisher;
use crate::errors::{HandlerError, PostmanResult};
use crate::messages::{Request, Response, WireFormat, STATUS_INTERNAL_ERROR};
use crate::middleware::Middleware;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Future;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

/// Status code and body of a response.
pub type HandlerResult = Result<(i32, Bytes), HandlerError>;

/// Business logic serving requests delivered from the service request queue.
#[async_trait]
pub trait RequestHandler: Debug + Send + Sync {
    async fn handle(&self, request: Request) -> HandlerResult;
}

/// Wraps an async closure as a [`RequestHandler`].
pub fn handler_fn<F, FUT>(handler: F) -> FnHandler<F>
where
    F: Fn(Request) -> FUT + Send + Sync + 'static,
    FUT: Future<Output = HandlerResult> + Send + 'static,
{
    FnHandler(handler)
}

pub struct FnHandler<F>(F);

impl<F> Debug for FnHandler<F> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("FnHandler")
    }
}

#[async_trait]
impl<F, FUT> RequestHandler for FnHandler<F>
where
    F: Fn(Request) -> FUT + Send + Sync + 'static,
    FUT: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, request: Request) -> HandlerResult {
        (self.0)(request).await
    }
}

/// Decodes inbound request, runs the handler and publishes the response to
/// the caller's `reply_to` queue.
#[derive(Debug, new)]
pub(crate) struct RequestProcessor {
    handler: Arc<dyn RequestHandler>,
    middleware: Arc<Middleware>,
    publisher: Arc<Publisher>,
}

impl RequestProcessor {
    pub async fn process(&self, body: &[u8]) -> PostmanResult<()> {
        let request = Request::from_wire(body)?;
        self.middleware.run_incoming_request(&request);
        let id = request.id.clone();
        let reply_to = request.reply_to.clone();
        let (status_code, body) = match self.handler.handle(request).await {
            Ok(res) => res,
            Err(err) => {
                error!("Handler failed for request {}: {}", id, err);
                (STATUS_INTERNAL_ERROR, Bytes::from(err.to_string()))
            }
        };
        if reply_to.is_empty() {
            debug!("Request {} has no reply_to, dropping response", id);
            return Ok(());
        }
        let response = Response::new(id, status_code, body);
        self.middleware.run_outgoing_response(&response);
        self.publisher.publish(&reply_to, &response.to_wire()).await
    }
}
