use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{Future, FutureExt};
use parking_lot::RwLock;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use tokio::task::JoinHandle;

pub type Hook = Arc<dyn Fn(Bytes) -> BoxFuture<'static, ()> + Send + Sync>;

/// Observers of raw inbound deliveries. One hook per slot, setting a hook
/// replaces the previous one.
///
/// Every invocation runs as its own task so a slow observer never holds up
/// the consumer loop.
#[derive(Default)]
pub struct Hooks {
    on_new_request: RwLock<Option<Hook>>,
    on_new_response: RwLock<Option<Hook>>,
}

impl Hooks {
    pub fn new() -> Self {
        Hooks::default()
    }

    /// Called with the body of every delivery from the request queue.
    pub fn set_on_new_request<F, FUT>(&self, hook: F)
    where
        F: Fn(Bytes) -> FUT + Send + Sync + 'static,
        FUT: Future<Output = ()> + Send + 'static,
    {
        *self.on_new_request.write() = Some(boxed(hook));
    }

    /// Called with the body of every delivery from the response queue.
    pub fn set_on_new_response<F, FUT>(&self, hook: F)
    where
        F: Fn(Bytes) -> FUT + Send + Sync + 'static,
        FUT: Future<Output = ()> + Send + 'static,
    {
        *self.on_new_response.write() = Some(boxed(hook));
    }

    pub fn clear(&self) {
        *self.on_new_request.write() = None;
        *self.on_new_response.write() = None;
    }

    pub(crate) fn notify_request(&self, body: &Bytes) -> Option<JoinHandle<()>> {
        notify(&self.on_new_request, body)
    }

    pub(crate) fn notify_response(&self, body: &Bytes) -> Option<JoinHandle<()>> {
        notify(&self.on_new_response, body)
    }
}

impl Debug for Hooks {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("on_new_request", &self.on_new_request.read().is_some())
            .field("on_new_response", &self.on_new_response.read().is_some())
            .finish()
    }
}

fn boxed<F, FUT>(hook: F) -> Hook
where
    F: Fn(Bytes) -> FUT + Send + Sync + 'static,
    FUT: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |body| hook(body).boxed())
}

fn notify(slot: &RwLock<Option<Hook>>, body: &Bytes) -> Option<JoinHandle<()>> {
    let hook = slot.read().clone()?;
    let body = body.clone();
    Some(tokio::spawn(async move { hook(body).await }))
}
