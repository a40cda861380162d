use crate::messages::{Request, Response};
use parking_lot::RwLock;
use std::fmt::{Debug, Formatter};

pub mod logger;

type RequestCallback = Box<dyn Fn(&Request) + Send + Sync>;
type ResponseCallback = Box<dyn Fn(&Response) + Send + Sync>;

/// Side-effect-only callbacks run on decoded incoming requests and outgoing
/// responses, in registration order.
#[derive(Default)]
pub struct Middleware {
    incoming_requests: RwLock<Vec<RequestCallback>>,
    outgoing_responses: RwLock<Vec<ResponseCallback>>,
}

impl Middleware {
    pub fn new() -> Self {
        Middleware::default()
    }

    pub fn register_incoming_request<F>(&self, callback: F)
    where
        F: Fn(&Request) + Send + Sync + 'static,
    {
        self.incoming_requests.write().push(Box::new(callback));
    }

    pub fn register_outgoing_response<F>(&self, callback: F)
    where
        F: Fn(&Response) + Send + Sync + 'static,
    {
        self.outgoing_responses.write().push(Box::new(callback));
    }

    pub(crate) fn run_incoming_request(&self, request: &Request) {
        for callback in self.incoming_requests.read().iter() {
            callback(request);
        }
    }

    pub(crate) fn run_outgoing_response(&self, response: &Response) {
        for callback in self.outgoing_responses.read().iter() {
            callback(response);
        }
    }
}

impl Debug for Middleware {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Middleware")
            .field("incoming_requests", &self.incoming_requests.read().len())
            .field("outgoing_responses", &self.outgoing_responses.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn callbacks_run_in_registration_order() {
        // Given
        let middleware = Middleware::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let seen = seen.clone();
            middleware.register_incoming_request(move |request| {
                seen.lock().push(format!("{}:{}", tag, request.endpoint))
            });
        }
        let seen_responses = seen.clone();
        middleware.register_outgoing_response(move |response| {
            seen_responses
                .lock()
                .push(format!("response:{}", response.status_code))
        });

        // When
        middleware.run_incoming_request(&Request::new("/ping", "GET", "x"));
        middleware.run_outgoing_response(&Response::new("id", 404, "x"));

        // Then
        assert_eq!(
            vec!["first:/ping", "second:/ping", "response:404"],
            *seen.lock()
        );
    }
}
