use crate::middleware::Middleware;

/// Logs incoming requests and outgoing responses at debug level.
pub fn install(middleware: &Middleware) {
    middleware.register_incoming_request(|request| {
        debug!(
            "Incoming request (endpoint: '{}', method: '{}', request_id: {})",
            request.endpoint, request.method, request.id
        )
    });
    middleware.register_outgoing_response(|response| {
        debug!(
            "Outgoing response (status_code: {}, request_id: {})",
            response.status_code, response.request_id
        )
    });
}
