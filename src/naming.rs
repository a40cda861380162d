use uuid::Uuid;

pub const REQUEST_QUEUE_PREFIX: &str = "postman.req.";
pub const RESPONSE_QUEUE_PREFIX: &str = "postman.resp.";

/// Name of the request queue shared by all instances of `service`.
pub fn request_queue_name<STR: AsRef<str>>(service: STR) -> String {
    format!("{}{}", REQUEST_QUEUE_PREFIX, service.as_ref())
}

/// Fresh name for an exclusive response queue. Unique per call.
pub fn response_queue_name() -> String {
    format!("{}{}", RESPONSE_QUEUE_PREFIX, Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn request_queue_depends_only_on_service() {
        assert_eq!("postman.req.foo", request_queue_name("foo"));
        assert_eq!(request_queue_name("foo"), request_queue_name(String::from("foo")));
        assert_ne!(request_queue_name("foo"), request_queue_name("bar"));
    }

    #[test]
    fn response_queues_are_distinct() {
        let names: HashSet<String> = (0..100).map(|_| response_queue_name()).collect();
        assert_eq!(100, names.len());
        assert!(names
            .iter()
            .all(|name| name.starts_with(RESPONSE_QUEUE_PREFIX)));
    }
}
