use crate::broker::BrokerChannel;
use crate::errors::PostmanResult;
use crate::naming::request_queue_name;

/// Queue name with the flags it gets declared with.
#[derive(Debug, Clone, PartialEq, Eq, Getters, new)]
pub struct QueueDescriptor {
    #[get = "pub"]
    name: String,
    #[get = "pub"]
    durable: bool,
    #[get = "pub"]
    exclusive: bool,
    #[get = "pub"]
    auto_delete: bool,
}

impl QueueDescriptor {
    /// Shared request queue. Every instance of `service` declares the same one.
    pub fn request<STR: AsRef<str>>(service: STR) -> Self {
        QueueDescriptor::new(request_queue_name(service), true, false, true)
    }

    /// Response queue owned by a single connection.
    pub fn response<STR: Into<String>>(name: STR) -> Self {
        QueueDescriptor::new(name.into(), true, true, true)
    }
}

pub(crate) async fn declare_response_queue(
    channel: &dyn BrokerChannel,
    name: &str,
) -> PostmanResult<QueueDescriptor> {
    let queue = QueueDescriptor::response(name);
    debug!("Declaring response queue {}", queue.name());
    channel.declare_queue(&queue).await?;
    Ok(queue)
}

pub(crate) async fn declare_request_queue(
    channel: &dyn BrokerChannel,
    service: &str,
) -> PostmanResult<QueueDescriptor> {
    let queue = QueueDescriptor::request(service);
    debug!("Declaring request queue {}", queue.name());
    channel.declare_queue(&queue).await?;
    Ok(queue)
}
