use crate::broker::{Broker, BrokerChannel, ConsumeOptions, Delivery, DeliveryStream, PublishOptions};
use crate::errors::{PostmanError, PostmanResult};
use crate::topology::QueueDescriptor;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, QueueDeclareOptions,
};
use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::sync::Arc;

const REPLY_SUCCESS: u16 = 200;
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// AMQP 0-9-1 broker connection backed by `lapin`.
#[derive(Debug)]
pub struct AmqpBroker {
    connection: Connection,
}

impl AmqpBroker {
    pub async fn dial<STR: AsRef<str>>(uri: STR) -> PostmanResult<Self> {
        debug!("Connecting to AMQP broker");
        let connection = Connection::connect(uri.as_ref(), ConnectionProperties::default())
            .await
            .map_err(|err| {
                PostmanError::BrokerUnreachable(format!(
                    "Unable to connect to the AMQP server: {}",
                    err
                ))
            })?;
        connection.on_error(|err| error!("AMQP connection failure: {}", err));
        Ok(AmqpBroker { connection })
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn open_channel(&self) -> PostmanResult<Arc<dyn BrokerChannel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|err| PostmanError::BrokerUnreachable(err.to_string()))?;
        trace!("Opened channel {}", channel.id());
        Ok(Arc::new(AmqpChannel { channel }))
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    async fn close(&self) -> PostmanResult<()> {
        if !self.is_connected() {
            return Ok(());
        }
        self.connection
            .close(REPLY_SUCCESS, "Bye")
            .await
            .map_err(|err| PostmanError::BrokerUnreachable(err.to_string()))
    }
}

#[derive(Debug)]
pub struct AmqpChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_queue(&self, queue: &QueueDescriptor) -> PostmanResult<()> {
        let options = QueueDeclareOptions {
            passive: false,
            durable: *queue.durable(),
            exclusive: *queue.exclusive(),
            auto_delete: *queue.auto_delete(),
            nowait: false,
        };
        self.channel
            .queue_declare(queue.name(), options, FieldTable::default())
            .await
            .map(|_| ())
            .map_err(|err| {
                PostmanError::TopologyError(format!("Declaring '{}': {}", queue.name(), err))
            })
    }

    async fn queue_exists(&self, name: &str) -> PostmanResult<bool> {
        let options = QueueDeclareOptions {
            passive: true,
            ..QueueDeclareOptions::default()
        };
        match self
            .channel
            .queue_declare(name, options, FieldTable::default())
            .await
        {
            Ok(_) => Ok(true),
            Err(lapin::Error::ProtocolError(amqp_error)) => match amqp_error.kind() {
                AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND) => Ok(false),
                // exclusive queue of another connection
                AMQPErrorKind::Soft(AMQPSoftError::RESOURCELOCKED) => Ok(true),
                _ => Err(PostmanError::TopologyError(amqp_error.to_string())),
            },
            Err(err) => Err(PostmanError::TopologyError(err.to_string())),
        }
    }

    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> PostmanResult<DeliveryStream> {
        let consume_options = BasicConsumeOptions {
            no_local: false,
            no_ack: options.auto_ack,
            exclusive: options.exclusive,
            nowait: false,
        };
        let consumer = self
            .channel
            .basic_consume(queue, "", consume_options, FieldTable::default())
            .await
            .map_err(|err| {
                PostmanError::TopologyError(format!("Consuming '{}': {}", queue, err))
            })?;
        let deliveries = consumer.map(|delivery_res| {
            delivery_res
                .map(|delivery| Delivery::new(Bytes::from(delivery.data), delivery.delivery_tag))
                .map_err(|err| PostmanError::BrokerUnreachable(err.to_string()))
        });
        Ok(deliveries.boxed())
    }

    async fn publish(
        &self,
        routing_key: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> PostmanResult<()> {
        let mut properties =
            BasicProperties::default().with_content_type(options.content_type.as_str().into());
        if options.persistent {
            properties = properties.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
        }
        let publish_options = BasicPublishOptions {
            mandatory: options.mandatory,
            immediate: options.immediate,
        };
        self.channel
            .basic_publish(
                &options.exchange,
                routing_key,
                publish_options,
                payload,
                properties,
            )
            .await
            .map(|_confirm| ())
            .map_err(|err| PostmanError::PublishFailed(err.to_string()))
    }

    async fn ack(&self, delivery_tag: u64) -> PostmanResult<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| PostmanError::BrokerUnreachable(err.to_string()))
    }

    async fn close(&self) -> PostmanResult<()> {
        if !self.channel.status().connected() {
            return Ok(());
        }
        self.channel
            .close(REPLY_SUCCESS, "Bye")
            .await
            .map_err(|err| PostmanError::BrokerUnreachable(err.to_string()))
    }
}
