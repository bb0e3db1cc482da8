//! RabbitMQ plumbing shared by the batcher (publishing side) and the worker (consuming side).
//!
//! Publishing goes through [QueueChannel], which owns the reconnect/retry policy on top of a
//! [PublishTransport]. Consuming goes through a [BatchConsumer] whose channel is limited to a
//! single unacknowledged delivery, so a worker only gets a new batch after acking the last one.
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        ConfirmSelectOptions, QueueDeclareOptions,
    },
    protocol::{AMQPErrorKind, AMQPHardError, AMQPSoftError},
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, Queue,
};
use thiserror::Error;

use crate::cdx::CdxRecord;

pub const CC_QUEUE_NAME: &str = "batches";
pub const MAX_RETRIES: u32 = 3;
pub const RETRY_DELAY: Duration = Duration::from_secs(5);
pub const PREFETCH_COUNT: u16 = 1;
const RABBIT_MQ_TIMEOUT: Duration = Duration::from_secs(20);

/// Coarse classification of queue failures, used to decide whether a retry can help.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Auth,
    Transport,
}

#[derive(Debug, Error)]
pub enum QueueError {
    /// Credentials or permissions were rejected. Retrying will not help.
    #[error("RabbitMQ rejected the credentials or permissions: {0}")]
    Auth(String),

    #[error("RabbitMQ transport failure: {0}")]
    Transport(String),

    #[error("failed to publish after {attempts} attempts, last error: {last_error}")]
    PublishExhausted { attempts: u32, last_error: String },

    #[error("failed to serialize batch: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl QueueError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueueError::Auth(_) => ErrorKind::Auth,
            _ => ErrorKind::Transport,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Auth
    }
}

impl From<lapin::Error> for QueueError {
    fn from(e: lapin::Error) -> Self {
        if is_auth_error(&e) {
            QueueError::Auth(e.to_string())
        } else {
            QueueError::Transport(e.to_string())
        }
    }
}

fn is_auth_error(e: &lapin::Error) -> bool {
    match e {
        lapin::Error::ProtocolError(amqp_error) => matches!(
            amqp_error.kind(),
            AMQPErrorKind::Soft(AMQPSoftError::ACCESSREFUSED)
                | AMQPErrorKind::Hard(AMQPHardError::NOTALLOWED)
        ),
        _ => false,
    }
}

async fn with_timeout<T, F>(what: &str, fut: F) -> Result<T, QueueError>
where
    F: std::future::Future<Output = Result<T, lapin::Error>>,
{
    tokio::time::timeout(RABBIT_MQ_TIMEOUT, fut)
        .await
        .map_err(|_| QueueError::Transport(format!("Timed out while trying to {what}")))?
        .map_err(Into::into)
}

/// Waits for a stale connection to close. Returns whether it closed cleanly; a failed or
/// hanging close does not stop the reconnect.
async fn close_before_reconnect<F>(close: F) -> bool
where
    F: std::future::Future<Output = Result<(), lapin::Error>>,
{
    match tokio::time::timeout(RABBIT_MQ_TIMEOUT, close).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::debug!(err.msg = %e, "Closing the old connection failed");
            false
        }
        Err(_) => {
            tracing::debug!("Timed out while closing the old connection");
            false
        }
    }
}

#[tracing::instrument(skip(connection_string))]
pub async fn rabbitmq_connection(connection_string: &str) -> Result<Connection, QueueError> {
    with_timeout(
        "connect to RabbitMQ",
        Connection::connect(connection_string, ConnectionProperties::default()),
    )
    .await
}

#[tracing::instrument(skip(conn))]
pub async fn rabbitmq_channel_with_queue(
    conn: &Connection,
    queue_name: &str,
) -> Result<(Channel, Queue), QueueError> {
    let channel = rabbitmq_channel(conn).await?;
    let queue = rabbitmq_declare_queue(&channel, queue_name, FieldTable::default()).await?;
    Ok((channel, queue))
}

pub async fn rabbitmq_declare_queue(
    channel: &Channel,
    queue_name: &str,
    arguments: FieldTable,
) -> Result<Queue, QueueError> {
    with_timeout(
        "declare a RabbitMQ queue",
        channel.queue_declare(queue_name, QueueDeclareOptions::default(), arguments),
    )
    .await
}

/// Opens a channel that holds at most [PREFETCH_COUNT] unacknowledged deliveries.
pub async fn rabbitmq_channel(conn: &Connection) -> Result<Channel, QueueError> {
    let channel = with_timeout("create a RabbitMQ channel", conn.create_channel()).await?;
    with_timeout(
        "set QoS on the channel",
        channel.basic_qos(PREFETCH_COUNT, BasicQosOptions::default()),
    )
    .await?;
    Ok(channel)
}

pub async fn rabbitmq_consumer(
    channel: &Channel,
    queue_name: &str,
    consumer_tag: &str,
) -> Result<lapin::Consumer, QueueError> {
    with_timeout(
        "consume from a RabbitMQ queue",
        channel.basic_consume(
            queue_name,
            consumer_tag,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        ),
    )
    .await
}

/// A single attempt at putting a payload on the queue, plus a way to start over on a fresh
/// connection. Retry policy lives in [QueueChannel], not here.
#[async_trait]
pub trait PublishTransport: Send {
    async fn publish_once(&mut self, payload: &[u8]) -> Result<(), QueueError>;

    async fn reconnect(&mut self) -> Result<(), QueueError>;
}

/// Publishes to a named queue through the default exchange, with publisher confirms, so that
/// nacked or unroutable messages surface as errors.
pub struct RabbitTransport {
    connection_string: String,
    queue_name: String,
    connection: Connection,
    channel: Channel,
}

impl RabbitTransport {
    pub async fn connect(connection_string: &str, queue_name: &str) -> Result<Self, QueueError> {
        let (connection, channel) = Self::open(connection_string, queue_name).await?;
        Ok(Self {
            connection_string: connection_string.to_string(),
            queue_name: queue_name.to_string(),
            connection,
            channel,
        })
    }

    async fn open(
        connection_string: &str,
        queue_name: &str,
    ) -> Result<(Connection, Channel), QueueError> {
        let connection = rabbitmq_connection(connection_string).await?;
        let (channel, _queue) = rabbitmq_channel_with_queue(&connection, queue_name).await?;
        with_timeout(
            "enable publisher confirms",
            channel.confirm_select(ConfirmSelectOptions::default()),
        )
        .await?;
        Ok((connection, channel))
    }
}

#[async_trait]
impl PublishTransport for RabbitTransport {
    async fn publish_once(&mut self, payload: &[u8]) -> Result<(), QueueError> {
        let confirm = with_timeout(
            "publish to RabbitMQ",
            self.channel.basic_publish(
                "",
                &self.queue_name,
                BasicPublishOptions {
                    mandatory: true,
                    ..BasicPublishOptions::default()
                },
                payload,
                BasicProperties::default(),
            ),
        )
        .await?;
        let confirmation = with_timeout("receive a publisher confirm", confirm).await?;
        if confirmation.is_nack() {
            return Err(QueueError::Transport("broker nacked the message".to_string()));
        }
        if confirmation.take_message().is_some() {
            return Err(QueueError::Transport(format!(
                "message was unroutable to queue {}",
                self.queue_name
            )));
        }
        Ok(())
    }

    async fn reconnect(&mut self) -> Result<(), QueueError> {
        close_before_reconnect(self.connection.close(200, "reconnecting")).await;
        let (connection, channel) = Self::open(&self.connection_string, &self.queue_name).await?;
        self.connection = connection;
        self.channel = channel;
        tracing::info!("Reconnected to RabbitMQ");
        Ok(())
    }
}

/// Progress of the publish call currently in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    pub attempt: u32,
    pub last_error: Option<ErrorKind>,
}

/// Publishing side of the queue.
///
/// Authentication failures are returned immediately. Every other failure counts as an attempt;
/// after a failed attempt the channel waits `retry_delay`, reconnects and tries the same payload
/// again, giving up with [QueueError::PublishExhausted] after `max_retries` attempts.
pub struct QueueChannel<T> {
    transport: T,
    max_retries: u32,
    retry_delay: Duration,
    state: RetryState,
}

impl<T: PublishTransport> QueueChannel<T> {
    pub fn new(transport: T) -> Self {
        Self::with_policy(transport, MAX_RETRIES, RETRY_DELAY)
    }

    pub fn with_policy(transport: T, max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            transport,
            max_retries: max_retries.max(1),
            retry_delay,
            state: RetryState::default(),
        }
    }

    pub fn retry_state(&self) -> RetryState {
        self.state
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub async fn publish(&mut self, payload: &[u8]) -> Result<(), QueueError> {
        self.state = RetryState::default();
        loop {
            self.state.attempt += 1;
            let err = match self.transport.publish_once(payload).await {
                Ok(()) => {
                    self.state = RetryState::default();
                    return Ok(());
                }
                Err(err) => err,
            };
            if err.is_fatal() {
                tracing::error!(err.msg = %err, "Unrecoverable error while publishing");
                return Err(err);
            }
            self.state.last_error = Some(err.kind());
            if self.state.attempt >= self.max_retries {
                return Err(QueueError::PublishExhausted {
                    attempts: self.state.attempt,
                    last_error: err.to_string(),
                });
            }
            tracing::warn!(
                err.msg = %err,
                "Recoverable error while publishing, retry {}/{}",
                self.state.attempt,
                self.max_retries
            );
            tokio::time::sleep(self.retry_delay).await;
            if let Err(e) = self.transport.reconnect().await {
                if e.is_fatal() {
                    return Err(e);
                }
                tracing::warn!(err.msg = %e, "Failed to reconnect to RabbitMQ");
            }
        }
    }

    /// Serializes `batch` to the wire format (a JSON array of cdx records) and publishes it.
    pub async fn publish_batch(&mut self, batch: &[CdxRecord]) -> Result<(), QueueError> {
        let payload = encode_batch(batch)?;
        self.publish(&payload).await
    }
}

pub fn encode_batch(batch: &[CdxRecord]) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(batch)
}

pub fn decode_batch(payload: &[u8]) -> Result<Vec<CdxRecord>, serde_json::Error> {
    serde_json::from_slice(payload)
}

/// A message taken off the queue but not yet acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub data: Vec<u8>,
}

/// Receiving side of the queue.
#[async_trait]
pub trait BatchConsumer: Send {
    /// Waits for the next delivery. `Ok(None)` means the consumer has been closed.
    async fn next_delivery(&mut self) -> Result<Option<Delivery>, QueueError>;

    async fn ack(&mut self, delivery_tag: u64) -> Result<(), QueueError>;
}

pub struct RabbitConsumer {
    _connection: Connection,
    channel: Channel,
    consumer: lapin::Consumer,
}

impl RabbitConsumer {
    pub async fn connect(
        connection_string: &str,
        queue_name: &str,
        consumer_tag: &str,
    ) -> Result<Self, QueueError> {
        let connection = rabbitmq_connection(connection_string).await?;
        let (channel, _queue) = rabbitmq_channel_with_queue(&connection, queue_name).await?;
        let consumer = rabbitmq_consumer(&channel, queue_name, consumer_tag).await?;
        Ok(Self {
            _connection: connection,
            channel,
            consumer,
        })
    }
}

#[async_trait]
impl BatchConsumer for RabbitConsumer {
    async fn next_delivery(&mut self) -> Result<Option<Delivery>, QueueError> {
        match self.consumer.next().await {
            Some(Ok(delivery)) => Ok(Some(Delivery {
                delivery_tag: delivery.delivery_tag,
                data: delivery.data,
            })),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    async fn ack(&mut self, delivery_tag: u64) -> Result<(), QueueError> {
        with_timeout(
            "acknowledge a delivery",
            self.channel
                .basic_ack(delivery_tag, BasicAckOptions::default()),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use lapin::protocol::AMQPError;

    use super::*;

    fn protocol_error(kind: AMQPErrorKind) -> lapin::Error {
        lapin::Error::ProtocolError(AMQPError::new(kind, "rejected".into()))
    }

    #[test]
    fn refused_credentials_are_auth_errors() {
        let refused: QueueError =
            protocol_error(AMQPErrorKind::Soft(AMQPSoftError::ACCESSREFUSED)).into();
        assert_eq!(refused.kind(), ErrorKind::Auth);
        assert!(refused.is_fatal());

        let not_allowed: QueueError =
            protocol_error(AMQPErrorKind::Hard(AMQPHardError::NOTALLOWED)).into();
        assert_eq!(not_allowed.kind(), ErrorKind::Auth);
    }

    #[test]
    fn other_failures_are_transport_errors() {
        let forced: QueueError =
            protocol_error(AMQPErrorKind::Hard(AMQPHardError::CONNECTIONFORCED)).into();
        assert_eq!(forced.kind(), ErrorKind::Transport);
        assert!(!forced.is_fatal());

        let io: QueueError = lapin::Error::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection reset by peer",
        ))
        .into();
        assert_eq!(io.kind(), ErrorKind::Transport);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_or_failed_close_does_not_block_reconnect() {
        assert!(close_before_reconnect(async { Ok::<(), lapin::Error>(()) }).await);
        let forced = protocol_error(AMQPErrorKind::Hard(AMQPHardError::CONNECTIONFORCED));
        assert!(!close_before_reconnect(async { Err::<(), _>(forced) }).await);
        assert!(!close_before_reconnect(std::future::pending::<Result<(), lapin::Error>>()).await);
    }
}
