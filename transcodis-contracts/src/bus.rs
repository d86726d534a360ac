//! The broker abstraction: durable work queues and request/reply
//! correlation, satisfied by any transport offering at-least-once
//! delivery with manual acknowledgment. The broker transport itself is
//! treated as out of scope; this module only fixes the shape of the
//! capability both the coordinator and the worker program against.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, oneshot};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum EventBusError {
    #[error("publish to {queue} failed: {message}")]
    Publish { queue: String, message: String },

    #[error("consume from {queue} failed: {message}")]
    Consume { queue: String, message: String },

    #[error("no reply received for correlation {correlation_id} on {queue}")]
    ReplyTimeout { queue: String, correlation_id: Uuid },

    #[error("transport error: {0}")]
    Transport(String),
}

/// Acknowledges a single delivery. Dropping without calling [`ack`] is
/// equivalent to a nack under at-least-once semantics: the message is
/// redelivered.
pub struct AckHandle {
    ack_tx: Option<oneshot::Sender<bool>>,
}

impl AckHandle {
    pub fn new(ack_tx: oneshot::Sender<bool>) -> Self {
        Self {
            ack_tx: Some(ack_tx),
        }
    }

    pub fn noop() -> Self {
        Self { ack_tx: None }
    }

    pub fn ack(mut self) {
        if let Some(tx) = self.ack_tx.take() {
            let _ = tx.send(true);
        }
    }

    pub fn nack(mut self) {
        if let Some(tx) = self.ack_tx.take() {
            let _ = tx.send(false);
        }
    }
}

pub type Delivery = (Vec<u8>, AckHandle);
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, EventBusError>> + Send>>;

#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish a payload onto a durable work queue; producers relinquish
    /// ownership once this returns `Ok`.
    async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<(), EventBusError>;

    /// Subscribe to a queue. Each item must be acknowledged via its
    /// [`AckHandle`] once the consumer has durably applied it.
    async fn consume(&self, queue: &str) -> Result<DeliveryStream, EventBusError>;

    /// Publish a request and await the single reply correlated to it by
    /// `correlation_id`. A generic request/reply capability for
    /// transports that can address a single caller directly, distinct
    /// from the durable work queues `publish`/`consume` model.
    async fn request_reply(
        &self,
        request_queue: &str,
        response_queue: &str,
        payload: Vec<u8>,
        correlation_id: Uuid,
    ) -> Result<Vec<u8>, EventBusError>;
}

/// `tokio::sync::mpsc`-backed fake used by unit and integration tests so
/// end-to-end scenarios can run without a live broker.
#[derive(Clone, Default)]
pub struct InMemoryEventBus {
    queues: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Vec<u8>>>>>,
    receivers: Arc<Mutex<HashMap<String, Arc<Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>>>>,
    correlated: Arc<Mutex<HashMap<Uuid, oneshot::Sender<Vec<u8>>>>>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    async fn sender_for(&self, queue: &str) -> mpsc::UnboundedSender<Vec<u8>> {
        let mut queues = self.queues.lock().await;
        if let Some(tx) = queues.get(queue) {
            return tx.clone();
        }
        let (tx, rx) = mpsc::unbounded_channel();
        queues.insert(queue.to_string(), tx.clone());
        self.receivers
            .lock()
            .await
            .insert(queue.to_string(), Arc::new(Mutex::new(rx)));
        tx
    }

    /// Deliver a payload directly to a pending `request_reply` caller,
    /// identified by correlation id. Used by test harnesses standing in
    /// for whatever answers the request on the other side of the bus.
    pub async fn reply(&self, correlation_id: Uuid, payload: Vec<u8>) -> bool {
        if let Some(tx) = self.correlated.lock().await.remove(&correlation_id) {
            tx.send(payload).is_ok()
        } else {
            false
        }
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<(), EventBusError> {
        let tx = self.sender_for(queue).await;
        tx.send(payload)
            .map_err(|e| EventBusError::Publish {
                queue: queue.to_string(),
                message: e.to_string(),
            })
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream, EventBusError> {
        self.sender_for(queue).await;
        let receivers = self.receivers.lock().await;
        let rx = receivers
            .get(queue)
            .cloned()
            .ok_or_else(|| EventBusError::Consume {
                queue: queue.to_string(),
                message: "queue not registered".to_string(),
            })?;

        let stream = async_stream::stream! {
            loop {
                let item = { rx.lock().await.recv().await };
                match item {
                    Some(payload) => yield Ok((payload, AckHandle::noop())),
                    None => break,
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn request_reply(
        &self,
        request_queue: &str,
        _response_queue: &str,
        payload: Vec<u8>,
        correlation_id: Uuid,
    ) -> Result<Vec<u8>, EventBusError> {
        let (tx, rx) = oneshot::channel();
        self.correlated.lock().await.insert(correlation_id, tx);
        self.publish(request_queue, payload).await?;
        rx.await.map_err(|_| EventBusError::ReplyTimeout {
            queue: request_queue.to_string(),
            correlation_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn publish_then_consume_round_trips_payload() {
        let bus = InMemoryEventBus::new();
        bus.publish("encode.request", b"hello".to_vec()).await.unwrap();

        let mut stream = bus.consume("encode.request").await.unwrap();
        let (payload, ack) = stream.next().await.unwrap().unwrap();
        assert_eq!(payload, b"hello");
        ack.ack();
    }

    #[tokio::test]
    async fn request_reply_resolves_on_correlated_reply() {
        let bus = InMemoryEventBus::new();
        let bus_clone = bus.clone();
        let correlation_id = Uuid::from_u128(42);

        let responder = tokio::spawn(async move {
            let mut stream = bus_clone.consume("pgs.request").await.unwrap();
            let (payload, ack) = stream.next().await.unwrap().unwrap();
            ack.ack();
            assert_eq!(payload, b"pgs-data");
            bus_clone.reply(correlation_id, b"subtitle text".to_vec()).await;
        });

        let reply = bus
            .request_reply("pgs.request", "pgs.response", b"pgs-data".to_vec(), correlation_id)
            .await
            .unwrap();

        responder.await.unwrap();
        assert_eq!(reply, b"subtitle text");
    }
}
