//! Redis-backed [`EventBus`]: lists give work-queue semantics (one
//! consumer wins a `BRPOPLPUSH`), Pub/Sub channels keyed by correlation
//! id give request/reply. Redis is already part of this workspace's
//! dependency stack for caching; reusing it here keeps the ecosystem
//! surface aligned with the reference server instead of reaching for a
//! dedicated AMQP client.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::{AckHandle, DeliveryStream, EventBus, EventBusError};

#[derive(Clone)]
pub struct RedisEventBus {
    client: redis::Client,
    conn: ConnectionManager,
    poll_interval: Duration,
}

impl fmt::Debug for RedisEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisEventBus")
            .field("connection", &"ConnectionManager")
            .finish()
    }
}

impl RedisEventBus {
    pub async fn connect(redis_url: &str) -> Result<Self, EventBusError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| EventBusError::Transport(format!("invalid redis url: {e}")))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| EventBusError::Transport(format!("redis connect failed: {e}")))?;
        Ok(Self {
            client,
            conn,
            poll_interval: Duration::from_millis(250),
        })
    }

    fn processing_key(queue: &str) -> String {
        format!("{queue}:processing")
    }

    fn reply_channel(response_queue: &str, correlation_id: Uuid) -> String {
        format!("{response_queue}:{correlation_id}")
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<(), EventBusError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .lpush(queue, payload)
            .await
            .map_err(|e| EventBusError::Publish {
                queue: queue.to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream, EventBusError> {
        let mut conn = self.conn.clone();
        let queue = queue.to_string();
        let processing = Self::processing_key(&queue);
        let poll_interval = self.poll_interval;

        let stream = async_stream::stream! {
            loop {
                let item: Option<Vec<u8>> = match conn
                    .brpoplpush::<_, _, Option<Vec<u8>>>(&queue, &processing, poll_interval.as_secs_f64())
                    .await
                {
                    Ok(item) => item,
                    Err(e) => {
                        yield Err(EventBusError::Consume {
                            queue: queue.clone(),
                            message: e.to_string(),
                        });
                        continue;
                    }
                };

                if let Some(payload) = item {
                    let (ack_tx, ack_rx) = tokio::sync::oneshot::channel();
                    let mut ack_conn = conn.clone();
                    let payload_for_ack = payload.clone();
                    let processing_for_ack = processing.clone();
                    tokio::spawn(async move {
                        if let Ok(acked) = ack_rx.await {
                            if acked {
                                let _: Result<i64, _> =
                                    ack_conn.lrem(&processing_for_ack, 1, &payload_for_ack).await;
                            } else {
                                debug!("message nacked, left in processing list for redelivery");
                            }
                        } else {
                            warn!("ack handle dropped without ack/nack, message stays in-flight");
                        }
                    });
                    yield Ok((payload, AckHandle::new(ack_tx)));
                }
            }
        };

        Ok(Box::pin(stream))
    }

    async fn request_reply(
        &self,
        request_queue: &str,
        response_queue: &str,
        payload: Vec<u8>,
        correlation_id: Uuid,
    ) -> Result<Vec<u8>, EventBusError> {
        let channel = Self::reply_channel(response_queue, correlation_id);
        let mut pubsub_conn = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| EventBusError::Transport(format!("pubsub unavailable: {e}")))?;
        pubsub_conn
            .subscribe(&channel)
            .await
            .map_err(|e| EventBusError::Transport(e.to_string()))?;

        self.publish(request_queue, payload).await?;

        let mut message_stream = pubsub_conn.into_on_message();
        use futures::StreamExt;
        match message_stream.next().await {
            Some(msg) => {
                let payload: Vec<u8> = msg
                    .get_payload()
                    .map_err(|e| EventBusError::Transport(e.to_string()))?;
                Ok(payload)
            }
            None => Err(EventBusError::ReplyTimeout {
                queue: response_queue.to_string(),
                correlation_id,
            }),
        }
    }
}
