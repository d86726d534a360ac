//! The subtitle OCR bridge: publishes one `TaskPGS` request per PGS
//! track and resolves a `oneshot` once the correlated `TaskPgsResponse`
//! arrives on `pgs.response`. The bridge itself never retries; the
//! encode stage bounds the overall wait with a single timeout.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{Mutex, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use transcodis_contracts::EventBus;
use transcodis_core::job::{TaskPgs, TaskPgsResponse};
use uuid::Uuid;

use crate::errors::PipelineResult;

type CorrelationKey = (Uuid, String);
type PendingMap = Arc<Mutex<HashMap<CorrelationKey, oneshot::Sender<TaskPgsResponse>>>>;

pub struct OcrBridge {
    bus: Arc<dyn EventBus>,
    request_queue: String,
    pending: PendingMap,
}

impl OcrBridge {
    pub fn new(bus: Arc<dyn EventBus>, request_queue: impl Into<String>) -> Self {
        Self {
            bus,
            request_queue: request_queue.into(),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// A handle to the pending-correlation map, shared with
    /// [`run_response_router`] so responses delivered on a background
    /// task can resolve requests issued from encode-stage workers.
    pub fn pending_handle(&self) -> PendingMap {
        Arc::clone(&self.pending)
    }

    /// Registers a correlation entry and publishes the request. The
    /// returned receiver resolves once the router observes a matching
    /// response, or never if it doesn't — callers are expected to race
    /// it against a timeout.
    pub async fn request(&self, request: TaskPgs) -> PipelineResult<oneshot::Receiver<TaskPgsResponse>> {
        let (tx, rx) = oneshot::channel();
        let key = (request.job_id, request.pgs_id.clone());
        self.pending.lock().await.insert(key, tx);

        let payload = serde_json::to_vec(&request)?;
        self.bus.publish(&self.request_queue, payload).await?;
        Ok(rx)
    }
}

/// Long-lived task that drains `pgs.response` and routes each message to
/// the oneshot registered for its `(job_id, pgs_id)` key. A response
/// with no matching entry (already timed out, or a stray redelivery) is
/// acknowledged and dropped.
pub async fn run_response_router(
    bus: Arc<dyn EventBus>,
    response_queue: String,
    pending: PendingMap,
    cancellation: CancellationToken,
) {
    let stream = match bus.consume(&response_queue).await {
        Ok(stream) => stream,
        Err(err) => {
            error!(%err, "failed to subscribe to pgs.response");
            return;
        }
    };
    tokio::pin!(stream);

    loop {
        tokio::select! {
            _ = cancellation.cancelled() => return,
            next = stream.next() => {
                let Some(delivery) = next else { return };
                match delivery {
                    Ok((payload, ack)) => {
                        match serde_json::from_slice::<TaskPgsResponse>(&payload) {
                            Ok(response) => {
                                let key = (response.job_id, response.pgs_id.clone());
                                let sender = pending.lock().await.remove(&key);
                                if let Some(sender) = sender {
                                    let _ = sender.send(response);
                                }
                                ack.ack();
                            }
                            Err(err) => {
                                warn!(%err, "malformed pgs.response payload");
                                ack.nack();
                            }
                        }
                    }
                    Err(err) => error!(%err, "error consuming pgs.response"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use transcodis_contracts::InMemoryEventBus;

    #[tokio::test]
    async fn request_resolves_once_router_observes_matching_response() {
        let bus: Arc<dyn EventBus> = Arc::new(InMemoryEventBus::new());
        let bridge = OcrBridge::new(bus.clone(), "pgs.request");
        let cancellation = CancellationToken::new();

        let router_bus = bus.clone();
        let router_pending = bridge.pending_handle();
        let router_cancellation = cancellation.clone();
        let router = tokio::spawn(async move {
            run_response_router(router_bus, "pgs.response".to_string(), router_pending, router_cancellation).await;
        });

        let job_id = Uuid::new_v4();
        let rx = bridge
            .request(TaskPgs {
                job_id,
                pgs_id: "2".to_string(),
                pgs_data: vec![1, 2, 3],
                language: Some("jpn".into()),
            })
            .await
            .unwrap();

        let response = TaskPgsResponse {
            job_id,
            pgs_id: "2".to_string(),
            srt_bytes: Some(b"1\n00:00:00,000 --> 00:00:01,000\nhi\n".to_vec()),
            error: None,
        };
        bus.publish("pgs.response", serde_json::to_vec(&response).unwrap()).await.unwrap();

        let received = rx.await.unwrap();
        assert_eq!(received.pgs_id, "2");
        assert!(received.srt_bytes.is_some());

        cancellation.cancel();
        router.await.unwrap();
    }
}
