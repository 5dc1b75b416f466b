use super::{MessageSender, RetryPolicy, SendTarget, send_with_retry};
use crate::Error;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

struct RoomJob {
    event_type: String,
    content: Value,
    reply: oneshot::Sender<Result<String, Error>>,
}

/// Ordered send queue of one room.
///
/// Jobs are sent one after the other by a worker task, so messages of a
/// transaction reach the timeline in the order they were queued.
#[derive(Clone)]
pub struct RoomSendQueue {
    jobs: mpsc::UnboundedSender<RoomJob>,
}

impl RoomSendQueue {
    /// Spawns the worker. Must be called within a Tokio runtime.
    pub fn spawn(room_id: &str, sender: Arc<dyn MessageSender>, policy: RetryPolicy) -> Self {
        let (jobs, mut receiver) = mpsc::unbounded_channel::<RoomJob>();
        let target = SendTarget::Room {
            room_id: room_id.to_string(),
        };

        tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                let result = send_with_retry(sender.as_ref(), policy, &job.event_type, &target, &job.content).await;
                // The caller may have stopped waiting.
                let _ = job.reply.send(result);
            }
            debug!(?target, "Room send queue closed");
        });

        Self { jobs }
    }

    async fn send(&self, event_type: &str, content: Value) -> Result<String, Error> {
        let (reply, response) = oneshot::channel();
        self.jobs
            .send(RoomJob {
                event_type: event_type.to_string(),
                content,
                reply,
            })
            .map_err(|_| Error::Transport("Room send queue closed".to_string()))?;

        response
            .await
            .map_err(|_| Error::Transport("Room send queue dropped the message".to_string()))?
    }
}

/// Sends verification messages as events in a room.
#[derive(Clone)]
pub struct RoomTransport {
    room_id: String,
    queue: RoomSendQueue,
}

impl RoomTransport {
    pub fn new(room_id: &str, queue: RoomSendQueue) -> Self {
        Self {
            room_id: room_id.to_string(),
            queue,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub(crate) async fn send(&self, event_type: &str, content: Value) -> Result<String, Error> {
        self.queue.send(event_type, content).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Transport;
    use crate::transport::tests::RecordingSender;
    use std::time::Duration;

    #[tokio::test]
    async fn test_room_messages_are_references_in_order() {
        let sender = Arc::new(RecordingSender::default());
        let policy = RetryPolicy {
            max_attempts: 2,
            backoff: Duration::from_millis(1),
        };
        let queue = RoomSendQueue::spawn("!room:example.org", sender.clone(), policy);
        let transport = Transport::Room(RoomTransport::new("!room:example.org", queue));

        assert!(transport.requires_done());
        transport.send(&transport.create_key("$request", "k".to_string())).await.unwrap();
        transport.done("$request").await;

        let sent = sender.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, "m.key.verification.key");
        assert_eq!(sent[0].2["m.relates_to"]["event_id"], "$request");
        assert_eq!(sent[1].0, "m.key.verification.done");
        assert_eq!(
            sent[1].1,
            SendTarget::Room {
                room_id: "!room:example.org".to_string()
            }
        );
    }
}
