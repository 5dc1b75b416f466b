mod room;
pub use room::*;

mod to_device;
pub use to_device::*;

use crate::messages::{
    Binding, SasOffer, StartMethod, ValidAccept, ValidReady, ValidRequest, ValidStart, VerificationInfo,
};
use crate::{CancelCode, Error, VerificationConfig};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Destination of an outgoing event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SendTarget {
    /// One device of one user.
    Device { user_id: String, device_id: String },
    /// Several devices of one user. An empty list means all of them.
    Devices { user_id: String, device_ids: Vec<String> },
    /// A room timeline.
    Room { room_id: String },
}

/// The network send primitive.
///
/// Returns an id for the sent message; for room events this is the event id.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, event_type: &str, target: &SendTarget, content: Value) -> Result<String, Error>;
}

/// Bounded retry applied below the protocol.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl From<&VerificationConfig> for RetryPolicy {
    fn from(config: &VerificationConfig) -> Self {
        Self {
            max_attempts: config.max_send_attempts.max(1),
            backoff: config.retry_backoff,
        }
    }
}

pub(crate) async fn send_with_retry(
    sender: &dyn MessageSender,
    policy: RetryPolicy,
    event_type: &str,
    target: &SendTarget,
    content: &Value,
) -> Result<String, Error> {
    let mut attempt = 1;
    loop {
        match sender.send(event_type, target, content.clone()).await {
            Ok(id) => return Ok(id),
            Err(err) if attempt < policy.max_attempts => {
                warn!(event_type, attempt, error = %err, "Send failed, retrying");
                tokio::time::sleep(policy.backoff * attempt).await;
                attempt += 1;
            }
            Err(err) => {
                warn!(event_type, attempt, error = %err, "Send failed, giving up");
                return Err(err);
            }
        }
    }
}

/// Delivery binding of one transaction.
///
/// Both variants build the same messages; they only differ in how a message
/// names its transaction and how it reaches the peer.
#[derive(Clone)]
pub enum Transport {
    ToDevice(ToDeviceTransport),
    Room(RoomTransport),
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ToDevice(t) => write!(f, "ToDevice({})", t.user_id()),
            Self::Room(t) => write!(f, "Room({})", t.room_id()),
        }
    }
}

impl Transport {
    pub fn binding(&self) -> Binding {
        match self {
            Self::ToDevice(_) => Binding::TransactionId,
            Self::Room(_) => Binding::Reference,
        }
    }

    /// Whether a done message must be sent after a successful verification.
    pub fn requires_done(&self) -> bool {
        matches!(self, Self::Room(_))
    }

    pub fn room_id(&self) -> Option<&str> {
        match self {
            Self::ToDevice(_) => None,
            Self::Room(t) => Some(t.room_id()),
        }
    }

    /// The content exactly as it goes on the wire.
    pub fn encode(&self, info: &VerificationInfo) -> Result<Value, Error> {
        info.to_content(self.binding())
    }

    /// Sends a message, retrying per the retry policy.
    pub async fn send(&self, info: &VerificationInfo) -> Result<String, Error> {
        let event_type = info.event_type(self.binding());
        let content = self.encode(info)?;
        debug!(event_type, transaction_id = %info.transaction_id(), "Sending verification message");

        match self {
            Self::ToDevice(t) => t.send(event_type, &content).await,
            Self::Room(t) => t.send(event_type, content).await,
        }
    }

    pub fn create_start_for_sas(&self, from_device: &str, transaction_id: &str, offer: SasOffer) -> VerificationInfo {
        VerificationInfo::Start(ValidStart {
            transaction_id: transaction_id.to_string(),
            from_device: from_device.to_string(),
            method: StartMethod::Sas(offer),
        })
    }

    pub fn create_start_for_qr_code(&self, from_device: &str, transaction_id: &str, shared_secret: &str) -> VerificationInfo {
        VerificationInfo::Start(ValidStart {
            transaction_id: transaction_id.to_string(),
            from_device: from_device.to_string(),
            method: StartMethod::Reciprocate {
                shared_secret: shared_secret.to_string(),
            },
        })
    }

    pub fn create_accept(
        &self,
        transaction_id: &str,
        key_agreement_protocol: &str,
        hash: &str,
        commitment: String,
        message_authentication_code: &str,
        short_authentication_string: Vec<String>,
    ) -> VerificationInfo {
        VerificationInfo::Accept(ValidAccept {
            transaction_id: transaction_id.to_string(),
            key_agreement_protocol: key_agreement_protocol.to_string(),
            hash: hash.to_string(),
            message_authentication_code: message_authentication_code.to_string(),
            short_authentication_string,
            commitment,
        })
    }

    pub fn create_key(&self, transaction_id: &str, key: String) -> VerificationInfo {
        VerificationInfo::key(transaction_id, key)
    }

    pub fn create_mac(&self, transaction_id: &str, mac: BTreeMap<String, String>, keys: String) -> VerificationInfo {
        VerificationInfo::mac(transaction_id, mac, keys)
    }

    /// In rooms the request names its target user; the transaction id is
    /// replaced by the event id once sent.
    pub fn create_request(
        &self,
        transaction_id: &str,
        from_device: &str,
        to_user_id: &str,
        methods: Vec<String>,
        timestamp: u64,
    ) -> VerificationInfo {
        VerificationInfo::Request(ValidRequest {
            transaction_id: transaction_id.to_string(),
            from_device: from_device.to_string(),
            to_user_id: matches!(self, Self::Room(_)).then(|| to_user_id.to_string()),
            methods,
            timestamp: Some(timestamp),
        })
    }

    pub fn create_ready(&self, transaction_id: &str, from_device: &str, methods: Vec<String>) -> VerificationInfo {
        VerificationInfo::Ready(ValidReady {
            transaction_id: transaction_id.to_string(),
            from_device: from_device.to_string(),
            methods,
        })
    }

    /// Best-effort cancel; a failure is logged and otherwise ignored.
    pub async fn cancel_transaction(&self, transaction_id: &str, code: CancelCode) {
        let cancel = VerificationInfo::cancel(transaction_id, code);
        if let Err(err) = self.send(&cancel).await {
            warn!(transaction_id, code = %code, error = %err, "Failed to send cancel");
        }
    }

    /// Best-effort done; only in-room verifications need one.
    pub async fn done(&self, transaction_id: &str) {
        if let Err(err) = self.send(&VerificationInfo::done(transaction_id)).await {
            warn!(transaction_id, error = %err, "Failed to send done");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Records every send and fails the first `failures` attempts.
    #[derive(Default)]
    pub(crate) struct RecordingSender {
        pub(crate) sent: Mutex<Vec<(String, SendTarget, Value)>>,
        pub(crate) failures: AtomicU32,
        pub(crate) attempts: AtomicU32,
    }

    #[async_trait]
    impl MessageSender for RecordingSender {
        async fn send(&self, event_type: &str, target: &SendTarget, content: Value) -> Result<String, Error> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures.load(Ordering::SeqCst) {
                return Err(Error::Transport("offline".to_string()));
            }

            let mut sent = self.sent.lock().unwrap();
            sent.push((event_type.to_string(), target.clone(), content));
            Ok(format!("$event{}", sent.len()))
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_retry_recovers_within_bound() {
        let sender = RecordingSender::default();
        sender.failures.store(2, Ordering::SeqCst);

        let target = SendTarget::Room {
            room_id: "!room".to_string(),
        };
        let result = send_with_retry(&sender, policy(3), "m.key.verification.key", &target, &Value::Null).await;

        assert!(result.is_ok());
        assert_eq!(sender.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up() {
        let sender = RecordingSender::default();
        sender.failures.store(10, Ordering::SeqCst);

        let target = SendTarget::Room {
            room_id: "!room".to_string(),
        };
        let result = send_with_retry(&sender, policy(3), "m.key.verification.key", &target, &Value::Null).await;

        assert!(matches!(result, Err(Error::Transport(_))));
        assert_eq!(sender.attempts.load(Ordering::SeqCst), 3);
        assert!(sender.sent.lock().unwrap().is_empty());
    }
}
