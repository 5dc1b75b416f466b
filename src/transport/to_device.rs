use super::{MessageSender, RetryPolicy, SendTarget, send_with_retry};
use crate::Error;
use serde_json::Value;
use std::sync::Arc;

/// Sends verification messages directly to devices of one user.
#[derive(Clone)]
pub struct ToDeviceTransport {
    sender: Arc<dyn MessageSender>,
    policy: RetryPolicy,
    user_id: String,
    device_ids: Vec<String>,
}

impl ToDeviceTransport {
    /// `device_ids` empty means every device of the user.
    pub fn new(sender: Arc<dyn MessageSender>, policy: RetryPolicy, user_id: &str, device_ids: Vec<String>) -> Self {
        Self {
            sender,
            policy,
            user_id: user_id.to_string(),
            device_ids,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    fn target(&self) -> SendTarget {
        match self.device_ids.as_slice() {
            [device_id] => SendTarget::Device {
                user_id: self.user_id.clone(),
                device_id: device_id.clone(),
            },
            device_ids => SendTarget::Devices {
                user_id: self.user_id.clone(),
                device_ids: device_ids.to_vec(),
            },
        }
    }

    pub(crate) async fn send(&self, event_type: &str, content: &Value) -> Result<String, Error> {
        send_with_retry(self.sender.as_ref(), self.policy, event_type, &self.target(), content).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Transport;
    use crate::transport::tests::RecordingSender;
    use std::time::Duration;

    #[tokio::test]
    async fn test_to_device_targets_and_encoding() {
        let sender = Arc::new(RecordingSender::default());
        let policy = RetryPolicy {
            max_attempts: 1,
            backoff: Duration::from_millis(1),
        };
        let all = Transport::ToDevice(ToDeviceTransport::new(
            sender.clone(),
            policy,
            "@bob:example.org",
            vec![],
        ));
        all.send(&all.create_ready("tx", "ALICE", vec!["m.sas.v1".to_string()]))
            .await
            .unwrap();

        let one = Transport::ToDevice(ToDeviceTransport::new(
            sender.clone(),
            policy,
            "@bob:example.org",
            vec!["BOBDEVICE".to_string()],
        ));
        one.send(&one.create_key("tx", "key".to_string())).await.unwrap();

        let sent = sender.sent.lock().unwrap();
        assert_eq!(sent[0].0, "m.key.verification.ready");
        assert_eq!(
            sent[0].1,
            SendTarget::Devices {
                user_id: "@bob:example.org".to_string(),
                device_ids: vec![]
            }
        );
        assert_eq!(sent[1].2["transaction_id"], "tx");
        assert_eq!(
            sent[1].1,
            SendTarget::Device {
                user_id: "@bob:example.org".to_string(),
                device_id: "BOBDEVICE".to_string()
            }
        );
    }
}
