use crate::CancelCode;
use crate::messages::{ValidReady, ValidRequest};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

/// Where a request stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestState {
    Requested,
    Ready,
    Started,
    Cancelled(CancelCode),
    Done,
}

/// An invitation to verify, tracked until it is answered or dropped.
///
/// A request and the transaction it spawns share a transaction id but have
/// independent lifecycles.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingVerificationRequest {
    /// Local creation time, or the origin timestamp of a received request.
    pub age_local_ts: u64,
    pub is_incoming: bool,
    /// Id known before the request is sent; in rooms the event id replaces it.
    pub local_id: String,
    pub other_user_id: String,
    /// Set for in-room requests.
    pub room_id: Option<String>,
    /// Known once the request went out, or on receipt.
    pub transaction_id: Option<String>,
    pub request_info: Option<ValidRequest>,
    pub ready_info: Option<ValidReady>,
    pub cancel_conclusion: Option<CancelCode>,
    pub is_successful: bool,
    /// Another of our sessions answered this request.
    pub handled_by_other_session: bool,
    /// Devices a to-device request was sent to.
    pub target_devices: Vec<String>,
    /// A transaction was started for this request.
    pub started: bool,
}

impl PendingVerificationRequest {
    pub(crate) fn outgoing(local_id: &str, other_user_id: &str, room_id: Option<&str>) -> Self {
        Self {
            age_local_ts: now_millis(),
            is_incoming: false,
            local_id: local_id.to_string(),
            other_user_id: other_user_id.to_string(),
            room_id: room_id.map(str::to_string),
            transaction_id: None,
            request_info: None,
            ready_info: None,
            cancel_conclusion: None,
            is_successful: false,
            handled_by_other_session: false,
            target_devices: Vec::new(),
            started: false,
        }
    }

    pub(crate) fn incoming(info: ValidRequest, sender: &str, room_id: Option<&str>, ts: Option<u64>) -> Self {
        Self {
            age_local_ts: ts.or(info.timestamp).unwrap_or_else(now_millis),
            is_incoming: true,
            transaction_id: Some(info.transaction_id.clone()),
            request_info: Some(info),
            ..Self::outgoing("", sender, room_id)
        }
        .with_local_id_from_transaction()
    }

    fn with_local_id_from_transaction(mut self) -> Self {
        if let Some(id) = &self.transaction_id {
            self.local_id = id.clone();
        }
        self
    }

    pub fn is_ready(&self) -> bool {
        self.ready_info.is_some()
    }

    pub fn is_sent(&self) -> bool {
        self.transaction_id.is_some()
    }

    pub fn is_finished(&self) -> bool {
        self.is_successful || self.cancel_conclusion.is_some()
    }

    /// Whether the request was created too long ago, or claims to come from
    /// too far in the future, to still be acted upon.
    pub fn is_suspiciously_old(&self, now: u64, validity_window: Duration, future_tolerance: Duration) -> bool {
        let window = u64::try_from(validity_window.as_millis()).unwrap_or(u64::MAX);
        let tolerance = u64::try_from(future_tolerance.as_millis()).unwrap_or(u64::MAX);

        now.saturating_sub(self.age_local_ts) > window || self.age_local_ts.saturating_sub(now) > tolerance
    }

    pub fn state(&self) -> RequestState {
        if self.is_successful {
            RequestState::Done
        } else if let Some(code) = self.cancel_conclusion {
            RequestState::Cancelled(code)
        } else if self.started {
            RequestState::Started
        } else if self.is_ready() {
            RequestState::Ready
        } else {
            RequestState::Requested
        }
    }

    /// Whether `transaction_id` designates this request.
    pub(crate) fn matches(&self, transaction_id: &str) -> bool {
        self.transaction_id.as_deref() == Some(transaction_id)
    }

    /// Whether this device sent or readied the request.
    pub(crate) fn involves_device(&self, device_id: &str) -> bool {
        let sent = !self.is_incoming
            && self
                .request_info
                .as_ref()
                .is_some_and(|info| info.from_device == device_id);
        let readied = self
            .ready_info
            .as_ref()
            .is_some_and(|info| info.from_device == device_id);
        sent || readied
    }

    /// The peer device a request is bound to, once known.
    pub(crate) fn other_device_id(&self) -> Option<&str> {
        if self.is_incoming {
            self.request_info.as_ref().map(|info| info.from_device.as_str())
        } else {
            self.ready_info.as_ref().map(|info| info.from_device.as_str())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: u64 = 60_000;

    fn request(ts: u64) -> PendingVerificationRequest {
        PendingVerificationRequest::incoming(
            ValidRequest {
                transaction_id: "tx".to_string(),
                from_device: "ALICEDEVICE".to_string(),
                to_user_id: None,
                methods: vec!["m.sas.v1".to_string()],
                timestamp: None,
            },
            "@alice:example.org",
            None,
            Some(ts),
        )
    }

    #[test]
    fn test_state_progression() {
        let mut request = request(0);
        assert_eq!(request.local_id, "tx");
        assert_eq!(request.state(), RequestState::Requested);
        assert!(request.is_sent());
        assert_eq!(request.other_device_id(), Some("ALICEDEVICE"));

        request.ready_info = Some(ValidReady {
            transaction_id: "tx".to_string(),
            from_device: "BOBDEVICE".to_string(),
            methods: vec!["m.sas.v1".to_string()],
        });
        assert_eq!(request.state(), RequestState::Ready);
        assert!(request.involves_device("BOBDEVICE"));
        assert!(!request.involves_device("ALICEDEVICE"));

        request.started = true;
        assert_eq!(request.state(), RequestState::Started);

        request.is_successful = true;
        assert!(request.is_finished());
        assert_eq!(request.state(), RequestState::Done);
    }

    #[test]
    fn test_cancelled_request_is_finished() {
        let mut request = request(0);
        request.cancel_conclusion = Some(CancelCode::User);
        assert!(request.is_finished());
        assert_eq!(request.state(), RequestState::Cancelled(CancelCode::User));
    }

    #[test]
    fn test_suspiciously_old() {
        let window = Duration::from_secs(10 * 60);
        let tolerance = Duration::from_secs(5 * 60);
        let now = 100 * MINUTE;

        assert!(!request(now - 9 * MINUTE).is_suspiciously_old(now, window, tolerance));
        assert!(request(now - 11 * MINUTE).is_suspiciously_old(now, window, tolerance));
        assert!(!request(now + 4 * MINUTE).is_suspiciously_old(now, window, tolerance));
        assert!(request(now + 6 * MINUTE).is_suspiciously_old(now, window, tolerance));
    }

    #[test]
    fn test_outgoing_request_is_not_sent_until_id_known() {
        let request = PendingVerificationRequest::outgoing("local", "@bob:example.org", Some("!room"));
        assert!(!request.is_sent());
        assert!(!request.is_incoming);
        assert_eq!(request.room_id.as_deref(), Some("!room"));
    }
}
