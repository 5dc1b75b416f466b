mod content;
pub use content::*;

use crate::{CancelCode, Error};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const EVENT_TYPE_REQUEST: &str = "m.key.verification.request";
pub const EVENT_TYPE_READY: &str = "m.key.verification.ready";
pub const EVENT_TYPE_START: &str = "m.key.verification.start";
pub const EVENT_TYPE_ACCEPT: &str = "m.key.verification.accept";
pub const EVENT_TYPE_KEY: &str = "m.key.verification.key";
pub const EVENT_TYPE_MAC: &str = "m.key.verification.mac";
pub const EVENT_TYPE_CANCEL: &str = "m.key.verification.cancel";
pub const EVENT_TYPE_DONE: &str = "m.key.verification.done";
/// Room event type carrying in-room verification requests.
pub const EVENT_TYPE_ROOM_MESSAGE: &str = "m.room.message";

pub const METHOD_SAS: &str = "m.sas.v1";
pub const METHOD_QR_CODE_SCAN: &str = "m.qr_code.scan.v1";
pub const METHOD_QR_CODE_SHOW: &str = "m.qr_code.show.v1";
pub const METHOD_RECIPROCATE: &str = "m.reciprocate.v1";

pub const KEY_AGREEMENT_V1: &str = "curve25519";
pub const KEY_AGREEMENT_V2: &str = "curve25519-hkdf-sha256";
pub const HASH_SHA256: &str = "sha256";
pub const MAC_HKDF_HMAC_SHA256: &str = "hkdf-hmac-sha256";
pub const MAC_HMAC_SHA256: &str = "hmac-sha256";
pub const SAS_DECIMAL: &str = "decimal";
pub const SAS_EMOJI: &str = "emoji";

/// Key agreement protocols in order of preference.
pub const KNOWN_AGREEMENT_PROTOCOLS: [&str; 2] = [KEY_AGREEMENT_V2, KEY_AGREEMENT_V1];
/// Hashes in order of preference.
pub const KNOWN_HASHES: [&str; 1] = [HASH_SHA256];
/// MAC algorithms in order of preference.
pub const KNOWN_MACS: [&str; 2] = [MAC_HKDF_HMAC_SHA256, MAC_HMAC_SHA256];
/// Short code formats in order of preference.
pub const KNOWN_SHORT_CODES: [&str; 2] = [SAS_EMOJI, SAS_DECIMAL];

/// A verification method that can be offered in a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VerificationMethod {
    /// Short authentication string.
    Sas,
    /// This device can scan a QR code.
    QrCodeScan,
    /// This device can display a QR code.
    QrCodeShow,
    /// This device can confirm a scanned QR code.
    Reciprocate,
}

impl VerificationMethod {
    pub fn value(&self) -> &'static str {
        match self {
            Self::Sas => METHOD_SAS,
            Self::QrCodeScan => METHOD_QR_CODE_SCAN,
            Self::QrCodeShow => METHOD_QR_CODE_SHOW,
            Self::Reciprocate => METHOD_RECIPROCATE,
        }
    }

    pub fn from_value(value: &str) -> Option<Self> {
        match value {
            METHOD_SAS => Some(Self::Sas),
            METHOD_QR_CODE_SCAN => Some(Self::QrCodeScan),
            METHOD_QR_CODE_SHOW => Some(Self::QrCodeShow),
            METHOD_RECIPROCATE => Some(Self::Reciprocate),
            _ => None,
        }
    }

    /// Whether this method needs cross-signing to be offered.
    pub fn is_qr(&self) -> bool {
        !matches!(self, Self::Sas)
    }
}

/// `m.relates_to` reference binding an in-room message to its request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    #[serde(default = "reference")]
    pub rel_type: String,
    pub event_id: String,
}

fn reference() -> String {
    "m.reference".to_string()
}

impl Relation {
    pub fn reference(event_id: &str) -> Self {
        Self {
            rel_type: reference(),
            event_id: event_id.to_string(),
        }
    }
}

/// How a message names its transaction on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Binding {
    /// A `transaction_id` field, used for to-device messages.
    TransactionId,
    /// A reference relation to the request event, used in rooms.
    Reference,
}

/// A validated verification message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VerificationInfo {
    Request(ValidRequest),
    Ready(ValidReady),
    Start(ValidStart),
    Accept(ValidAccept),
    Key(ValidKey),
    Mac(ValidMac),
    Cancel(ValidCancel),
    Done(ValidDone),
}

impl VerificationInfo {
    pub fn transaction_id(&self) -> &str {
        match self {
            Self::Request(m) => &m.transaction_id,
            Self::Ready(m) => &m.transaction_id,
            Self::Start(m) => &m.transaction_id,
            Self::Accept(m) => &m.transaction_id,
            Self::Key(m) => &m.transaction_id,
            Self::Mac(m) => &m.transaction_id,
            Self::Cancel(m) => &m.transaction_id,
            Self::Done(m) => &m.transaction_id,
        }
    }

    /// The event type this message is sent as with the given binding.
    pub fn event_type(&self, binding: Binding) -> &'static str {
        match self {
            Self::Request(_) if binding == Binding::Reference => EVENT_TYPE_ROOM_MESSAGE,
            Self::Request(_) => EVENT_TYPE_REQUEST,
            Self::Ready(_) => EVENT_TYPE_READY,
            Self::Start(_) => EVENT_TYPE_START,
            Self::Accept(_) => EVENT_TYPE_ACCEPT,
            Self::Key(_) => EVENT_TYPE_KEY,
            Self::Mac(_) => EVENT_TYPE_MAC,
            Self::Cancel(_) => EVENT_TYPE_CANCEL,
            Self::Done(_) => EVENT_TYPE_DONE,
        }
    }

    /// Serializes the message content.
    ///
    /// With [`Binding::Reference`] the transaction id becomes an `m.relates_to`
    /// reference, except for requests, whose own event id is the transaction id.
    pub fn to_content(&self, binding: Binding) -> Result<Value, Error> {
        let (transaction_id, relates_to) = match binding {
            Binding::TransactionId => (Some(self.transaction_id().to_string()), None),
            Binding::Reference => (None, Some(Relation::reference(self.transaction_id()))),
        };

        let value = match self {
            Self::Request(m) => {
                let in_room = binding == Binding::Reference;
                serde_json::to_value(RequestContent {
                    msgtype: in_room.then(|| EVENT_TYPE_REQUEST.to_string()),
                    body: in_room.then(|| {
                        "Verification requested. Your client does not support key verification."
                            .to_string()
                    }),
                    transaction_id: (!in_room).then(|| m.transaction_id.clone()),
                    from_device: Some(m.from_device.clone()),
                    to: m.to_user_id.clone(),
                    methods: Some(m.methods.clone()),
                    timestamp: m.timestamp,
                })?
            }
            Self::Ready(m) => serde_json::to_value(ReadyContent {
                transaction_id,
                from_device: Some(m.from_device.clone()),
                methods: Some(m.methods.clone()),
                relates_to,
            })?,
            Self::Start(m) => {
                let mut content = StartContent {
                    from_device: Some(m.from_device.clone()),
                    transaction_id,
                    relates_to,
                    ..StartContent::default()
                };
                match &m.method {
                    StartMethod::Sas(offer) => {
                        content.method = Some(METHOD_SAS.to_string());
                        content.key_agreement_protocols = Some(offer.key_agreement_protocols.clone());
                        content.hashes = Some(offer.hashes.clone());
                        content.message_authentication_codes =
                            Some(offer.message_authentication_codes.clone());
                        content.short_authentication_string =
                            Some(offer.short_authentication_string.clone());
                    }
                    StartMethod::Reciprocate { shared_secret } => {
                        content.method = Some(METHOD_RECIPROCATE.to_string());
                        content.secret = Some(shared_secret.clone());
                    }
                }
                serde_json::to_value(content)?
            }
            Self::Accept(m) => serde_json::to_value(AcceptContent {
                transaction_id,
                method: Some(METHOD_SAS.to_string()),
                key_agreement_protocol: Some(m.key_agreement_protocol.clone()),
                hash: Some(m.hash.clone()),
                message_authentication_code: Some(m.message_authentication_code.clone()),
                short_authentication_string: Some(m.short_authentication_string.clone()),
                commitment: Some(m.commitment.clone()),
                relates_to,
            })?,
            Self::Key(m) => serde_json::to_value(KeyContent {
                transaction_id,
                key: Some(m.key.clone()),
                relates_to,
            })?,
            Self::Mac(m) => serde_json::to_value(MacContent {
                transaction_id,
                mac: Some(m.mac.clone()),
                keys: Some(m.keys.clone()),
                relates_to,
            })?,
            Self::Cancel(m) => serde_json::to_value(CancelContent {
                transaction_id,
                code: Some(m.code.value().to_string()),
                reason: Some(m.reason.clone()),
                relates_to,
            })?,
            Self::Done(_) => serde_json::to_value(DoneContent {
                transaction_id,
                relates_to,
            })?,
        };

        Ok(value)
    }

    pub fn cancel(transaction_id: &str, code: CancelCode) -> Self {
        Self::Cancel(ValidCancel {
            transaction_id: transaction_id.to_string(),
            code,
            reason: code.human_readable().to_string(),
        })
    }

    pub fn done(transaction_id: &str) -> Self {
        Self::Done(ValidDone {
            transaction_id: transaction_id.to_string(),
        })
    }

    pub fn key(transaction_id: &str, key: String) -> Self {
        Self::Key(ValidKey {
            transaction_id: transaction_id.to_string(),
            key,
        })
    }

    pub fn mac(transaction_id: &str, mac: BTreeMap<String, String>, keys: String) -> Self {
        Self::Mac(ValidMac {
            transaction_id: transaction_id.to_string(),
            mac,
            keys,
        })
    }
}

/// Where an inbound event was received.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventOrigin {
    /// A direct device-to-device message.
    ToDevice,
    /// A room event with its room and event ids.
    Room { room_id: String, event_id: String },
}

/// A decrypted verification event as handed over by the sync layer.
#[derive(Clone, Debug)]
pub struct InboundEvent {
    pub sender: String,
    pub event_type: String,
    pub content: Value,
    pub origin: EventOrigin,
    /// Origin server timestamp in milliseconds, when known.
    pub origin_server_ts: Option<u64>,
}

impl InboundEvent {
    pub fn to_device(sender: &str, event_type: &str, content: Value) -> Self {
        Self {
            sender: sender.to_string(),
            event_type: event_type.to_string(),
            content,
            origin: EventOrigin::ToDevice,
            origin_server_ts: None,
        }
    }

    pub fn in_room(sender: &str, room_id: &str, event_id: &str, event_type: &str, content: Value) -> Self {
        Self {
            sender: sender.to_string(),
            event_type: event_type.to_string(),
            content,
            origin: EventOrigin::Room {
                room_id: room_id.to_string(),
                event_id: event_id.to_string(),
            },
            origin_server_ts: None,
        }
    }

    pub fn room_id(&self) -> Option<&str> {
        match &self.origin {
            EventOrigin::Room { room_id, .. } => Some(room_id),
            EventOrigin::ToDevice => None,
        }
    }

    fn is_room_request(&self) -> bool {
        self.event_type == EVENT_TYPE_ROOM_MESSAGE
            && self.content.get("msgtype").and_then(Value::as_str) == Some(EVENT_TYPE_REQUEST)
    }

    /// Whether this event belongs to the verification protocol at all.
    pub fn is_verification_event(&self) -> bool {
        self.event_type.starts_with("m.key.verification.") || self.is_room_request()
    }

    /// The transaction id as read from the raw content, even if the rest of
    /// the payload is invalid.
    pub fn raw_transaction_id(&self) -> Option<String> {
        if self.is_room_request() {
            if let EventOrigin::Room { event_id, .. } = &self.origin {
                return Some(event_id.clone());
            }
        }

        self.content
            .get("transaction_id")
            .and_then(Value::as_str)
            .or_else(|| {
                self.content
                    .get("m.relates_to")
                    .and_then(|r| r.get("event_id"))
                    .and_then(Value::as_str)
            })
            .filter(|id| !id.is_empty())
            .map(str::to_string)
    }

    /// Parses and validates the content.
    pub fn parse(&self) -> Result<VerificationInfo, Error> {
        fn decode<T: serde::de::DeserializeOwned>(value: &Value) -> Result<T, Error> {
            Ok(serde_json::from_value(value.clone())?)
        }
        let invalid = || Error::InvalidMessage(self.event_type.clone());

        if self.is_room_request() {
            let event_id = match &self.origin {
                EventOrigin::Room { event_id, .. } => Some(event_id.as_str()),
                EventOrigin::ToDevice => None,
            };
            return decode::<RequestContent>(&self.content)?
                .validate(event_id)
                .map(VerificationInfo::Request)
                .ok_or_else(invalid);
        }

        let info = match self.event_type.as_str() {
            EVENT_TYPE_REQUEST => decode::<RequestContent>(&self.content)?
                .validate(None)
                .map(VerificationInfo::Request),
            EVENT_TYPE_READY => decode::<ReadyContent>(&self.content)?
                .validate()
                .map(VerificationInfo::Ready),
            EVENT_TYPE_START => decode::<StartContent>(&self.content)?
                .validate()
                .map(VerificationInfo::Start),
            EVENT_TYPE_ACCEPT => decode::<AcceptContent>(&self.content)?
                .validate()
                .map(VerificationInfo::Accept),
            EVENT_TYPE_KEY => decode::<KeyContent>(&self.content)?
                .validate()
                .map(VerificationInfo::Key),
            EVENT_TYPE_MAC => decode::<MacContent>(&self.content)?
                .validate()
                .map(VerificationInfo::Mac),
            EVENT_TYPE_CANCEL => decode::<CancelContent>(&self.content)?
                .validate()
                .map(VerificationInfo::Cancel),
            EVENT_TYPE_DONE => decode::<DoneContent>(&self.content)?
                .validate()
                .map(VerificationInfo::Done),
            other => return Err(Error::InvalidMessage(format!("Unknown event type {other}"))),
        };

        info.ok_or_else(invalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sas_start() -> VerificationInfo {
        VerificationInfo::Start(ValidStart {
            transaction_id: "tx1".to_string(),
            from_device: "ALICEDEVICE".to_string(),
            method: StartMethod::Sas(SasOffer {
                key_agreement_protocols: vec![KEY_AGREEMENT_V1.to_string()],
                hashes: vec![HASH_SHA256.to_string()],
                message_authentication_codes: vec![MAC_HKDF_HMAC_SHA256.to_string()],
                short_authentication_string: vec![SAS_DECIMAL.to_string(), SAS_EMOJI.to_string()],
            }),
        })
    }

    #[test]
    fn test_start_encodes_with_either_binding() {
        let start = sas_start();

        let to_device = start.to_content(Binding::TransactionId).unwrap();
        assert_eq!(to_device["transaction_id"], "tx1");
        assert!(to_device.get("m.relates_to").is_none());

        let room = start.to_content(Binding::Reference).unwrap();
        assert!(room.get("transaction_id").is_none());
        assert_eq!(room["m.relates_to"]["rel_type"], "m.reference");
        assert_eq!(room["m.relates_to"]["event_id"], "tx1");

        let event = InboundEvent::in_room("@alice:example.org", "!room", "$start", EVENT_TYPE_START, room);
        assert_eq!(event.parse().unwrap(), start);
    }

    #[test]
    fn test_room_request_encoding() {
        let request = VerificationInfo::Request(ValidRequest {
            transaction_id: "$local".to_string(),
            from_device: "DEV".to_string(),
            to_user_id: Some("@bob:example.org".to_string()),
            methods: vec![METHOD_SAS.to_string()],
            timestamp: None,
        });

        assert_eq!(request.event_type(Binding::Reference), EVENT_TYPE_ROOM_MESSAGE);
        let content = request.to_content(Binding::Reference).unwrap();
        assert_eq!(content["msgtype"], EVENT_TYPE_REQUEST);
        assert!(content.get("transaction_id").is_none());

        let event = InboundEvent::in_room("@alice:example.org", "!room", "$remote", EVENT_TYPE_ROOM_MESSAGE, content);
        assert!(event.is_verification_event());
        assert_eq!(event.parse().unwrap().transaction_id(), "$remote");
        assert_eq!(event.raw_transaction_id().as_deref(), Some("$remote"));
    }

    #[test]
    fn test_raw_transaction_id_of_invalid_start() {
        let event = InboundEvent::to_device(
            "@alice:example.org",
            EVENT_TYPE_START,
            json!({"transaction_id": "tx9", "method": "m.sas.v1"}),
        );

        assert!(event.parse().is_err());
        assert_eq!(event.raw_transaction_id().as_deref(), Some("tx9"));
    }

    #[test]
    fn test_plain_room_message_is_not_verification() {
        let event = InboundEvent::in_room(
            "@alice:example.org",
            "!room",
            "$ev",
            EVENT_TYPE_ROOM_MESSAGE,
            json!({"msgtype": "m.text", "body": "hi"}),
        );
        assert!(!event.is_verification_event());
    }

    #[test]
    fn test_method_values() {
        assert_eq!(VerificationMethod::from_value("m.qr_code.show.v1"), Some(VerificationMethod::QrCodeShow));
        assert!(VerificationMethod::Reciprocate.is_qr());
        assert!(!VerificationMethod::Sas.is_qr());
    }
}
