use crate::CancelCode;
use crate::messages::{
    HASH_SHA256, METHOD_RECIPROCATE, METHOD_SAS, SAS_DECIMAL, Relation,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn non_empty_list(value: Option<Vec<String>>) -> Option<Vec<String>> {
    value.filter(|v| !v.is_empty())
}

/// Picks the transaction id from the field or the reference relation.
fn transaction_id(explicit: Option<String>, relation: Option<Relation>) -> Option<String> {
    non_empty(explicit).or_else(|| non_empty(relation.map(|r| r.event_id)))
}

/// Wire form of `m.key.verification.start`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StartContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_device: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_agreement_protocols: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hashes: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_authentication_codes: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short_authentication_string: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(rename = "m.relates_to", skip_serializing_if = "Option::is_none")]
    pub relates_to: Option<Relation>,
}

/// Negotiation lists offered by the SAS initiator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SasOffer {
    pub key_agreement_protocols: Vec<String>,
    pub hashes: Vec<String>,
    pub message_authentication_codes: Vec<String>,
    pub short_authentication_string: Vec<String>,
}

/// What a start message asks for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StartMethod {
    /// Short authentication string with its negotiation lists.
    Sas(SasOffer),
    /// Reciprocation of a scanned QR code.
    Reciprocate { shared_secret: String },
}

/// A start message with every required field present.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidStart {
    pub transaction_id: String,
    pub from_device: String,
    pub method: StartMethod,
}

impl StartContent {
    /// Checks required fields. The offer must include `sha256` and `decimal`.
    pub fn validate(self) -> Option<ValidStart> {
        let transaction_id = transaction_id(self.transaction_id, self.relates_to)?;
        let from_device = non_empty(self.from_device)?;

        let method = match self.method.as_deref() {
            Some(METHOD_SAS) => {
                let hashes = non_empty_list(self.hashes)?;
                let sas = non_empty_list(self.short_authentication_string)?;
                if !hashes.iter().any(|h| h == HASH_SHA256) || !sas.iter().any(|s| s == SAS_DECIMAL) {
                    return None;
                }
                StartMethod::Sas(SasOffer {
                    key_agreement_protocols: non_empty_list(self.key_agreement_protocols)?,
                    hashes,
                    message_authentication_codes: non_empty_list(self.message_authentication_codes)?,
                    short_authentication_string: sas,
                })
            }
            Some(METHOD_RECIPROCATE) => StartMethod::Reciprocate {
                shared_secret: non_empty(self.secret)?,
            },
            _ => return None,
        };

        Some(ValidStart {
            transaction_id,
            from_device,
            method,
        })
    }
}

/// Wire form of `m.key.verification.accept`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AcceptContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_agreement_protocol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_authentication_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short_authentication_string: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commitment: Option<String>,
    #[serde(rename = "m.relates_to", skip_serializing_if = "Option::is_none")]
    pub relates_to: Option<Relation>,
}

/// An accept message with every required field present.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidAccept {
    pub transaction_id: String,
    pub key_agreement_protocol: String,
    pub hash: String,
    pub message_authentication_code: String,
    pub short_authentication_string: Vec<String>,
    pub commitment: String,
}

impl AcceptContent {
    pub fn validate(self) -> Option<ValidAccept> {
        Some(ValidAccept {
            transaction_id: transaction_id(self.transaction_id, self.relates_to)?,
            key_agreement_protocol: non_empty(self.key_agreement_protocol)?,
            hash: non_empty(self.hash)?,
            message_authentication_code: non_empty(self.message_authentication_code)?,
            short_authentication_string: non_empty_list(self.short_authentication_string)?,
            commitment: non_empty(self.commitment)?,
        })
    }
}

/// Wire form of `m.key.verification.key`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeyContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(rename = "m.relates_to", skip_serializing_if = "Option::is_none")]
    pub relates_to: Option<Relation>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidKey {
    pub transaction_id: String,
    pub key: String,
}

impl KeyContent {
    pub fn validate(self) -> Option<ValidKey> {
        Some(ValidKey {
            transaction_id: transaction_id(self.transaction_id, self.relates_to)?,
            key: non_empty(self.key)?,
        })
    }
}

/// Wire form of `m.key.verification.mac`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MacContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keys: Option<String>,
    #[serde(rename = "m.relates_to", skip_serializing_if = "Option::is_none")]
    pub relates_to: Option<Relation>,
}

/// MACs over each vouched key id plus the MAC over the key id list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidMac {
    pub transaction_id: String,
    pub mac: BTreeMap<String, String>,
    pub keys: String,
}

impl MacContent {
    pub fn validate(self) -> Option<ValidMac> {
        Some(ValidMac {
            transaction_id: transaction_id(self.transaction_id, self.relates_to)?,
            mac: self.mac.filter(|m| !m.is_empty())?,
            keys: non_empty(self.keys)?,
        })
    }
}

/// Wire form of `m.key.verification.cancel`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CancelContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(rename = "m.relates_to", skip_serializing_if = "Option::is_none")]
    pub relates_to: Option<Relation>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidCancel {
    pub transaction_id: String,
    pub code: CancelCode,
    pub reason: String,
}

impl CancelContent {
    pub fn validate(self) -> Option<ValidCancel> {
        let code = non_empty(self.code)?;
        Some(ValidCancel {
            transaction_id: transaction_id(self.transaction_id, self.relates_to)?,
            code: CancelCode::from_value(&code),
            reason: self.reason.unwrap_or_default(),
        })
    }
}

/// Wire form of `m.key.verification.ready`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ReadyContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_device: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub methods: Option<Vec<String>>,
    #[serde(rename = "m.relates_to", skip_serializing_if = "Option::is_none")]
    pub relates_to: Option<Relation>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidReady {
    pub transaction_id: String,
    pub from_device: String,
    pub methods: Vec<String>,
}

impl ReadyContent {
    pub fn validate(self) -> Option<ValidReady> {
        Some(ValidReady {
            transaction_id: transaction_id(self.transaction_id, self.relates_to)?,
            from_device: non_empty(self.from_device)?,
            methods: non_empty_list(self.methods)?,
        })
    }
}

/// Wire form of `m.key.verification.request`, both as a to-device event and
/// as an `m.room.message` body.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RequestContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msgtype: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_device: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub methods: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidRequest {
    pub transaction_id: String,
    pub from_device: String,
    pub to_user_id: Option<String>,
    pub methods: Vec<String>,
    pub timestamp: Option<u64>,
}

impl RequestContent {
    /// `event_id` is the id of the room event carrying the request, which
    /// stands in for a transaction id in rooms.
    pub fn validate(self, event_id: Option<&str>) -> Option<ValidRequest> {
        let transaction_id = non_empty(self.transaction_id)
            .or_else(|| non_empty(event_id.map(str::to_string)))?;

        Some(ValidRequest {
            transaction_id,
            from_device: non_empty(self.from_device)?,
            to_user_id: non_empty(self.to),
            methods: non_empty_list(self.methods)?,
            timestamp: self.timestamp,
        })
    }
}

/// Wire form of `m.key.verification.done`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DoneContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(rename = "m.relates_to", skip_serializing_if = "Option::is_none")]
    pub relates_to: Option<Relation>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidDone {
    pub transaction_id: String,
}

impl DoneContent {
    pub fn validate(self) -> Option<ValidDone> {
        Some(ValidDone {
            transaction_id: transaction_id(self.transaction_id, self.relates_to)?,
        })
    }
}
