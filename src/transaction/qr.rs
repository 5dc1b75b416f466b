use super::{Outgoing, TransactionParams, TxState, Variant, VerificationTransaction};
use crate::crypto::{constant_time_eq, decode_base64, encode_base64};
use crate::messages::{StartMethod, ValidStart, VerificationInfo};
use crate::qrcode::generate_shared_secret;
use crate::{CancelCode, Error, QrCodeData, QrCodeMode};
use tracing::{debug, info, warn};

/// Trust granted once the peer confirms our reciprocate start.
#[derive(Debug)]
struct PendingTrust {
    master_key_of: Option<String>,
    devices: Vec<String>,
}

/// QR specific part of a transaction.
pub(super) struct QrData {
    /// The code this device displays, if the peer can scan.
    displayed: Option<QrCodeData>,
    pending_trust: Option<PendingTrust>,
}

impl QrData {
    pub(super) fn new(displayed: Option<QrCodeData>) -> Self {
        Self {
            displayed,
            pending_trust: None,
        }
    }

    pub(super) fn displayed_text(&self) -> Option<String> {
        self.displayed.as_ref()?.to_encoded_string().ok()
    }

    pub(super) fn release(&mut self) {
        self.displayed = None;
        self.pending_trust = None;
    }
}

/// Builds the code this device shows to the peer.
///
/// Needs a master key on our side, and for another user the master key we
/// know for them.
pub(super) fn displayed_code(params: &TransactionParams) -> Option<QrCodeData> {
    let my_master_key = params.cross_signing.my_master_key()?;

    let (mode, first_key, second_key) = if params.other_user_id != params.user_id {
        if !params.cross_signing.is_trusted() {
            return None;
        }
        let their_master_key = params.cross_signing.user_master_key(&params.other_user_id)?;
        (QrCodeMode::VerifyingAnotherUser, my_master_key, their_master_key)
    } else if params.cross_signing.is_trusted() {
        let other_device = params.other_device_id.as_deref()?;
        let their_device_key = params
            .device_store
            .device_fingerprint(&params.other_user_id, other_device)?;
        (QrCodeMode::SelfVerifyingMasterKeyTrusted, my_master_key, their_device_key)
    } else {
        let my_device_key = params
            .device_store
            .device_fingerprint(&params.user_id, &params.device_id)?;
        (QrCodeMode::SelfVerifyingMasterKeyNotTrusted, my_device_key, my_master_key)
    };

    let shared_secret = match generate_shared_secret() {
        Ok(secret) => secret,
        Err(err) => {
            warn!(transaction_id = %params.transaction_id, error = %err, "Cannot generate QR code secret");
            return None;
        }
    };

    Some(QrCodeData {
        mode,
        transaction_id: params.transaction_id.clone(),
        first_key,
        second_key,
        shared_secret,
    })
}

fn same_secret(a: &str, b: &str) -> bool {
    match (decode_base64(a), decode_base64(b)) {
        (Ok(a), Ok(b)) => constant_time_eq(&encode_base64(a), &encode_base64(b)),
        _ => false,
    }
}

impl VerificationTransaction {
    fn qr(&self) -> Option<&QrData> {
        match &self.variant {
            Variant::QrCode(qr) => Some(qr.as_ref()),
            Variant::Sas(_) => None,
        }
    }

    fn qr_mut(&mut self) -> Option<&mut QrData> {
        match &mut self.variant {
            Variant::QrCode(qr) => Some(qr.as_mut()),
            Variant::Sas(_) => None,
        }
    }

    fn queue_done(&mut self) {
        self.outbox
            .push(Outgoing::best_effort(VerificationInfo::done(&self.transaction_id)));
    }

    fn apply_trust(&mut self, trust: PendingTrust) {
        if let Some(user_id) = &trust.master_key_of {
            self.cross_signing.mark_master_key_trusted(user_id);
        }
        for device_id in &trust.devices {
            self.mark_device_verified(device_id);
        }
    }

    /// The peer scanned our code and sent its reciprocate start.
    pub(super) fn on_reciprocate_start(&mut self, start: &ValidStart) {
        let StartMethod::Reciprocate { shared_secret } = &start.method else {
            self.cancel(CancelCode::UnexpectedMessage);
            return;
        };

        let Some(matches) = self
            .qr()
            .and_then(|qr| qr.displayed.as_ref())
            .map(|displayed| same_secret(shared_secret, &displayed.shared_secret))
        else {
            debug!(transaction_id = %self.transaction_id, "Reciprocate start without a displayed code");
            self.cancel(CancelCode::UnexpectedMessage);
            return;
        };

        if self.state != TxState::None {
            self.cancel(CancelCode::UnexpectedMessage);
            return;
        }

        if matches {
            if self.other_device_id.is_none() {
                self.other_device_id = Some(start.from_device.clone());
            }
            self.set_state(TxState::QrScannedByOther);
        } else {
            warn!(transaction_id = %self.transaction_id, "Reciprocate secret mismatch");
            self.cancel(CancelCode::MismatchedKeys);
        }
    }

    /// The user confirmed the peer scanned our code.
    pub(crate) fn other_user_scanned_my_qr_code(&mut self) -> Result<(), Error> {
        if self.state != TxState::QrScannedByOther {
            return Err(Error::Protocol(format!("Nothing to confirm in state {:?}", self.state)));
        }

        let mode = self
            .qr()
            .and_then(|qr| qr.displayed.as_ref())
            .map(|code| code.mode)
            .ok_or_else(|| Error::Protocol("No QR code displayed".to_string()))?;

        let trust = match mode {
            QrCodeMode::VerifyingAnotherUser => PendingTrust {
                master_key_of: Some(self.other_user_id.clone()),
                devices: Vec::new(),
            },
            QrCodeMode::SelfVerifyingMasterKeyTrusted => PendingTrust {
                master_key_of: None,
                devices: self.other_device_id.iter().cloned().collect(),
            },
            QrCodeMode::SelfVerifyingMasterKeyNotTrusted => PendingTrust {
                master_key_of: Some(self.user_id.clone()),
                devices: Vec::new(),
            },
        };

        self.apply_trust(trust);
        info!(transaction_id = %self.transaction_id, ?mode, "QR code verification confirmed");
        self.set_state(TxState::Verified);
        self.queue_done();
        Ok(())
    }

    /// The user said the peer did not scan our code.
    pub(crate) fn other_user_did_not_scan_my_qr_code(&mut self) {
        self.cancel(CancelCode::MismatchedKeys);
    }

    /// The user scanned the code displayed by the peer.
    pub(crate) fn user_has_scanned_other_qr_code(&mut self, text: &str) -> Result<(), Error> {
        if self.qr().is_none() || self.state != TxState::None {
            return Err(Error::Protocol(format!("Cannot scan in state {:?}", self.state)));
        }

        let code = match QrCodeData::from_encoded_string(text) {
            Ok(code) if code.transaction_id == self.transaction_id => code,
            Ok(code) => {
                debug!(
                    transaction_id = %self.transaction_id,
                    scanned = %code.transaction_id,
                    "QR code is for another transaction"
                );
                self.cancel(CancelCode::QrCodeInvalid);
                return Ok(());
            }
            Err(err) => {
                debug!(transaction_id = %self.transaction_id, error = %err, "Invalid QR code");
                self.cancel(CancelCode::QrCodeInvalid);
                return Ok(());
            }
        };

        match self.check_scanned_keys(&code) {
            Some(trust) => {
                if let Some(qr) = self.qr_mut() {
                    qr.pending_trust = Some(trust);
                }
                let start = self
                    .transport
                    .create_start_for_qr_code(&self.device_id, &self.transaction_id, &code.shared_secret);
                self.set_state(TxState::Started);
                self.queue(start, Some((TxState::Started, TxState::WaitingOtherReciprocateConfirm)));
            }
            None => {
                warn!(transaction_id = %self.transaction_id, mode = ?code.mode, "Scanned keys do not match");
                self.cancel(CancelCode::MismatchedKeys);
            }
        }
        Ok(())
    }

    /// Compares the scanned keys with ours; returns what can be trusted.
    fn check_scanned_keys(&self, code: &QrCodeData) -> Option<PendingTrust> {
        let my_master_key = self.cross_signing.my_master_key()?;

        match code.mode {
            QrCodeMode::VerifyingAnotherUser => {
                let their_master_key = self.cross_signing.user_master_key(&self.other_user_id)?;
                (code.first_key == their_master_key && code.second_key == my_master_key).then(|| PendingTrust {
                    master_key_of: Some(self.other_user_id.clone()),
                    devices: Vec::new(),
                })
            }
            QrCodeMode::SelfVerifyingMasterKeyTrusted => {
                let my_device_key = self.device_store.device_fingerprint(&self.user_id, &self.device_id)?;
                (code.first_key == my_master_key && code.second_key == my_device_key).then(|| PendingTrust {
                    master_key_of: Some(self.user_id.clone()),
                    devices: Vec::new(),
                })
            }
            QrCodeMode::SelfVerifyingMasterKeyNotTrusted => {
                let other_device = self.other_device_id.as_deref()?;
                let their_device_key = self.device_store.device_fingerprint(&self.other_user_id, other_device)?;
                (code.first_key == their_device_key && code.second_key == my_master_key).then(|| PendingTrust {
                    master_key_of: None,
                    devices: vec![other_device.to_string()],
                })
            }
        }
    }

    /// The peer confirmed our reciprocate start.
    pub(super) fn on_done_received(&mut self) {
        if !matches!(self.state, TxState::Started | TxState::WaitingOtherReciprocateConfirm) {
            self.cancel(CancelCode::UnexpectedMessage);
            return;
        }

        if let Some(trust) = self.qr_mut().and_then(|qr| qr.pending_trust.take()) {
            self.apply_trust(trust);
        }

        info!(transaction_id = %self.transaction_id, "QR code verification completed");
        self.set_state(TxState::Verified);
        self.queue_done();
    }
}
