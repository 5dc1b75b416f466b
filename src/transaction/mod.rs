mod state;
pub use state::*;

mod sas;
use sas::SasData;

mod qr;
use qr::QrData;

use crate::messages::{SasOffer, StartMethod, ValidStart, VerificationInfo};
use crate::short_code::{EmojiRepresentation, SasMode, decimal_code, emoji_code};
use crate::transport::Transport;
use crate::{CancelCode, CrossSigning, DeviceStore, Error};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

/// Verification method of a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionMethod {
    Sas,
    QrCode,
}

/// Read-only view of a transaction handed to listeners and callers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionSnapshot {
    pub transaction_id: String,
    pub other_user_id: String,
    pub other_device_id: Option<String>,
    pub room_id: Option<String>,
    pub is_incoming: bool,
    pub method: TransactionMethod,
    pub state: TxState,
    /// Three numbers, available once the short code is ready.
    pub decimal_code: Option<String>,
    /// Seven emoji, available when both sides agreed on emoji.
    pub emoji_code: Option<Vec<EmojiRepresentation>>,
    /// Latin-1 text of the QR code this device displays.
    pub qr_code_text: Option<String>,
    /// Peer device ids marked verified by this transaction.
    pub verified_devices: Vec<String>,
}

/// Local cancel code of a handshake step that could not be delivered. The
/// wire taxonomy has no code for an unreachable peer.
pub(crate) const DELIVERY_FAILED: CancelCode = CancelCode::User;

/// A message queued by the state machine, with what to do once it is sent.
#[derive(Clone, Debug)]
pub(crate) struct Outgoing {
    pub(crate) info: VerificationInfo,
    /// Compare-and-set applied when delivery succeeds.
    pub(crate) advance: Option<(TxState, TxState)>,
    /// Code the transaction is cancelled with when delivery fails.
    pub(crate) on_failure: Option<CancelCode>,
}

impl Outgoing {
    /// A handshake step; failing to deliver it ends the transaction.
    pub(crate) fn step(info: VerificationInfo, advance: Option<(TxState, TxState)>) -> Self {
        Self {
            info,
            advance,
            on_failure: Some(DELIVERY_FAILED),
        }
    }

    /// A cancel or done, sent once with failures only logged.
    pub(crate) fn best_effort(info: VerificationInfo) -> Self {
        Self {
            info,
            advance: None,
            on_failure: None,
        }
    }

    pub(crate) fn is_best_effort(&self) -> bool {
        self.advance.is_none() && self.on_failure.is_none()
    }
}

/// Identity and collaborators of a new transaction.
#[derive(Clone)]
pub(crate) struct TransactionParams {
    pub(crate) transaction_id: String,
    pub(crate) user_id: String,
    pub(crate) device_id: String,
    pub(crate) other_user_id: String,
    pub(crate) other_device_id: Option<String>,
    pub(crate) transport: Transport,
    pub(crate) device_store: Arc<dyn DeviceStore>,
    pub(crate) cross_signing: Arc<dyn CrossSigning>,
}

enum Variant {
    Sas(Box<SasData>),
    QrCode(Box<QrData>),
}

/// One verification attempt between this device and a peer device.
///
/// The transaction never performs I/O. Messages to send are queued in an
/// outbox drained by the service, which reports delivery results back.
pub(crate) struct VerificationTransaction {
    transaction_id: String,
    user_id: String,
    device_id: String,
    other_user_id: String,
    other_device_id: Option<String>,
    incoming: bool,
    state: TxState,
    transport: Transport,
    device_store: Arc<dyn DeviceStore>,
    cross_signing: Arc<dyn CrossSigning>,
    variant: Variant,
    verified_devices: Vec<String>,
    outbox: Vec<Outgoing>,
    /// Tells apart instances registered under the same id.
    generation: u64,
}

impl VerificationTransaction {
    fn new(params: TransactionParams, incoming: bool, variant: Variant) -> Self {
        Self {
            transaction_id: params.transaction_id,
            user_id: params.user_id,
            device_id: params.device_id,
            other_user_id: params.other_user_id,
            other_device_id: params.other_device_id,
            incoming,
            state: TxState::None,
            transport: params.transport,
            device_store: params.device_store,
            cross_signing: params.cross_signing,
            variant,
            verified_devices: Vec::new(),
            outbox: Vec::new(),
            generation: 0,
        }
    }

    /// A SAS transaction this device initiates with `offer`.
    pub(crate) fn new_outgoing_sas(params: TransactionParams, offer: SasOffer) -> Self {
        Self::new(params, false, Variant::Sas(Box::new(SasData::outgoing(offer))))
    }

    /// A SAS transaction answering `start`, whose raw content is kept for
    /// the commitment.
    pub(crate) fn new_incoming_sas(
        params: TransactionParams,
        start: &ValidStart,
        start_content: &Value,
    ) -> Result<Self, Error> {
        let StartMethod::Sas(offer) = &start.method else {
            return Err(Error::UnknownMethod("Not a SAS start".to_string()));
        };

        let data = SasData::incoming(offer.clone(), start_content)?;
        let mut transaction = Self::new(params, true, Variant::Sas(Box::new(data)));
        transaction.other_device_id = Some(start.from_device.clone());
        transaction.set_state(TxState::OnStarted);

        Ok(transaction)
    }

    /// A QR transaction created once a request is ready. A code is displayed
    /// only when the peer can scan and our identity allows building one.
    pub(crate) fn new_qr(params: TransactionParams, incoming: bool, other_can_scan: bool) -> Self {
        let displayed = if other_can_scan { qr::displayed_code(&params) } else { None };
        Self::new(params, incoming, Variant::QrCode(Box::new(QrData::new(displayed))))
    }

    pub(crate) fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    pub(crate) fn other_user_id(&self) -> &str {
        &self.other_user_id
    }

    pub(crate) fn is_incoming(&self) -> bool {
        self.incoming
    }

    pub(crate) fn state(&self) -> TxState {
        self.state
    }

    pub(crate) fn transport(&self) -> &Transport {
        &self.transport
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
    }

    pub(crate) fn method(&self) -> TransactionMethod {
        match self.variant {
            Variant::Sas(_) => TransactionMethod::Sas,
            Variant::QrCode(_) => TransactionMethod::QrCode,
        }
    }

    pub(crate) fn snapshot(&self) -> TransactionSnapshot {
        let (decimal, emoji, qr_code_text) = match &self.variant {
            Variant::Sas(sas) => {
                let bytes = sas.short_code_bytes();
                let decimal = bytes.and_then(decimal_code);
                let emoji = bytes
                    .filter(|_| sas.agreed_modes().contains(&SasMode::Emoji))
                    .and_then(emoji_code);
                (decimal, emoji, None)
            }
            Variant::QrCode(qr) => (None, None, qr.displayed_text()),
        };

        TransactionSnapshot {
            transaction_id: self.transaction_id.clone(),
            other_user_id: self.other_user_id.clone(),
            other_device_id: self.other_device_id.clone(),
            room_id: self.transport.room_id().map(str::to_string),
            is_incoming: self.incoming,
            method: self.method(),
            state: self.state,
            decimal_code: decimal,
            emoji_code: emoji,
            qr_code_text,
            verified_devices: self.verified_devices.clone(),
        }
    }

    /// Messages queued since the last call.
    pub(crate) fn take_outbox(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.outbox)
    }

    fn queue(&mut self, info: VerificationInfo, advance: Option<(TxState, TxState)>) {
        self.outbox.push(Outgoing::step(info, advance));
    }

    fn set_state(&mut self, state: TxState) {
        debug!(
            transaction_id = %self.transaction_id,
            from = ?self.state,
            to = ?state,
            "Transaction state changed"
        );
        self.state = state;

        if state.is_terminal() {
            // Key material never outlives the transaction.
            match &mut self.variant {
                Variant::Sas(sas) => sas.release(),
                Variant::QrCode(qr) => qr.release(),
            }
        }
    }

    /// Cancels locally and queues a best-effort cancel for the peer.
    pub(crate) fn cancel(&mut self, code: CancelCode) {
        if self.state.is_terminal() {
            return;
        }

        info!(transaction_id = %self.transaction_id, code = %code, "Cancelling transaction");
        self.set_state(TxState::Cancelled(code));
        self.outbox
            .push(Outgoing::best_effort(VerificationInfo::cancel(&self.transaction_id, code)));
    }

    /// Drops the transaction without telling the peer, when another attempt
    /// with the same id takes its place.
    pub(crate) fn abandon(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        info!(transaction_id = %self.transaction_id, "Abandoning transaction");
        self.outbox.clear();
        self.set_state(TxState::Cancelled(CancelCode::UnexpectedMessage));
    }

    /// The peer cancelled. Nothing is sent back.
    pub(crate) fn on_cancel_received(&mut self, code: CancelCode) {
        if self.state.is_terminal() {
            debug!(transaction_id = %self.transaction_id, "Ignoring cancel for finished transaction");
            return;
        }

        info!(transaction_id = %self.transaction_id, code = %code, "Transaction cancelled by peer");
        self.set_state(TxState::OnCancelled(code));
    }

    /// Applies the outcome of sending `outgoing`.
    pub(crate) fn on_delivery(&mut self, outgoing: &Outgoing, delivered: bool) {
        if delivered {
            if let Some((from, to)) = outgoing.advance {
                let transition = self.state.advance(from, to);
                debug!(
                    transaction_id = %self.transaction_id,
                    ?from,
                    ?to,
                    ?transition,
                    "Delivery confirmed"
                );
            }
        } else if let Some(code) = outgoing.on_failure {
            self.cancel(code);
        }
    }

    /// Routes a message from the peer.
    pub(crate) fn on_verification_info(&mut self, info: &VerificationInfo) {
        if let VerificationInfo::Cancel(cancel) = info {
            self.on_cancel_received(cancel.code);
            return;
        }

        if self.state.is_terminal() {
            debug!(transaction_id = %self.transaction_id, "Dropping message for finished transaction");
            return;
        }

        match (&self.variant, info) {
            (Variant::Sas(_), VerificationInfo::Accept(accept)) => self.on_accept(accept),
            (Variant::Sas(_), VerificationInfo::Key(key)) => self.on_key(key),
            (Variant::Sas(_), VerificationInfo::Mac(mac)) => self.on_mac(mac),
            (Variant::QrCode(_), VerificationInfo::Start(start)) => self.on_reciprocate_start(start),
            (Variant::QrCode(_), VerificationInfo::Done(_)) => self.on_done_received(),
            (_, VerificationInfo::Done(_)) => {}
            _ => {
                debug!(transaction_id = %self.transaction_id, "Unexpected message for transaction");
                self.cancel(CancelCode::UnexpectedMessage);
            }
        }
    }

    fn mark_device_verified(&mut self, device_id: &str) {
        self.device_store.mark_verified(&self.other_user_id, device_id);
        if !self.verified_devices.iter().any(|d| d == device_id) {
            self.verified_devices.push(device_id.to_string());
        }
    }
}
