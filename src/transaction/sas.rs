use super::{TxState, Variant, VerificationTransaction};
use crate::crypto::{Curve25519Sas, SasPrimitive, canonical_json, constant_time_eq, sha256_base64};
use crate::messages::{
    KEY_AGREEMENT_V2, KNOWN_AGREEMENT_PROTOCOLS, KNOWN_HASHES, KNOWN_MACS, MAC_HKDF_HMAC_SHA256,
    MAC_HMAC_SHA256, SasOffer, ValidAccept, ValidKey, ValidMac, VerificationInfo,
};
use crate::short_code::{SAS_BYTES_LENGTH, SasMode};
use crate::{CancelCode, Error};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

const SAS_INFO_PREFIX: &str = "MATRIX_KEY_VERIFICATION_SAS";
const MAC_INFO_PREFIX: &str = "MATRIX_KEY_VERIFICATION_MAC";
const KEY_IDS_SUFFIX: &str = "KEY_IDS";

/// SAS specific part of a transaction.
pub(super) struct SasData {
    /// Negotiation lists of the start message, ours or the peer's.
    offer: SasOffer,
    /// Canonical JSON of the start message, input of the commitment.
    start_canonical: Option<String>,
    primitive: Option<Box<dyn SasPrimitive>>,
    accept: Option<ValidAccept>,
    short_code_bytes: Option<Vec<u8>>,
    my_mac: Option<ValidMac>,
    their_mac: Option<ValidMac>,
}

impl SasData {
    pub(super) fn outgoing(offer: SasOffer) -> Self {
        Self {
            offer,
            start_canonical: None,
            primitive: None,
            accept: None,
            short_code_bytes: None,
            my_mac: None,
            their_mac: None,
        }
    }

    pub(super) fn incoming(offer: SasOffer, start_content: &Value) -> Result<Self, Error> {
        let mut data = Self::outgoing(offer);
        data.start_canonical = Some(canonical_json(start_content)?);
        Ok(data)
    }

    pub(super) fn short_code_bytes(&self) -> Option<&[u8]> {
        self.short_code_bytes.as_deref()
    }

    /// Short code formats both sides agreed on.
    pub(super) fn agreed_modes(&self) -> Vec<SasMode> {
        self.accept
            .iter()
            .flat_map(|a| a.short_authentication_string.iter())
            .filter_map(|s| SasMode::from_value(s))
            .collect()
    }

    pub(super) fn release(&mut self) {
        self.primitive = None;
    }
}

fn first_known(offered: &[String], known: &[&str]) -> Option<String> {
    offered.iter().find(|o| known.contains(&o.as_str())).cloned()
}

impl VerificationTransaction {
    fn sas(&self) -> Result<&SasData, CancelCode> {
        match &self.variant {
            Variant::Sas(sas) => Ok(sas.as_ref()),
            Variant::QrCode(_) => Err(CancelCode::UnexpectedMessage),
        }
    }

    fn sas_mut(&mut self) -> Result<&mut SasData, CancelCode> {
        match &mut self.variant {
            Variant::Sas(sas) => Ok(sas.as_mut()),
            Variant::QrCode(_) => Err(CancelCode::UnexpectedMessage),
        }
    }

    /// Creates the key pair on first use.
    fn ensure_primitive(&mut self) -> Result<&mut Box<dyn SasPrimitive>, CancelCode> {
        let sas = self.sas_mut()?;
        if sas.primitive.is_none() {
            let primitive = Curve25519Sas::new().map_err(|_| CancelCode::User)?;
            sas.primitive = Some(Box::new(primitive));
        }
        sas.primitive.as_mut().ok_or(CancelCode::User)
    }

    fn primitive(&self) -> Result<&dyn SasPrimitive, CancelCode> {
        self.sas()?.primitive.as_deref().ok_or(CancelCode::User)
    }

    fn other_device(&self) -> Result<&str, CancelCode> {
        self.other_device_id.as_deref().ok_or(CancelCode::User)
    }

    /// Sends the start message of an outgoing SAS transaction.
    pub(crate) fn start(&mut self) -> Result<(), Error> {
        if self.incoming || self.state != TxState::None {
            return Err(Error::Protocol("Transaction cannot be started".to_string()));
        }

        let offer = self
            .sas()
            .map_err(|_| Error::UnknownMethod("Not a SAS transaction".to_string()))?
            .offer
            .clone();
        let start = self
            .transport
            .create_start_for_sas(&self.device_id, &self.transaction_id, offer);
        let canonical = canonical_json(&self.transport.encode(&start)?)?;

        if let Ok(sas) = self.sas_mut() {
            sas.start_canonical = Some(canonical);
        }

        self.set_state(TxState::SendingStart);
        self.queue(start, Some((TxState::SendingStart, TxState::Started)));
        Ok(())
    }

    /// Answers an incoming start with an accept carrying our commitment.
    pub(crate) fn perform_accept(&mut self) -> Result<(), Error> {
        if !self.incoming || self.state != TxState::OnStarted {
            return Err(Error::Protocol(format!("Cannot accept in state {:?}", self.state)));
        }

        if let Err(code) = self.accept_start() {
            self.cancel(code);
        }
        Ok(())
    }

    fn accept_start(&mut self) -> Result<(), CancelCode> {
        let other_device = self.other_device()?.to_string();
        if self
            .device_store
            .device_fingerprint(&self.other_user_id, &other_device)
            .is_none()
        {
            warn!(
                transaction_id = %self.transaction_id,
                other_device_id = %other_device,
                "Can't find the peer device key"
            );
            return Err(CancelCode::User);
        }

        let sas = self.sas()?;
        let offer = &sas.offer;
        let protocol = first_known(&offer.key_agreement_protocols, &KNOWN_AGREEMENT_PROTOCOLS);
        let hash = first_known(&offer.hashes, &KNOWN_HASHES);
        let mac = first_known(&offer.message_authentication_codes, &KNOWN_MACS);
        let modes: Vec<String> = offer
            .short_authentication_string
            .iter()
            .filter(|s| SasMode::from_value(s).is_some())
            .cloned()
            .collect();

        let (Some(protocol), Some(hash), Some(mac)) = (protocol, hash, mac) else {
            return Err(CancelCode::UnknownMethod);
        };
        if modes.is_empty() {
            return Err(CancelCode::UnknownMethod);
        }

        let canonical = sas.start_canonical.clone().ok_or(CancelCode::User)?;
        let key = self.ensure_primitive()?.public_key();
        let commitment = sha256_base64(&format!("{key}{canonical}"));

        let accept = self
            .transport
            .create_accept(&self.transaction_id, &protocol, &hash, commitment, &mac, modes);
        let VerificationInfo::Accept(valid) = &accept else {
            return Err(CancelCode::User);
        };
        self.sas_mut()?.accept = Some(valid.clone());

        self.set_state(TxState::SendingAccept);
        self.queue(accept, Some((TxState::SendingAccept, TxState::Accepted)));
        Ok(())
    }

    pub(super) fn on_accept(&mut self, accept: &ValidAccept) {
        if self.incoming || !matches!(self.state, TxState::SendingStart | TxState::Started) {
            self.cancel(CancelCode::UnexpectedMessage);
            return;
        }

        if let Err(code) = self.handle_accept(accept) {
            self.cancel(code);
        }
    }

    fn handle_accept(&mut self, accept: &ValidAccept) -> Result<(), CancelCode> {
        let offer = &self.sas()?.offer;
        let offered = |list: &[String], value: &str| list.iter().any(|v| v == value);

        let agreed = offered(&offer.key_agreement_protocols, &accept.key_agreement_protocol)
            && KNOWN_AGREEMENT_PROTOCOLS.contains(&accept.key_agreement_protocol.as_str())
            && offered(&offer.hashes, &accept.hash)
            && KNOWN_HASHES.contains(&accept.hash.as_str())
            && offered(&offer.message_authentication_codes, &accept.message_authentication_code)
            && KNOWN_MACS.contains(&accept.message_authentication_code.as_str())
            && accept
                .short_authentication_string
                .iter()
                .any(|s| offered(&offer.short_authentication_string, s) && SasMode::from_value(s).is_some());

        if !agreed {
            debug!(transaction_id = %self.transaction_id, "Accept uses unknown methods");
            return Err(CancelCode::UnknownMethod);
        }

        self.sas_mut()?.accept = Some(accept.clone());
        self.set_state(TxState::OnAccepted);

        let key = self.ensure_primitive()?.public_key();
        let message = self.transport.create_key(&self.transaction_id, key);
        self.set_state(TxState::SendingKey);
        self.queue(message, Some((TxState::SendingKey, TxState::KeySent)));
        Ok(())
    }

    pub(super) fn on_key(&mut self, key: &ValidKey) {
        let expected = if self.incoming {
            matches!(self.state, TxState::SendingAccept | TxState::Accepted)
        } else {
            matches!(self.state, TxState::SendingKey | TxState::KeySent)
        };

        if !expected {
            self.cancel(CancelCode::UnexpectedMessage);
            return;
        }

        if let Err(code) = self.handle_key(key) {
            self.cancel(code);
        }
    }

    fn handle_key(&mut self, key: &ValidKey) -> Result<(), CancelCode> {
        self.ensure_primitive()?
            .set_peer_public_key(&key.key)
            .map_err(|_| CancelCode::InvalidMessage)?;

        if self.incoming {
            let my_key = self.ensure_primitive()?.public_key();
            let message = self.transport.create_key(&self.transaction_id, my_key);
            self.set_state(TxState::SendingKey);
            self.queue(message, Some((TxState::SendingKey, TxState::KeySent)));
        } else {
            // Only the initiator's start was committed to.
            let sas = self.sas()?;
            let accept = sas.accept.as_ref().ok_or(CancelCode::UnexpectedMessage)?;
            let canonical = sas.start_canonical.as_deref().ok_or(CancelCode::User)?;
            let commitment = sha256_base64(&format!("{}{canonical}", key.key));

            if !constant_time_eq(&commitment, &accept.commitment) {
                warn!(transaction_id = %self.transaction_id, "Commitment mismatch");
                return Err(CancelCode::MismatchedCommitment);
            }
            self.set_state(TxState::OnKeyReceived);
        }

        let info = self.sas_info(&key.key)?;
        let bytes = self
            .primitive()?
            .derive_bytes(&info, SAS_BYTES_LENGTH)
            .map_err(|_| CancelCode::User)?;
        self.sas_mut()?.short_code_bytes = Some(bytes);

        self.set_state(TxState::ShortCodeReady);
        Ok(())
    }

    /// Info string of the short code derivation. The start sender comes first
    /// on both sides.
    fn sas_info(&self, their_key: &str) -> Result<String, CancelCode> {
        let protocol = &self
            .sas()?
            .accept
            .as_ref()
            .ok_or(CancelCode::UnexpectedMessage)?
            .key_agreement_protocol;
        let my_key = self.primitive()?.public_key();

        let me = (self.user_id.as_str(), self.device_id.as_str(), my_key.as_str());
        let them = (self.other_user_id.as_str(), self.other_device()?, their_key);
        let (first, second) = if self.incoming { (them, me) } else { (me, them) };

        let info = if protocol == KEY_AGREEMENT_V2 {
            format!(
                "{SAS_INFO_PREFIX}|{}|{}|{}|{}|{}|{}|{}",
                first.0, first.1, first.2, second.0, second.1, second.2, self.transaction_id
            )
        } else {
            format!(
                "{SAS_INFO_PREFIX}{}{}{}{}{}",
                first.0, first.1, second.0, second.1, self.transaction_id
            )
        };

        Ok(info)
    }

    fn calculate_mac(&self, message: &str, info: &str) -> Result<String, CancelCode> {
        let algorithm = self
            .sas()?
            .accept
            .as_ref()
            .map(|a| a.message_authentication_code.as_str())
            .ok_or(CancelCode::UnexpectedMessage)?;
        let primitive = self.primitive()?;

        let mac = match algorithm {
            MAC_HKDF_HMAC_SHA256 => primitive.calculate_mac(message, info),
            MAC_HMAC_SHA256 => primitive.calculate_mac_long_kdf(message, info),
            _ => return Err(CancelCode::UnknownMethod),
        };
        mac.map_err(|_| CancelCode::User)
    }

    /// The user confirmed that both devices show the same short code.
    pub(crate) fn user_has_verified_short_code(&mut self) {
        if self.state != TxState::ShortCodeReady {
            self.cancel(CancelCode::UnexpectedMessage);
            return;
        }

        self.set_state(TxState::ShortCodeAccepted);
        match self.build_my_mac() {
            Ok(mac) => {
                if let Ok(sas) = self.sas_mut() {
                    sas.my_mac = Some(mac.clone());
                }
                self.set_state(TxState::SendingMac);
                self.queue(
                    VerificationInfo::Mac(mac),
                    Some((TxState::SendingMac, TxState::MacSent)),
                );
            }
            Err(code) => {
                self.cancel(code);
                return;
            }
        }

        if self.sas().is_ok_and(|sas| sas.their_mac.is_some()) {
            self.verify_macs();
        }
    }

    /// The user said the short codes differ.
    pub(crate) fn short_code_does_not_match(&mut self) {
        self.cancel(CancelCode::MismatchedSas);
    }

    fn build_my_mac(&self) -> Result<ValidMac, CancelCode> {
        let base = format!(
            "{MAC_INFO_PREFIX}{}{}{}{}{}",
            self.user_id,
            self.device_id,
            self.other_user_id,
            self.other_device()?,
            self.transaction_id
        );

        let fingerprint = self
            .device_store
            .device_fingerprint(&self.user_id, &self.device_id)
            .ok_or(CancelCode::User)?;

        let mut macs = BTreeMap::new();
        let key_id = format!("ed25519:{}", self.device_id);
        macs.insert(key_id.clone(), self.calculate_mac(&fingerprint, &format!("{base}{key_id}"))?);

        if self.cross_signing.is_trusted()
            && let Some(master_key) = self.cross_signing.my_master_key()
        {
            let key_id = format!("ed25519:{master_key}");
            macs.insert(key_id.clone(), self.calculate_mac(&master_key, &format!("{base}{key_id}"))?);
        }

        let key_ids = macs.keys().cloned().collect::<Vec<_>>().join(",");
        let keys = self.calculate_mac(&key_ids, &format!("{base}{KEY_IDS_SUFFIX}"))?;

        let message = self.transport.create_mac(&self.transaction_id, macs, keys);
        match message {
            VerificationInfo::Mac(mac) => Ok(mac),
            _ => Err(CancelCode::User),
        }
    }

    pub(super) fn on_mac(&mut self, mac: &ValidMac) {
        let expected = matches!(
            self.state,
            TxState::SendingKey
                | TxState::KeySent
                | TxState::OnKeyReceived
                | TxState::ShortCodeReady
                | TxState::ShortCodeAccepted
                | TxState::SendingMac
                | TxState::MacSent
        );
        let duplicate = self.sas().is_ok_and(|sas| sas.their_mac.is_some());

        if !expected || duplicate {
            self.cancel(CancelCode::UnexpectedMessage);
            return;
        }

        let mine_ready = match self.sas_mut() {
            Ok(sas) => {
                sas.their_mac = Some(mac.clone());
                sas.my_mac.is_some()
            }
            Err(code) => {
                self.cancel(code);
                return;
            }
        };

        if mine_ready {
            self.verify_macs();
        }
    }

    /// Runs once both MACs are known, in whichever order they arrived.
    fn verify_macs(&mut self) {
        self.set_state(TxState::Verifying);

        match self.check_their_mac() {
            Ok((devices, master_key_verified)) => {
                for device_id in &devices {
                    self.mark_device_verified(device_id);
                }
                if master_key_verified {
                    self.cross_signing.mark_master_key_trusted(&self.other_user_id);
                }

                info!(
                    transaction_id = %self.transaction_id,
                    other_user_id = %self.other_user_id,
                    verified = ?devices,
                    "Verification succeeded"
                );
                self.set_state(TxState::Verified);

                if self.transport.requires_done() {
                    self.outbox
                        .push(super::Outgoing::best_effort(VerificationInfo::done(&self.transaction_id)));
                }
            }
            Err(code) => self.cancel(code),
        }
    }

    /// Returns the verified device ids and whether the master key was verified.
    fn check_their_mac(&self) -> Result<(Vec<String>, bool), CancelCode> {
        let their_mac = self
            .sas()?
            .their_mac
            .as_ref()
            .ok_or(CancelCode::UnexpectedMessage)?;

        let base = format!(
            "{MAC_INFO_PREFIX}{}{}{}{}{}",
            self.other_user_id,
            self.other_device()?,
            self.user_id,
            self.device_id,
            self.transaction_id
        );

        let key_ids = their_mac.mac.keys().cloned().collect::<Vec<_>>().join(",");
        let expected = self.calculate_mac(&key_ids, &format!("{base}{KEY_IDS_SUFFIX}"))?;
        if !constant_time_eq(&expected, &their_mac.keys) {
            warn!(transaction_id = %self.transaction_id, "Key id list MAC mismatch");
            return Err(CancelCode::MismatchedKeys);
        }

        let master_key = self.cross_signing.user_master_key(&self.other_user_id);
        let mut verified = Vec::new();
        let mut master_key_verified = false;

        for (key_id, mac) in &their_mac.mac {
            let Some(key) = key_id.strip_prefix("ed25519:") else {
                debug!(%key_id, "Skipping non ed25519 key id");
                continue;
            };
            let info = format!("{base}{key_id}");

            if master_key.as_deref() == Some(key) {
                if !constant_time_eq(&self.calculate_mac(key, &info)?, mac) {
                    warn!(transaction_id = %self.transaction_id, "Master key MAC mismatch");
                    return Err(CancelCode::MismatchedKeys);
                }
                master_key_verified = true;
                continue;
            }

            let Some(fingerprint) = self.device_store.device_fingerprint(&self.other_user_id, key) else {
                debug!(transaction_id = %self.transaction_id, device_id = %key, "Skipping unknown device");
                continue;
            };

            if !constant_time_eq(&self.calculate_mac(&fingerprint, &info)?, mac) {
                warn!(transaction_id = %self.transaction_id, device_id = %key, "Device key MAC mismatch");
                return Err(CancelCode::MismatchedKeys);
            }
            verified.push(key.to_string());
        }

        if verified.is_empty() && !master_key_verified {
            warn!(transaction_id = %self.transaction_id, "No key could be verified");
            return Err(CancelCode::MismatchedKeys);
        }

        Ok((verified, master_key_verified))
    }
}
