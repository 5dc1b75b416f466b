use crate::messages::{KNOWN_AGREEMENT_PROTOCOLS, KNOWN_HASHES, KNOWN_MACS, KNOWN_SHORT_CODES, SasOffer};
use crate::VerificationMethod;
use std::time::Duration;

/// Tunables for a [`crate::VerificationService`].
#[derive(Clone, Debug)]
pub struct VerificationConfig {
    /// Attempts made by the send primitive before a message is considered lost.
    pub max_send_attempts: u32,
    /// Delay before retry `n` is `retry_backoff * n`.
    pub retry_backoff: Duration,
    /// Requests older than this are no longer actionable.
    pub request_validity_window: Duration,
    /// Requests stamped further than this in the future are rejected.
    pub request_future_tolerance: Duration,
    /// Methods advertised in requests and ready messages.
    pub supported_methods: Vec<VerificationMethod>,
    /// Number of finished transaction ids remembered after eviction.
    pub max_past_transactions: usize,
    /// Key agreement protocols offered in a SAS start, by preference.
    pub key_agreement_protocols: Vec<String>,
    /// MAC methods offered in a SAS start, by preference.
    pub message_authentication_codes: Vec<String>,
    /// Short code formats offered in a SAS start.
    pub short_authentication_strings: Vec<String>,
}

fn owned(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl VerificationConfig {
    /// The SAS start offer built from this configuration.
    pub fn sas_offer(&self) -> SasOffer {
        SasOffer {
            key_agreement_protocols: self.key_agreement_protocols.clone(),
            hashes: owned(&KNOWN_HASHES),
            message_authentication_codes: self.message_authentication_codes.clone(),
            short_authentication_string: self.short_authentication_strings.clone(),
        }
    }
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            max_send_attempts: 3,
            retry_backoff: Duration::from_millis(250),
            request_validity_window: Duration::from_secs(10 * 60),
            request_future_tolerance: Duration::from_secs(5 * 60),
            supported_methods: vec![
                VerificationMethod::Sas,
                VerificationMethod::QrCodeScan,
                VerificationMethod::QrCodeShow,
                VerificationMethod::Reciprocate,
            ],
            max_past_transactions: 50,
            key_agreement_protocols: owned(&KNOWN_AGREEMENT_PROTOCOLS),
            message_authentication_codes: owned(&KNOWN_MACS),
            short_authentication_strings: owned(&KNOWN_SHORT_CODES),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_offer() {
        let offer = VerificationConfig::default().sas_offer();
        assert_eq!(offer.key_agreement_protocols, ["curve25519-hkdf-sha256", "curve25519"]);
        assert_eq!(offer.hashes, ["sha256"]);
        assert_eq!(offer.message_authentication_codes, ["hkdf-hmac-sha256", "hmac-sha256"]);
        assert_eq!(offer.short_authentication_string, ["emoji", "decimal"]);
    }
}
