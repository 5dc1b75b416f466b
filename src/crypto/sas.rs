use super::{decode_base64, encode_base64};
use crate::Error;
use crate::crypto::x25519::{X25519PublicKey, X25519Secret};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

type HmacSha256 = Hmac<Sha256>;

/// Length of the HKDF-derived key used by the long-KDF MAC variant.
const LONG_KDF_KEY_LENGTH: usize = 256;

/// Key agreement and MAC primitive used by a SAS transaction.
///
/// One instance is owned by exactly one transaction and dropped when that
/// transaction reaches a terminal state.
pub trait SasPrimitive: Send {
    /// Returns the local ephemeral public key as unpadded base64.
    fn public_key(&self) -> String;

    /// Completes the key agreement with the peer's unpadded base64 key.
    fn set_peer_public_key(&mut self, key: &str) -> Result<(), Error>;

    /// Derives `length` bytes from the agreed secret bound to `info`.
    fn derive_bytes(&self, info: &str, length: usize) -> Result<Vec<u8>, Error>;

    /// MAC for `hkdf-hmac-sha256`.
    fn calculate_mac(&self, message: &str, info: &str) -> Result<String, Error>;

    /// MAC for `hmac-sha256`, which expands a 256 byte key first.
    fn calculate_mac_long_kdf(&self, message: &str, info: &str) -> Result<String, Error>;
}

/// Curve25519 implementation of [`SasPrimitive`].
pub struct Curve25519Sas {
    secret: X25519Secret,
    public_key: X25519PublicKey,
    shared_secret: Option<Box<[u8; 32]>>,
}

impl Curve25519Sas {
    /// Generates a fresh ephemeral key pair.
    pub fn new() -> Result<Self, Error> {
        let secret = X25519Secret::generate()?;
        let public_key = secret.public_key();

        Ok(Self {
            secret,
            public_key,
            shared_secret: None,
        })
    }

    fn shared_secret(&self) -> Result<&[u8; 32], Error> {
        self.shared_secret
            .as_deref()
            .ok_or_else(|| Error::Crypto("Peer public key not set".to_string()))
    }

    fn mac_with_key_length(&self, message: &str, info: &str, key_length: usize) -> Result<String, Error> {
        let mut key = self.derive_bytes(info, key_length)?;

        let mac = <HmacSha256 as Mac>::new_from_slice(&key);
        key.zeroize();

        let mut mac = mac.map_err(|_| Error::Crypto("HMAC initialization failed".to_string()))?;
        mac.update(message.as_bytes());

        Ok(encode_base64(mac.finalize().into_bytes()))
    }
}

impl SasPrimitive for Curve25519Sas {
    fn public_key(&self) -> String {
        encode_base64(self.public_key.as_bytes())
    }

    fn set_peer_public_key(&mut self, key: &str) -> Result<(), Error> {
        let bytes = decode_base64(key)?;
        let peer = X25519PublicKey::from_slice(&bytes)?;

        let shared = self.secret.dh(&peer);
        if !shared.was_contributory() {
            return Err(Error::Crypto("Non contributory key agreement".to_string()));
        }

        self.shared_secret = Some(Box::new(shared.to_bytes()));
        Ok(())
    }

    fn derive_bytes(&self, info: &str, length: usize) -> Result<Vec<u8>, Error> {
        let hkdf = Hkdf::<Sha256>::new(None, self.shared_secret()?);

        let mut output = vec![0u8; length];
        hkdf.expand(info.as_bytes(), &mut output)
            .map_err(|_| Error::Crypto("HKDF expansion failed".to_string()))?;

        Ok(output)
    }

    fn calculate_mac(&self, message: &str, info: &str) -> Result<String, Error> {
        self.mac_with_key_length(message, info, 32)
    }

    fn calculate_mac_long_kdf(&self, message: &str, info: &str) -> Result<String, Error> {
        self.mac_with_key_length(message, info, LONG_KDF_KEY_LENGTH)
    }
}

impl Zeroize for Curve25519Sas {
    fn zeroize(&mut self) {
        self.secret.zeroize();
        if let Some(shared) = self.shared_secret.as_mut() {
            shared.zeroize();
        }
        self.shared_secret = None;
    }
}

impl Drop for Curve25519Sas {
    fn drop(&mut self) {
        self.zeroize();
    }
}

impl ZeroizeOnDrop for Curve25519Sas {}

#[cfg(test)]
mod tests {
    use super::*;

    fn agreed_pair() -> (Curve25519Sas, Curve25519Sas) {
        let mut alice = Curve25519Sas::new().unwrap();
        let mut bob = Curve25519Sas::new().unwrap();

        let alice_key = alice.public_key();
        let bob_key = bob.public_key();
        alice.set_peer_public_key(&bob_key).unwrap();
        bob.set_peer_public_key(&alice_key).unwrap();

        (alice, bob)
    }

    #[test]
    fn test_derived_bytes_match() {
        let (alice, bob) = agreed_pair();

        let a = alice.derive_bytes("MATRIX_KEY_VERIFICATION_SAS", 6).unwrap();
        let b = bob.derive_bytes("MATRIX_KEY_VERIFICATION_SAS", 6).unwrap();

        assert_eq!(a, b);
        assert_eq!(a.len(), 6);
    }

    #[test]
    fn test_macs_match_and_depend_on_info() {
        let (alice, bob) = agreed_pair();

        let a = alice.calculate_mac("key", "info-1").unwrap();
        assert_eq!(a, bob.calculate_mac("key", "info-1").unwrap());
        assert_ne!(a, bob.calculate_mac("key", "info-2").unwrap());
        assert_ne!(a, bob.calculate_mac_long_kdf("key", "info-1").unwrap());
        assert!(!a.ends_with('='));
    }

    #[test]
    fn test_derive_without_peer_key_fails() {
        let sas = Curve25519Sas::new().unwrap();
        assert!(sas.derive_bytes("info", 6).is_err());
    }

    #[test]
    fn test_rejects_malformed_peer_key() {
        let mut sas = Curve25519Sas::new().unwrap();
        assert!(sas.set_peer_public_key("not base64!").is_err());
        assert!(sas.set_peer_public_key("AAAA").is_err());
    }
}
