use crate::Error;
use rand::TryRngCore;
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Fills a fresh buffer of `len` bytes from the operating system RNG.
pub(crate) fn random_bytes(len: usize) -> Result<Vec<u8>, Error> {
    let mut bytes = vec![0u8; len];
    OsRng
        .try_fill_bytes(bytes.as_mut_slice())
        .map_err(|_| Error::Random)?;
    Ok(bytes)
}

/// An X25519 public key as exchanged in key messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct X25519PublicKey(PublicKey);

impl X25519PublicKey {
    /// Returns the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// Parses a key from its 32 raw bytes, rejecting any other length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, Error> {
        let raw: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Crypto(format!("Invalid public key length {}", bytes.len())))?;
        Ok(Self::from(raw))
    }
}

impl From<[u8; 32]> for X25519PublicKey {
    fn from(bytes: [u8; 32]) -> Self {
        Self(PublicKey::from(bytes))
    }
}

impl AsRef<PublicKey> for X25519PublicKey {
    fn as_ref(&self) -> &PublicKey {
        &self.0
    }
}

/// The ephemeral secret half of a SAS key pair.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub(crate) struct X25519Secret(Box<StaticSecret>);

impl X25519Secret {
    /// Generates a new secret from the operating system RNG.
    pub(crate) fn generate() -> Result<Self, Error> {
        let mut seed = Box::new([0u8; 32]);
        OsRng
            .try_fill_bytes(seed.as_mut_slice())
            .map_err(|_| Error::Random)?;
        Ok(Self::from(seed))
    }

    pub(crate) fn dh(&self, public_key: &X25519PublicKey) -> SharedSecret {
        self.0.diffie_hellman(public_key.as_ref())
    }

    pub(crate) fn public_key(&self) -> X25519PublicKey {
        X25519PublicKey(PublicKey::from(self.0.as_ref()))
    }
}

impl From<Box<[u8; 32]>> for X25519Secret {
    fn from(mut bytes: Box<[u8; 32]>) -> Self {
        let secret = StaticSecret::from(*bytes);
        bytes.zeroize();
        Self(Box::new(secret))
    }
}
