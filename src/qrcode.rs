use crate::crypto::{decode_base64, encode_base64, random_bytes};
use crate::Error;

const PREFIX: &[u8; 6] = b"MATRIX";
const VERSION: u8 = 0x02;
const KEY_LENGTH: usize = 32;
const MIN_SECRET_LENGTH: usize = 8;

/// Generates the shared secret embedded in a displayed QR code.
pub fn generate_shared_secret() -> Result<String, Error> {
    Ok(encode_base64(random_bytes(MIN_SECRET_LENGTH)?))
}

/// What the two keys of a QR code refer to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QrCodeMode {
    /// First key is our master key, second is what we believe the other
    /// user's master key is.
    VerifyingAnotherUser,
    /// First key is our master key, second is the other device's key.
    SelfVerifyingMasterKeyTrusted,
    /// First key is this device's key, second is our master key.
    SelfVerifyingMasterKeyNotTrusted,
}

impl QrCodeMode {
    fn to_byte(self) -> u8 {
        match self {
            Self::VerifyingAnotherUser => 0x00,
            Self::SelfVerifyingMasterKeyTrusted => 0x01,
            Self::SelfVerifyingMasterKeyNotTrusted => 0x02,
        }
    }

    fn from_byte(byte: u8) -> Result<Self, Error> {
        match byte {
            0x00 => Ok(Self::VerifyingAnotherUser),
            0x01 => Ok(Self::SelfVerifyingMasterKeyTrusted),
            0x02 => Ok(Self::SelfVerifyingMasterKeyNotTrusted),
            other => Err(Error::QrCode(format!("Unknown mode {other}"))),
        }
    }
}

/// Content of a verification QR code.
///
/// Keys and the shared secret are held as unpadded base64, the form they
/// have in key stores and start messages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QrCodeData {
    pub mode: QrCodeMode,
    pub transaction_id: String,
    pub first_key: String,
    pub second_key: String,
    pub shared_secret: String,
}

impl QrCodeData {
    /// Serializes the code.
    ///
    /// The format is:
    /// - 6 bytes: `MATRIX`
    /// - 1 byte: version (2)
    /// - 1 byte: mode
    /// - 2 bytes: transaction id length (big-endian u16)
    /// - transaction id
    /// - 32 bytes: first key
    /// - 32 bytes: second key
    /// - shared secret
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let id = self.transaction_id.as_bytes();
        let id_len = u16::try_from(id.len())
            .map_err(|_| Error::QrCode("Transaction id too long".to_string()))?;
        let first_key = decode_key(&self.first_key)?;
        let second_key = decode_key(&self.second_key)?;
        let secret = decode_base64(&self.shared_secret)?;

        let mut result = Vec::with_capacity(10 + id.len() + 2 * KEY_LENGTH + secret.len());
        result.extend_from_slice(PREFIX);
        result.push(VERSION);
        result.push(self.mode.to_byte());
        result.extend_from_slice(&id_len.to_be_bytes());
        result.extend_from_slice(id);
        result.extend_from_slice(&first_key);
        result.extend_from_slice(&second_key);
        result.extend_from_slice(&secret);

        Ok(result)
    }

    /// Deserializes a code from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let invalid = |reason: &str| Error::QrCode(reason.to_string());

        let rest = bytes
            .strip_prefix(PREFIX.as_slice())
            .ok_or_else(|| invalid("Missing prefix"))?;
        let (&version, rest) = rest.split_first().ok_or_else(|| invalid("Truncated"))?;
        if version != VERSION {
            return Err(Error::QrCode(format!("Unsupported version {version}")));
        }

        let (&mode, rest) = rest.split_first().ok_or_else(|| invalid("Truncated"))?;
        let mode = QrCodeMode::from_byte(mode)?;

        if rest.len() < 2 {
            return Err(invalid("Truncated"));
        }
        let (len_bytes, rest) = rest.split_at(2);
        let id_len = usize::from(u16::from_be_bytes([len_bytes[0], len_bytes[1]]));

        if rest.len() < id_len + 2 * KEY_LENGTH + MIN_SECRET_LENGTH {
            return Err(invalid("Truncated"));
        }
        let (id, rest) = rest.split_at(id_len);
        let (first_key, rest) = rest.split_at(KEY_LENGTH);
        let (second_key, secret) = rest.split_at(KEY_LENGTH);

        let transaction_id = String::from_utf8(id.to_vec())
            .map_err(|_| invalid("Transaction id is not UTF-8"))?;

        Ok(Self {
            mode,
            transaction_id,
            first_key: encode_base64(first_key),
            second_key: encode_base64(second_key),
            shared_secret: encode_base64(secret),
        })
    }

    /// Encodes the code as the Latin-1 string handed to a QR renderer.
    pub fn to_encoded_string(&self) -> Result<String, Error> {
        Ok(self.to_bytes()?.into_iter().map(char::from).collect())
    }

    /// Parses the Latin-1 string read by a QR scanner.
    pub fn from_encoded_string(text: &str) -> Result<Self, Error> {
        let bytes = text
            .chars()
            .map(|c| u8::try_from(c).map_err(|_| Error::QrCode("Not a Latin-1 string".to_string())))
            .collect::<Result<Vec<u8>, Error>>()?;

        Self::from_bytes(&bytes)
    }
}

fn decode_key(key: &str) -> Result<[u8; KEY_LENGTH], Error> {
    decode_base64(key)?
        .try_into()
        .map_err(|_| Error::QrCode("Keys must be 32 bytes".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> QrCodeData {
        QrCodeData {
            mode: QrCodeMode::VerifyingAnotherUser,
            transaction_id: "$event:example.org".to_string(),
            first_key: encode_base64([1u8; 32]),
            second_key: encode_base64([2u8; 32]),
            shared_secret: generate_shared_secret().unwrap(),
        }
    }

    #[test]
    fn test_layout() {
        let data = sample();
        let bytes = data.to_bytes().unwrap();

        assert_eq!(&bytes[0..6], b"MATRIX");
        assert_eq!(bytes[6], 0x02);
        assert_eq!(bytes[7], 0x00);
        assert_eq!(u16::from_be_bytes([bytes[8], bytes[9]]), 18);
        assert_eq!(&bytes[10..28], data.transaction_id.as_bytes());
        assert_eq!(&bytes[28..60], &[1u8; 32]);
        assert_eq!(bytes.len(), 10 + 18 + 64 + 8);

        assert_eq!(QrCodeData::from_bytes(&bytes).unwrap(), data);
    }

    #[test]
    fn test_encoded_string_survives_high_bytes() {
        let mut data = sample();
        data.mode = QrCodeMode::SelfVerifyingMasterKeyNotTrusted;
        data.first_key = encode_base64([0xFFu8; 32]);

        let text = data.to_encoded_string().unwrap();
        assert_eq!(QrCodeData::from_encoded_string(&text).unwrap(), data);
        assert!(QrCodeData::from_encoded_string("MATRIX\u{263a}").is_err());
    }

    #[test]
    fn test_rejects_malformed_codes() {
        let bytes = sample().to_bytes().unwrap();

        assert!(QrCodeData::from_bytes(&bytes[..bytes.len() - 1]).is_err());
        assert!(QrCodeData::from_bytes(b"MATRIX").is_err());
        assert!(QrCodeData::from_bytes(b"NOTMATRIX").is_err());

        let mut wrong_version = bytes.clone();
        wrong_version[6] = 0x01;
        assert!(QrCodeData::from_bytes(&wrong_version).is_err());

        let mut wrong_mode = bytes;
        wrong_mode[7] = 0x09;
        assert!(QrCodeData::from_bytes(&wrong_mode).is_err());
    }

    #[test]
    fn test_rejects_short_keys() {
        let mut data = sample();
        data.second_key = encode_base64([2u8; 31]);
        assert!(data.to_bytes().is_err());
    }
}
