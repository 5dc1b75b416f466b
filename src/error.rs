/// Errors that can occur while driving a verification.
#[derive(thiserror::Error, Debug, Clone, Eq, PartialEq)]
pub enum Error {
    /// A cryptographic operation failed.
    #[error("Cryptographic operation failed: {0}")]
    Crypto(String),

    /// A protocol rule was violated.
    #[error("Protocol Violation: {0}")]
    Protocol(String),

    /// The requested verification method is not supported.
    #[error("Unknown verification method: {0}")]
    UnknownMethod(String),

    /// No transaction or request matches the given identifiers.
    #[error("Unknown transaction")]
    UnknownTransaction,

    /// An inbound payload is missing required fields.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// The send primitive gave up delivering a message.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Random number generation failed.
    #[error("Random number generation failed")]
    Random,

    /// Serialization or deserialization failed.
    #[error("Serialization/deserialization failed: {0}")]
    Serde(String),

    /// A scanned QR code could not be decoded.
    #[error("QR code error: {0}")]
    QrCode(String),
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Serde(value.to_string())
    }
}

impl From<base64::DecodeError> for Error {
    fn from(value: base64::DecodeError) -> Self {
        Self::Serde(value.to_string())
    }
}

/// Reason a verification was cancelled, as carried in a cancel message.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CancelCode {
    /// The user cancelled, or a required device key is unknown.
    User,
    /// The verification took too long.
    Timeout,
    /// The transaction id is not known.
    UnknownTransaction,
    /// No common protocol, hash, MAC or short-code format.
    UnknownMethod,
    /// A message arrived that the current state cannot accept.
    UnexpectedMessage,
    /// A MAC did not match, or no device key could be verified.
    MismatchedKeys,
    /// The expected user does not match the sender.
    UserMismatch,
    /// A message could not be understood.
    InvalidMessage,
    /// Another device of the user accepted the request.
    AcceptedByAnotherDevice,
    /// The commitment in the accept message does not match.
    MismatchedCommitment,
    /// The users said the short codes differ.
    MismatchedSas,
    /// The scanned QR code is not valid.
    QrCodeInvalid,
}

impl CancelCode {
    /// Returns the wire value of this code.
    pub fn value(&self) -> &'static str {
        match self {
            Self::User => "m.user",
            Self::Timeout => "m.timeout",
            Self::UnknownTransaction => "m.unknown_transaction",
            Self::UnknownMethod => "m.unknown_method",
            Self::UnexpectedMessage => "m.unexpected_message",
            Self::MismatchedKeys => "m.key_mismatch",
            Self::UserMismatch => "m.user_mismatch",
            Self::InvalidMessage => "m.invalid_message",
            Self::AcceptedByAnotherDevice => "m.accepted",
            Self::MismatchedCommitment => "m.mismatched_commitment",
            Self::MismatchedSas => "m.mismatched_sas",
            Self::QrCodeInvalid => "m.qr_code_invalid",
        }
    }

    /// Returns the human readable reason sent next to the code.
    pub fn human_readable(&self) -> &'static str {
        match self {
            Self::User => "the user cancelled the verification",
            Self::Timeout => "the verification process timed out",
            Self::UnknownTransaction => "the device does not know about that transaction",
            Self::UnknownMethod => "the device can't agree on a key agreement, hash, MAC, or SAS method",
            Self::UnexpectedMessage => "the device received an unexpected message",
            Self::MismatchedKeys => "the key was not verified",
            Self::UserMismatch => "the expected user did not match the user verified",
            Self::InvalidMessage => "the message received was invalid",
            Self::AcceptedByAnotherDevice => "the verification request was accepted by another device",
            Self::MismatchedCommitment => "the hash commitment did not match",
            Self::MismatchedSas => "the SAS did not match",
            Self::QrCodeInvalid => "the QR code is invalid",
        }
    }

    /// Parses a wire value. Unknown codes are treated as a user cancellation.
    pub fn from_value(value: &str) -> Self {
        match value {
            "m.timeout" => Self::Timeout,
            "m.unknown_transaction" => Self::UnknownTransaction,
            "m.unknown_method" => Self::UnknownMethod,
            "m.unexpected_message" => Self::UnexpectedMessage,
            "m.key_mismatch" => Self::MismatchedKeys,
            "m.user_mismatch" => Self::UserMismatch,
            "m.invalid_message" => Self::InvalidMessage,
            "m.accepted" => Self::AcceptedByAnotherDevice,
            "m.mismatched_commitment" => Self::MismatchedCommitment,
            "m.mismatched_sas" => Self::MismatchedSas,
            "m.qr_code_invalid" => Self::QrCodeInvalid,
            _ => Self::User,
        }
    }
}

impl std::fmt::Display for CancelCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.value())
    }
}

#[cfg(test)]
mod tests {
    use super::CancelCode;

    #[test]
    fn test_cancel_code_round_trip_and_fallback() {
        for code in [
            CancelCode::UnknownMethod,
            CancelCode::MismatchedKeys,
            CancelCode::MismatchedCommitment,
            CancelCode::AcceptedByAnotherDevice,
        ] {
            assert_eq!(CancelCode::from_value(code.value()), code);
        }

        assert_eq!(CancelCode::from_value("org.example.custom"), CancelCode::User);
        assert_eq!(CancelCode::MismatchedKeys.to_string(), "m.key_mismatch");
    }
}
