use crate::CancelCode;

/// State of a verification transaction.
///
/// Initiator and responder share the enum; not every state is reachable by
/// both roles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TxState {
    None,

    // Initiator
    SendingStart,
    Started,
    OnAccepted,

    // Responder
    OnStarted,
    SendingAccept,
    Accepted,

    // Key exchange
    SendingKey,
    KeySent,
    OnKeyReceived,

    // Short code
    ShortCodeReady,
    ShortCodeAccepted,

    SendingMac,
    MacSent,
    Verifying,

    // QR code
    QrScannedByOther,
    WaitingOtherReciprocateConfirm,

    Verified,
    /// Cancelled by this device.
    Cancelled(CancelCode),
    /// Cancelled by the peer.
    OnCancelled(CancelCode),
}

/// Outcome of [`TxState::advance`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// The state had already moved to or beyond the target.
    AlreadyPast,
    /// The state is neither the expected one nor past the target.
    Rejected,
}

impl TxState {
    /// Position along the happy path. Terminal states sort last.
    fn rank(&self) -> u8 {
        match self {
            Self::None => 0,
            Self::SendingStart => 1,
            Self::Started | Self::OnStarted => 2,
            Self::SendingAccept => 3,
            Self::Accepted | Self::OnAccepted => 4,
            Self::SendingKey => 5,
            Self::KeySent | Self::OnKeyReceived => 6,
            Self::ShortCodeReady | Self::QrScannedByOther => 7,
            Self::ShortCodeAccepted | Self::WaitingOtherReciprocateConfirm => 8,
            Self::SendingMac => 9,
            Self::MacSent => 10,
            Self::Verifying => 11,
            Self::Verified | Self::Cancelled(_) | Self::OnCancelled(_) => u8::MAX,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Verified | Self::Cancelled(_) | Self::OnCancelled(_))
    }

    /// The cancel code of a cancelled transaction.
    pub fn cancel_code(&self) -> Option<CancelCode> {
        match self {
            Self::Cancelled(code) | Self::OnCancelled(code) => Some(*code),
            _ => None,
        }
    }

    /// Compare-and-set: moves from `from` to `to`.
    ///
    /// Does nothing if the state already reached `to` or went past it, which
    /// happens when a send completes after the peer's answer was processed.
    pub fn advance(&mut self, from: TxState, to: TxState) -> Transition {
        if *self == from {
            *self = to;
            Transition::Applied
        } else if self.rank() >= to.rank() {
            Transition::AlreadyPast
        } else {
            Transition::Rejected
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_from_expected_state() {
        let mut state = TxState::SendingKey;
        assert_eq!(state.advance(TxState::SendingKey, TxState::KeySent), Transition::Applied);
        assert_eq!(state, TxState::KeySent);
    }

    #[test]
    fn test_advance_after_overtaken() {
        let mut state = TxState::ShortCodeReady;
        assert_eq!(state.advance(TxState::SendingKey, TxState::KeySent), Transition::AlreadyPast);
        assert_eq!(state, TxState::ShortCodeReady);

        let mut cancelled = TxState::OnCancelled(CancelCode::User);
        assert_eq!(
            cancelled.advance(TxState::SendingMac, TxState::MacSent),
            Transition::AlreadyPast
        );
        assert_eq!(cancelled, TxState::OnCancelled(CancelCode::User));
    }

    #[test]
    fn test_advance_rejected() {
        let mut state = TxState::None;
        assert_eq!(state.advance(TxState::SendingMac, TxState::MacSent), Transition::Rejected);
        assert_eq!(state, TxState::None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(TxState::Verified.is_terminal());
        assert!(TxState::Cancelled(CancelCode::User).is_terminal());
        assert!(!TxState::MacSent.is_terminal());
        assert_eq!(
            TxState::OnCancelled(CancelCode::Timeout).cancel_code(),
            Some(CancelCode::Timeout)
        );
    }
}
