//! Websocket close codes and close metadata.

use std::fmt;

use strum_macros::AsRefStr;

/// Numeric websocket closure reason as defined by RFC 6455 section 7.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, AsRefStr)]
pub enum CloseCode {
    /// 1000
    Normal,
    /// 1001
    GoingAway,
    /// 1002
    ProtocolError,
    /// 1003
    UnacceptableType,
    /// 1005, never sent on the wire
    NoStatus,
    /// 1006, never sent on the wire
    Abnormal,
    /// 1007
    InconsistentFrameDataType,
    /// 1008
    PolicyViolation,
    /// 1009
    MessageTooLarge,
    /// 1010
    ExpectedExtensionMissing,
    /// 1011
    UnexpectedServerError,
    /// 1012
    ServiceRestarting,
    /// 1013
    TryAgainLater,
    /// 1014
    BadGateway,
    /// 1015, never sent on the wire
    TlsError,
    /// Any other code, including application-defined codes in 4000-4999.
    Other(u16),
}

impl CloseCode {
    /// Whether a peer closing with this code is reporting an error on our side.
    ///
    /// Normal closure and going-away are routine and return `false`.
    #[must_use]
    pub const fn is_peer_error(self) -> bool {
        matches!(
            self,
            Self::ProtocolError
                | Self::UnacceptableType
                | Self::PolicyViolation
                | Self::InconsistentFrameDataType
                | Self::MessageTooLarge
                | Self::ExpectedExtensionMissing
                | Self::BadGateway
        )
    }
}

impl From<u16> for CloseCode {
    fn from(value: u16) -> Self {
        match value {
            1000 => Self::Normal,
            1001 => Self::GoingAway,
            1002 => Self::ProtocolError,
            1003 => Self::UnacceptableType,
            1005 => Self::NoStatus,
            1006 => Self::Abnormal,
            1007 => Self::InconsistentFrameDataType,
            1008 => Self::PolicyViolation,
            1009 => Self::MessageTooLarge,
            1010 => Self::ExpectedExtensionMissing,
            1011 => Self::UnexpectedServerError,
            1012 => Self::ServiceRestarting,
            1013 => Self::TryAgainLater,
            1014 => Self::BadGateway,
            1015 => Self::TlsError,
            other => Self::Other(other),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(value: CloseCode) -> Self {
        match value {
            CloseCode::Normal => 1000,
            CloseCode::GoingAway => 1001,
            CloseCode::ProtocolError => 1002,
            CloseCode::UnacceptableType => 1003,
            CloseCode::NoStatus => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::InconsistentFrameDataType => 1007,
            CloseCode::PolicyViolation => 1008,
            CloseCode::MessageTooLarge => 1009,
            CloseCode::ExpectedExtensionMissing => 1010,
            CloseCode::UnexpectedServerError => 1011,
            CloseCode::ServiceRestarting => 1012,
            CloseCode::TryAgainLater => 1013,
            CloseCode::BadGateway => 1014,
            CloseCode::TlsError => 1015,
            CloseCode::Other(code) => code,
        }
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_ref(), u16::from(*self))
    }
}

/// Close metadata available once a connection has closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    /// Close code sent or received.
    pub code: CloseCode,
    /// Close reason sent or received.
    pub reason: String,
    /// Whether the peer initiated the close.
    pub by_peer: bool,
}

impl CloseInfo {
    #[must_use]
    pub fn new(code: CloseCode, reason: impl Into<String>, by_peer: bool) -> Self {
        Self {
            code,
            reason: reason.into(),
            by_peer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn round_trips_known_codes_through_u16() {
        for code in 1000..=1015_u16 {
            if code == 1004 {
                assert_eq!(CloseCode::from(code), CloseCode::Other(1004));
            }
            assert_eq!(u16::from(CloseCode::from(code)), code);
        }
    }

    #[test_log::test]
    fn keeps_application_codes_as_other() {
        assert_eq!(CloseCode::from(4001), CloseCode::Other(4001));
        assert_eq!(u16::from(CloseCode::Other(4001)), 4001);
    }

    #[test_log::test]
    fn classifies_peer_errors() {
        for code in [
            CloseCode::ProtocolError,
            CloseCode::UnacceptableType,
            CloseCode::PolicyViolation,
            CloseCode::InconsistentFrameDataType,
            CloseCode::MessageTooLarge,
            CloseCode::ExpectedExtensionMissing,
            CloseCode::BadGateway,
        ] {
            assert!(code.is_peer_error(), "{code} should be a peer error");
        }

        for code in [
            CloseCode::Normal,
            CloseCode::GoingAway,
            CloseCode::NoStatus,
            CloseCode::Abnormal,
            CloseCode::UnexpectedServerError,
        ] {
            assert!(!code.is_peer_error(), "{code} should not be a peer error");
        }
    }

    #[test_log::test]
    fn displays_name_and_numeric_code() {
        assert_eq!(CloseCode::GoingAway.to_string(), "GoingAway (1001)");
    }
}
