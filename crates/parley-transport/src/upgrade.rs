//! Transport kinds and upgrade negotiation.
//!
//! Every session starts on one transport. A polling session may later be
//! upgraded to a WebSocket; the handshake advertises which upgrades the
//! server will accept.

use std::fmt;
use std::str::FromStr;

use crate::traits::TransportError;

/// The byte-transport a session currently runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// HTTP long-polling.
    Polling,
    /// A persistent WebSocket.
    WebSocket,
}

impl TransportKind {
    /// Name used in the `transport` query parameter.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Polling => "polling",
            TransportKind::WebSocket => "websocket",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "polling" => Ok(TransportKind::Polling),
            "websocket" => Ok(TransportKind::WebSocket),
            _ => Err(TransportError::InvalidTransport("unknown transport")),
        }
    }
}

/// Upgrades offered to a session that opened on `current`.
///
/// Only polling sessions can upgrade, and only to transports the server
/// has enabled.
#[must_use]
pub fn upgrades_for(current: TransportKind, enabled: &[TransportKind]) -> Vec<String> {
    match current {
        TransportKind::Polling if enabled.contains(&TransportKind::WebSocket) => {
            vec![TransportKind::WebSocket.as_str().to_string()]
        }
        _ => Vec::new(),
    }
}

/// Check that a client may open or continue a session on `requested`.
///
/// # Errors
///
/// Returns `InvalidTransport` when the server has that transport disabled.
pub fn negotiate(
    requested: TransportKind,
    enabled: &[TransportKind],
) -> Result<TransportKind, TransportError> {
    if enabled.contains(&requested) {
        Ok(requested)
    } else {
        Err(TransportError::InvalidTransport("transport disabled"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOTH: [TransportKind; 2] = [TransportKind::Polling, TransportKind::WebSocket];

    #[test]
    fn test_polling_offers_websocket() {
        assert_eq!(upgrades_for(TransportKind::Polling, &BOTH), vec!["websocket"]);
        assert!(upgrades_for(TransportKind::Polling, &[TransportKind::Polling]).is_empty());
    }

    #[test]
    fn test_websocket_offers_nothing() {
        assert!(upgrades_for(TransportKind::WebSocket, &BOTH).is_empty());
    }

    #[test]
    fn test_negotiate() {
        assert_eq!(
            negotiate(TransportKind::WebSocket, &BOTH).unwrap(),
            TransportKind::WebSocket
        );
        assert!(negotiate(TransportKind::WebSocket, &[TransportKind::Polling]).is_err());
    }

    #[test]
    fn test_parse_kind() {
        assert_eq!("polling".parse::<TransportKind>().unwrap(), TransportKind::Polling);
        assert!("sse".parse::<TransportKind>().is_err());
    }
}
