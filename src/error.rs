//! Error taxonomy surfaced at the public boundary.
//!
//! Every fallible operation in the crate reports one of the kinds below.
//! The enum is `Clone` so that a single connection-loss cause can fail
//! every pending acknowledgement wait without re-deriving the error.

use crate::codec::reason;
use thiserror::Error;

/// Classified failure kinds for the MQTT client.
#[derive(Debug, Clone, Error)]
pub enum MqttError {
    /// Bytes that cannot be a well-formed MQTT 5.0 control packet:
    /// truncated buffers, oversized Variable Byte Integers, unknown
    /// property identifiers, invalid UTF-8.
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    /// A well-formed packet that is illegal in the current protocol
    /// state, or a protocol rule violation such as an unresolvable
    /// topic alias.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server rejected the CONNECT with an error reason code.
    #[error("connect rejected: {name} (0x{code:02x})", name = reason::name(*.0), code = .0)]
    ConnectRejected(u8),

    /// Transport failure: connect failed or timed out, socket closed
    /// mid-read, write failed.
    #[error("connection error: {0}")]
    Connection(String),

    /// A QoS 1/2 publish was acknowledged with an error reason code.
    #[error("publish rejected: {name} (0x{code:02x})", name = reason::name(*.0), code = .0)]
    PublishRejected(u8),

    /// Enhanced authentication failed: no challenge handler was
    /// installed, the handler produced no response when the server
    /// demanded continuation, or the server ended the AUTH exchange
    /// without a CONNACK.
    #[error("authentication error: {0}")]
    Auth(String),

    /// All 65535 packet identifiers are in flight.
    #[error("packet identifiers exhausted")]
    PacketIdsExhausted,

    /// Operation issued in a state that cannot honor it, e.g. a publish
    /// while disconnected with auto-reconnect off.
    #[error("illegal state: {0}")]
    IllegalState(String),
}

impl MqttError {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        MqttError::MalformedPacket(msg.into())
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        MqttError::Protocol(msg.into())
    }

    /// True for failures that indicate the network connection itself is
    /// unusable, as opposed to a single rejected request.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            MqttError::Connection(_) | MqttError::MalformedPacket(_)
        )
    }
}

impl From<std::io::Error> for MqttError {
    fn from(err: std::io::Error) -> Self {
        MqttError::Connection(err.to_string())
    }
}
