// MIT License - Copyright (c) 2026 Peter Wright

//! Omni session establishment.
//!
//! Two round trips: a cleartext new-session request whose ack carries the
//! protocol version and five bytes of session id, then (with the session
//! key derived from the pre-shared key) an encrypted secure-session request
//! echoing the id. Failure at any step is `HandshakeFailed` and the caller
//! drops the connection.

use tracing::{debug, info, warn};

use crate::config::OmniConfig;
use crate::error::{DriverError, Result};
use crate::transport::Transport;

use super::codec::{FrameBody, OmniCodec};
use super::protocol::packet;

/// Derive the per-session key: the last five bytes of the pre-shared key
/// are XORed with the session id.
pub fn derive_session_key(base: &[u8; 16], session_id: &[u8]) -> [u8; 16] {
    let mut key = *base;
    for (i, b) in session_id.iter().take(5).enumerate() {
        key[11 + i] ^= b;
    }
    key
}

/// Run the handshake on a fresh connection, leaving the codec keyed.
pub async fn establish<T: Transport>(
    transport: &mut T,
    codec: &mut OmniCodec,
    config: &OmniConfig,
) -> Result<()> {
    let (_, wire) = codec.encode_session(packet::NEW_SESSION_REQ, &[]);
    transport.send(&wire).await?;

    let frame = codec.read_frame(transport, config.handshake_timeout).await?;
    let session_id: Vec<u8> = match (frame.packet_type, &frame.body) {
        (packet::NEW_SESSION_ACK, FrameBody::Session(payload)) if payload.len() == 7 => {
            let version = u16::from_be_bytes([payload[0], payload[1]]);
            debug!(version, "new session acknowledged");
            payload[2..7].to_vec()
        }
        (packet::NEW_SESSION_NAK, _) => {
            warn!("panel refused new session");
            return Err(DriverError::HandshakeFailed {
                details: "new session refused".into(),
            });
        }
        (other, _) => {
            return Err(DriverError::HandshakeFailed {
                details: format!("unexpected handshake packet 0x{:02X}", other),
            });
        }
    };

    codec.set_key(&derive_session_key(&config.key, &session_id));

    // The secure-session request echoes the untransformed session id,
    // encrypted under the derived key.
    let (seq, wire) = codec.encode_session(packet::SECURE_SESSION_REQ, &session_id);
    transport.send(&wire).await?;

    let frame = codec.read_frame(transport, config.handshake_timeout).await?;
    match (frame.packet_type, &frame.body) {
        (packet::SECURE_SESSION_ACK, FrameBody::Session(echo)) if echo == &session_id => {
            codec.validate_seq(seq, &frame)?;
            info!("secure session established");
            Ok(())
        }
        (packet::SECURE_SESSION_ACK, _) => Err(DriverError::HandshakeFailed {
            details: "secure session ack did not echo session id".into(),
        }),
        (other, _) => Err(DriverError::HandshakeFailed {
            details: format!("expected secure session ack, got 0x{:02X}", other),
        }),
    }
}
