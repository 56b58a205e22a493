// MIT License - Copyright (c) 2026 Peter Wright

//! Omni frame codec.
//!
//! Wire layout: a four byte header (`sequence u16 BE`, packet type,
//! reserved) followed by the payload. Application messages are wrapped as
//! `STX, length, type, data.., CRC-lo, CRC-hi`, zero padded to 16 byte
//! blocks and AES-128-ECB encrypted; before encryption (and after
//! decryption) bytes 0 and 1 of every block are XORed with the header
//! sequence bytes. Session setup packets travel before a key exists and are
//! plaintext.

use std::time::Duration;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use tracing::trace;

use crate::error::{DriverError, Result};
use crate::transport::Transport;

use super::protocol::{msg, packet, Message};

pub const STX: u8 = 0x21;
const BLOCK: usize = 16;

/// A decoded wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub seq: u16,
    pub packet_type: u8,
    pub body: FrameBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameBody {
    /// Session-layer payload (handshake material), already decrypted if a
    /// key was in effect.
    Session(Vec<u8>),
    /// An application message.
    Message(Message),
}

impl Frame {
    /// Async frames carry sequence zero and bypass sequence validation.
    pub fn is_async(&self) -> bool {
        self.seq == 0
    }

    pub fn message(&self) -> Option<&Message> {
        match &self.body {
            FrameBody::Message(m) => Some(m),
            FrameBody::Session(_) => None,
        }
    }
}

/// CRC-16, polynomial 0xA001, LSB first, zero initial value. Covers the
/// length byte through the last data byte.
pub fn crc16(bytes: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &b in bytes {
        crc ^= b as u16;
        for _ in 0..8 {
            let lsb = crc & 1;
            crc >>= 1;
            if lsb != 0 {
                crc ^= 0xA001;
            }
        }
    }
    crc
}

pub struct OmniCodec {
    cipher: Option<Aes128>,
    next_seq: u16,
    tolerate_swapped_crc: bool,
}

impl OmniCodec {
    pub fn new(tolerate_swapped_crc: bool) -> Self {
        Self { cipher: None, next_seq: 1, tolerate_swapped_crc }
    }

    /// Install the session key derived during the handshake. Frames encoded
    /// or decoded from here on are encrypted.
    pub fn set_key(&mut self, key: &[u8; 16]) {
        self.cipher = Some(Aes128::new(GenericArray::from_slice(key)));
    }

    pub fn has_key(&self) -> bool {
        self.cipher.is_some()
    }

    /// Allocate the next transmit sequence. Wraps 1..=65535; zero is
    /// reserved for controller-initiated frames.
    pub fn take_seq(&mut self) -> u16 {
        let seq = self.next_seq;
        self.next_seq = if self.next_seq == u16::MAX { 1 } else { self.next_seq + 1 };
        seq
    }

    /// Reject a sequenced frame that does not match the outstanding request.
    pub fn validate_seq(&self, expected: u16, frame: &Frame) -> Result<()> {
        if frame.is_async() || frame.seq == expected {
            Ok(())
        } else {
            Err(DriverError::OutOfSync { expected, received: frame.seq })
        }
    }

    fn header(seq: u16, packet_type: u8) -> [u8; 4] {
        let [hi, lo] = seq.to_be_bytes();
        [hi, lo, packet_type, 0]
    }

    /// Encode a session-layer packet. Payload is encrypted only once a key
    /// is installed (the secure-session request onward).
    pub fn encode_session(&mut self, packet_type: u8, payload: &[u8]) -> (u16, Vec<u8>) {
        let seq = self.take_seq();
        let mut wire = Self::header(seq, packet_type).to_vec();
        if payload.is_empty() {
            return (seq, wire);
        }
        match &self.cipher {
            None => wire.extend_from_slice(payload),
            Some(_) => {
                let mut padded = payload.to_vec();
                padded.resize(payload.len().div_ceil(BLOCK) * BLOCK, 0);
                self.crypt_blocks(seq, &mut padded, true);
                wire.extend_from_slice(&padded);
            }
        }
        (seq, wire)
    }

    /// Encode an application message with a fresh sequence.
    pub fn encode_message(&mut self, message: &Message) -> Result<(u16, Vec<u8>)> {
        let seq = self.take_seq();
        let wire = self.encode_message_with_seq(seq, message)?;
        Ok((seq, wire))
    }

    /// Encode under an explicit sequence (zero encodes a controller-style
    /// async frame).
    pub(crate) fn encode_message_with_seq(&self, seq: u16, message: &Message) -> Result<Vec<u8>> {
        if self.cipher.is_none() {
            return Err(DriverError::HandshakeFailed {
                details: "no session key established".into(),
            });
        }

        // STX, length, type, data, CRC. length counts the type byte and data.
        let len = 1 + message.data.len();
        if len > u8::MAX as usize {
            return Err(DriverError::malformed("message data too long"));
        }
        let mut payload = Vec::with_capacity(len + 4);
        payload.push(STX);
        payload.push(len as u8);
        payload.push(message.msg_type);
        payload.extend_from_slice(&message.data);
        let crc = crc16(&payload[1..]);
        payload.push((crc & 0xFF) as u8);
        payload.push((crc >> 8) as u8);

        payload.resize(payload.len().div_ceil(BLOCK) * BLOCK, 0);
        self.crypt_blocks(seq, &mut payload, true);

        let mut wire = Self::header(seq, packet::OMNI_MESSAGE).to_vec();
        wire.extend_from_slice(&payload);
        trace!(seq, msg_type = message.msg_type, bytes = wire.len(), "encoded frame");
        Ok(wire)
    }

    /// XOR-whiten and encrypt (or decrypt then un-whiten) in place.
    fn crypt_blocks(&self, seq: u16, buf: &mut [u8], encrypt: bool) {
        let cipher = match &self.cipher {
            Some(c) => c,
            None => return,
        };
        let [hi, lo] = seq.to_be_bytes();
        for chunk in buf.chunks_exact_mut(BLOCK) {
            let block = GenericArray::from_mut_slice(chunk);
            if encrypt {
                block[0] ^= hi;
                block[1] ^= lo;
                cipher.encrypt_block(block);
            } else {
                cipher.decrypt_block(block);
                block[0] ^= hi;
                block[1] ^= lo;
            }
        }
    }

    /// Read one frame from the transport, waiting at most `wait` for the
    /// header. The body is read on a short fixed allowance once the header
    /// has arrived.
    pub async fn read_frame<T: Transport>(&mut self, transport: &mut T, wait: Duration) -> Result<Frame> {
        let header = transport.recv_exact(4, wait).await?;
        let seq = u16::from_be_bytes([header[0], header[1]]);
        let packet_type = header[2];
        let body_wait = Duration::from_millis(500);

        match packet_type {
            packet::OMNI_MESSAGE => {
                if self.cipher.is_none() {
                    return Err(DriverError::malformed("application frame before session key"));
                }
                // First block reveals the length; remaining blocks follow.
                let mut first = transport.recv_exact(BLOCK, body_wait).await?;
                self.crypt_blocks(seq, &mut first, false);
                if first[0] != STX {
                    return Err(DriverError::malformed(format!(
                        "bad start byte 0x{:02X}",
                        first[0]
                    )));
                }
                let len = first[1] as usize;
                if len == 0 {
                    return Err(DriverError::malformed("zero-length message"));
                }
                let total = (len + 4).div_ceil(BLOCK) * BLOCK;
                let mut payload = first;
                if total > BLOCK {
                    let mut rest = transport.recv_exact(total - BLOCK, body_wait).await?;
                    self.crypt_blocks(seq, &mut rest, false);
                    payload.extend_from_slice(&rest);
                }
                let message = self.parse_payload(&payload, len)?;
                if message.msg_type == msg::NAK {
                    return Err(DriverError::Device(crate::error::DeviceErrorCode::Nak));
                }
                trace!(seq, msg_type = message.msg_type, "decoded frame");
                Ok(Frame { seq, packet_type, body: FrameBody::Message(message) })
            }
            packet::NEW_SESSION_ACK => {
                // Two protocol version bytes plus five bytes of session id.
                let payload = transport.recv_exact(7, body_wait).await?;
                Ok(Frame { seq, packet_type, body: FrameBody::Session(payload) })
            }
            packet::SECURE_SESSION_ACK => {
                let mut payload = transport.recv_exact(BLOCK, body_wait).await?;
                self.crypt_blocks(seq, &mut payload, false);
                payload.truncate(5);
                Ok(Frame { seq, packet_type, body: FrameBody::Session(payload) })
            }
            packet::NEW_SESSION_NAK
            | packet::CLIENT_SESSION_TERMINATED
            | packet::CONTROLLER_SESSION_TERMINATED => {
                Ok(Frame { seq, packet_type, body: FrameBody::Session(Vec::new()) })
            }
            other => Err(DriverError::malformed(format!("unknown packet type 0x{:02X}", other))),
        }
    }

    fn parse_payload(&self, payload: &[u8], len: usize) -> Result<Message> {
        if payload.len() < len + 4 {
            return Err(DriverError::malformed("truncated message payload"));
        }
        let msg_type = payload[2];
        let data = payload[3..2 + len].to_vec();
        let embedded = u16::from_le_bytes([payload[2 + len], payload[3 + len]]);
        let computed = crc16(&payload[1..2 + len]);

        // Some panel firmware sends the CRC byte-swapped, and some omit it
        // entirely (all zero). Zero is always accepted; swapped only when
        // configured.
        let crc_ok = embedded == 0
            || embedded == computed
            || (self.tolerate_swapped_crc && embedded == computed.swap_bytes());
        if !crc_ok {
            return Err(DriverError::malformed(format!(
                "CRC mismatch: embedded 0x{:04X}, computed 0x{:04X}",
                embedded, computed
            )));
        }
        Ok(Message { msg_type, data })
    }
}
