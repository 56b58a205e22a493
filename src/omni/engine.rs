// MIT License - Copyright (c) 2026 Peter Wright

//! Omni request/reply engine.
//!
//! One task owns the connection. A request drains already-arrived frames,
//! transmits, then reads in short slices until the matching reply arrives
//! or the deadline passes. Unsolicited frames received while waiting are
//! handed to the sink and extend the deadline by a small grace, so a chatty
//! panel cannot starve a request of its reply window.

use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::config::Timings;
use crate::error::{DriverError, Result};
use crate::transport::Transport;

use super::codec::{Frame, FrameBody, OmniCodec};
use super::protocol::{msg, packet, Message};

/// Immediate retries after a transient failure or reply timeout.
const SEND_RETRIES: u32 = 3;

/// Receiver for frames that are not the reply to the outstanding request.
pub trait AsyncSink: Send {
    fn on_async(&mut self, message: &Message);
}

/// Discards asyncs; used while notifications must not be processed.
pub struct NullSink;

impl AsyncSink for NullSink {
    fn on_async(&mut self, _message: &Message) {}
}

/// Reply discriminator: a set of acceptable message types, optionally
/// narrowed to one object type (first data byte). The object filter does
/// not apply to bare ack / end-of-data replies.
#[derive(Debug, Clone)]
pub struct Expect {
    types: Vec<u8>,
    obj_type: Option<u8>,
}

impl Expect {
    pub fn reply(msg_type: u8) -> Self {
        Self { types: vec![msg_type], obj_type: None }
    }

    pub fn or(mut self, msg_type: u8) -> Self {
        self.types.push(msg_type);
        self
    }

    pub fn for_obj(mut self, obj_type: u8) -> Self {
        self.obj_type = Some(obj_type);
        self
    }

    pub fn ack() -> Self {
        Self::reply(msg::ACK)
    }

    fn matches(&self, message: &Message) -> bool {
        if !self.types.contains(&message.msg_type) {
            return false;
        }
        if message.msg_type == msg::ACK || message.msg_type == msg::END_OF_DATA {
            return true;
        }
        match self.obj_type {
            Some(obj) => message.data.first() == Some(&obj),
            None => true,
        }
    }
}

pub struct OmniEngine<T> {
    transport: T,
    codec: OmniCodec,
    timings: Timings,
    last_send: Option<Instant>,
}

impl<T: Transport> OmniEngine<T> {
    pub fn new(transport: T, codec: OmniCodec, timings: Timings) -> Self {
        Self { transport, codec, timings, last_send: None }
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn codec_mut(&mut self) -> &mut OmniCodec {
        &mut self.codec
    }

    /// Dispatch any frames that arrived since the last exchange.
    pub async fn drain(&mut self, sink: &mut dyn AsyncSink) -> Result<()> {
        loop {
            match self.codec.read_frame(&mut self.transport, self.timings.drain_timeout).await {
                Ok(frame) => self.route_unmatched(frame, sink)?,
                Err(DriverError::Timeout { .. }) => return Ok(()),
                Err(DriverError::Malformed { details }) => {
                    warn!(details, "discarding malformed frame during drain");
                }
                // a leftover error reply belongs to a finished exchange
                Err(DriverError::Device(code)) => {
                    warn!(?code, "discarding stale device error during drain");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// A frame that is not a reply: asyncs go to the sink, a session
    /// terminate ends the connection, anything else is logged and dropped.
    fn route_unmatched(&mut self, frame: Frame, sink: &mut dyn AsyncSink) -> Result<()> {
        if frame.packet_type == packet::CONTROLLER_SESSION_TERMINATED {
            return Err(DriverError::Disconnected);
        }
        match frame.body {
            FrameBody::Message(ref m) => sink.on_async(m),
            FrameBody::Session(_) => {
                warn!(packet_type = frame.packet_type, "unexpected session packet")
            }
        }
        Ok(())
    }

    /// Enforce the minimum spacing between transmissions.
    async fn pace(&mut self) {
        if let Some(last) = self.last_send {
            let since = last.elapsed();
            if since < self.timings.min_send_gap {
                tokio::time::sleep(self.timings.min_send_gap - since).await;
            }
        }
    }

    /// Send `request` and wait for a reply matching `expect`. Interleaved
    /// async frames are dispatched to `sink`. Transient device errors and
    /// reply timeouts are retried a fixed number of times.
    pub async fn send_and_wait(
        &mut self,
        request: &Message,
        expect: &Expect,
        sink: &mut dyn AsyncSink,
    ) -> Result<Message> {
        self.drain(sink).await?;

        for attempt in 0..=SEND_RETRIES {
            if attempt > 0 {
                debug!(attempt, msg_type = request.msg_type, "retrying request");
            }
            self.pace().await;
            let (seq, wire) = self.codec.encode_message(request)?;
            self.transport.send(&wire).await?;
            self.last_send = Some(Instant::now());

            match self.await_reply(seq, expect, sink).await {
                Ok(reply) => return Ok(reply),
                Err(DriverError::Timeout { .. }) if attempt < SEND_RETRIES => continue,
                Err(DriverError::Device(code)) if code.is_transient() && attempt < SEND_RETRIES => {
                    continue
                }
                Err(e) => return Err(e),
            }
        }
        Err(DriverError::timeout(format!("reply to message 0x{:02X}", request.msg_type)))
    }

    async fn await_reply(
        &mut self,
        seq: u16,
        expect: &Expect,
        sink: &mut dyn AsyncSink,
    ) -> Result<Message> {
        let mut deadline = Instant::now() + self.timings.reply_timeout;
        loop {
            let now = Instant::now();
            let Some(remaining) = deadline.checked_duration_since(now) else {
                return Err(DriverError::timeout("matching reply"));
            };
            if remaining.is_zero() {
                return Err(DriverError::timeout("matching reply"));
            }
            let slice = self.timings.read_slice.min(remaining);
            match self.codec.read_frame(&mut self.transport, slice).await {
                Ok(frame) => {
                    if frame.is_async() {
                        self.route_unmatched(frame, sink)?;
                        deadline += self.timings.async_grace;
                        continue;
                    }
                    self.codec.validate_seq(seq, &frame)?;
                    match frame.body {
                        FrameBody::Message(m) if expect.matches(&m) => {
                            trace!(seq, msg_type = m.msg_type, "reply matched");
                            return Ok(m);
                        }
                        _ => {
                            // right sequence, wrong shape: treat as an async
                            self.route_unmatched(frame, sink)?;
                            deadline += self.timings.async_grace;
                        }
                    }
                }
                Err(DriverError::Timeout { .. }) => continue,
                Err(DriverError::Malformed { details }) => {
                    warn!(details, "discarding malformed frame");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Wait up to `wait` for an async frame satisfying `pred`, dispatching
    /// every async seen (including the matching one) to `sink`.
    pub async fn wait_for_async(
        &mut self,
        pred: impl Fn(&Message) -> bool,
        wait: Duration,
        sink: &mut dyn AsyncSink,
    ) -> Result<Message> {
        let deadline = Instant::now() + wait;
        loop {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Err(DriverError::timeout("confirmation"));
            };
            let slice = self.timings.read_slice.min(remaining);
            match self.codec.read_frame(&mut self.transport, slice).await {
                Ok(frame) => {
                    let hit = frame.message().map(|m| pred(m)).unwrap_or(false);
                    let message = frame.message().cloned();
                    self.route_unmatched(frame, sink)?;
                    if hit {
                        if let Some(m) = message {
                            return Ok(m);
                        }
                    }
                }
                Err(DriverError::Timeout { .. }) => continue,
                Err(DriverError::Malformed { details }) => {
                    warn!(details, "discarding malformed frame");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Politely end the session.
    pub async fn terminate(&mut self) -> Result<()> {
        let (_, wire) = self.codec.encode_session(packet::CLIENT_SESSION_TERMINATED, &[]);
        self.transport.send(&wire).await
    }
}
