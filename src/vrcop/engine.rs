// MIT License - Copyright (c) 2026 Peter Wright

//! VRCOP request/reply engine.
//!
//! Same single-task discipline as the panel engine, over lines instead of
//! encrypted frames. State-changing commands are acknowledged twice: `E000`
//! confirms the dongle accepted the message, and a later `X000` confirms
//! the RF transmission reached the node. Node reports interleave freely and
//! go to the sink.

use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::config::Timings;
use crate::error::{DriverError, Result};
use crate::transport::Transport;

use super::codec::{self, VrcopLine};

/// Immediate retries after a transient failure or reply timeout.
const SEND_RETRIES: u32 = 3;

/// Receiver for interleaved node reports.
pub trait ReportSink: Send {
    fn on_report(&mut self, node: u16, values: &[u16]);
}

/// Discards reports; used while the model is not ready for them.
pub struct NullReportSink;

impl ReportSink for NullReportSink {
    fn on_report(&mut self, _node: u16, _values: &[u16]) {}
}

pub struct VrcopEngine<T> {
    transport: T,
    timings: Timings,
    last_send: Option<Instant>,
}

impl<T: Transport> VrcopEngine<T> {
    pub fn new(transport: T, timings: Timings) -> Self {
        Self { transport, timings, last_send: None }
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Dispatch any lines that arrived since the last exchange.
    pub async fn drain(&mut self, sink: &mut dyn ReportSink) -> Result<()> {
        loop {
            match codec::read_line(&mut self.transport, self.timings.drain_timeout).await {
                Ok(line) => self.route_unmatched(line, sink),
                Err(DriverError::Timeout { .. }) => return Ok(()),
                Err(DriverError::Malformed { details }) => {
                    warn!(details, "discarding malformed line during drain");
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn route_unmatched(&mut self, line: VrcopLine, sink: &mut dyn ReportSink) {
        match line {
            VrcopLine::NodeReport { node, values } => sink.on_report(node, &values),
            VrcopLine::Learn(ref text) => debug!(text, "learn-mode line"),
            other => trace!(?other, "dropping stray line"),
        }
    }

    async fn pace(&mut self) {
        if let Some(last) = self.last_send {
            let since = last.elapsed();
            if since < self.timings.min_send_gap {
                tokio::time::sleep(self.timings.min_send_gap - since).await;
            }
        }
    }

    async fn send_body(&mut self, body: &str) -> Result<()> {
        self.pace().await;
        trace!(body, "tx");
        self.transport.send(&codec::write_line(body)).await?;
        self.last_send = Some(Instant::now());
        Ok(())
    }

    /// Send a message and wait for the dongle's `E000`. Retries on timeout
    /// and on transient device errors.
    pub async fn send_and_ack(&mut self, body: &str, sink: &mut dyn ReportSink) -> Result<()> {
        self.drain(sink).await?;
        for attempt in 0..=SEND_RETRIES {
            if attempt > 0 {
                debug!(attempt, body, "retrying");
            }
            self.send_body(body).await?;
            match self.await_ack(sink).await {
                Ok(()) => return Ok(()),
                Err(DriverError::Timeout { .. }) if attempt < SEND_RETRIES => continue,
                Err(DriverError::Device(code)) if code.is_transient() && attempt < SEND_RETRIES => {
                    continue
                }
                Err(e) => return Err(e),
            }
        }
        Err(DriverError::timeout(format!("ack for '{}'", body)))
    }

    async fn await_ack(&mut self, sink: &mut dyn ReportSink) -> Result<()> {
        let mut deadline = Instant::now() + self.timings.reply_timeout;
        loop {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Err(DriverError::timeout("message ack"));
            };
            if remaining.is_zero() {
                return Err(DriverError::timeout("message ack"));
            }
            let slice = self.timings.read_slice.min(remaining);
            match codec::read_line(&mut self.transport, slice).await {
                Ok(VrcopLine::Ack) => return Ok(()),
                Ok(VrcopLine::Error(code)) => return Err(codec::device_error(code)),
                Ok(other) => {
                    self.route_unmatched(other, sink);
                    deadline += self.timings.async_grace;
                }
                Err(DriverError::Timeout { .. }) => continue,
                Err(DriverError::Malformed { details }) => {
                    warn!(details, "discarding malformed line");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// A state-changing command: message ack, then transmission ack. A
    /// failed transmission is transient and retries the whole command.
    pub async fn send_command(&mut self, body: &str, sink: &mut dyn ReportSink) -> Result<()> {
        for attempt in 0..=SEND_RETRIES {
            self.send_and_ack(body, sink).await?;
            match self.await_transmit_ack(sink).await {
                Ok(()) => return Ok(()),
                Err(DriverError::Device(code)) if code.is_transient() && attempt < SEND_RETRIES => {
                    debug!(attempt, body, "transmission failed, retrying");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(DriverError::timeout(format!("transmission of '{}'", body)))
    }

    async fn await_transmit_ack(&mut self, sink: &mut dyn ReportSink) -> Result<()> {
        let deadline = Instant::now() + self.timings.transmit_ack_timeout;
        loop {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Err(DriverError::timeout("transmission ack"));
            };
            let slice = self.timings.read_slice.min(remaining);
            match codec::read_line(&mut self.transport, slice).await {
                Ok(VrcopLine::TransmitOk) => return Ok(()),
                Ok(VrcopLine::TransmitFail(code)) => {
                    warn!(code, "transmission failed");
                    return Err(DriverError::Device(crate::error::DeviceErrorCode::TransmitFailed));
                }
                Ok(other) => self.route_unmatched(other, sink),
                Err(DriverError::Timeout { .. }) => continue,
                Err(DriverError::Malformed { details }) => {
                    warn!(details, "discarding malformed line");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One scan probe: returns the reported node id (0 = absent), or 0 on
    /// a silent timeout. No retries; the scan covers hundreds of ids.
    pub async fn query_exists(&mut self, body: &str, wait: Duration) -> Result<u16> {
        self.send_body(body).await?;
        let deadline = Instant::now() + wait;
        loop {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Ok(0);
            };
            let slice = self.timings.read_slice.min(remaining);
            match codec::read_line(&mut self.transport, slice).await {
                Ok(VrcopLine::Found { node }) => return Ok(node),
                Ok(VrcopLine::Error(_)) | Ok(VrcopLine::Ack) => continue,
                Ok(other) => trace!(?other, "line during scan"),
                Err(DriverError::Timeout { .. }) => continue,
                Err(DriverError::Malformed { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
    }
}
