// MIT License - Copyright (c) 2026 Peter Wright

//! VRCOP line codec.
//!
//! Inbound traffic is CR-terminated ASCII lines, echoed with a leading `<`.
//! A line ending in a backslash continues on the next physical line, which
//! must repeat the same `N<id>:` prefix; the continuation parts are joined
//! with a comma. The first character of a completed line selects its
//! category.

use std::time::Duration;

use tracing::trace;

use crate::error::{DeviceErrorCode, DriverError, Result};
use crate::transport::Transport;

/// One decoded inbound line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VrcopLine {
    /// `E000`: message accepted.
    Ack,
    /// `Exxx`: message rejected with a device error code.
    Error(u16),
    /// `X000`: RF transmission confirmed.
    TransmitOk,
    /// `Xxxx`: RF transmission failed.
    TransmitFail(u16),
    /// `N<id>:v,v,...`: a node report.
    NodeReport { node: u16, values: Vec<u16> },
    /// `F<id>`: existence scan reply; id 0 means no such node.
    Found { node: u16 },
    /// `L...`: learn-mode chatter, logged and otherwise ignored.
    Learn(String),
}

/// Frame an outbound body with the `>` prompt and CR.
pub fn write_line(body: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(body.len() + 2);
    bytes.push(b'>');
    bytes.extend_from_slice(body.as_bytes());
    bytes.push(b'\r');
    bytes
}

/// Read one logical line, reassembling continuations.
pub async fn read_line<T: Transport>(transport: &mut T, wait: Duration) -> Result<VrcopLine> {
    let mut line = read_physical(transport, wait).await?;
    while line.ends_with('\\') {
        line.pop();
        let prefix = node_prefix(&line).ok_or_else(|| {
            DriverError::malformed("continuation on a line without a node prefix")
        })?;
        let next = read_physical(transport, wait).await?;
        let rest = next.strip_prefix(&prefix).ok_or_else(|| {
            DriverError::malformed(format!(
                "continuation prefix mismatch: expected '{}', got '{}'",
                prefix, next
            ))
        })?;
        line.push(',');
        line.push_str(rest.trim_end_matches('\\'));
        if next.ends_with('\\') {
            line.push('\\');
        }
    }
    parse_line(&line)
}

async fn read_physical<T: Transport>(transport: &mut T, wait: Duration) -> Result<String> {
    loop {
        let raw = transport.recv_until(b'\r', wait).await?;
        let text: String = String::from_utf8_lossy(&raw)
            .trim_matches(|c: char| c == '\n' || c == ' ')
            .trim_start_matches('<')
            .to_string();
        if !text.is_empty() {
            trace!(line = %text, "rx");
            return Ok(text);
        }
    }
}

/// The `N<id>:` prefix of a node report line.
fn node_prefix(line: &str) -> Option<String> {
    if !line.starts_with('N') {
        return None;
    }
    let colon = line.find(':')?;
    line[1..colon].parse::<u16>().ok()?;
    Some(line[..=colon].to_string())
}

fn parse_line(line: &str) -> Result<VrcopLine> {
    // the category byte must be ASCII before the tail can be sliced off
    let (first, rest) = match line.as_bytes().first() {
        Some(&b) if b.is_ascii() => (b, &line[1..]),
        _ => return Err(DriverError::malformed(format!("unrecognised line: '{}'", line))),
    };
    match first {
        b'E' => {
            let code = parse_code(rest)?;
            Ok(if code == 0 { VrcopLine::Ack } else { VrcopLine::Error(code) })
        }
        b'X' => {
            let code = parse_code(rest)?;
            Ok(if code == 0 { VrcopLine::TransmitOk } else { VrcopLine::TransmitFail(code) })
        }
        b'N' => {
            let (node, payload) = rest
                .split_once(':')
                .ok_or_else(|| DriverError::malformed(format!("node line without colon: '{}'", line)))?;
            let node: u16 = node
                .parse()
                .map_err(|_| DriverError::malformed(format!("bad node id: '{}'", line)))?;
            let values = payload
                .split(',')
                .map(|v| v.trim().parse::<u16>())
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|_| DriverError::malformed(format!("bad report value: '{}'", line)))?;
            Ok(VrcopLine::NodeReport { node, values })
        }
        b'F' => {
            let node: u16 = rest
                .trim()
                .parse()
                .map_err(|_| DriverError::malformed(format!("bad found reply: '{}'", line)))?;
            Ok(VrcopLine::Found { node })
        }
        b'L' => Ok(VrcopLine::Learn(rest.to_string())),
        _ => Err(DriverError::malformed(format!("unrecognised line: '{}'", line))),
    }
}

fn parse_code(s: &str) -> Result<u16> {
    s.trim()
        .parse()
        .map_err(|_| DriverError::malformed(format!("bad status code: '{}'", s)))
}

/// Map a non-zero `Exxx` code into the shared device error taxonomy.
pub fn device_error(code: u16) -> DriverError {
    DriverError::Device(DeviceErrorCode::from_vrcop_code(code))
}
