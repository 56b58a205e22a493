// MIT License - Copyright (c) 2026 Peter Wright

//! Byte-stream transport adapters.
//!
//! A transport wraps one I/O device with bounded reads and writes and has no
//! protocol knowledge. Read or write failure is fatal to the connection and
//! propagates as `Disconnected`/`Io`; a timeout is an ordinary outcome the
//! engines handle as control flow.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::debug;

use crate::error::{DriverError, Result};

/// Largest frame either protocol can produce.
pub const MAX_FRAME_SIZE: usize = 1024;

#[allow(async_fn_in_trait)]
pub trait Transport: Send {
    /// Read up to `max` bytes, waiting at most `wait`. `Timeout` when
    /// nothing arrived, `Disconnected` on EOF.
    async fn recv_some(&mut self, max: usize, wait: Duration) -> Result<Vec<u8>>;

    /// Read exactly `n` bytes within `wait`.
    async fn recv_exact(&mut self, n: usize, wait: Duration) -> Result<Vec<u8>>;

    /// Read through the next `delim` byte within `wait`, returning the bytes
    /// up to but not including the delimiter.
    async fn recv_until(&mut self, delim: u8, wait: Duration) -> Result<Vec<u8>>;

    /// Write the whole buffer.
    async fn send(&mut self, bytes: &[u8]) -> Result<()>;
}

/// Buffered transport over any async byte stream.
pub struct StreamTransport<S> {
    stream: S,
    buffer: VecDeque<u8>,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> StreamTransport<S> {
    pub fn new(stream: S) -> Self {
        Self { stream, buffer: VecDeque::new() }
    }

    /// One bounded read into the internal buffer. Ok(false) on timeout.
    async fn fill(&mut self, wait: Duration) -> Result<bool> {
        let mut chunk = [0u8; 512];
        match timeout(wait, self.stream.read(&mut chunk)).await {
            Err(_) => Ok(false),
            Ok(Ok(0)) => Err(DriverError::Disconnected),
            Ok(Ok(n)) => {
                self.buffer.extend(&chunk[..n]);
                Ok(true)
            }
            Ok(Err(e)) => Err(DriverError::Io(e)),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> Transport for StreamTransport<S> {
    async fn recv_some(&mut self, max: usize, wait: Duration) -> Result<Vec<u8>> {
        if self.buffer.is_empty() && !self.fill(wait).await? {
            return Err(DriverError::timeout("data"));
        }
        let n = self.buffer.len().min(max);
        Ok(self.buffer.drain(..n).collect())
    }

    async fn recv_exact(&mut self, n: usize, wait: Duration) -> Result<Vec<u8>> {
        let deadline = tokio::time::Instant::now() + wait;
        while self.buffer.len() < n {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or_else(|| DriverError::timeout(format!("{} bytes", n)))?;
            self.fill(remaining).await?;
        }
        Ok(self.buffer.drain(..n).collect())
    }

    async fn recv_until(&mut self, delim: u8, wait: Duration) -> Result<Vec<u8>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(pos) = self.buffer.iter().position(|&b| b == delim) {
                let line: Vec<u8> = self.buffer.drain(..pos).collect();
                self.buffer.pop_front(); // the delimiter itself
                return Ok(line);
            }
            if self.buffer.len() > MAX_FRAME_SIZE {
                return Err(DriverError::malformed("no frame delimiter within limit"));
            }
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or_else(|| DriverError::timeout("line"))?;
            self.fill(remaining).await?;
        }
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).await.map_err(DriverError::Io)?;
        self.stream.flush().await.map_err(DriverError::Io)
    }
}

/// TCP transport for the Omni panel.
pub type TcpTransport = StreamTransport<TcpStream>;

pub async fn connect_tcp(host: &str, port: u16) -> Result<TcpTransport> {
    debug!("connecting to {}:{}", host, port);
    let stream = TcpStream::connect((host, port)).await.map_err(DriverError::Io)?;
    stream.set_nodelay(true).map_err(DriverError::Io)?;
    Ok(StreamTransport::new(stream))
}

/// Serial transport for the VRCOP.
pub type SerialTransport = StreamTransport<SerialStream>;

pub fn open_serial(device: &str, baud: u32) -> Result<SerialTransport> {
    debug!("opening serial port {} at {} baud", device, baud);
    let stream = tokio_serial::new(device, baud)
        .open_native_async()
        .map_err(|e| DriverError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
    Ok(StreamTransport::new(stream))
}

/// Scripted in-memory transport: replays queued inbound chunks and records
/// writes. A read past the script times out. With `release_on_send`, each
/// send makes exactly one queued chunk readable, modelling replies that
/// arrive in response to a request; a chunk holds everything one request
/// provokes.
#[derive(Default)]
pub struct ScriptedTransport {
    inbound: VecDeque<Vec<u8>>,
    pending: VecDeque<u8>,
    pub written: Vec<Vec<u8>>,
    pub release_on_send: bool,
    send_credits: usize,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one inbound chunk.
    pub fn push_inbound(&mut self, bytes: impl Into<Vec<u8>>) {
        self.inbound.push_back(bytes.into());
    }

    fn promote(&mut self) {
        if self.release_on_send {
            while self.send_credits > 0 {
                match self.inbound.pop_front() {
                    Some(chunk) => self.pending.extend(chunk),
                    None => break,
                }
                self.send_credits -= 1;
            }
        } else {
            while let Some(chunk) = self.inbound.pop_front() {
                self.pending.extend(chunk);
            }
        }
    }
}

impl Transport for ScriptedTransport {
    async fn recv_some(&mut self, max: usize, _wait: Duration) -> Result<Vec<u8>> {
        self.promote();
        if self.pending.is_empty() {
            return Err(DriverError::timeout("data"));
        }
        let n = self.pending.len().min(max);
        Ok(self.pending.drain(..n).collect())
    }

    async fn recv_exact(&mut self, n: usize, _wait: Duration) -> Result<Vec<u8>> {
        self.promote();
        if self.pending.len() < n {
            return Err(DriverError::timeout(format!("{} bytes", n)));
        }
        Ok(self.pending.drain(..n).collect())
    }

    async fn recv_until(&mut self, delim: u8, _wait: Duration) -> Result<Vec<u8>> {
        self.promote();
        match self.pending.iter().position(|&b| b == delim) {
            Some(pos) => {
                let line: Vec<u8> = self.pending.drain(..pos).collect();
                self.pending.pop_front();
                Ok(line)
            }
            None => Err(DriverError::timeout("line")),
        }
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.written.push(bytes.to_vec());
        self.send_credits += 1;
        Ok(())
    }
}
