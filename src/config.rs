// MIT License - Copyright (c) 2026 Peter Wright

use std::time::Duration;

/// Timing knobs shared by both request/reply engines.
///
/// Defaults match deployed hardware behaviour; tests compress them.
#[derive(Debug, Clone)]
pub struct Timings {
    /// Primary wait for a matching reply.
    pub reply_timeout: Duration,
    /// Per-iteration read while waiting for the reply.
    pub read_slice: Duration,
    /// Opportunistic pre-send drain of already-arrived frames.
    pub drain_timeout: Duration,
    /// Deadline extension granted after dispatching an unrelated async.
    pub async_grace: Duration,
    /// Minimum spacing between transmissions.
    pub min_send_gap: Duration,
    /// Second-stage (transmission ack) wait.
    pub transmit_ack_timeout: Duration,
    /// Minimum interval between poll rounds.
    pub poll_round_gap: Duration,
    /// `stale_multiple` x poll period without a value puts a unit in Error.
    pub stale_multiple: u32,
    /// Consecutive failed poll rounds before the connection is declared lost.
    pub max_failed_rounds: u32,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_millis(3000),
            read_slice: Duration::from_millis(50),
            drain_timeout: Duration::from_millis(20),
            async_grace: Duration::from_millis(250),
            min_send_gap: Duration::from_millis(200),
            transmit_ack_timeout: Duration::from_millis(5000),
            poll_round_gap: Duration::from_secs(2),
            stale_multiple: 4,
            max_failed_rounds: 3,
        }
    }
}

/// Configuration for the Omni panel driver.
#[derive(Debug, Clone)]
pub struct OmniConfig {
    pub host: String,
    pub port: u16,
    /// 16-byte pre-shared key from the panel's setup menu.
    pub key: [u8; 16],
    /// Wait for each handshake ack.
    pub handshake_timeout: Duration,
    /// Accept a byte-swapped CRC (firmware bug in some panel revisions).
    pub tolerate_swapped_crc: bool,
    pub default_poll_period: Duration,
    pub timings: Timings,
}

impl OmniConfig {
    pub fn builder() -> OmniConfigBuilder {
        OmniConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct OmniConfigBuilder {
    host: Option<String>,
    port: Option<u16>,
    key: Option<[u8; 16]>,
    handshake_timeout: Option<Duration>,
    tolerate_swapped_crc: Option<bool>,
    default_poll_period: Option<Duration>,
    timings: Option<Timings>,
}

impl OmniConfigBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn key(mut self, key: [u8; 16]) -> Self {
        self.key = Some(key);
        self
    }

    pub fn handshake_timeout(mut self, t: Duration) -> Self {
        self.handshake_timeout = Some(t);
        self
    }

    pub fn tolerate_swapped_crc(mut self, yes: bool) -> Self {
        self.tolerate_swapped_crc = Some(yes);
        self
    }

    pub fn default_poll_period(mut self, t: Duration) -> Self {
        self.default_poll_period = Some(t);
        self
    }

    pub fn timings(mut self, t: Timings) -> Self {
        self.timings = Some(t);
        self
    }

    pub fn build(self) -> OmniConfig {
        OmniConfig {
            host: self.host.unwrap_or_default(),
            port: self.port.unwrap_or(4369),
            key: self.key.unwrap_or([0u8; 16]),
            handshake_timeout: self.handshake_timeout.unwrap_or(Duration::from_secs(5)),
            tolerate_swapped_crc: self.tolerate_swapped_crc.unwrap_or(true),
            default_poll_period: self.default_poll_period.unwrap_or(Duration::from_secs(60)),
            timings: self.timings.unwrap_or_default(),
        }
    }
}

/// Configuration for the Leviton VRCOP driver.
#[derive(Debug, Clone)]
pub struct VrcopConfig {
    /// Serial device path, e.g. `/dev/ttyUSB0`.
    pub device: String,
    pub baud: u32,
    /// Highest node id covered by the enumeration scan.
    pub max_node_id: u16,
    /// Per-id existence query wait during the scan.
    pub scan_reply_timeout: Duration,
    pub default_poll_period: Duration,
    pub timings: Timings,
}

impl VrcopConfig {
    pub fn builder() -> VrcopConfigBuilder {
        VrcopConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct VrcopConfigBuilder {
    device: Option<String>,
    baud: Option<u32>,
    max_node_id: Option<u16>,
    scan_reply_timeout: Option<Duration>,
    default_poll_period: Option<Duration>,
    timings: Option<Timings>,
}

impl VrcopConfigBuilder {
    pub fn device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }

    pub fn baud(mut self, baud: u32) -> Self {
        self.baud = Some(baud);
        self
    }

    pub fn max_node_id(mut self, max: u16) -> Self {
        self.max_node_id = Some(max);
        self
    }

    pub fn scan_reply_timeout(mut self, t: Duration) -> Self {
        self.scan_reply_timeout = Some(t);
        self
    }

    pub fn default_poll_period(mut self, t: Duration) -> Self {
        self.default_poll_period = Some(t);
        self
    }

    pub fn timings(mut self, t: Timings) -> Self {
        self.timings = Some(t);
        self
    }

    pub fn build(self) -> VrcopConfig {
        VrcopConfig {
            device: self.device.unwrap_or_default(),
            baud: self.baud.unwrap_or(9600),
            max_node_id: self.max_node_id.unwrap_or(232),
            scan_reply_timeout: self.scan_reply_timeout.unwrap_or(Duration::from_millis(750)),
            default_poll_period: self.default_poll_period.unwrap_or(Duration::from_secs(30)),
            timings: self.timings.unwrap_or_default(),
        }
    }
}

/// Parse a 32-hex-digit pre-shared key, with or without separators.
pub fn parse_key(s: &str) -> Option<[u8; 16]> {
    let hex: String = s.chars().filter(|c| c.is_ascii_hexdigit()).collect();
    if hex.len() != 32 {
        return None;
    }
    let mut key = [0u8; 16];
    for (i, byte) in key.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let cfg = OmniConfig::builder().host("10.0.0.5").build();
        assert_eq!(cfg.port, 4369);
        assert!(cfg.tolerate_swapped_crc);
        let cfg = VrcopConfig::builder().device("/dev/ttyUSB0").build();
        assert_eq!(cfg.baud, 9600);
        assert_eq!(cfg.max_node_id, 232);
    }

    #[test]
    fn key_parsing() {
        let key = parse_key("00-01-02-03-04-05-06-07-08-09-0A-0B-0C-0D-0E-0F").unwrap();
        assert_eq!(key[0], 0x00);
        assert_eq!(key[15], 0x0F);
        assert!(parse_key("deadbeef").is_none());
    }
}
