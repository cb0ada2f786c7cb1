// MIT License - Copyright (c) 2026 Peter Wright
// BlueBOLT CV2 client

use std::fmt;
use std::time::Duration;

use crate::constants::{
    DEFAULT_PORT, DEFAULT_RETRIES, DEFAULT_SCAN_INTERVAL, DEFAULT_TIMEOUT, TOKEN_LEN, TOKEN_MASK,
    TOKEN_SECRET_LEN,
};
use crate::error::{BlueBoltError, Result};

/// The CV2 card's MAC address, used as the shared secret on every request.
///
/// Stored as 12 lowercase hex characters. `Debug` and `Display` only ever show
/// the redacted form (`1065a3XXXXXX`); the full value is reachable through
/// [`AuthToken::expose`] for building packets.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    /// Parse a MAC such as `10:65:A3:12:34:56`, `10-65-a3-12-34-56` or
    /// `1065a3123456`.
    pub fn new(mac: &str) -> Result<Self> {
        let normalized: String = mac
            .trim()
            .chars()
            .filter(|c| !matches!(c, ':' | '-' | '.'))
            .collect::<String>()
            .to_ascii_lowercase();

        if normalized.len() != TOKEN_LEN {
            return Err(BlueBoltError::InvalidToken {
                reason: format!(
                    "expected {} hex characters, got {}",
                    TOKEN_LEN,
                    normalized.len()
                ),
            });
        }
        if !normalized.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(BlueBoltError::InvalidToken {
                reason: "token must contain only hex characters".to_string(),
            });
        }
        Ok(Self(normalized))
    }

    /// Full token, for the wire only.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Token with the trailing six characters masked.
    pub fn redacted(&self) -> String {
        format!("{}{}", &self.0[..TOKEN_LEN - TOKEN_SECRET_LEN], TOKEN_MASK)
    }

    /// Mask every occurrence of the token's secret part in `text`.
    ///
    /// Matching is case-insensitive, so an echo in uppercase is masked too.
    pub fn redact(&self, text: &str) -> String {
        let secret = &self.0[TOKEN_LEN - TOKEN_SECRET_LEN..];
        let lower = text.to_ascii_lowercase();
        let mut out = String::with_capacity(text.len());
        let mut pos = 0;
        while let Some(found) = lower[pos..].find(secret) {
            let start = pos + found;
            out.push_str(&text[pos..start]);
            out.push_str(TOKEN_MASK);
            pos = start + secret.len();
        }
        out.push_str(&text[pos..]);
        out
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthToken({})", self.redacted())
    }
}

impl fmt::Display for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

/// Configuration for one CV2-equipped device.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// IP address or hostname of the CV2 card
    pub host: String,
    /// UDP port (default: 57010)
    pub port: u16,
    /// Card MAC used as auth token
    pub token: AuthToken,
    /// Per-attempt response timeout
    pub timeout: Duration,
    /// Retries after the first attempt before reporting a timeout
    pub retries: u32,
    /// Polling cadence for the monitor
    pub scan_interval: Duration,
}

impl DeviceConfig {
    /// Create a new config builder starting from defaults.
    pub fn builder() -> DeviceConfigBuilder {
        DeviceConfigBuilder::default()
    }

    /// `host:port` for the socket.
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Total number of send attempts per request.
    pub fn attempts(&self) -> u32 {
        self.retries + 1
    }
}

/// Builder for [`DeviceConfig`].
///
/// The MAC is validated in [`build`](Self::build), so a builder can be filled
/// straight from untrusted config input.
#[derive(Debug, Clone)]
pub struct DeviceConfigBuilder {
    host: String,
    port: u16,
    mac: String,
    timeout: Duration,
    retries: u32,
    scan_interval: Duration,
}

impl Default for DeviceConfigBuilder {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_PORT,
            mac: String::new(),
            timeout: DEFAULT_TIMEOUT,
            retries: DEFAULT_RETRIES,
            scan_interval: DEFAULT_SCAN_INTERVAL,
        }
    }
}

impl DeviceConfigBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn mac(mut self, mac: impl Into<String>) -> Self {
        self.mac = mac.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    pub fn build(self) -> Result<DeviceConfig> {
        if self.host.trim().is_empty() {
            return Err(BlueBoltError::Connection {
                host: self.host,
                reason: "host is empty".to_string(),
            });
        }
        let token = AuthToken::new(&self.mac)?;
        Ok(DeviceConfig {
            host: self.host.trim().to_string(),
            port: self.port,
            token,
            timeout: self.timeout,
            retries: self.retries,
            scan_interval: self.scan_interval,
        })
    }
}
