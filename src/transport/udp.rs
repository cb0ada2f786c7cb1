// MIT License - Copyright (c) 2026 Peter Wright
// BlueBOLT CV2 client

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::Mutex;
use tokio::time::{timeout_at, Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::{AuthToken, DeviceConfig};
use crate::constants::MAX_DATAGRAM;
use crate::error::{BlueBoltError, Result};
use crate::protocol::Command;
use crate::xml::XmlElement;

/// Counters for one UDP session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Datagrams written to the socket, retries included
    pub datagrams_sent: u64,
    /// Requests answered by a matching response
    pub responses: u64,
    /// Requests that exhausted every attempt
    pub timeouts: u64,
    /// Datagrams thrown away as stale or unrelated
    pub discarded: u64,
}

/// Request/response transport over a single connected UDP socket.
///
/// The card answers in arrival order and echoes no request id, so only one
/// request may be outstanding: the socket lives behind a mutex that is held
/// for the whole request, retries included. Anything already queued when a
/// request starts is a late answer to an earlier one and is dropped. After a
/// request times out the socket is replaced with one on a fresh local port,
/// so answers still in flight to the old port are never read.
pub struct UdpTransport {
    socket: Mutex<UdpSocket>,
    peer: SocketAddr,
    timeout: Duration,
    attempts: u32,
    token: AuthToken,
    datagrams_sent: AtomicU64,
    responses: AtomicU64,
    timeouts: AtomicU64,
    discarded: AtomicU64,
}

impl UdpTransport {
    /// Resolve the card's address and open a socket connected to it.
    ///
    /// No packet is exchanged here; the first authenticated request is the
    /// handshake.
    pub async fn connect(config: &DeviceConfig) -> Result<Self> {
        let address = config.address();
        let connection_error = |reason: String| BlueBoltError::Connection {
            host: config.host.clone(),
            reason,
        };

        let peer = lookup_host(&address)
            .await
            .map_err(|e| connection_error(e.to_string()))?
            .next()
            .ok_or_else(|| connection_error("no address found".to_string()))?;

        let socket = open_socket(peer)
            .await
            .map_err(|e| connection_error(e.to_string()))?;

        info!("UDP session open to {} (token {})", peer, config.token);

        Ok(Self {
            socket: Mutex::new(socket),
            peer,
            timeout: config.timeout,
            attempts: config.attempts(),
            token: config.token.clone(),
            datagrams_sent: AtomicU64::new(0),
            responses: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn stats(&self) -> TransportStats {
        TransportStats {
            datagrams_sent: self.datagrams_sent.load(Ordering::Relaxed),
            responses: self.responses.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }

    /// Send `command` to device `class`/`id` and wait for its response.
    ///
    /// Each attempt waits up to the configured timeout; the same datagram is
    /// resent on silence. Datagrams that do not answer `command` are dropped
    /// without consuming the attempt. A malformed response fails at once.
    pub async fn request(&self, command: &Command, class: &str, id: &str) -> Result<XmlElement> {
        let packet = command.encode(class, id)?;
        let mut socket = self.socket.lock().await;

        let stale = self.drain(&socket);
        if stale > 0 {
            debug!("Discarded {} stale datagram(s) before {}", stale, command.name());
        }

        for attempt in 1..=self.attempts {
            debug!(
                "Sent to {} (attempt {}/{}): {}",
                self.peer,
                attempt,
                self.attempts,
                self.token.redact(&packet)
            );
            socket.send(packet.as_bytes()).await?;
            self.datagrams_sent.fetch_add(1, Ordering::Relaxed);

            let deadline = Instant::now() + self.timeout;
            if let Some(response) = self.wait_for(&socket, command, deadline).await? {
                self.responses.fetch_add(1, Ordering::Relaxed);
                return Ok(response);
            }
            if attempt < self.attempts {
                debug!("No response to {} from {}, retrying", command.name(), self.peer);
            }
        }

        self.timeouts.fetch_add(1, Ordering::Relaxed);
        warn!(
            "Timeout waiting for {} from {} after {} attempt(s)",
            command.name(),
            self.peer,
            self.attempts
        );

        match open_socket(self.peer).await {
            Ok(fresh) => {
                debug!(
                    "Moved session to {} from {} after timeout",
                    fresh.local_addr().map(|a| a.to_string()).unwrap_or_default(),
                    socket.local_addr().map(|a| a.to_string()).unwrap_or_default()
                );
                *socket = fresh;
            }
            Err(e) => warn!("Could not reopen socket to {}: {}", self.peer, e),
        }
        Err(BlueBoltError::Timeout {
            command: command.name(),
            attempts: self.attempts,
        })
    }

    /// Read until a datagram answering `command` arrives or `deadline` passes.
    async fn wait_for(
        &self,
        socket: &UdpSocket,
        command: &Command,
        deadline: Instant,
    ) -> Result<Option<XmlElement>> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let n = match timeout_at(deadline, socket.recv(&mut buf)).await {
                Err(_) => return Ok(None),
                Ok(Ok(n)) => n,
                // ICMP port unreachable surfaces here on a connected socket
                Ok(Err(e)) if e.kind() == ErrorKind::ConnectionRefused => {
                    debug!("{} refused the datagram", self.peer);
                    continue;
                }
                Ok(Err(e)) => return Err(BlueBoltError::Io(e)),
            };

            let raw = String::from_utf8_lossy(&buf[..n]);
            let text = raw.trim_matches(|c: char| c == '\0' || c.is_whitespace());
            debug!("Received from {}: {}", self.peer, self.token.redact(text));

            let response = XmlElement::parse(text).map_err(|e| match e {
                BlueBoltError::Parse { details } => BlueBoltError::Parse {
                    details: self.token.redact(&details),
                },
                other => other,
            })?;

            if command.matches(&response) {
                return Ok(Some(response));
            }
            self.discarded.fetch_add(1, Ordering::Relaxed);
            debug!("Discarding datagram that does not answer {}", command.name());
        }
    }

    /// Drop every datagram already queued on the socket.
    fn drain(&self, socket: &UdpSocket) -> u64 {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut count = 0;
        loop {
            match socket.try_recv(&mut buf) {
                Ok(_) => count += 1,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::ConnectionRefused => continue,
                Err(e) => {
                    debug!("Error while draining socket: {}", e);
                    break;
                }
            }
        }
        self.discarded.fetch_add(count, Ordering::Relaxed);
        count
    }
}

/// Bind an ephemeral local port of the peer's family and connect it.
async fn open_socket(peer: SocketAddr) -> std::io::Result<UdpSocket> {
    let bind_addr = if peer.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(peer).await?;
    Ok(socket)
}
