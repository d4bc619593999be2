//! Connection manager for the dispatcher link.
//!
//! A two-state machine: Connected or Disconnected. Any send or receive
//! failure discards the whole connection; from Disconnected a fixed
//! backoff elapses before each reconnect attempt. `send` is
//! deliver-or-retry: it loops reconnect-then-send until one send succeeds
//! and never surfaces failure to the caller.

use std::time::Duration;

use async_trait::async_trait;
use genloop_common::{NodeError, Result, METRICS};
use genloop_proto::ConnectParams;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{info, warn};

/// Upper bound on a single inbound payload; anything larger is a framing
/// error, not a message.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// One established link to the dispatcher.
///
/// The handshake and framing internals live behind this seam; the core
/// only sends and receives opaque payloads.
#[async_trait]
pub trait LinkTransport: Send {
    /// Deliver one payload or fail the whole link.
    async fn send(&mut self, payload: &[u8]) -> Result<()>;

    /// Wait up to `wait` for one inbound payload. `Ok(None)` is a timeout.
    async fn recv(&mut self, wait: Duration) -> Result<Option<Vec<u8>>>;
}

/// Factory for links, resolved once at startup.
#[async_trait]
pub trait Connector: Send {
    type Link: LinkTransport;

    async fn connect(&self) -> Result<Self::Link>;
}

enum LinkState<L> {
    Connected(L),
    Disconnected,
}

/// Owns the single outbound connection and its retry policy.
pub struct ConnectionManager<C: Connector> {
    connector: C,
    state: LinkState<C::Link>,
    backoff: Duration,
}

impl<C: Connector> ConnectionManager<C> {
    /// Starts disconnected; the first send or explicit connect attempt
    /// establishes the link.
    pub fn new(connector: C, backoff: Duration) -> Self {
        Self {
            connector,
            state: LinkState::Disconnected,
            backoff,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, LinkState::Connected(_))
    }

    /// One connection attempt; returns whether the link is now up.
    pub async fn try_connect(&mut self) -> bool {
        match self.connector.connect().await {
            Ok(link) => {
                info!("connected to dispatcher");
                METRICS.reconnects_total.inc();
                self.state = LinkState::Connected(link);
                true
            }
            Err(e) => {
                warn!(error = %e, "connect to dispatcher failed");
                self.state = LinkState::Disconnected;
                false
            }
        }
    }

    /// Deliver-or-retry send. Suspends through reconnect backoff as long
    /// as it takes; by the time this returns the payload has been sent.
    pub async fn send(&mut self, payload: &[u8]) {
        loop {
            match &mut self.state {
                LinkState::Connected(link) => match link.send(payload).await {
                    Ok(()) => return,
                    Err(e) => {
                        warn!(error = %e, "send failed; dropping connection");
                        self.state = LinkState::Disconnected;
                    }
                },
                LinkState::Disconnected => {
                    tokio::time::sleep(self.backoff).await;
                    self.try_connect().await;
                }
            }
        }
    }

    /// Bounded-wait receive. Failures flip the state machine and read as
    /// "nothing arrived"; the next send drives reconnection. While
    /// disconnected this still honors the bound so the loop never spins.
    pub async fn recv(&mut self, wait: Duration) -> Option<Vec<u8>> {
        match &mut self.state {
            LinkState::Connected(link) => match link.recv(wait).await {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(error = %e, "receive failed; dropping connection");
                    self.state = LinkState::Disconnected;
                    None
                }
            },
            LinkState::Disconnected => {
                tokio::time::sleep(wait).await;
                None
            }
        }
    }
}

/// TCP connector: a handshake line carrying the connect parameters, then
/// length-delimited payloads in both directions.
pub struct TcpConnector {
    addr: String,
    params: ConnectParams,
}

impl TcpConnector {
    pub fn new(addr: String, params: ConnectParams) -> Self {
        Self { addr, params }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Link = TcpLink;

    async fn connect(&self) -> Result<TcpLink> {
        let mut stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| NodeError::transport(format!("connect {}: {}", self.addr, e)))?;
        let hello = format!("{}\n", self.params.to_query());
        stream
            .write_all(hello.as_bytes())
            .await
            .map_err(|e| NodeError::transport(format!("handshake: {e}")))?;
        Ok(TcpLink {
            stream,
            rx: Vec::new(),
        })
    }
}

/// Established TCP link. Inbound bytes accumulate in `rx` so a timed-out
/// read never loses a partial frame.
pub struct TcpLink {
    stream: TcpStream,
    rx: Vec<u8>,
}

impl TcpLink {
    /// Extract one complete length-prefixed payload from the buffer.
    fn try_extract(&mut self) -> Result<Option<Vec<u8>>> {
        if self.rx.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.rx[0], self.rx[1], self.rx[2], self.rx[3]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(NodeError::transport(format!(
                "inbound frame of {len} bytes exceeds the frame limit"
            )));
        }
        if self.rx.len() < 4 + len {
            return Ok(None);
        }
        let payload = self.rx[4..4 + len].to_vec();
        self.rx.drain(..4 + len);
        Ok(Some(payload))
    }
}

#[async_trait]
impl LinkTransport for TcpLink {
    async fn send(&mut self, payload: &[u8]) -> Result<()> {
        let len = (payload.len() as u32).to_be_bytes();
        self.stream
            .write_all(&len)
            .await
            .map_err(|e| NodeError::transport(e.to_string()))?;
        self.stream
            .write_all(payload)
            .await
            .map_err(|e| NodeError::transport(e.to_string()))?;
        self.stream
            .flush()
            .await
            .map_err(|e| NodeError::transport(e.to_string()))?;
        Ok(())
    }

    async fn recv(&mut self, wait: Duration) -> Result<Option<Vec<u8>>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(payload) = self.try_extract()? {
                return Ok(Some(payload));
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let mut chunk = [0u8; 4096];
            match tokio::time::timeout(remaining, self.stream.read(&mut chunk)).await {
                Err(_) => return Ok(None),
                Ok(Ok(0)) => return Err(NodeError::transport("connection closed by dispatcher")),
                Ok(Ok(n)) => self.rx.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => return Err(NodeError::transport(e.to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryConnector, SharedLink};

    #[tokio::test(start_paused = true)]
    async fn test_send_retries_until_delivered() {
        let shared = SharedLink::default();
        shared.fail_sends(2);
        let mut conn =
            ConnectionManager::new(MemoryConnector::new(shared.clone()), Duration::from_secs(10));

        conn.try_connect().await;
        conn.send(b"payload").await;

        // Two failed sends each dropped the link, so two reconnects
        // happened before the delivery stuck.
        assert_eq!(shared.connect_count(), 3);
        assert_eq!(shared.sent(), vec![b"payload".to_vec()]);
        assert!(conn.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_waits_out_connect_failures() {
        let shared = SharedLink::default();
        shared.fail_connects(3);
        let mut conn =
            ConnectionManager::new(MemoryConnector::new(shared.clone()), Duration::from_secs(10));

        conn.send(b"x").await;
        assert_eq!(shared.connect_count(), 4);
        assert_eq!(shared.sent(), vec![b"x".to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recv_failure_disconnects() {
        let shared = SharedLink::default();
        shared.fail_recvs(1);
        let mut conn =
            ConnectionManager::new(MemoryConnector::new(shared.clone()), Duration::from_secs(10));

        conn.try_connect().await;
        assert!(conn.is_connected());
        let got = conn.recv(Duration::from_millis(5)).await;
        assert!(got.is_none());
        assert!(!conn.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recv_while_disconnected_honors_bound() {
        let shared = SharedLink::default();
        let mut conn =
            ConnectionManager::new(MemoryConnector::new(shared), Duration::from_secs(10));

        let started = tokio::time::Instant::now();
        let got = conn.recv(Duration::from_millis(100)).await;
        assert!(got.is_none());
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recv_returns_scripted_payload() {
        let shared = SharedLink::default();
        shared.push_inbound(b"{\"id\":1,\"stop\":true}".to_vec());
        let mut conn =
            ConnectionManager::new(MemoryConnector::new(shared), Duration::from_secs(10));

        conn.try_connect().await;
        let got = conn.recv(Duration::from_millis(5)).await;
        assert_eq!(got.unwrap(), b"{\"id\":1,\"stop\":true}");
    }
}
