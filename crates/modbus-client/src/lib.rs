#![allow(dead_code)]

//! `DeviceSession`: one Modbus/TCP session per device (spec.md §4.1).
//!
//! Connect, read holding registers with retry/backoff, test connectivity,
//! and tear down, all serialized on a per-session lock. A connection
//! cooldown prevents reconnection storms when a device is flapping.

use std::cmp::min;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use socket2::{SockRef, TcpKeepalive};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tokio_modbus::client::{tcp, Context};
use tokio_modbus::prelude::{Reader, Slave, SlaveContext};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default cooldown between connection attempts (spec.md §4.1).
pub const DEFAULT_CONNECTION_COOLDOWN: Duration = Duration::from_secs(5);

/// Configuration options for connecting and polling a Modbus TCP device.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Maximum number of registers to read in a single request; devices with quirks may require lower batch sizes.
    pub max_batch_size: Option<u16>,
    /// Per-request timeout in milliseconds.
    pub timeout_ms: u64,
    /// Number of retries per request after the initial attempt.
    pub retry_count: usize,
    /// Base delay between retries in milliseconds (exponential backoff).
    pub retry_backoff_ms: u64,
    /// Upper bound for retry backoff delay in milliseconds.
    pub retry_max_backoff_ms: u64,
    /// Optional delay between split reads to placate slower devices.
    pub inter_read_delay_ms: Option<u64>,
    /// Minimum time between connection attempts, regardless of outcome.
    pub connection_cooldown: Duration,
    pub keepalive: bool,
    pub nagle: bool,
    pub socket_recv_buffer: u32,
    pub socket_send_buffer: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 502,
            max_batch_size: None,
            timeout_ms: 1_000,
            retry_count: 2,
            retry_backoff_ms: 100,
            retry_max_backoff_ms: 2_000,
            inter_read_delay_ms: None,
            connection_cooldown: DEFAULT_CONNECTION_COOLDOWN,
            keepalive: true,
            nagle: false,
            socket_recv_buffer: 8 * 1024,
            socket_send_buffer: 8 * 1024,
        }
    }
}

/// Failure taxonomy for a read attempt (spec.md §4.1).
#[derive(Debug, Error, Clone)]
pub enum ClientError {
    #[error("invalid socket address {0}:{1}")]
    InvalidAddress(String, u16),
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("protocol error: {0}")]
    ProtocolError(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("register address overflow")]
    AddressOverflow,
    #[error("session is closed")]
    Closed,
}

impl ClientError {
    /// Whether this failure should mark the session disconnected
    /// (cancellation is a normal termination signal, not a fault — §4.1).
    pub fn marks_disconnected(&self) -> bool {
        !matches!(self, ClientError::Cancelled)
    }

    fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match err.kind() {
            TimedOut => ClientError::Timeout { timeout_ms: 0 },
            ConnectionReset | ConnectionAborted | ConnectionRefused | NotConnected
            | BrokenPipe => ClientError::ConnectionFailed(err.to_string()),
            _ => ClientError::ProtocolError(err.to_string()),
        }
    }
}

/// Session lifecycle states (spec.md §4.1 state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

/// Outcome of a successful register read.
#[derive(Debug, Clone)]
pub struct ReadOutcome {
    pub data: Vec<u16>,
    pub duration: Duration,
}

struct Inner {
    state: SessionState,
    context: Option<Context>,
    last_connect_attempt: Option<Instant>,
}

/// One logical Modbus/TCP endpoint (spec.md §4.1). Concurrent callers
/// serialize on `inner`; a read that observes the session disconnected
/// reconnects once transparently before failing.
pub struct DeviceSession {
    config: ClientConfig,
    unit_id: u8,
    inner: Mutex<Inner>,
}

impl DeviceSession {
    pub fn new(config: ClientConfig, unit_id: u8) -> Self {
        Self {
            config,
            unit_id,
            inner: Mutex::new(Inner {
                state: SessionState::Disconnected,
                context: None,
                last_connect_attempt: None,
            }),
        }
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    /// Opens the TCP socket, configures it, and instantiates a Modbus
    /// master. Re-entrant: a call arriving within the connection cooldown
    /// returns the current state without dialing again.
    pub async fn connect(&self) -> Result<SessionState, ClientError> {
        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Closed {
            return Err(ClientError::Closed);
        }

        if let Some(last) = inner.last_connect_attempt {
            if last.elapsed() < self.config.connection_cooldown {
                debug!(host = %self.config.host, "connect suppressed by cooldown");
                return Ok(inner.state);
            }
        }

        inner.state = SessionState::Connecting;
        inner.last_connect_attempt = Some(Instant::now());

        match self.dial().await {
            Ok(context) => {
                inner.context = Some(context);
                inner.state = SessionState::Connected;
                Ok(SessionState::Connected)
            }
            Err(err) => {
                inner.context = None;
                inner.state = SessionState::Disconnected;
                Err(err)
            }
        }
    }

    async fn dial(&self) -> Result<Context, ClientError> {
        let addr = format!("{}:{}", self.config.host, self.config.port)
            .parse::<SocketAddr>()
            .map_err(|_| ClientError::InvalidAddress(self.config.host.clone(), self.config.port))?;

        let stream = timeout(
            Duration::from_millis(self.config.timeout_ms),
            TcpStream::connect(addr),
        )
        .await
        .map_err(|_| ClientError::Timeout {
            timeout_ms: self.config.timeout_ms,
        })?
        .map_err(|err| ClientError::ConnectionFailed(err.to_string()))?;

        self.tune_socket(&stream)
            .map_err(|err| ClientError::ConnectionFailed(err.to_string()))?;

        Ok(tcp::attach(stream))
    }

    fn tune_socket(&self, stream: &TcpStream) -> std::io::Result<()> {
        stream.set_nodelay(!self.config.nagle)?;
        let sock_ref = SockRef::from(stream);
        if self.config.keepalive {
            sock_ref.set_tcp_keepalive(&TcpKeepalive::new().with_time(Duration::from_secs(60)))?;
        }
        sock_ref.set_recv_buffer_size(self.config.socket_recv_buffer as usize)?;
        sock_ref.set_send_buffer_size(self.config.socket_send_buffer as usize)?;
        Ok(())
    }

    /// Reads `count` holding registers starting at `start`. Attempts at
    /// most `max_retries + 1` times; between attempts the session is
    /// marked disconnected, `retry_delay` elapses, and the session
    /// reconnects. `duration` covers the whole call including retries.
    pub async fn read_holding_registers(
        &self,
        start: u16,
        count: u16,
        cancel: &CancellationToken,
    ) -> Result<ReadOutcome, ClientError> {
        let started = Instant::now();
        if count == 0 {
            return Ok(ReadOutcome {
                data: Vec::new(),
                duration: started.elapsed(),
            });
        }

        let batch_size = self.config.max_batch_size.unwrap_or(count).max(1u16);
        let mut remaining = count;
        let mut offset = 0u16;
        let mut out = Vec::with_capacity(count as usize);

        while remaining > 0 {
            let chunk = min(remaining, batch_size);
            let chunk_start = u16::try_from(u32::from(start) + u32::from(offset))
                .map_err(|_| ClientError::AddressOverflow)?;
            let values = self.read_chunk_with_retry(chunk_start, chunk, cancel).await?;
            out.extend(values);
            remaining -= chunk;
            offset += chunk;

            if remaining > 0 {
                if let Some(delay_ms) = self.config.inter_read_delay_ms {
                    if !sleep_cancellable(Duration::from_millis(delay_ms), cancel).await {
                        return Err(ClientError::Cancelled);
                    }
                }
            }
        }

        Ok(ReadOutcome {
            data: out,
            duration: started.elapsed(),
        })
    }

    async fn read_chunk_with_retry(
        &self,
        start: u16,
        count: u16,
        cancel: &CancellationToken,
    ) -> Result<Vec<u16>, ClientError> {
        let mut attempts = 0usize;
        let mut last_error = None;

        loop {
            if cancel.is_cancelled() {
                return Err(ClientError::Cancelled);
            }

            match self.attempt_read(start, count, cancel).await {
                Ok(values) => return Ok(values),
                Err(ClientError::Cancelled) => return Err(ClientError::Cancelled),
                Err(err) => {
                    warn!(start, count, error = %err, attempt = attempts, "modbus read failed");
                    self.mark_disconnected_for(&err).await;
                    last_error = Some(err);
                }
            }

            if attempts >= self.config.retry_count {
                return Err(last_error.unwrap_or(ClientError::Timeout {
                    timeout_ms: self.config.timeout_ms,
                }));
            }

            let delay = Duration::from_millis(self.retry_delay_ms(attempts));
            attempts += 1;
            if !sleep_cancellable(delay, cancel).await {
                return Err(ClientError::Cancelled);
            }
            // Transparent reconnect before the next attempt (§4.1).
            let _ = self.connect().await;
        }
    }

    async fn attempt_read(
        &self,
        start: u16,
        count: u16,
        cancel: &CancellationToken,
    ) -> Result<Vec<u16>, ClientError> {
        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Closed {
            return Err(ClientError::Closed);
        }
        if inner.context.is_none() {
            drop(inner);
            self.connect().await?;
            inner = self.inner.lock().await;
        }
        let ctx = inner
            .context
            .as_mut()
            .ok_or_else(|| ClientError::ConnectionFailed("no session context".to_string()))?;
        ctx.set_slave(Slave(self.unit_id));

        let request = ctx.read_holding_registers(start, count);
        tokio::select! {
            _ = cancel.cancelled() => Err(ClientError::Cancelled),
            result = timeout(Duration::from_millis(self.config.timeout_ms), request) => {
                match result {
                    Ok(Ok(values)) => {
                        debug!(unit_id = self.unit_id, start, count, "modbus read ok");
                        Ok(values)
                    }
                    Ok(Err(err)) => Err(ClientError::from_io(&err)),
                    Err(_) => Err(ClientError::Timeout {
                        timeout_ms: self.config.timeout_ms,
                    }),
                }
            }
        }
    }

    async fn mark_disconnected_for(&self, err: &ClientError) {
        if !err.marks_disconnected() {
            return;
        }
        let mut inner = self.inner.lock().await;
        if inner.state != SessionState::Closed {
            inner.state = SessionState::Disconnected;
            inner.context = None;
        }
    }

    /// Reads a single register at address 0; success means the session is usable.
    pub async fn test_connectivity(&self, cancel: &CancellationToken) -> Result<Duration, ClientError> {
        let started = Instant::now();
        self.read_holding_registers(0, 1, cancel).await?;
        Ok(started.elapsed())
    }

    /// Tears down the Modbus master and socket. Idempotent.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        inner.context = None;
        inner.state = SessionState::Closed;
    }

    fn retry_delay_ms(&self, attempt: usize) -> u64 {
        let base = self.config.retry_backoff_ms.max(1);
        let shift = u32::try_from(attempt).unwrap_or(u32::MAX);
        let factor = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
        let delay = base.saturating_mul(factor);
        let max = self.config.retry_max_backoff_ms.max(base);
        min(delay, max)
    }
}

/// Sleeps for `duration` unless cancelled first. Returns `false` if cancelled.
async fn sleep_cancellable(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = sleep(duration) => true,
        _ = cancel.cancelled() => false,
    }
}
