//! Pre-established connection pool.
//!
//! Keeps a configurable number of fully-handshaken upstream sessions warm
//! so a proxy outbound's first byte goes out without paying dial latency.
//! Sessions rotate on a jittered lifetime, are topped up by a maintenance
//! loop at a bounded creation rate, and carry a per-connection heartbeat
//! that refreshes a read deadline while they sit idle.
//!
//! Ownership model: the pool owns every socket. A lease hands out a
//! [`PooledConn`] that borrows the stream; closing or dropping the lease
//! returns the stream to the pool instead of closing it. One mutex guards
//! the whole connection list and is never held across I/O.

use crate::dialer::{DialError, IoStream};
use parking_lot::Mutex;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use sy_config::ConnectionPoolConfig;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Async factory producing one fully-established upstream session.
pub type ConnFactory =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<IoStream, DialError>> + Send>> + Send + Sync>;

const CREATE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum PoolError {
    /// `get_conn` after `close`.
    #[error("connection pool is closed")]
    Closed,

    /// Synchronous factory failure during a lease.
    #[error("create pooled connection: {0}")]
    CreateFailed(#[from] DialError),
}

type ReadDeadline = Mutex<Option<Instant>>;

struct PooledEntry {
    id: u64,
    /// The session while idle; taken by the active lease.
    stream: Option<IoStream>,
    created_at: Instant,
    last_used_at: Instant,
    expires_at: Option<Instant>,
    in_use: bool,
    closed: bool,
    deadline: Arc<ReadDeadline>,
    heartbeat_done: CancellationToken,
}

struct PoolState {
    connections: Vec<PooledEntry>,
    next_id: u64,
    closed: bool,
}

pub struct ConnectionPool {
    config: ConnectionPoolConfig,
    factory: ConnFactory,
    state: Mutex<PoolState>,
    cancel: CancellationToken,
}

impl ConnectionPool {
    /// Start a pool: the maintenance loop begins ticking immediately and,
    /// when `ensure_idle_session > 0`, pre-warming starts in the
    /// background. Must be called within a tokio runtime.
    pub fn new(config: ConnectionPoolConfig, factory: ConnFactory) -> Arc<Self> {
        let mut config = config;
        if config.idle_session_check_interval.is_zero() {
            config.idle_session_check_interval = Duration::from_secs(30);
        }
        if config.idle_session_timeout.is_zero() {
            config.idle_session_timeout = Duration::from_secs(5 * 60);
        }
        if config.ensure_idle_session_create_rate == 0 {
            config.ensure_idle_session_create_rate = 1;
        }

        let pool = Arc::new(Self {
            config,
            factory,
            state: Mutex::new(PoolState {
                connections: Vec::new(),
                next_id: 0,
                closed: false,
            }),
            cancel: CancellationToken::new(),
        });

        {
            let pool = pool.clone();
            tokio::spawn(async move { pool.maintenance_loop().await });
        }
        pool.ensure_idle_connections();
        pool
    }

    /// Lease a session: the first usable idle connection, or a fresh one
    /// dialed synchronously when none is available.
    pub async fn get_conn(self: &Arc<Self>) -> Result<PooledConn, PoolError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(PoolError::Closed);
            }
            let now = Instant::now();
            let mut index = 0;
            while index < state.connections.len() {
                let entry = &state.connections[index];
                if entry.in_use || entry.closed || entry.stream.is_none() {
                    index += 1;
                    continue;
                }
                if matches!(entry.expires_at, Some(at) if now > at) {
                    let mut entry = state.connections.remove(index);
                    tracing::debug!(
                        age_secs = entry.created_at.elapsed().as_secs(),
                        "dropping expired pooled connection at lease"
                    );
                    close_entry(&mut entry);
                    continue;
                }
                let entry = &mut state.connections[index];
                if let Some(stream) = entry.stream.take() {
                    entry.in_use = true;
                    entry.last_used_at = now;
                    return Ok(PooledConn::new(
                        self.clone(),
                        entry.id,
                        stream,
                        entry.deadline.clone(),
                    ));
                }
                index += 1;
            }
        }

        // No idle connection available: create one while holding no lock.
        let stream = self.create_stream().await?;
        let now = Instant::now();
        let deadline: Arc<ReadDeadline> = Arc::new(Mutex::new(None));
        let heartbeat_done = CancellationToken::new();

        let id = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(PoolError::Closed);
            }
            let id = state.next_id;
            state.next_id += 1;
            state.connections.push(PooledEntry {
                id,
                stream: None,
                created_at: now,
                last_used_at: now,
                expires_at: self.compute_expiry(now),
                in_use: true,
                closed: false,
                deadline: deadline.clone(),
                heartbeat_done: heartbeat_done.clone(),
            });
            id
        };
        self.spawn_heartbeat(id, heartbeat_done);
        Ok(PooledConn::new(self.clone(), id, stream, deadline))
    }

    /// Close every connection immediately and re-warm in the background.
    /// Intended for network-interface transitions.
    pub fn reset(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            for mut entry in state.connections.drain(..) {
                close_entry(&mut entry);
            }
        }
        if self.config.ensure_idle_session > 0 {
            self.ensure_idle_connections();
        }
    }

    /// Shut the pool down: cancel maintenance and heartbeats, close every
    /// connection. Idempotent; subsequent leases fail with
    /// [`PoolError::Closed`].
    pub fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        self.cancel.cancel();
        for mut entry in state.connections.drain(..) {
            close_entry(&mut entry);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Total connections tracked, leased included.
    pub fn len(&self) -> usize {
        self.state.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Connections currently idle in the pool.
    pub fn idle_len(&self) -> usize {
        self.state
            .lock()
            .connections
            .iter()
            .filter(|e| !e.in_use && !e.closed)
            .count()
    }

    async fn create_stream(&self) -> Result<IoStream, PoolError> {
        match tokio::time::timeout(CREATE_TIMEOUT, (self.factory)()).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(error)) => Err(PoolError::CreateFailed(error)),
            Err(elapsed) => Err(PoolError::CreateFailed(elapsed.into())),
        }
    }

    fn compute_expiry(&self, created_at: Instant) -> Option<Instant> {
        let max_lifetime = self.config.max_connection_lifetime;
        if max_lifetime.is_zero() {
            return None;
        }
        let mut lifetime_ms = max_lifetime.as_millis() as i64;
        let jitter = self.config.connection_lifetime_jitter;
        if !jitter.is_zero() {
            let jitter_ms = jitter.as_millis() as i64;
            lifetime_ms += fastrand::i64(-jitter_ms..=jitter_ms);
        }
        Some(created_at + Duration::from_millis(lifetime_ms.max(0) as u64))
    }

    /// Top the idle set up to `ensure_idle_session`, creating at most
    /// `ensure_idle_session_create_rate` connections per call, each in its
    /// own task.
    fn ensure_idle_connections(self: &Arc<Self>) {
        let needed = {
            let state = self.state.lock();
            if state.closed || self.config.ensure_idle_session == 0 {
                return;
            }
            let idle = state
                .connections
                .iter()
                .filter(|e| !e.in_use && !e.closed)
                .count();
            self.config
                .ensure_idle_session
                .saturating_sub(idle)
                .min(self.config.ensure_idle_session_create_rate)
        };
        for _ in 0..needed {
            let pool = self.clone();
            tokio::spawn(async move { pool.create_idle().await });
        }
    }

    async fn create_idle(self: Arc<Self>) {
        let stream = match self.create_stream().await {
            Ok(stream) => stream,
            Err(error) => {
                tracing::warn!(error = %error, "failed to create pool connection");
                return;
            }
        };
        let now = Instant::now();
        let deadline: Arc<ReadDeadline> = Arc::new(Mutex::new(None));
        let heartbeat_done = CancellationToken::new();

        let id = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            let id = state.next_id;
            state.next_id += 1;
            state.connections.push(PooledEntry {
                id,
                stream: Some(stream),
                created_at: now,
                last_used_at: now,
                expires_at: self.compute_expiry(now),
                in_use: false,
                closed: false,
                deadline,
                heartbeat_done: heartbeat_done.clone(),
            });
            id
        };
        self.spawn_heartbeat(id, heartbeat_done);
    }

    async fn maintenance_loop(self: Arc<Self>) {
        let period = self.config.idle_session_check_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => self.perform_maintenance(),
            }
        }
    }

    /// One sweep-and-top-up round. Eviction keeps at least
    /// `min_idle_session` idle connections (the age floor uses
    /// `min_idle_session_for_age`, inheriting `min_idle_session` when
    /// unset).
    fn perform_maintenance(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            let now = Instant::now();
            let idle_timeout = self.config.idle_session_timeout;
            let max_lifetime = self.config.max_connection_lifetime;
            let min_idle = self.config.min_idle_session;
            let min_idle_for_age = self.config.effective_min_idle_for_age();

            let mut idle_count = 0usize;
            let mut index = 0;
            while index < state.connections.len() {
                if state.connections[index].closed {
                    state.connections.remove(index);
                    continue;
                }
                let entry = &state.connections[index];
                if !entry.in_use {
                    idle_count += 1;

                    let idle_expired = !idle_timeout.is_zero()
                        && now.duration_since(entry.last_used_at) > idle_timeout;
                    if idle_expired && idle_count > min_idle {
                        let mut entry = state.connections.remove(index);
                        close_entry(&mut entry);
                        idle_count -= 1;
                        continue;
                    }

                    let age_expired = !max_lifetime.is_zero()
                        && matches!(entry.expires_at, Some(at) if now > at);
                    if age_expired && idle_count > min_idle_for_age {
                        let mut entry = state.connections.remove(index);
                        tracing::debug!(
                            age_secs = entry.created_at.elapsed().as_secs(),
                            "rotating aged pooled connection"
                        );
                        close_entry(&mut entry);
                        idle_count -= 1;
                        continue;
                    }
                }
                index += 1;
            }
        }
        self.ensure_idle_connections();
    }

    /// Refresh the entry's read deadline every `heartbeat` interval while
    /// the connection lives. `closed` is read under the pool lock so the
    /// task cannot race a concurrent close.
    fn spawn_heartbeat(self: &Arc<Self>, id: u64, done: CancellationToken) {
        let heartbeat = self.config.heartbeat;
        if heartbeat.is_zero() {
            return;
        }
        let pool = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pool.cancel.cancelled() => break,
                    _ = done.cancelled() => break,
                    _ = tokio::time::sleep(heartbeat) => {
                        let deadline = {
                            let state = pool.state.lock();
                            state
                                .connections
                                .iter()
                                .find(|e| e.id == id && !e.closed)
                                .map(|e| e.deadline.clone())
                        };
                        match deadline {
                            Some(deadline) => {
                                *deadline.lock() = Some(Instant::now() + heartbeat * 2);
                            }
                            None => break,
                        }
                    }
                }
            }
        });
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ConnectionPool")
            .field("connections", &state.connections.len())
            .field("closed", &state.closed)
            .finish()
    }
}

/// Mark closed, stop the heartbeat, and drop the stream; dropping the
/// stream closes the socket.
fn close_entry(entry: &mut PooledEntry) {
    if entry.closed {
        return;
    }
    entry.closed = true;
    entry.heartbeat_done.cancel();
    entry.stream = None;
}

/// Leased view of a pooled session.
///
/// Closing (or dropping) the lease returns the stream to the pool rather
/// than closing the socket; the return is gated so repeated shutdowns are
/// no-ops. Every read clears the heartbeat's read deadline first, so the
/// deadline never affects caller traffic.
pub struct PooledConn {
    pool: Arc<ConnectionPool>,
    id: u64,
    stream: Option<IoStream>,
    deadline: Arc<ReadDeadline>,
    returned: bool,
}

impl PooledConn {
    fn new(
        pool: Arc<ConnectionPool>,
        id: u64,
        stream: IoStream,
        deadline: Arc<ReadDeadline>,
    ) -> Self {
        Self {
            pool,
            id,
            stream: Some(stream),
            deadline,
            returned: false,
        }
    }

    fn release(&mut self) {
        if self.returned {
            return;
        }
        self.returned = true;
        let Some(stream) = self.stream.take() else {
            return;
        };
        let mut state = self.pool.state.lock();
        if state.closed {
            return;
        }
        if let Some(entry) = state.connections.iter_mut().find(|e| e.id == self.id) {
            if !entry.closed {
                entry.stream = Some(stream);
                entry.in_use = false;
                entry.last_used_at = Instant::now();
            }
        }
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        self.release();
    }
}

impl tokio::io::AsyncRead for PooledConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        // Clear the heartbeat deadline before every read.
        *this.deadline.lock() = None;
        match this.stream.as_mut() {
            Some(stream) => Pin::new(stream).poll_read(cx, buf),
            None => Poll::Ready(Err(lease_gone())),
        }
    }
}

impl tokio::io::AsyncWrite for PooledConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match this.stream.as_mut() {
            Some(stream) => Pin::new(stream).poll_write(cx, buf),
            None => Poll::Ready(Err(lease_gone())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.stream.as_mut() {
            Some(stream) => Pin::new(stream).poll_flush(cx),
            None => Poll::Ready(Err(lease_gone())),
        }
    }

    /// Flush and return the lease to the pool. The underlying socket
    /// stays open for the next lease.
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.stream.as_mut() {
            Some(stream) => match Pin::new(stream).poll_flush(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(result) => {
                    this.release();
                    Poll::Ready(result)
                }
            },
            None => Poll::Ready(Ok(())),
        }
    }
}

fn lease_gone() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection returned to pool")
}
