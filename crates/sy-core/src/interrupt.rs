//! Interrupt group: tear down in-flight connections on tier switches.
//!
//! Connections handed out by a group register here when the
//! `interrupt_exist_connections` option is set; [`InterruptGroup::interrupt`]
//! fails their pending and future I/O so callers re-dial through the new
//! tier.

use crate::adapter::{BoxPacketConn, IoStream, PacketConn};
use crate::types::Endpoint;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

#[derive(Debug, Default)]
pub struct InterruptGroup {
    token: Mutex<CancellationToken>,
}

impl InterruptGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tear down every connection wrapped since the last interrupt.
    /// Connections wrapped afterwards join a fresh generation.
    pub fn interrupt(&self) {
        let mut token = self.token.lock();
        token.cancel();
        *token = CancellationToken::new();
    }

    pub fn wrap_stream(&self, inner: IoStream) -> IoStream {
        let token = self.token.lock().clone();
        Box::new(InterruptedStream {
            inner,
            cancelled: Box::pin(token.cancelled_owned()),
            interrupted: false,
        })
    }

    pub fn wrap_packet(&self, inner: BoxPacketConn) -> BoxPacketConn {
        let token = self.token.lock().clone();
        Box::new(InterruptedPacketConn { inner, token })
    }
}

fn interrupted_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionReset, "connection interrupted")
}

struct InterruptedStream {
    inner: IoStream,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    interrupted: bool,
}

impl InterruptedStream {
    fn poll_interrupted(&mut self, cx: &mut Context<'_>) -> bool {
        if self.interrupted {
            return true;
        }
        if self.cancelled.as_mut().poll(cx).is_ready() {
            self.interrupted = true;
            return true;
        }
        false
    }
}

impl tokio::io::AsyncRead for InterruptedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poll_interrupted(cx) {
            return Poll::Ready(Err(interrupted_error()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl tokio::io::AsyncWrite for InterruptedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.poll_interrupted(cx) {
            return Poll::Ready(Err(interrupted_error()));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poll_interrupted(cx) {
            return Poll::Ready(Err(interrupted_error()));
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Closing is always allowed, interrupted or not.
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

struct InterruptedPacketConn {
    inner: BoxPacketConn,
    token: CancellationToken,
}

#[async_trait]
impl PacketConn for InterruptedPacketConn {
    async fn send_to(&mut self, buf: &[u8], destination: &Endpoint) -> io::Result<usize> {
        if self.token.is_cancelled() {
            return Err(interrupted_error());
        }
        tokio::select! {
            _ = self.token.cancelled() => Err(interrupted_error()),
            result = self.inner.send_to(buf, destination) => result,
        }
    }

    async fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<(usize, Endpoint)> {
        if self.token.is_cancelled() {
            return Err(interrupted_error());
        }
        tokio::select! {
            _ = self.token.cancelled() => Err(interrupted_error()),
            result = self.inner.recv_from(buf) => result,
        }
    }
}
