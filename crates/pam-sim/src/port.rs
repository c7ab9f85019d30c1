//! Async byte stream onto a virtual controller
//!
//! A `VirtualPort` behaves like an opened serial port: bytes written are
//! buffered until a CRLF completes a console line, the line is executed
//! against the shared [`VirtualPam`](crate::VirtualPam), and the reply becomes
//! readable. Injected faults surface as `BrokenPipe` errors.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::{MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

use crate::controller::{SharedPam, VirtualPam};

/// An open connection to a virtual controller
pub struct VirtualPort {
    pam: SharedPam,
    line: Vec<u8>,
    output: VecDeque<u8>,
    read_waker: Option<Waker>,
}

impl std::fmt::Debug for VirtualPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualPort")
            .field("pending_line", &self.line.len())
            .field("pending_output", &self.output.len())
            .finish()
    }
}

fn lock(pam: &SharedPam) -> MutexGuard<'_, VirtualPam> {
    pam.lock().unwrap_or_else(PoisonError::into_inner)
}

fn injected_fault() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "injected virtual port fault")
}

impl VirtualPort {
    /// Open a port onto a shared controller
    ///
    /// Fails with `NotFound` while the controller has failed opens queued.
    pub fn open(pam: &SharedPam) -> io::Result<Self> {
        let opened = lock(pam).try_open();
        if !opened {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "virtual controller not available",
            ));
        }
        Ok(Self {
            pam: pam.clone(),
            line: Vec::new(),
            output: VecDeque::new(),
            read_waker: None,
        })
    }

    /// Discard any unread reply bytes
    pub fn clear_input(&mut self) -> io::Result<()> {
        if lock(&self.pam).take_io_fault() {
            return Err(injected_fault());
        }
        self.output.clear();
        Ok(())
    }

    /// Number of reply bytes waiting to be read
    pub fn bytes_to_read(&self) -> io::Result<u32> {
        Ok(self.output.len() as u32)
    }

    fn accept(&mut self, data: &[u8]) {
        let mut pam = lock(&self.pam);
        pam.record_bytes(data.len());

        for &byte in data {
            self.line.push(byte);
            if self.line.ends_with(b"\r\n") {
                let text = String::from_utf8_lossy(&self.line[..self.line.len() - 2]).into_owned();
                self.line.clear();
                let reply = pam.handle_line(&text);
                self.output.extend(reply.into_bytes());
            }
        }
        drop(pam);

        if !self.output.is_empty() {
            if let Some(waker) = self.read_waker.take() {
                waker.wake();
            }
        }
    }
}

impl AsyncRead for VirtualPort {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if lock(&self.pam).take_io_fault() {
            return Poll::Ready(Err(injected_fault()));
        }
        if self.output.is_empty() {
            self.read_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        let n = buf.remaining().min(self.output.len());
        let chunk: Vec<u8> = self.output.drain(..n).collect();
        buf.put_slice(&chunk);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for VirtualPort {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        if lock(&self.pam).take_io_fault() {
            debug!("Virtual port write fault injected");
            return Poll::Ready(Err(injected_fault()));
        }
        self.accept(data);
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
