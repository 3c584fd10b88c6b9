//! Bidirectional relay between a client stream and a remote stream
//!
//! Unlike `tokio::io::copy_bidirectional`, the relay reports which side
//! ended the exchange so the disconnect can be attributed to the client
//! (the proxy side) or the remote (the adapter side).

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

/// Default per-direction buffer size
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// One end of a relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelaySide {
    /// The accepted client connection
    Client,
    /// The connection opened by the adapter
    Remote,
}

impl fmt::Display for RelaySide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => write!(f, "client"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

/// Outcome of a finished relay
#[derive(Debug)]
pub struct RelayOutcome {
    /// Bytes copied from the client to the remote
    pub client_to_remote: u64,
    /// Bytes copied from the remote to the client
    pub remote_to_client: u64,
    /// Side that closed first or failed
    pub closed_by: RelaySide,
    /// The error that ended the relay, if it did not end cleanly
    pub error: Option<io::Error>,
}

impl RelayOutcome {
    /// Total bytes transferred in both directions
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.client_to_remote + self.remote_to_client
    }
}

enum TransferError {
    Read(io::Error),
    Write(io::Error),
}

/// State for one direction of transfer
struct TransferState {
    buf: Box<[u8]>,
    read_done: bool,
    finished: bool,
    pos: usize,
    cap: usize,
    bytes_transferred: u64,
}

impl TransferState {
    fn new(buf_size: usize) -> Self {
        Self {
            buf: vec![0u8; buf_size].into_boxed_slice(),
            read_done: false,
            finished: false,
            pos: 0,
            cap: 0,
            bytes_transferred: 0,
        }
    }

    fn poll_transfer<R, W>(
        &mut self,
        cx: &mut Context<'_>,
        mut reader: Pin<&mut R>,
        mut writer: Pin<&mut W>,
    ) -> Poll<Result<(), TransferError>>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        loop {
            if self.pos < self.cap {
                let n = match writer.as_mut().poll_write(cx, &self.buf[self.pos..self.cap]) {
                    Poll::Ready(Ok(0)) => {
                        return Poll::Ready(Err(TransferError::Write(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "write zero bytes",
                        ))));
                    }
                    Poll::Ready(Ok(n)) => n,
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(TransferError::Write(e))),
                    Poll::Pending => return Poll::Pending,
                };
                self.pos += n;
                self.bytes_transferred += n as u64;

                if self.pos == self.cap {
                    self.pos = 0;
                    self.cap = 0;
                }
            } else if self.read_done {
                match writer.as_mut().poll_flush(cx) {
                    Poll::Ready(Ok(())) => {}
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(TransferError::Write(e))),
                    Poll::Pending => return Poll::Pending,
                }
                // Half-close: the peer may still have data for us
                match writer.as_mut().poll_shutdown(cx) {
                    Poll::Ready(Ok(())) => return Poll::Ready(Ok(())),
                    Poll::Ready(Err(e)) if e.kind() == io::ErrorKind::NotConnected => {
                        return Poll::Ready(Ok(()))
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(TransferError::Write(e))),
                    Poll::Pending => return Poll::Pending,
                }
            } else {
                let mut read_buf = ReadBuf::new(&mut self.buf);
                match reader.as_mut().poll_read(cx, &mut read_buf) {
                    Poll::Ready(Ok(())) => {
                        let n = read_buf.filled().len();
                        if n == 0 {
                            self.read_done = true;
                        } else {
                            self.cap = n;
                        }
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(TransferError::Read(e))),
                    Poll::Pending => return Poll::Pending,
                }
            }
        }
    }
}

/// Relay state machine
struct Relay<'a, C: ?Sized, R: ?Sized> {
    client: &'a mut C,
    remote: &'a mut R,
    client_to_remote: TransferState,
    remote_to_client: TransferState,
    closed_by: Option<RelaySide>,
    error: Option<io::Error>,
}

impl<C, R> Relay<'_, C, R>
where
    C: AsyncRead + AsyncWrite + Unpin + ?Sized,
    R: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    fn note_close(&mut self, side: RelaySide) {
        if self.closed_by.is_none() {
            self.closed_by = Some(side);
        }
    }

    fn fail(&mut self, side: RelaySide, error: io::Error) {
        debug!("relay error on {} side: {}", side, error);
        self.closed_by = Some(side);
        self.error = Some(error);
    }

    fn outcome(&mut self) -> RelayOutcome {
        RelayOutcome {
            client_to_remote: self.client_to_remote.bytes_transferred,
            remote_to_client: self.remote_to_client.bytes_transferred,
            closed_by: self.closed_by.unwrap_or(RelaySide::Client),
            error: self.error.take(),
        }
    }
}

impl<C, R> Future for Relay<'_, C, R>
where
    C: AsyncRead + AsyncWrite + Unpin + ?Sized,
    R: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    type Output = RelayOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;

        if !this.client_to_remote.finished {
            match this.client_to_remote.poll_transfer(
                cx,
                Pin::new(&mut *this.client),
                Pin::new(&mut *this.remote),
            ) {
                Poll::Ready(Ok(())) => {
                    this.client_to_remote.finished = true;
                    this.note_close(RelaySide::Client);
                }
                Poll::Ready(Err(TransferError::Read(e))) => {
                    this.fail(RelaySide::Client, e);
                    return Poll::Ready(this.outcome());
                }
                Poll::Ready(Err(TransferError::Write(e))) => {
                    this.fail(RelaySide::Remote, e);
                    return Poll::Ready(this.outcome());
                }
                Poll::Pending => {}
            }
        }

        if !this.remote_to_client.finished {
            match this.remote_to_client.poll_transfer(
                cx,
                Pin::new(&mut *this.remote),
                Pin::new(&mut *this.client),
            ) {
                Poll::Ready(Ok(())) => {
                    this.remote_to_client.finished = true;
                    this.note_close(RelaySide::Remote);
                }
                Poll::Ready(Err(TransferError::Read(e))) => {
                    this.fail(RelaySide::Remote, e);
                    return Poll::Ready(this.outcome());
                }
                Poll::Ready(Err(TransferError::Write(e))) => {
                    this.fail(RelaySide::Client, e);
                    return Poll::Ready(this.outcome());
                }
                Poll::Pending => {}
            }
        }

        if this.client_to_remote.finished && this.remote_to_client.finished {
            Poll::Ready(this.outcome())
        } else {
            Poll::Pending
        }
    }
}

/// Relay bytes between `client` and `remote` until both directions finish
/// or either side fails.
///
/// EOF on one side half-closes the other; the relay keeps draining the
/// opposite direction. The first side to close (or the side that failed)
/// is reported in [`RelayOutcome::closed_by`].
pub async fn relay<C, R>(client: &mut C, remote: &mut R) -> RelayOutcome
where
    C: AsyncRead + AsyncWrite + Unpin + ?Sized,
    R: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    relay_with_buffer(client, remote, DEFAULT_BUFFER_SIZE).await
}

/// [`relay`] with a custom per-direction buffer size
pub async fn relay_with_buffer<C, R>(client: &mut C, remote: &mut R, buf_size: usize) -> RelayOutcome
where
    C: AsyncRead + AsyncWrite + Unpin + ?Sized,
    R: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    Relay {
        client,
        remote,
        client_to_remote: TransferState::new(buf_size),
        remote_to_client: TransferState::new(buf_size),
        closed_by: None,
        error: None,
    }
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_relay_both_directions() {
        let (mut client, mut client_peer) = duplex(64);
        let (mut remote, mut remote_peer) = duplex(64);

        let task = tokio::spawn(async move { relay(&mut client_peer, &mut remote_peer).await });

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        remote.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        client.shutdown().await.unwrap();
        // Remote sees EOF, then closes its side
        let mut rest = Vec::new();
        remote.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        drop(remote);

        let outcome = task.await.unwrap();
        assert_eq!(outcome.client_to_remote, 4);
        assert_eq!(outcome.remote_to_client, 5);
        assert_eq!(outcome.total(), 9);
        assert_eq!(outcome.closed_by, RelaySide::Client);
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn test_remote_close_attributed_to_remote() {
        let (client, mut client_peer) = duplex(64);
        let (remote, mut remote_peer) = duplex(64);

        drop(remote);
        let task = tokio::spawn(async move { relay(&mut client_peer, &mut remote_peer).await });
        // Give the relay a chance to observe the remote EOF before the client goes away
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        drop(client);

        let outcome = task.await.unwrap();
        assert_eq!(outcome.closed_by, RelaySide::Remote);
    }

    #[test]
    fn test_side_display() {
        assert_eq!(RelaySide::Client.to_string(), "client");
        assert_eq!(RelaySide::Remote.to_string(), "remote");
    }
}
