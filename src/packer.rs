//! Whole-frame access to one connection
// (c) 2026 The muxrpc authors

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt as _};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::protocol::{CodecError, Packet, read_packet, write_goodbye, write_packet};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// How long [`Packer::close`] will wait for the goodbye frame to go out
const GOODBYE_TIMEOUT: Duration = Duration::from_secs(1);

/// Serialises concurrent access to one connection into whole-frame reads and writes.
///
/// One task is expected to call [`next`](Self::next) in a loop; any number of tasks may
/// call [`pour`](Self::pour) concurrently.
///
/// Stream ids are negated on the way in, so that the reader sees every id with the sign
/// of its own numbering. They are written exactly as given.
#[derive(derive_more::Debug)]
pub struct Packer {
    #[debug(ignore)]
    reader: Mutex<Option<BoxedReader>>,
    #[debug(ignore)]
    writer: Mutex<Option<BoxedWriter>>,
    closing: CancellationToken,
    closed: AtomicBool,
    max_body_size: u32,
}

impl Packer {
    /// Takes ownership of a bidirectional connection
    pub fn new<C>(conn: C, max_body_size: u32) -> Self
    where
        C: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (r, w) = tokio::io::split(conn);
        Self::from_parts(r, w, max_body_size)
    }

    /// Takes ownership of a connection that is already split into halves
    pub fn from_parts<R, W>(reader: R, writer: W, max_body_size: u32) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Mutex::new(Some(Box::new(reader))),
            writer: Mutex::new(Some(Box::new(writer))),
            closing: CancellationToken::new(),
            closed: AtomicBool::new(false),
            max_body_size,
        }
    }

    /// Has [`close`](Self::close) been called?
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Reads the next frame.
    ///
    /// Returns `Ok(None)` when the peer ends the session cleanly.
    ///
    /// If the read is interrupted part way through a frame, the read half is abandoned
    /// (there is no way to find the next frame boundary) and later calls fail with
    /// [`Error::SinkClosed`].
    pub async fn next(&self, cancel: &CancellationToken) -> Result<Option<Packet>> {
        let mut guard = tokio::select! {
            biased;
            () = self.closing.cancelled() => return Err(Error::SinkClosed),
            () = cancel.cancelled() => return Err(Error::Cancelled),
            g = self.reader.lock() => g,
        };
        let Some(reader) = guard.as_mut() else {
            return Err(Error::SinkClosed);
        };
        let result = tokio::select! {
            biased;
            () = self.closing.cancelled() => Err(Error::SinkClosed),
            () = cancel.cancelled() => Err(Error::Cancelled),
            r = read_packet(reader, self.max_body_size) => r.map_err(Error::from),
        };
        let packet = match result {
            Ok(p) => p,
            Err(e) => {
                if matches!(e, Error::Cancelled | Error::SinkClosed) {
                    debug!("read interrupted; abandoning the read half");
                }
                let _ = guard.take();
                return Err(e);
            }
        };
        let Some(mut packet) = packet else {
            debug!("peer ended the connection");
            return Ok(None);
        };
        packet.id = packet.id.checked_neg().ok_or_else(|| {
            Error::Codec(CodecError::Malformed(format!(
                "stream id {} cannot be renormalised",
                packet.id
            )))
        })?;
        trace!("recv {packet}");
        Ok(Some(packet))
    }

    /// Writes one frame.
    ///
    /// Cancellation is honoured only while waiting for exclusive access to the connection;
    /// once a frame has started it is written whole, unless the packer is closed meanwhile.
    pub async fn pour(&self, cancel: &CancellationToken, packet: &Packet) -> Result<()> {
        let mut guard = tokio::select! {
            biased;
            () = self.closing.cancelled() => return Err(Error::SinkClosed),
            () = cancel.cancelled() => return Err(Error::Cancelled),
            g = self.writer.lock() => g,
        };
        let Some(writer) = guard.as_mut() else {
            return Err(Error::SinkClosed);
        };
        trace!("send {packet}");
        let result = tokio::select! {
            biased;
            () = self.closing.cancelled() => Err(Error::SinkClosed),
            r = write_packet(writer, packet, self.max_body_size) => r.map_err(Error::from),
        };
        if let Err(e) = &result {
            // An oversize frame is rejected before anything is written. Otherwise part of
            // a frame may have gone out, and the write half is useless now.
            if !matches!(e, Error::Codec(CodecError::TooLong { .. })) {
                let _ = guard.take();
            }
        }
        result
    }

    /// Closes the connection. Idempotent.
    ///
    /// Sends the goodbye frame (best effort) and shuts down the write half. Any reader or
    /// writer blocked in [`next`](Self::next) or [`pour`](Self::pour) is released with
    /// [`Error::SinkClosed`].
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.closing.cancel();
        if let Some(mut writer) = self.writer.lock().await.take() {
            match tokio::time::timeout(GOODBYE_TIMEOUT, write_goodbye(&mut writer)).await {
                Ok(Ok(())) => (),
                Ok(Err(e)) => debug!("failed to send goodbye: {e}"),
                Err(_) => debug!("timed out sending goodbye"),
            }
            if let Err(e) = writer.shutdown().await {
                debug!("shutdown: {e}");
            }
        }
        let _ = self.reader.lock().await.take();
        Ok(())
    }
}

/////////////////////////////////////////////////////////////////////////////////////////////
