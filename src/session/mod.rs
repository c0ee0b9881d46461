// (c) 2026 The muxrpc authors

//! The multiplexer
//!
//! A [`Session`] owns one connection. It runs the receive loop ([`Session::serve`]),
//! routes every inbound frame to the stream it belongs to, and starts a handler task
//! for every call the peer opens. Calls are made through its [`Endpoint`].
//!
//! The stream table is guarded by a plain mutex which is never held across an await.

mod endpoint;

pub use endpoint::{Call, Endpoint};

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use anyhow::bail;
use futures_util::FutureExt as _;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument as _, debug, error, trace, warn};

use crate::Handler;
use crate::error::{Error, Result};
use crate::packer::Packer;
use crate::protocol::{Body, CallError, CallHeader, Encoding, Packet, Role};
use crate::stream::{Disposition, Request, StreamCore};

/// Default depth of each stream's inbound queue
pub const DEFAULT_QUEUE_DEPTH: usize = 150;
/// Default limit on the size of a frame body
pub const DEFAULT_MAX_BODY_SIZE: u32 = 1_048_576;

/// Per-session tunables
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    /// How many inbound bodies a stream buffers before the receive loop waits for its reader
    pub queue_depth: usize,
    /// Largest frame body we will send or accept
    pub max_body_size: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_depth: DEFAULT_QUEUE_DEPTH,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }
}

/////////////////////////////////////////////////////////////////////////////////////////////
// STREAM TABLE

/// The remote call ids that have finished.
///
/// A peer numbers its calls upwards from 1, so nearly all of them can be summarised by a
/// floor; only ids finished out of order are held individually.
#[derive(Debug, Default)]
struct Finished {
    /// Every id from 1 to here is finished
    floor: u32,
    above: BTreeSet<u32>,
}

impl Finished {
    fn contains(&self, n: u32) -> bool {
        n <= self.floor || self.above.contains(&n)
    }

    /// Returns whether `n` was newly added
    fn insert(&mut self, n: u32) -> bool {
        if self.contains(n) {
            return false;
        }
        let _ = self.above.insert(n);
        while self.above.remove(&(self.floor + 1)) {
            self.floor += 1;
        }
        true
    }
}

#[derive(Debug)]
struct Table {
    streams: HashMap<i32, Arc<StreamCore>>,
    /// Next id for a call we open
    next_id: i32,
    /// Calls the peer opened that have finished or were rejected; late frames for these
    /// are dropped
    finished_remote: Finished,
    terminated: bool,
}

impl Default for Table {
    fn default() -> Self {
        Self {
            streams: HashMap::new(),
            next_id: 1,
            finished_remote: Finished::default(),
            terminated: false,
        }
    }
}

impl Table {
    /// Allocates the next local id, skipping any still in use after wrap-around
    fn allocate_id(&mut self) -> i32 {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.checked_add(1).unwrap_or(1);
            if !self.streams.contains_key(&id) {
                return id;
            }
        }
    }

    /// Is `id` a call that is not open, but was in the past?
    ///
    /// For our own calls this is approximate after the ids wrap, which only affects logging.
    fn is_finished(&self, id: i32) -> bool {
        if id < 0 {
            self.finished_remote.contains(id.unsigned_abs())
        } else {
            id > 0 && id < self.next_id
        }
    }

    /// Records that a call is finished. Returns whether it already was.
    fn finish(&mut self, id: i32) -> bool {
        if id < 0 {
            !self.finished_remote.insert(id.unsigned_abs())
        } else {
            self.is_finished(id)
        }
    }
}

/////////////////////////////////////////////////////////////////////////////////////////////
// SESSION STATE

/// State shared between the session, its endpoints and its streams
pub(crate) struct SessionInner {
    packer: Packer,
    handler: Arc<dyn Handler>,
    table: Mutex<Table>,
    /// Cancelled when the session terminates
    terminated: CancellationToken,
    remote: OnceLock<SocketAddr>,
    config: SessionConfig,
}

impl SessionInner {
    fn lock_table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn packer(&self) -> &Packer {
        &self.packer
    }

    pub(crate) fn remote(&self) -> Option<SocketAddr> {
        self.remote.get().copied()
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.terminated.is_cancelled()
    }

    /// Removes a finished stream from the table and remembers its id
    pub(crate) fn forget(&self, core: &StreamCore) {
        let id = core.id();
        let mut table = self.lock_table();
        if table
            .streams
            .get(&id)
            .is_some_and(|c| std::ptr::eq(Arc::as_ptr(c), core))
        {
            let _ = table.streams.remove(&id);
        }
        let _ = table.finish(id);
    }

    /// Allocates an id and registers a new outbound stream
    pub(crate) fn open(self: &Arc<Self>, call: &Call) -> Result<Arc<StreamCore>> {
        let mut table = self.lock_table();
        if table.terminated {
            return Err(Error::SessionTerminated);
        }
        let id = table.allocate_id();
        let core = Arc::new(StreamCore::new(
            id,
            call.method.clone(),
            call.call_type,
            Role::Caller,
            call.args.clone(),
            self.config.queue_depth,
            Arc::downgrade(self),
        ));
        let _ = table.streams.insert(id, core.clone());
        Ok(core)
    }

    /// Ends the session: every open stream is closed as terminated, then the connection
    /// is closed. Idempotent.
    pub(crate) async fn terminate(&self) -> Result<()> {
        let streams = {
            let mut table = self.lock_table();
            if table.terminated {
                None
            } else {
                table.terminated = true;
                Some(table.streams.drain().map(|(_, c)| c).collect::<Vec<_>>())
            }
        };
        self.terminated.cancel();
        if let Some(streams) = streams {
            debug!("terminating session with {} open streams", streams.len());
            for s in streams {
                s.terminate();
            }
        }
        self.packer.close().await
    }

    /////////////////////////////////////////////////////////////////////////////////////////
    // RECEIVE PATH

    fn route(self: &Arc<Self>, packet: Packet) {
        let id = packet.id;
        if packet.end_err {
            let (core, known) = {
                let mut table = self.lock_table();
                let core = table.streams.remove(&id);
                let known = table.finish(id);
                (core, known)
            };
            match core {
                Some(core) => core.remote_end(Disposition::from_end_body(&packet.body)),
                None if known => trace!(id, "end for finished stream"),
                None => warn!(id, "end for unknown stream discarded"),
            }
            return;
        }

        let (core, known) = {
            let table = self.lock_table();
            (table.streams.get(&id).cloned(), table.is_finished(id))
        };
        if let Some(core) = core {
            if !core.accepts_data() {
                warn!(id, "data on a stream that does not accept any; discarded");
                return;
            }
            if core.deliver(packet.body).is_err() {
                debug!(id, "stream closed; data discarded");
                return;
            }
            if !core.call_type().is_stream() {
                // the single response completes an async call
                self.forget(&core);
                core.remote_end(Disposition::Ok);
            }
            return;
        }
        if known {
            debug!(id, "data for finished stream discarded");
            return;
        }
        if id > 0 {
            warn!(id, "data for unknown stream discarded");
            return;
        }
        self.accept(packet);
    }

    /// The first frame of a call the peer opened
    fn accept(self: &Arc<Self>, packet: Packet) {
        let id = packet.id;
        let header = match parse_header(&packet) {
            Ok(h) => h,
            Err(e) => {
                warn!(id, "rejecting malformed call: {e:#}");
                self.reject(id, packet.stream, CallError::new(format!("malformed call: {e}")));
                return;
            }
        };
        if !self.handler.handled(&header.name) {
            debug!(id, method = %header.name, "no such method");
            self.reject(
                id,
                header.call_type.is_stream(),
                CallError::no_such_method(&header.name),
            );
            return;
        }
        let args = match header.args() {
            Ok(a) => a,
            Err(e) => {
                warn!(id, "rejecting call with bad arguments: {e}");
                self.reject(id, packet.stream, CallError::new(format!("malformed call: {e}")));
                return;
            }
        };
        let core = Arc::new(StreamCore::new(
            id,
            header.name,
            header.call_type,
            Role::Callee,
            args,
            self.config.queue_depth,
            Arc::downgrade(self),
        ));
        {
            let mut table = self.lock_table();
            if table.terminated {
                return;
            }
            let _ = table.streams.insert(id, core.clone());
        }
        self.spawn_handler(Request::from_core(core));
    }

    /// Refuses a call with an error, without creating a stream for it
    fn reject(self: &Arc<Self>, id: i32, stream: bool, error: CallError) {
        let _ = self.lock_table().finish(id);
        let body = match Body::json(&error) {
            Ok(b) => b,
            Err(e) => {
                warn!(id, "could not encode rejection: {e}");
                return;
            }
        };
        let packet = Packet {
            id,
            stream,
            end_err: true,
            body,
        };
        let inner = self.clone();
        let _ = tokio::spawn(
            async move {
                if let Err(e) = inner.packer.pour(&CancellationToken::new(), &packet).await {
                    debug!(id, "could not send rejection: {e}");
                }
            }
            .in_current_span(),
        );
    }

    fn spawn_handler(&self, req: Request) {
        let handler = self.handler.clone();
        let cancel = self.terminated.child_token();
        let span = tracing::debug_span!("call", method = %req.method(), id = req.id());
        let _ = tokio::spawn(supervise(handler, cancel, req).instrument(span));
    }
}

fn parse_header(packet: &Packet) -> anyhow::Result<CallHeader> {
    if packet.body.encoding() != Encoding::Json {
        bail!("call header must be JSON, not {}", packet.body.encoding());
    }
    let header: CallHeader = packet.body.decode()?;
    if header.name.is_empty() {
        bail!("empty method name");
    }
    if header.call_type.is_stream() != packet.stream {
        bail!(
            "stream flag does not match call type {}",
            header.call_type
        );
    }
    Ok(header)
}

/// Runs one inbound call to completion and funnels its outcome into the stream's close
async fn supervise(handler: Arc<dyn Handler>, cancel: CancellationToken, req: Request) {
    debug!("{} call started", req.call_type());
    let outcome = AssertUnwindSafe(handler.handle_call(cancel, req.clone()))
        .catch_unwind()
        .await;
    let closed = match outcome {
        Ok(Ok(())) if !req.call_type().is_stream() && !req.responded() => {
            req.close_with_error(CallError::new("handler returned without a response"))
                .await
        }
        Ok(Ok(())) => req.close().await,
        Ok(Err(e)) => {
            debug!("handler failed: {e:#}");
            req.close_with_error(CallError::from_anyhow(&e)).await
        }
        Err(_) => {
            error!("handler panicked");
            req.close_with_error(CallError::new("handler panicked"))
                .await
        }
    };
    match closed {
        Ok(()) => debug!("call finished"),
        Err(e) if e.is_session_terminated() => debug!("call finished with the session"),
        Err(e) => debug!("closing after handler: {e}"),
    }
}

/////////////////////////////////////////////////////////////////////////////////////////////
// SESSION

/// One muxrpc session over one connection
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("remote", &self.inner.remote())
            .field("config", &self.inner.config)
            .field("terminated", &self.inner.is_terminated())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Constructor. Nothing happens on the connection until [`serve`](Self::serve) is called,
    /// though calls may be made through the [`endpoint`](Self::endpoint) straight away.
    pub fn new<C>(conn: C, handler: Arc<dyn Handler>, config: SessionConfig) -> Self
    where
        C: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self {
            inner: Arc::new(SessionInner {
                packer: Packer::new(conn, config.max_body_size),
                handler,
                table: Mutex::new(Table::default()),
                terminated: CancellationToken::new(),
                remote: OnceLock::new(),
                config,
            }),
        }
    }

    /// Records the peer's network address, as reported by [`Endpoint::remote`]
    #[must_use]
    pub fn with_remote(self, remote: SocketAddr) -> Self {
        let _ = self.inner.remote.set(remote);
        self
    }

    /// A handle for making calls to the peer
    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::from_inner(self.inner.clone())
    }

    /// Ends the session. See [`Endpoint::terminate`].
    pub async fn terminate(&self) -> Result<()> {
        self.inner.terminate().await
    }

    /// Runs the receive loop until the peer hangs up, the session is terminated, or
    /// `cancel` fires. The session is always terminated on return.
    ///
    /// The handler's [`handle_connect`](Handler::handle_connect) is started first.
    ///
    /// A framing error on the connection is returned; all other ends count as success.
    pub async fn serve(&self, cancel: &CancellationToken) -> Result<()> {
        let span = match self.inner.remote() {
            Some(remote) => tracing::debug_span!("session", %remote),
            None => tracing::debug_span!("session"),
        };
        self.serve_inner(cancel).instrument(span).await
    }

    async fn serve_inner(&self, cancel: &CancellationToken) -> Result<()> {
        let inner = &self.inner;
        {
            let handler = inner.handler.clone();
            let token = inner.terminated.child_token();
            let endpoint = self.endpoint();
            let _ = tokio::spawn(
                async move { handler.handle_connect(token, endpoint).await }.in_current_span(),
            );
        }

        let result = loop {
            match inner.packer.next(cancel).await {
                Ok(Some(packet)) => inner.route(packet),
                Ok(None) => {
                    debug!("connection ended");
                    break Ok(());
                }
                Err(Error::Cancelled) => {
                    debug!("serve cancelled");
                    break Ok(());
                }
                Err(Error::SinkClosed) => break Ok(()),
                Err(e) => {
                    error!("receive failed: {e}");
                    break Err(e);
                }
            }
        };
        if let Err(e) = inner.terminate().await {
            debug!("terminate: {e}");
        }
        result
    }
}

/////////////////////////////////////////////////////////////////////////////////////////////
