// (c) 2026 The muxrpc authors

//! Per-call stream handles
//!
//! Every logical call is represented on each side by one [`Request`]. The call type
//! fixes what each side may do with it: see [`CallType::capabilities`].
//!
//! A stream moves from *open* to *active* on first use, and then to *closed*. Closing
//! is triggered by whichever comes first of: a local [`close`](Request::close), the
//! peer's `EndErr` frame, or session termination. Only the first of these has any
//! effect.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::{Serialize, de::DeserializeOwned};
use serde_json::value::RawValue;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Direction, Error, Interruption, Result};
use crate::protocol::{Body, CallError, CallType, Capability, Method, Packet, Role};
use crate::session::{Endpoint, SessionInner};

/// How a stream ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Disposition {
    /// Clean end
    Ok,
    /// Ended with an error, either ours or the peer's
    Err(CallError),
    /// The session went away
    Terminated,
}

impl Disposition {
    /// Interprets the body of an `EndErr` frame
    pub(crate) fn from_end_body(body: &Body) -> Self {
        if body.is_true() || matches!(body.decode::<bool>(), Ok(true)) {
            return Disposition::Ok;
        }
        match body.decode::<CallError>() {
            Ok(ce) => Disposition::Err(ce),
            Err(_) => Disposition::Err(CallError::new(match body {
                Body::String(s) => s.clone(),
                other => other.to_string(),
            })),
        }
    }

    fn same_class(&self, other: &Disposition) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    fn into_read_result(self) -> Result<Option<Body>> {
        match self {
            Disposition::Ok => Ok(None),
            Disposition::Err(ce) => Err(Error::Call(ce)),
            Disposition::Terminated => Err(Error::SessionTerminated),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
enum Phase {
    #[default]
    Open,
    Active,
    Closed(Disposition),
}

#[derive(Debug, Default)]
struct State {
    phase: Phase,
    read_once: bool,
    wrote_once: bool,
    /// Our `EndErr` has been sent, or is not needed
    end_sent: bool,
}

/// The shared state of one stream
#[derive(derive_more::Debug)]
pub(crate) struct StreamCore {
    id: i32,
    method: Method,
    call_type: CallType,
    role: Role,
    args: Box<RawValue>,
    inbound: Capability,
    outbound: Capability,
    #[debug(ignore)]
    state: Mutex<State>,
    #[debug(ignore)]
    tx: mpsc::Sender<Body>,
    #[debug(ignore)]
    rx: tokio::sync::Mutex<mpsc::Receiver<Body>>,
    queue_depth: usize,
    /// Cancelled when the stream reaches its terminal state
    closed: CancellationToken,
    /// Held across the closed check and the write, so that `EndErr` always goes last
    #[debug(ignore)]
    write_lock: tokio::sync::Mutex<()>,
    #[debug(ignore)]
    session: Weak<SessionInner>,
}

impl StreamCore {
    pub(crate) fn new(
        id: i32,
        method: Method,
        call_type: CallType,
        role: Role,
        args: Box<RawValue>,
        queue_depth: usize,
        session: Weak<SessionInner>,
    ) -> Self {
        let (inbound, outbound) = call_type.capabilities(role);
        let (tx, rx) = mpsc::channel(queue_depth);
        Self {
            id,
            method,
            call_type,
            role,
            args,
            inbound,
            outbound,
            state: Mutex::new(State::default()),
            tx,
            rx: tokio::sync::Mutex::new(rx),
            queue_depth,
            closed: CancellationToken::new(),
            write_lock: tokio::sync::Mutex::new(()),
            session,
        }
    }

    pub(crate) fn id(&self) -> i32 {
        self.id
    }

    pub(crate) fn call_type(&self) -> CallType {
        self.call_type
    }

    pub(crate) fn accepts_data(&self) -> bool {
        self.inbound.allowed()
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session(&self) -> Result<Arc<SessionInner>> {
        self.session.upgrade().ok_or(Error::SessionTerminated)
    }

    fn capability_error(&self, direction: Direction) -> Error {
        Error::StreamCapability {
            id: self.id,
            call_type: self.call_type,
            direction,
        }
    }

    fn check_capability(&self, st: &State, direction: Direction) -> Result<()> {
        let (cap, used) = match direction {
            Direction::Read => (self.inbound, st.read_once),
            Direction::Write => (self.outbound, st.wrote_once),
        };
        match cap {
            Capability::Nil => Err(self.capability_error(direction)),
            Capability::Once if used => Err(self.capability_error(direction)),
            _ => Ok(()),
        }
    }

    fn disposition(&self) -> Disposition {
        match &self.lock_state().phase {
            Phase::Closed(d) => d.clone(),
            // the closed token only fires after the phase is set
            Phase::Open | Phase::Active => Disposition::Terminated,
        }
    }

    fn closed_reason(&self) -> Interruption {
        match self.disposition() {
            Disposition::Terminated => Interruption::SessionTerminated,
            _ => Interruption::StreamClosed,
        }
    }

    fn write_closed_error(&self) -> Error {
        match self.disposition() {
            Disposition::Terminated => Error::SessionTerminated,
            _ => Error::AlreadyClosed(self.id),
        }
    }

    /// Does closing now require us to put an `EndErr` frame on the wire?
    fn needs_end_frame(&self, st: &State) -> bool {
        if st.end_sent {
            return false;
        }
        if self.call_type.is_stream() {
            return true;
        }
        // An async caller never sends an end; an async callee only does so in place of
        // the response.
        self.role == Role::Callee && !st.wrote_once
    }

    fn forget(&self) {
        if let Some(session) = self.session.upgrade() {
            session.forget(self);
        }
    }

    /////////////////////////////////////////////////////////////////////////////////////////
    // Reading

    async fn next(&self, cancel: &CancellationToken) -> Result<Option<Body>> {
        self.check_capability(&self.lock_state(), Direction::Read)?;
        let mut rx = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::Cancelled),
            g = self.rx.lock() => g,
        };
        // a once-only read may have been used up while we waited
        self.check_capability(&self.lock_state(), Direction::Read)?;

        let outcome = tokio::select! {
            biased;
            item = rx.recv() => item.ok_or_else(|| self.closed_reason()),
            () = self.closed.cancelled() => Err(self.closed_reason()),
            () = cancel.cancelled() => Err(Interruption::Caller),
        };
        match outcome {
            Ok(body) => {
                let mut st = self.lock_state();
                if self.inbound == Capability::Once {
                    st.read_once = true;
                }
                if st.phase == Phase::Open {
                    st.phase = Phase::Active;
                }
                Ok(Some(body))
            }
            Err(Interruption::StreamClosed) => self.disposition().into_read_result(),
            Err(other) => Err(other.into()),
        }
    }

    /// Hands an inbound body to the reader. Called only by the receive loop, so it never
    /// waits: a stream whose reader has fallen `queue_depth` bodies behind is closed with
    /// an overflow error, and the rest of the connection carries on.
    pub(crate) fn deliver(self: &Arc<Self>, body: Body) -> Result<(), Interruption> {
        if self.closed.is_cancelled() {
            return Err(Interruption::StreamClosed);
        }
        match self.tx.try_send(body) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Interruption::StreamClosed),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    id = self.id,
                    method = %self.method,
                    "reader fell {} messages behind; closing stream",
                    self.queue_depth
                );
                self.overflow();
                Err(Interruption::StreamClosed)
            }
        }
    }

    /// Closes the stream because its queue is full. Bodies already queued are still
    /// readable; after them the reader sees the overflow error, which is also sent to
    /// the peer.
    fn overflow(self: &Arc<Self>) {
        let error = CallError::new(format!(
            "stream overflow: more than {} unread messages",
            self.queue_depth
        ));
        let send = {
            let mut st = self.lock_state();
            if matches!(st.phase, Phase::Closed(_)) {
                return;
            }
            st.phase = Phase::Closed(Disposition::Err(error.clone()));
            let send = self.needs_end_frame(&st);
            st.end_sent = true;
            send
        };
        self.closed.cancel();
        if send {
            let core = self.clone();
            let _ = tokio::spawn(async move {
                if let Err(e) = core.send_end(&Disposition::Err(error)).await {
                    debug!(id = core.id, "could not report overflow: {e}");
                }
            });
        }
    }

    /////////////////////////////////////////////////////////////////////////////////////////
    // Writing

    async fn send(&self, cancel: &CancellationToken, body: Body) -> Result<()> {
        self.check_capability(&self.lock_state(), Direction::Write)?;
        let session = self.session()?;
        let _guard = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::Cancelled),
            () = self.closed.cancelled() => return Err(self.write_closed_error()),
            g = self.write_lock.lock() => g,
        };
        {
            let st = self.lock_state();
            if matches!(st.phase, Phase::Closed(_)) {
                drop(st);
                return Err(self.write_closed_error());
            }
            self.check_capability(&st, Direction::Write)?;
        }

        let packet = Packet::data(self.id, self.call_type.is_stream(), body);
        session
            .packer()
            .pour(cancel, &packet)
            .await
            .map_err(Error::into_session_error)?;

        let finished = {
            let mut st = self.lock_state();
            if self.outbound == Capability::Once {
                st.wrote_once = true;
            }
            if st.phase == Phase::Open {
                st.phase = Phase::Active;
            }
            if !self.call_type.is_stream() && self.role == Role::Callee {
                // the response is the whole of an async call
                st.phase = Phase::Closed(Disposition::Ok);
                st.end_sent = true;
                true
            } else {
                false
            }
        };
        if finished {
            self.closed.cancel();
            session.forget(self);
        }
        Ok(())
    }

    async fn send_end(&self, disposition: &Disposition) -> Result<()> {
        let body = match disposition {
            Disposition::Ok => Body::end_ok(),
            Disposition::Err(ce) => Body::json(ce)?,
            Disposition::Terminated => return Ok(()),
        };
        let session = self.session()?;
        let _guard = self.write_lock.lock().await;
        let packet = Packet {
            id: self.id,
            stream: self.call_type.is_stream(),
            end_err: true,
            body,
        };
        session
            .packer()
            .pour(&CancellationToken::new(), &packet)
            .await
            .map_err(Error::into_session_error)
    }

    /////////////////////////////////////////////////////////////////////////////////////////
    // Closing

    async fn close_with(&self, disposition: Disposition) -> Result<()> {
        let send = {
            let mut st = self.lock_state();
            if let Phase::Closed(prev) = &st.phase {
                if *prev == Disposition::Terminated {
                    return Err(Error::SessionTerminated);
                }
                if prev.same_class(&disposition) {
                    return Ok(());
                }
                return Err(Error::AlreadyClosed(self.id));
            }
            st.phase = Phase::Closed(disposition.clone());
            let send = self.needs_end_frame(&st);
            st.end_sent = true;
            send
        };
        self.closed.cancel();
        debug!(id = self.id, "closed locally: {disposition:?}");
        if !self.call_type.is_stream() {
            self.forget();
        }
        if send {
            self.send_end(&disposition).await?;
        }
        Ok(())
    }

    /// The peer ended the call. Called only by the receive loop.
    ///
    /// If our own end is still outstanding on a streaming call, it is sent from a
    /// separate task so that the receive loop never waits on a write.
    pub(crate) fn remote_end(self: &Arc<Self>, disposition: Disposition) {
        let reply = {
            let mut st = self.lock_state();
            if !matches!(st.phase, Phase::Closed(_)) {
                st.phase = Phase::Closed(disposition.clone());
            }
            let reply = self.call_type.is_stream() && !st.end_sent;
            st.end_sent = true;
            reply
        };
        self.closed.cancel();
        debug!(id = self.id, "closed by peer: {disposition:?}");
        if reply {
            let core = self.clone();
            let _ = tokio::spawn(async move {
                if let Err(e) = core.send_end(&Disposition::Ok).await {
                    debug!(id = core.id, "could not acknowledge end of stream: {e}");
                }
            });
        }
    }

    /// The session ended. No frame is sent.
    pub(crate) fn terminate(&self) {
        {
            let mut st = self.lock_state();
            if !matches!(st.phase, Phase::Closed(_)) {
                st.phase = Phase::Closed(Disposition::Terminated);
            }
            st.end_sent = true;
        }
        self.closed.cancel();
    }
}

/////////////////////////////////////////////////////////////////////////////////////////////
// PUBLIC HANDLES

/// One side of a logical call.
///
/// This is a cheap handle; clones refer to the same stream.
#[derive(Clone, Debug)]
pub struct Request {
    core: Arc<StreamCore>,
}

impl Request {
    pub(crate) fn from_core(core: Arc<StreamCore>) -> Self {
        Self { core }
    }

    /// Stream id, with the sign of our own numbering (positive if we opened the call)
    #[must_use]
    pub fn id(&self) -> i32 {
        self.core.id
    }

    /// Method being called
    #[must_use]
    pub fn method(&self) -> &Method {
        &self.core.method
    }

    /// Call type
    #[must_use]
    pub fn call_type(&self) -> CallType {
        self.core.call_type
    }

    /// Which side of the call we are
    #[must_use]
    pub fn role(&self) -> Role {
        self.core.role
    }

    /// The raw call arguments, always a JSON array
    #[must_use]
    pub fn raw_args(&self) -> &RawValue {
        &self.core.args
    }

    /// Decodes the call arguments
    pub fn args<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(self.core.args.get())?)
    }

    /// Has the stream reached its terminal state?
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.core.closed.is_cancelled()
    }

    /// A token that is cancelled when the stream is closed
    #[must_use]
    pub fn closed_token(&self) -> CancellationToken {
        self.core.closed.clone()
    }

    /// The endpoint of the session this call belongs to, for making calls back to the peer
    pub fn endpoint(&self) -> Result<Endpoint> {
        Ok(Endpoint::from_inner(self.core.session()?))
    }

    /// Reads the next inbound body.
    ///
    /// Returns `Ok(None)` when the peer ended the stream cleanly, or `Err(Error::Call)` if it
    /// ended it with an error. Buffered bodies are always returned before the end is reported.
    pub async fn next(&self, cancel: &CancellationToken) -> Result<Option<Body>> {
        self.core.next(cancel).await
    }

    /// Reads and decodes the next inbound body
    pub async fn next_json<T: DeserializeOwned>(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<T>> {
        match self.next(cancel).await? {
            Some(body) => Ok(Some(body.decode()?)),
            None => Ok(None),
        }
    }

    /// Sends one body
    pub async fn send(&self, cancel: &CancellationToken, body: impl Into<Body>) -> Result<()> {
        self.core.send(cancel, body.into()).await
    }

    /// Sends one value encoded as JSON
    pub async fn send_json<T: Serialize + ?Sized>(
        &self,
        cancel: &CancellationToken,
        value: &T,
    ) -> Result<()> {
        self.core.send(cancel, Body::json(value)?).await
    }

    /// Answers an async call. This completes the call.
    pub async fn return_value(
        &self,
        cancel: &CancellationToken,
        body: impl Into<Body>,
    ) -> Result<()> {
        if self.core.call_type.is_stream() {
            return Err(self.core.capability_error(Direction::Write));
        }
        self.core.send(cancel, body.into()).await
    }

    /// Answers an async call with a value encoded as JSON
    pub async fn return_json<T: Serialize + ?Sized>(
        &self,
        cancel: &CancellationToken,
        value: &T,
    ) -> Result<()> {
        self.return_value(cancel, Body::json(value)?).await
    }

    /// Ends our side of the call successfully.
    ///
    /// Closing twice is harmless; closing after a different outcome was already recorded
    /// returns [`Error::AlreadyClosed`].
    pub async fn close(&self) -> Result<()> {
        self.core.close_with(Disposition::Ok).await
    }

    /// Ends our side of the call with an error, which is reported to the peer
    pub async fn close_with_error(&self, error: CallError) -> Result<()> {
        self.core.close_with(Disposition::Err(error)).await
    }

    /// Has the callee already produced its single async response?
    pub(crate) fn responded(&self) -> bool {
        self.core.lock_state().wrote_once
    }
}

/// The readable half of a call we opened
#[derive(Clone, Debug)]
pub struct Source {
    req: Request,
}

impl Source {
    pub(crate) fn new(req: Request) -> Self {
        Self { req }
    }

    /// The underlying request
    #[must_use]
    pub fn request(&self) -> &Request {
        &self.req
    }

    /// Reads the next body; `Ok(None)` at a clean end of stream
    pub async fn next(&self, cancel: &CancellationToken) -> Result<Option<Body>> {
        self.req.next(cancel).await
    }

    /// Reads and decodes the next body
    pub async fn next_json<T: DeserializeOwned>(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<T>> {
        self.req.next_json(cancel).await
    }

    /// Tells the peer we want no more
    pub async fn close(&self) -> Result<()> {
        self.req.close().await
    }

    /// Aborts the call with an error
    pub async fn close_with_error(&self, error: CallError) -> Result<()> {
        self.req.close_with_error(error).await
    }
}

/// The writable half of a call we opened
#[derive(Clone, Debug)]
pub struct Sink {
    req: Request,
}

impl Sink {
    pub(crate) fn new(req: Request) -> Self {
        Self { req }
    }

    /// The underlying request
    #[must_use]
    pub fn request(&self) -> &Request {
        &self.req
    }

    /// Sends one body
    pub async fn send(&self, cancel: &CancellationToken, body: impl Into<Body>) -> Result<()> {
        self.req.send(cancel, body).await
    }

    /// Sends one value encoded as JSON
    pub async fn send_json<T: Serialize + ?Sized>(
        &self,
        cancel: &CancellationToken,
        value: &T,
    ) -> Result<()> {
        self.req.send_json(cancel, value).await
    }

    /// Ends the stream successfully
    pub async fn close(&self) -> Result<()> {
        self.req.close().await
    }

    /// Ends the stream with an error
    pub async fn close_with_error(&self, error: CallError) -> Result<()> {
        self.req.close_with_error(error).await
    }
}
