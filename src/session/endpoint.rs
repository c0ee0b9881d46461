//! Making calls to the peer
// (c) 2026 The muxrpc authors

use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Serialize, de::DeserializeOwned};
use serde_json::value::RawValue;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::SessionInner;
use crate::error::{Error, Result};
use crate::handler::Manifest;
use crate::protocol::{Body, CallHeader, CallType, Method, Packet, normalize_args};
use crate::stream::{Request, Sink, Source};

/// Everything needed to open a call
#[derive(Clone, Debug)]
pub struct Call {
    /// Method to call
    pub method: Method,
    /// Call type
    pub call_type: CallType,
    /// Arguments, always a JSON array
    pub args: Box<RawValue>,
}

impl Call {
    /// Constructor. `args` is serialized to JSON and normalised into an array:
    /// `()` gives no arguments, a single non-array value gives one.
    pub fn new<A: Serialize + ?Sized>(
        method: impl Into<Method>,
        call_type: CallType,
        args: &A,
    ) -> Result<Self> {
        let raw = serde_json::value::to_raw_value(args)?;
        Ok(Self {
            method: method.into(),
            call_type,
            args: normalize_args(Some(&raw))?,
        })
    }

    /// Rebuilds the call a peer made of us, so that it can be relayed elsewhere
    #[must_use]
    pub fn from_request(req: &Request) -> Self {
        Self {
            method: req.method().clone(),
            call_type: req.call_type(),
            args: req.raw_args().to_owned(),
        }
    }
}

/// A handle for making calls over a session.
///
/// Endpoints are cheap to clone; all clones refer to the same session.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("remote", &self.inner.remote())
            .field("terminated", &self.inner.is_terminated())
            .finish()
    }
}

impl Endpoint {
    pub(crate) fn from_inner(inner: Arc<SessionInner>) -> Self {
        Self { inner }
    }

    /// Opens a call of any type.
    ///
    /// The returned [`Request`] is readable and writable as far as the call type allows.
    /// This is the primitive the typed helpers are built on; it is also what a relay
    /// uses to forward a [`Call`] without caring what type it is.
    pub async fn do_call(&self, cancel: &CancellationToken, call: Call) -> Result<Request> {
        let core = self.inner.open(&call)?;
        let id = core.id();
        let header = CallHeader {
            name: call.method,
            args: Some(call.args),
            call_type: call.call_type,
        };
        let packet = Packet::data(id, call.call_type.is_stream(), Body::json(&header)?);
        if let Err(e) = self.inner.packer().pour(cancel, &packet).await {
            self.inner.forget(&core);
            core.terminate();
            return Err(e.into_session_error());
        }
        debug!(id, method = %header.name, "{} call opened", call.call_type);
        Ok(Request::from_core(core))
    }

    /// Makes an async call and waits for its single response.
    ///
    /// If `cancel` fires first the call is abandoned; a late response is discarded.
    pub async fn async_call<A: Serialize + ?Sized>(
        &self,
        cancel: &CancellationToken,
        method: impl Into<Method>,
        args: &A,
    ) -> Result<Body> {
        let req = self
            .do_call(cancel, Call::new(method, CallType::Async, args)?)
            .await?;
        match req.next(cancel).await {
            Ok(Some(body)) => Ok(body),
            Ok(None) => Err(Error::NoResponse),
            Err(Error::Cancelled) => {
                let _ = req.close().await;
                Err(Error::Cancelled)
            }
            Err(e) => Err(e),
        }
    }

    /// Makes an async call and decodes its response
    pub async fn async_json<T: DeserializeOwned, A: Serialize + ?Sized>(
        &self,
        cancel: &CancellationToken,
        method: impl Into<Method>,
        args: &A,
    ) -> Result<T> {
        Ok(self.async_call(cancel, method, args).await?.decode()?)
    }

    /// Opens a call on which the peer streams responses to us
    pub async fn source<A: Serialize + ?Sized>(
        &self,
        cancel: &CancellationToken,
        method: impl Into<Method>,
        args: &A,
    ) -> Result<Source> {
        let req = self
            .do_call(cancel, Call::new(method, CallType::Source, args)?)
            .await?;
        Ok(Source::new(req))
    }

    /// Opens a call on which we stream requests to the peer
    pub async fn sink<A: Serialize + ?Sized>(
        &self,
        cancel: &CancellationToken,
        method: impl Into<Method>,
        args: &A,
    ) -> Result<Sink> {
        let req = self
            .do_call(cancel, Call::new(method, CallType::Sink, args)?)
            .await?;
        Ok(Sink::new(req))
    }

    /// Opens a call on which both sides stream
    pub async fn duplex<A: Serialize + ?Sized>(
        &self,
        cancel: &CancellationToken,
        method: impl Into<Method>,
        args: &A,
    ) -> Result<(Source, Sink)> {
        let req = self
            .do_call(cancel, Call::new(method, CallType::Duplex, args)?)
            .await?;
        Ok((Source::new(req.clone()), Sink::new(req)))
    }

    /// Asks the peer what it offers
    pub async fn fetch_manifest(&self, cancel: &CancellationToken) -> Result<Manifest> {
        self.async_json(cancel, "manifest", &()).await
    }

    /// Ends the session.
    ///
    /// Every open stream is closed with [`Error::SessionTerminated`] (no frames are
    /// sent for them), then the connection is closed. Idempotent.
    pub async fn terminate(&self) -> Result<()> {
        self.inner.terminate().await
    }

    /// Has the session ended?
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.inner.is_terminated()
    }

    /// The peer's network address, if known
    #[must_use]
    pub fn remote(&self) -> Option<SocketAddr> {
        self.inner.remote()
    }
}
