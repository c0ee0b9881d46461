//! Method dispatch
// (c) 2026 The muxrpc authors

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::protocol::{CallError, CallType, Method};
use crate::session::Endpoint;
use crate::stream::Request;

/// Serves the calls a peer makes of us
///
/// Every inbound call is run by [`handle_call`](Handler::handle_call) in a task of its
/// own. When it returns, the call is closed for it: successfully on `Ok`, or with the
/// error on `Err`.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Does this handler serve the given method?
    fn handled(&self, method: &Method) -> bool;

    /// Serves one call.
    ///
    /// An async call must be answered with [`Request::return_value`] (or closed with an error).
    /// `cancel` fires when the session ends.
    async fn handle_call(&self, cancel: CancellationToken, req: Request) -> anyhow::Result<()>;

    /// Runs once at the start of each session, concurrently with the receive loop.
    /// `cancel` fires when the session ends.
    async fn handle_connect(&self, _cancel: CancellationToken, _endpoint: Endpoint) {}

    /// The methods this handler offers, for the `manifest` call
    fn manifest(&self) -> Manifest {
        Manifest::default()
    }
}

/// Method name to call type
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest(BTreeMap<String, CallType>);

impl Manifest {
    /// Adds an entry
    pub fn insert(&mut self, method: &Method, call_type: CallType) {
        let _ = self.0.insert(method.to_string(), call_type);
    }

    /// Builder-style [`insert`](Self::insert)
    #[must_use]
    pub fn with(mut self, method: impl Into<Method>, call_type: CallType) -> Self {
        self.insert(&method.into(), call_type);
        self
    }

    /// Looks up a method
    #[must_use]
    pub fn get(&self, method: &Method) -> Option<CallType> {
        self.0.get(&method.to_string()).copied()
    }

    /// Merges another manifest into this one
    pub fn extend(&mut self, other: Manifest) {
        self.0.extend(other.0);
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Is it empty?
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over the entries, in method name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, CallType)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/////////////////////////////////////////////////////////////////////////////////////////////
// MUX

/// Dispatches calls to child handlers by method prefix.
///
/// The child registered under the longest prefix of the method wins; so a handler for
/// `blobs` sees `blobs.get` unless another is registered for `blobs.get` itself.
#[derive(Clone, Default)]
pub struct HandlerMux {
    routes: Vec<(Method, Arc<dyn Handler>)>,
}

impl std::fmt::Debug for HandlerMux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.routes.iter().map(|(m, _)| m.to_string()))
            .finish()
    }
}

impl HandlerMux {
    /// Constructor
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a child handler, replacing any previously registered for the same prefix
    pub fn register(&mut self, prefix: impl Into<Method>, handler: Arc<dyn Handler>) {
        let prefix = prefix.into();
        self.routes.retain(|(m, _)| *m != prefix);
        self.routes.push((prefix, handler));
    }

    /// Builder-style [`register`](Self::register)
    #[must_use]
    pub fn with(mut self, prefix: impl Into<Method>, handler: Arc<dyn Handler>) -> Self {
        self.register(prefix, handler);
        self
    }

    /// Adds a `manifest` method describing everything registered so far
    #[must_use]
    pub fn with_manifest(self) -> Self {
        let handler = ManifestHandler::new(self.manifest());
        self.with("manifest", Arc::new(handler))
    }

    fn route(&self, method: &Method) -> Option<&Arc<dyn Handler>> {
        self.routes
            .iter()
            .filter(|(prefix, _)| method.has_prefix(prefix))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, h)| h)
    }
}

#[async_trait]
impl Handler for HandlerMux {
    fn handled(&self, method: &Method) -> bool {
        self.route(method).is_some_and(|h| h.handled(method))
    }

    async fn handle_call(&self, cancel: CancellationToken, req: Request) -> anyhow::Result<()> {
        let Some(handler) = self.route(req.method()) else {
            return Err(CallError::no_such_method(req.method()).into());
        };
        trace!("dispatching {}", req.method());
        handler.handle_call(cancel, req).await
    }

    async fn handle_connect(&self, cancel: CancellationToken, endpoint: Endpoint) {
        let _ = join_all(
            self.routes
                .iter()
                .map(|(_, h)| h.handle_connect(cancel.clone(), endpoint.clone())),
        )
        .await;
    }

    fn manifest(&self) -> Manifest {
        let mut manifest = Manifest::default();
        for (_, h) in &self.routes {
            manifest.extend(h.manifest());
        }
        manifest
    }
}

/////////////////////////////////////////////////////////////////////////////////////////////
// MANIFEST

/// Answers the `manifest` call
#[derive(Clone, Debug)]
pub struct ManifestHandler {
    manifest: Manifest,
}

impl ManifestHandler {
    /// Constructor. The `manifest` method itself is added to what is advertised.
    #[must_use]
    pub fn new(manifest: Manifest) -> Self {
        Self {
            manifest: manifest.with("manifest", CallType::Async),
        }
    }
}

#[async_trait]
impl Handler for ManifestHandler {
    fn handled(&self, method: &Method) -> bool {
        method.parts() == ["manifest"]
    }

    async fn handle_call(&self, cancel: CancellationToken, req: Request) -> anyhow::Result<()> {
        req.return_json(&cancel, &self.manifest).await?;
        Ok(())
    }

    fn manifest(&self) -> Manifest {
        Manifest::default().with("manifest", CallType::Async)
    }
}
