//! Test helpers for code dealing with live sessions
// (c) 2026 The muxrpc authors

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{Handler, HandlerMux, Session, SessionConfig};

const STREAM_BUFFER_SIZE: usize = 4_096;

/// Two sessions wired back to back, each with its receive loop running
pub(crate) struct TestPair {
    pub(crate) left: Arc<Session>,
    pub(crate) right: Arc<Session>,
    pub(crate) cancel: CancellationToken,
    pub(crate) left_serve: JoinHandle<crate::Result<()>>,
    pub(crate) right_serve: JoinHandle<crate::Result<()>>,
}

fn spawn_serve(session: &Arc<Session>, cancel: &CancellationToken) -> JoinHandle<crate::Result<()>> {
    let session = session.clone();
    let cancel = cancel.clone();
    tokio::spawn(async move { session.serve(&cancel).await })
}

/// In order to test a session we need a peer.
/// A duplex pipe gives us a connected pair of byte streams; each side becomes a session.
pub(crate) fn test_plumbing(left: Arc<dyn Handler>, right: Arc<dyn Handler>) -> TestPair {
    let (a, b) = tokio::io::duplex(STREAM_BUFFER_SIZE);
    let left = Arc::new(Session::new(a, left, SessionConfig::default()));
    let right = Arc::new(Session::new(b, right, SessionConfig::default()));
    let cancel = CancellationToken::new();
    let left_serve = spawn_serve(&left, &cancel);
    let right_serve = spawn_serve(&right, &cancel);
    TestPair {
        left,
        right,
        cancel,
        left_serve,
        right_serve,
    }
}

/// A pair where only the right side serves anything
pub(crate) fn client_server(server: Arc<dyn Handler>) -> TestPair {
    test_plumbing(Arc::new(HandlerMux::new()), server)
}
