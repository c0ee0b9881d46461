//! Two sessions talking to each other
// (c) 2026 The muxrpc authors

use std::sync::Arc;
use std::time::Duration;

use assertables::assert_contains;
use async_trait::async_trait;
use futures_util::future::join_all;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use muxrpc::{
    Call, CallError, CallType, Direction, Endpoint, Error, Handler, HandlerMux, Manifest, Method,
    Request, Session, SessionConfig,
};

/// Generous upper bound on anything that is supposed to happen promptly
const PROMPTLY: Duration = Duration::from_secs(5);

const METHODS: &[(&str, CallType)] = &[
    ("whoami", CallType::Async),
    ("createHistoryStream", CallType::Source),
    ("fail", CallType::Source),
    ("oops", CallType::Async),
    ("panic", CallType::Async),
    ("silent", CallType::Async),
    ("hang", CallType::Source),
    ("stall", CallType::Sink),
    ("collect", CallType::Sink),
    ("echo", CallType::Duplex),
    ("probe", CallType::Source),
    ("flood", CallType::Source),
    ("callback", CallType::Sink),
    ("watch", CallType::Duplex),
];

#[derive(Clone, Default)]
struct TestServer {
    /// Everything the `collect` sink receives
    collected: Option<mpsc::UnboundedSender<Value>>,
    /// On connect, asks the peer `whoami` and reports the answer here
    on_connect: Option<mpsc::UnboundedSender<Value>>,
    /// How each `watch` call ended
    watched: Option<mpsc::UnboundedSender<&'static str>>,
}

#[async_trait]
impl Handler for TestServer {
    fn handled(&self, method: &Method) -> bool {
        let name = method.to_string();
        METHODS.iter().any(|(m, _)| *m == name)
    }

    async fn handle_call(&self, cancel: CancellationToken, req: Request) -> anyhow::Result<()> {
        match req.method().to_string().as_str() {
            "whoami" => req.return_json(&cancel, &json!({"id": "@alice"})).await?,
            "createHistoryStream" => {
                for seq in 1..=3 {
                    req.send_json(&cancel, &json!({ "seq": seq })).await?;
                }
            }
            "fail" => req.close_with_error(CallError::new("bad request")).await?,
            "oops" => anyhow::bail!("handler broke"),
            "panic" => panic!("boom"),
            "silent" => (),
            "hang" | "stall" => cancel.cancelled().await,
            "collect" => {
                while let Some(v) = req.next_json::<Value>(&cancel).await? {
                    if let Some(tx) = &self.collected {
                        let _ = tx.send(v);
                    }
                }
            }
            "echo" => {
                while let Some(body) = req.next(&cancel).await? {
                    req.send(&cancel, body).await?;
                }
            }
            "probe" => {
                let outcome = match req.next(&cancel).await {
                    Err(Error::StreamCapability { .. }) => "read refused",
                    _ => "read allowed",
                };
                req.send_json(&cancel, outcome).await?;
            }
            "flood" => {
                for seq in 0..20 {
                    if req.send_json(&cancel, &seq).await.is_err() {
                        break;
                    }
                }
            }
            "callback" => {
                // call back to the peer before reading anything
                let _: Value = req.endpoint()?.async_json(&cancel, "whoami", &()).await?;
                while req.next(&cancel).await?.is_some() {}
            }
            "watch" => {
                let outcome = loop {
                    match req.next(&cancel).await {
                        Ok(Some(_)) => (),
                        Ok(None) => break "ended",
                        Err(Error::Call(_)) => break "failed",
                        Err(Error::SessionTerminated) => break "terminated",
                        Err(Error::Cancelled) => break "cancelled",
                        Err(e) => anyhow::bail!("unexpected: {e}"),
                    }
                };
                if let Some(tx) = &self.watched {
                    let _ = tx.send(outcome);
                }
            }
            other => anyhow::bail!("unexpected method {other}"),
        }
        Ok(())
    }

    async fn handle_connect(&self, cancel: CancellationToken, endpoint: Endpoint) {
        if let Some(tx) = &self.on_connect {
            if let Ok(v) = endpoint.async_json::<Value, _>(&cancel, "whoami", &()).await {
                let _ = tx.send(v);
            }
        }
    }

    fn manifest(&self) -> Manifest {
        METHODS
            .iter()
            .fold(Manifest::default(), |m, (name, t)| m.with(*name, *t))
    }
}

struct Pair {
    left: Arc<Session>,
    right: Arc<Session>,
    cancel: CancellationToken,
    left_serve: JoinHandle<muxrpc::Result<()>>,
    _right_serve: JoinHandle<muxrpc::Result<()>>,
}

impl Pair {
    fn new(left: Arc<dyn Handler>, right: Arc<dyn Handler>, config: SessionConfig) -> Self {
        let (a, b) = tokio::io::duplex(4096);
        let left = Arc::new(Session::new(a, left, config));
        let right = Arc::new(Session::new(b, right, config));
        let cancel = CancellationToken::new();
        let spawn = |s: &Arc<Session>| {
            let (s, cancel) = (s.clone(), cancel.clone());
            tokio::spawn(async move { s.serve(&cancel).await })
        };
        Self {
            left_serve: spawn(&left),
            _right_serve: spawn(&right),
            left,
            right,
            cancel,
        }
    }

    /// A client with no methods of its own, talking to a [`TestServer`]
    fn client_server() -> Self {
        Self::new(
            Arc::new(HandlerMux::new()),
            Arc::new(TestServer::default()),
            SessionConfig::default(),
        )
    }

    fn client(&self) -> Endpoint {
        self.left.endpoint()
    }
}

impl Drop for Pair {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn call_error(e: &Error) -> &CallError {
    e.as_call_error()
        .unwrap_or_else(|| panic!("expected a call error, got {e:?}"))
}

// SCENARIOS //////////////////////////////////////////////////////////////////////////////

#[tokio::test]
async fn async_call_returns_the_value() {
    let pair = Pair::client_server();
    let cancel = CancellationToken::new();
    let v: Value = pair
        .client()
        .async_json(&cancel, "whoami", &())
        .await
        .unwrap();
    assert_eq!(v, json!({"id": "@alice"}));

    // the call is over; the request reports closed and refuses another read
    let req = pair
        .client()
        .do_call(&cancel, Call::new("whoami", CallType::Async, &()).unwrap())
        .await
        .unwrap();
    assert!(req.next(&cancel).await.unwrap().is_some());
    timeout(PROMPTLY, req.closed_token().cancelled())
        .await
        .unwrap();
    assert!(req.is_closed());
    assert!(matches!(
        req.next(&cancel).await,
        Err(Error::StreamCapability {
            direction: Direction::Read,
            ..
        })
    ));
}

#[tokio::test]
async fn source_streams_then_ends_cleanly() {
    let pair = Pair::client_server();
    let cancel = CancellationToken::new();
    let src = pair
        .client()
        .source(&cancel, "createHistoryStream", &json!({"id": "@bob", "live": false}))
        .await
        .unwrap();
    let mut got = Vec::new();
    while let Some(v) = src.next_json::<Value>(&cancel).await.unwrap() {
        got.push(v["seq"].as_u64().unwrap());
    }
    assert_eq!(got, [1, 2, 3]);
    // end of stream is sticky
    assert!(src.next(&cancel).await.unwrap().is_none());
}

#[tokio::test]
async fn close_with_error_reaches_the_caller() {
    let pair = Pair::client_server();
    let cancel = CancellationToken::new();
    let src = pair.client().source(&cancel, "fail", &()).await.unwrap();
    let err = src.next(&cancel).await.unwrap_err();
    let ce = call_error(&err);
    assert_eq!(ce.message, "bad request");
    assert_eq!(ce.name, "Error");
    assert!(!err.is_session_terminated());
}

#[tokio::test]
async fn peer_hanging_up_releases_blocked_readers() {
    let pair = Pair::client_server();
    let cancel = CancellationToken::new();
    let ep = pair.client();

    let mut readers = Vec::new();
    for _ in 0..3 {
        let src = ep.source(&cancel, "hang", &()).await.unwrap();
        let cancel = cancel.clone();
        readers.push(tokio::spawn(async move { src.next(&cancel).await }));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    for r in &readers {
        assert!(!r.is_finished());
    }

    pair.right.terminate().await.unwrap();

    for r in readers {
        let result = timeout(PROMPTLY, r).await.unwrap().unwrap();
        assert!(matches!(result, Err(Error::SessionTerminated)), "{result:?}");
    }
}

// PROPERTIES /////////////////////////////////////////////////////////////////////////////

#[tokio::test]
async fn capabilities_are_enforced_locally() {
    let pair = Pair::client_server();
    let cancel = CancellationToken::new();
    let ep = pair.client();

    let src = ep.source(&cancel, "hang", &()).await.unwrap();
    assert!(matches!(
        src.request().send(&cancel, "x").await,
        Err(Error::StreamCapability {
            call_type: CallType::Source,
            direction: Direction::Write,
            ..
        })
    ));

    let sink = ep.sink(&cancel, "collect", &()).await.unwrap();
    assert!(matches!(
        sink.request().next(&cancel).await,
        Err(Error::StreamCapability {
            direction: Direction::Read,
            ..
        })
    ));

    let req = ep
        .do_call(&cancel, Call::new("whoami", CallType::Async, &()).unwrap())
        .await
        .unwrap();
    assert!(matches!(
        req.send(&cancel, "x").await,
        Err(Error::StreamCapability { .. })
    ));
    assert!(req.return_value(&cancel, "x").await.is_err());

    // callee side: a source callee may not read
    let probe = ep.source(&cancel, "probe", &()).await.unwrap();
    assert_eq!(
        probe.next_json::<String>(&cancel).await.unwrap().as_deref(),
        Some("read refused")
    );
    assert!(probe.next(&cancel).await.unwrap().is_none());

    // none of that disturbed the session
    let v: Value = ep.async_json(&cancel, "whoami", &()).await.unwrap();
    assert_eq!(v["id"], "@alice");
}

#[tokio::test]
async fn interleaved_streams_see_only_their_own_packets() {
    const STREAMS: usize = 8;
    const MESSAGES: usize = 50;
    let pair = Pair::client_server();
    let cancel = CancellationToken::new();
    let ep = pair.client();

    let tasks = (0..STREAMS).map(|stream| {
        let ep = ep.clone();
        let cancel = cancel.clone();
        async move {
            let (src, sink) = ep.duplex(&cancel, "echo", &()).await.unwrap();
            let writer = {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    for i in 0..MESSAGES {
                        sink.send_json(&cancel, &(stream, i)).await.unwrap();
                        tokio::task::yield_now().await;
                    }
                    sink
                })
            };
            let mut got = Vec::new();
            for _ in 0..MESSAGES {
                got.push(src.next_json::<(usize, usize)>(&cancel).await.unwrap().unwrap());
            }
            let sink = writer.await.unwrap();
            sink.close().await.unwrap();
            got
        }
    });
    let results = timeout(PROMPTLY, join_all(tasks)).await.unwrap();
    for (stream, got) in results.into_iter().enumerate() {
        let expected: Vec<_> = (0..MESSAGES).map(|i| (stream, i)).collect();
        assert_eq!(got, expected);
    }
}

#[tokio::test]
async fn an_unread_stream_does_not_hold_up_the_others() {
    let pair = Pair::new(
        Arc::new(HandlerMux::new()),
        Arc::new(TestServer::default()),
        SessionConfig {
            queue_depth: 2,
            ..SessionConfig::default()
        },
    );
    let cancel = CancellationToken::new();
    let ep = pair.client();
    let flood = ep.source(&cancel, "flood", &()).await.unwrap();

    // nobody reads `flood`, yet other calls still complete
    for _ in 0..3 {
        let v: Value = timeout(PROMPTLY, ep.async_json(&cancel, "whoami", &()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(v["id"], "@alice");
    }

    // the flooded stream was closed; what it had queued is still readable
    timeout(PROMPTLY, flood.request().closed_token().cancelled())
        .await
        .unwrap();
    assert_eq!(flood.next_json::<u32>(&cancel).await.unwrap(), Some(0));
    assert_eq!(flood.next_json::<u32>(&cancel).await.unwrap(), Some(1));
    let err = flood.next(&cancel).await.unwrap_err();
    assert_contains!(call_error(&err).message, "stream overflow");
}

#[tokio::test]
async fn handler_calling_back_before_reading_does_not_wedge_the_connection() {
    let pair = Pair::new(
        Arc::new(TestServer::default()),
        Arc::new(TestServer::default()),
        SessionConfig {
            queue_depth: 2,
            ..SessionConfig::default()
        },
    );
    let cancel = CancellationToken::new();
    let ep = pair.client();
    let sink = ep.sink(&cancel, "callback", &()).await.unwrap();
    for i in 0..10 {
        // the sink may be closed for overflow part way through
        let _ = sink.send_json(&cancel, &i).await;
    }
    let v: Value = timeout(PROMPTLY, ep.async_json(&cancel, "whoami", &()))
        .await
        .expect("the connection stalled behind an unread stream")
        .unwrap();
    assert_eq!(v["id"], "@alice");
}

#[tokio::test]
async fn terminate_racing_close_resolves_each_stream_once() {
    const STREAMS: usize = 16;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let server = TestServer {
        watched: Some(tx),
        ..TestServer::default()
    };
    let pair = Pair::new(
        Arc::new(HandlerMux::new()),
        Arc::new(server),
        SessionConfig::default(),
    );
    let cancel = CancellationToken::new();
    let ep = pair.client();
    let mut sinks = Vec::new();
    for _ in 0..STREAMS {
        let (_, sink) = ep.duplex(&cancel, "watch", &()).await.unwrap();
        sinks.push(sink);
    }

    let closes: Vec<_> = sinks
        .iter()
        .cloned()
        .enumerate()
        .map(|(i, sink)| {
            tokio::spawn(async move {
                if i % 2 == 0 {
                    sink.close().await
                } else {
                    sink.close_with_error(CallError::new("going away")).await
                }
            })
        })
        .collect();
    ep.terminate().await.unwrap();

    for c in closes {
        let r = timeout(PROMPTLY, c).await.unwrap().unwrap();
        assert!(matches!(r, Ok(()) | Err(Error::SessionTerminated)), "{r:?}");
    }
    for (i, sink) in sinks.iter().enumerate() {
        assert!(sink.request().is_closed());
        // whichever close won, a different outcome is refused
        let second = if i % 2 == 0 {
            sink.close_with_error(CallError::new("late")).await
        } else {
            sink.close().await
        };
        assert!(
            matches!(second, Err(Error::AlreadyClosed(_) | Error::SessionTerminated)),
            "{second:?}"
        );
    }

    // the peer saw every call end exactly once
    let mut outcomes = Vec::new();
    for _ in 0..STREAMS {
        outcomes.push(timeout(PROMPTLY, rx.recv()).await.unwrap().unwrap());
    }
    assert!(
        outcomes
            .iter()
            .all(|o| ["ended", "failed", "terminated", "cancelled"].contains(o)),
        "{outcomes:?}"
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn closing_twice() {
    let pair = Pair::client_server();
    let cancel = CancellationToken::new();
    let src = pair.client().source(&cancel, "hang", &()).await.unwrap();
    src.close().await.unwrap();
    src.close().await.unwrap();
    assert!(matches!(
        src.close_with_error(CallError::new("changed my mind")).await,
        Err(Error::AlreadyClosed(_))
    ));
    // reading after our own close reports the clean end we chose
    assert!(src.next(&cancel).await.unwrap().is_none());
}

#[tokio::test]
async fn terminate_closes_everything() {
    let mut pair = Pair::client_server();
    let cancel = CancellationToken::new();
    let ep = pair.client();

    let src = ep.source(&cancel, "hang", &()).await.unwrap();
    let reader = {
        let (src, cancel) = (src.clone(), cancel.clone());
        tokio::spawn(async move { src.next(&cancel).await })
    };
    let sink = ep.sink(&cancel, "collect", &()).await.unwrap();

    ep.terminate().await.unwrap();
    ep.terminate().await.unwrap();
    assert!(ep.is_terminated());

    let r = timeout(PROMPTLY, reader).await.unwrap().unwrap();
    assert!(matches!(r, Err(Error::SessionTerminated)), "{r:?}");
    assert!(matches!(
        sink.send(&cancel, "late").await,
        Err(Error::SessionTerminated)
    ));
    assert!(matches!(src.close().await, Err(Error::SessionTerminated)));
    assert!(matches!(
        ep.async_call(&cancel, "whoami", &()).await,
        Err(Error::SessionTerminated)
    ));
    assert!(matches!(
        ep.source(&cancel, "createHistoryStream", &()).await,
        Err(Error::SessionTerminated)
    ));
    let served = timeout(PROMPTLY, &mut pair.left_serve).await;
    assert!(matches!(served, Ok(Ok(Ok(())))), "{served:?}");
}

#[tokio::test]
async fn cancellation_leaves_the_stream_open() {
    let pair = Pair::client_server();
    let src = pair
        .client()
        .source(&CancellationToken::new(), "createHistoryStream", &())
        .await
        .unwrap();
    let cancelled = CancellationToken::new();
    cancelled.cancel();
    assert!(matches!(src.next(&cancelled).await, Err(Error::Cancelled)));
    let live = CancellationToken::new();
    let first = src.next_json::<Value>(&live).await.unwrap().unwrap();
    assert_eq!(first["seq"], 1);
}

// SUPERVISION ////////////////////////////////////////////////////////////////////////////

#[tokio::test]
async fn handler_outcomes_close_the_call() {
    let pair = Pair::client_server();
    let cancel = CancellationToken::new();
    let ep = pair.client();

    let err = ep.async_call(&cancel, "oops", &()).await.unwrap_err();
    assert_eq!(call_error(&err).message, "handler broke");

    let err = ep.async_call(&cancel, "panic", &()).await.unwrap_err();
    assert_eq!(call_error(&err).message, "handler panicked");

    let err = ep.async_call(&cancel, "silent", &()).await.unwrap_err();
    assert_eq!(
        call_error(&err).message,
        "handler returned without a response"
    );

    let err = ep.async_call(&cancel, "nope.nothing", &()).await.unwrap_err();
    assert_eq!(call_error(&err).message, "no such method: nope.nothing");

    // and the session survived all of it
    let v: Value = ep.async_json(&cancel, "whoami", &()).await.unwrap();
    assert_eq!(v["id"], "@alice");
}

#[tokio::test]
async fn sink_delivers_in_order() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let server = TestServer {
        collected: Some(tx),
        ..TestServer::default()
    };
    let pair = Pair::new(
        Arc::new(HandlerMux::new()),
        Arc::new(server),
        SessionConfig::default(),
    );
    let cancel = CancellationToken::new();
    let sink = pair.client().sink(&cancel, "collect", &()).await.unwrap();
    for i in 0..10 {
        sink.send_json(&cancel, &i).await.unwrap();
    }
    sink.close().await.unwrap();
    for i in 0..10 {
        let v = timeout(PROMPTLY, rx.recv()).await.unwrap().unwrap();
        assert_eq!(v, json!(i));
    }
}

// SUPPLEMENTARY FEATURES /////////////////////////////////////////////////////////////////

#[tokio::test]
async fn manifest() {
    let server = HandlerMux::new()
        .with("whoami", Arc::new(TestServer::default()))
        .with("echo", Arc::new(TestServer::default()))
        .with_manifest();
    let pair = Pair::new(
        Arc::new(HandlerMux::new()),
        Arc::new(server),
        SessionConfig::default(),
    );
    let cancel = CancellationToken::new();
    let manifest = pair.client().fetch_manifest(&cancel).await.unwrap();
    assert_eq!(manifest.get(&Method::from("manifest")), Some(CallType::Async));
    assert_eq!(manifest.get(&Method::from("echo")), Some(CallType::Duplex));
    assert_eq!(
        manifest.get(&Method::from("createHistoryStream")),
        Some(CallType::Source)
    );
    // nothing is routed to `hang`, even though the handler behind the mux would serve it
    let err = pair
        .client()
        .async_call(&cancel, "hang", &())
        .await
        .unwrap_err();
    assert_eq!(call_error(&err).message, "no such method: hang");
}

#[tokio::test]
async fn handle_connect_runs_at_start() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let left = TestServer {
        on_connect: Some(tx),
        ..TestServer::default()
    };
    let _pair = Pair::new(
        Arc::new(left),
        Arc::new(TestServer::default()),
        SessionConfig::default(),
    );
    let v = timeout(PROMPTLY, rx.recv()).await.unwrap().unwrap();
    assert_eq!(v["id"], "@alice");
}

/// Forwards every call to another endpoint
struct Relay {
    target: Endpoint,
}

#[async_trait]
impl Handler for Relay {
    fn handled(&self, _method: &Method) -> bool {
        true
    }

    async fn handle_call(&self, cancel: CancellationToken, req: Request) -> anyhow::Result<()> {
        let upstream = self
            .target
            .do_call(&cancel, Call::from_request(&req))
            .await?;
        while let Some(body) = upstream.next(&cancel).await? {
            req.send(&cancel, body).await?;
            if !req.call_type().is_stream() {
                break;
            }
        }
        Ok(())
    }
}

#[tokio::test]
async fn relaying() {
    // client <-> relay <-> server
    let back = Pair::new(
        Arc::new(HandlerMux::new()),
        Arc::new(TestServer::default()),
        SessionConfig::default(),
    );
    let front = Pair::new(
        Arc::new(HandlerMux::new()),
        Arc::new(Relay {
            target: back.client(),
        }),
        SessionConfig::default(),
    );
    let cancel = CancellationToken::new();
    let ep = front.client();

    let v: Value = ep.async_json(&cancel, "whoami", &()).await.unwrap();
    assert_eq!(v["id"], "@alice");

    let src = ep
        .source(&cancel, "createHistoryStream", &json!({"id": "@bob"}))
        .await
        .unwrap();
    let mut n = 0;
    while src.next(&cancel).await.unwrap().is_some() {
        n += 1;
    }
    assert_eq!(n, 3);

    let src = ep.source(&cancel, "fail", &()).await.unwrap();
    let err = src.next(&cancel).await.unwrap_err();
    assert_eq!(call_error(&err).message, "bad request");
}
