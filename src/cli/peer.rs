//! `serve` and `call` over plain TCP
// (c) 2026 The muxrpc authors

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use serde_json::value::RawValue;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::args::CallArgs;
use crate::config::Configuration;
use crate::handler::{Handler, HandlerMux};
use crate::protocol::{Body, CallType};
use crate::session::{Call, Endpoint, Session};

/// Accepts connections until `cancel` fires, serving `handler` on each
pub(crate) async fn serve(
    listener: TcpListener,
    handler: Arc<dyn Handler>,
    config: &Configuration,
    cancel: &CancellationToken,
) -> Result<()> {
    info!("listening on {}", listener.local_addr()?);
    loop {
        let (conn, remote) = tokio::select! {
            () = cancel.cancelled() => break,
            r = listener.accept() => r.context("accepting connection")?,
        };
        conn.set_nodelay(true)?;
        info!("connection from {remote}");
        let session =
            Session::new(conn, handler.clone(), config.session_config()).with_remote(remote);
        let cancel = cancel.child_token();
        let _ = tokio::spawn(async move {
            match session.serve(&cancel).await {
                Ok(()) => info!("{remote} disconnected"),
                Err(e) => warn!("{remote}: {e}"),
            }
        });
    }
    Ok(())
}

/// Binds to the given address, then [`serve`]s the demonstration handlers
pub(crate) async fn serve_main(
    config: &Configuration,
    listen: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("could not listen on {listen}"))?;
    serve(listener, Arc::new(super::demo::handlers()), config, cancel).await
}

fn parse_call(args: &CallArgs) -> Result<Call> {
    let raw = match &args.args {
        Some(s) => Some(RawValue::from_string(s.clone()).context("call arguments are not valid JSON")?),
        None => None,
    };
    Ok(Call {
        method: args.method.as_str().into(),
        call_type: args.call_type,
        args: crate::protocol::normalize_args(raw.as_deref())?,
    })
}

fn print_body<W: Write>(out: &mut W, body: &Body) -> Result<()> {
    match body {
        Body::String(s) => writeln!(out, "{s}")?,
        other => writeln!(out, "{other}")?,
    }
    Ok(())
}

/// Makes one call and prints each response body on its own line
pub(crate) async fn run_call<W: Write>(
    endpoint: &Endpoint,
    call: Call,
    cancel: &CancellationToken,
    out: &mut W,
) -> Result<()> {
    let method = call.method.clone();
    match call.call_type {
        CallType::Async | CallType::Sync | CallType::Source => (),
        other => anyhow::bail!("{other} calls cannot be made from the command line"),
    }
    let req = endpoint.do_call(cancel, call).await?;
    let mut count = 0usize;
    while let Some(body) = req
        .next(cancel)
        .await
        .with_context(|| format!("{method} failed"))?
    {
        print_body(out, &body)?;
        count += 1;
        if !req.call_type().is_stream() {
            break;
        }
    }
    debug!("{count} responses");
    if count == 0 && !req.call_type().is_stream() {
        anyhow::bail!("{method} returned no response");
    }
    Ok(())
}

/// Connects to a peer, makes the call described by `args`, and prints the outcome
pub(crate) async fn call_main(
    config: &Configuration,
    args: &CallArgs,
    cancel: &CancellationToken,
) -> Result<()> {
    let call = parse_call(args)?;
    let conn = TcpStream::connect(&args.addr)
        .await
        .with_context(|| format!("could not connect to {}", args.addr))?;
    conn.set_nodelay(true)?;
    let remote = conn.peer_addr()?;
    let session = Arc::new(
        Session::new(conn, Arc::new(HandlerMux::new()), config.session_config())
            .with_remote(remote),
    );
    let server = {
        let session = session.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { session.serve(&cancel).await })
    };

    let result = run_call(&session.endpoint(), call, cancel, &mut std::io::stdout()).await;
    session.terminate().await?;
    if let Err(e) = server.await? {
        debug!("session ended with {e}");
    }
    result
}
