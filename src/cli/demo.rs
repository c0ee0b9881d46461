//! The methods `muxrpc serve` offers
// (c) 2026 The muxrpc authors

use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::handler::{Handler, HandlerMux, Manifest};
use crate::protocol::{CallType, Method};
use crate::stream::Request;

/// Upper limit on `count`, so that a typo cannot keep a connection busy forever
const MAX_COUNT: u64 = 1_000_000;

const METHODS: &[(&str, CallType)] = &[
    ("whoami", CallType::Async),
    ("echo", CallType::Async),
    ("echo.stream", CallType::Duplex),
    ("count", CallType::Source),
    ("collect", CallType::Sink),
];

/// Serves the demonstration methods
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Demo;

impl Demo {
    async fn whoami(cancel: &CancellationToken, req: &Request) -> anyhow::Result<()> {
        let remote = req.endpoint()?.remote();
        let id = remote.map_or_else(|| "anonymous".to_string(), |r| r.to_string());
        req.return_json(cancel, &json!({ "id": id })).await?;
        Ok(())
    }

    async fn echo(cancel: &CancellationToken, req: &Request) -> anyhow::Result<()> {
        let mut args: Vec<Value> = req.args()?;
        let value = if args.len() == 1 {
            args.remove(0)
        } else {
            Value::Array(args)
        };
        req.return_json(cancel, &value).await?;
        Ok(())
    }

    async fn echo_stream(cancel: &CancellationToken, req: &Request) -> anyhow::Result<()> {
        while let Some(body) = req.next(cancel).await? {
            req.send(cancel, body).await?;
        }
        Ok(())
    }

    async fn count(cancel: &CancellationToken, req: &Request) -> anyhow::Result<()> {
        let (n,): (u64,) = req.args().context("count takes one argument, a number")?;
        anyhow::ensure!(n <= MAX_COUNT, "count is limited to {MAX_COUNT}");
        for i in 0..n {
            req.send_json(cancel, &i).await?;
        }
        Ok(())
    }

    async fn collect(cancel: &CancellationToken, req: &Request) -> anyhow::Result<()> {
        let mut received = 0usize;
        while let Some(body) = req.next(cancel).await? {
            received += 1;
            info!("collect: {body}");
        }
        info!("collect: stream ended after {received} items");
        Ok(())
    }
}

#[async_trait]
impl Handler for Demo {
    fn handled(&self, method: &Method) -> bool {
        let name = method.to_string();
        METHODS.iter().any(|(m, _)| *m == name)
    }

    async fn handle_call(&self, cancel: CancellationToken, req: Request) -> anyhow::Result<()> {
        match req.method().to_string().as_str() {
            "whoami" => Self::whoami(&cancel, &req).await,
            "echo" => Self::echo(&cancel, &req).await,
            "echo.stream" => Self::echo_stream(&cancel, &req).await,
            "count" => Self::count(&cancel, &req).await,
            "collect" => Self::collect(&cancel, &req).await,
            other => anyhow::bail!("no such method: {other}"),
        }
    }

    fn manifest(&self) -> Manifest {
        METHODS
            .iter()
            .fold(Manifest::default(), |m, (name, t)| m.with(*name, *t))
    }
}

/// The full handler set, including `manifest`
pub(crate) fn handlers() -> HandlerMux {
    let demo = Arc::new(Demo);
    ["whoami", "echo", "count", "collect"]
        .into_iter()
        .fold(HandlerMux::new(), |mux, prefix| mux.with(prefix, demo.clone()))
        .with_manifest()
}
