// (c) 2026 The muxrpc authors

#![allow(clippy::doc_markdown)]
//! `muxrpc` is the multiplexed RPC transport spoken between Scuttlebutt peers.
//!
//! It turns one reliable, ordered, bidirectional byte connection into many concurrent
//! logical calls, opened by either side, each of which is one of:
//!
//! * **async**: one request, one response
//! * **source**: the callee streams responses
//! * **sink**: the caller streams requests
//! * **duplex**: both sides stream
//!
//! ## 📖 Documentation
//!
//! * [The wire protocol](protocol)
//! * [Configuring the CLI](config)
//!
//! ## Overview
//!
//! A [`Session`] owns a connection. [`Session::serve`] runs its receive loop, which reads
//! frames through the [`Packer`] and routes each to the call it belongs to. Calls the peer
//! opens are passed to your [`Handler`], each in a task of its own. Calls you open are
//! made through an [`Endpoint`].
//!
//! Each side of a call holds a [`Request`]. What it may do with it depends on the call type
//! and which side it is on: a source caller may only read, for example. Violations are
//! reported locally as [`Error::StreamCapability`] and never reach the wire.
//!
//! ```no_run
//! # async fn demo(conn: tokio::net::TcpStream) -> muxrpc::Result<()> {
//! use std::sync::Arc;
//! use muxrpc::{HandlerMux, Session, SessionConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! let session = Arc::new(Session::new(conn, Arc::new(HandlerMux::new()), SessionConfig::default()));
//! let cancel = CancellationToken::new();
//! let server = {
//!     let (session, cancel) = (session.clone(), cancel.clone());
//!     tokio::spawn(async move { session.serve(&cancel).await })
//! };
//! let who: serde_json::Value = session.endpoint().async_json(&cancel, "whoami", &()).await?;
//! println!("{who}");
//! session.terminate().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## What muxrpc is not
//!
//! The connection is assumed to be already authenticated and encrypted (Scuttlebutt uses
//! secret-handshake and box-stream for this). muxrpc does neither.
//!
//! The `muxrpc` binary is a debugging aid that speaks plain TCP.

pub(crate) mod cli;
pub use cli::cli;

pub mod config;
pub use config::Configuration;

mod error;
pub use error::{Direction, Error, Result};

mod handler;
pub use handler::{Handler, HandlerMux, Manifest, ManifestHandler};

mod packer;
pub use packer::Packer;

pub mod protocol;
pub use protocol::{Body, CallError, CallType, Method};

mod session;
pub use session::{
    Call, DEFAULT_MAX_BODY_SIZE, DEFAULT_QUEUE_DEPTH, Endpoint, Session, SessionConfig,
};

mod stream;
pub use stream::{Request, Sink, Source};

pub mod util;
