//! muxrpc utility - main entrypoint
// (c) 2026 The muxrpc authors

use std::process::ExitCode;

fn main() -> ExitCode {
    muxrpc::cli(std::env::args_os())
}
