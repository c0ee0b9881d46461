//! CLI based tests
// (c) 2026 The muxrpc authors

use std::process::ExitCode;

use muxrpc::cli as muxrpc_main;

use rusty_fork::rusty_fork_test;

#[test]
fn show_config_files() {
    assert_eq!(muxrpc_main(["muxrpc", "--config-files"]), ExitCode::SUCCESS);
}

#[test]
fn help() {
    assert_eq!(muxrpc_main(["muxrpc", "--help"]), ExitCode::SUCCESS);
}

#[test]
fn bad_option() {
    assert_eq!(
        muxrpc_main(["muxrpc", "--this-ridiculous-option-does-not-exist"]),
        ExitCode::FAILURE
    );
}

rusty_fork_test! {

#[test]
fn no_mode() {
    assert_eq!(muxrpc_main(["muxrpc"]), ExitCode::FAILURE);
}

#[test]
fn invalid_configuration() {
    assert_eq!(
        muxrpc_main(["muxrpc", "--queue-depth", "0", "call", "127.0.0.1:1", "whoami"]),
        ExitCode::FAILURE
    );
}

#[test]
fn connection_refused() {
    // find a port nobody is listening on
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let addr = format!("127.0.0.1:{port}");
    assert_eq!(
        muxrpc_main(["muxrpc", "-q", "call", &addr, "whoami"]),
        ExitCode::FAILURE
    );
}

}
