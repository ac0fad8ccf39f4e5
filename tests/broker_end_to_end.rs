//! Full-stack tests: a real `Server` bound to a Unix domain socket, driven
//! over a real socket connection exactly as an external client would.
//!
//! These stay deliberately clear of the real HID backend: `board_enumerate`
//! calls into `hidapi`, which is not reliably available in a CI container,
//! so probe selection/contention scenarios are covered at the session-unit
//! level in `src/session.rs` instead (seeding a registry entry directly
//! bypasses the HID-dependent `enumerate()` call, but that seam is crate-
//! internal, not exposed to an external test binary like this one). What's
//! exercised here is the part those unit tests can't reach: real threads,
//! a real listener, and real line-oriented socket framing end to end.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dap_broker::error::HidError;
use dap_broker::hid::HidDevice;
use dap_broker::server::{Server, ServerConfig};
use dap_broker::session::Opener;
use dap_broker::transport::Address;

#[derive(Debug)]
struct UnusedProbe;

impl HidDevice for UnusedProbe {
    fn write_report(&mut self, _payload: &[u8]) -> Result<(), HidError> {
        unreachable!("no test in this file drives a probe far enough to touch the transport")
    }

    fn read_report(&mut self, _timeout: Duration) -> Result<[u8; dap_broker::hid::REPORT_SIZE], HidError> {
        unreachable!("no test in this file drives a probe far enough to touch the transport")
    }
}

fn opener() -> Opener<UnusedProbe> {
    Arc::new(|_sel, _info| Ok(UnusedProbe))
}

/// A fresh socket path per test so parallel `cargo test` runs don't collide.
fn unique_socket_path(label: &str) -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}/dap-broker-test-{}-{}-{}.sock", std::env::temp_dir().display(), label, std::process::id(), n)
}

fn connect_with_retry(path: &str) -> UnixStream {
    for _ in 0..50 {
        if let Ok(stream) = UnixStream::connect(path) {
            return stream;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!("broker never came up at {path}");
}

fn send_line(stream: &mut UnixStream, line: &str) {
    stream.write_all(line.as_bytes()).unwrap();
    stream.write_all(b"\n").unwrap();
}

fn read_line(reader: &mut BufReader<UnixStream>) -> serde_json::Value {
    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    serde_json::from_str(line.trim_end()).unwrap()
}

#[test]
fn server_info_over_a_real_socket_reports_the_crate_version() {
    let path = unique_socket_path("server-info");
    let config = ServerConfig { address: Address::Unix(path.clone()), temporary: true };
    let server = Server::new(config, opener());
    let handle = std::thread::spawn(move || server.run());

    let stream = connect_with_retry(&path);
    let mut writer = stream.try_clone().unwrap();
    let mut reader = BufReader::new(stream);

    send_line(&mut writer, r#"{"command":"server_info"}"#);
    let reply = read_line(&mut reader);
    assert_eq!(reply["response"], "server_info");
    assert_eq!(reply["version"], env!("CARGO_PKG_VERSION"));

    drop(writer);
    drop(reader);
    handle.join().unwrap().unwrap();
}

#[test]
fn unknown_command_over_the_wire_comes_back_as_a_command_error_frame() {
    let path = unique_socket_path("unknown-command");
    let config = ServerConfig { address: Address::Unix(path.clone()), temporary: true };
    let server = Server::new(config, opener());
    let handle = std::thread::spawn(move || server.run());

    let stream = connect_with_retry(&path);
    let mut writer = stream.try_clone().unwrap();
    let mut reader = BufReader::new(stream);

    send_line(&mut writer, r#"{"command":"not_a_real_command"}"#);
    let reply = read_line(&mut reader);
    assert_eq!(reply["error"], "CommandError");
    assert!(reply["message"].as_str().unwrap().contains("not_a_real_command"));

    drop(writer);
    drop(reader);
    handle.join().unwrap().unwrap();
}

#[test]
fn two_connections_get_independent_sessions_and_replies_stay_correlated() {
    let path = unique_socket_path("two-clients");
    // temporary mode exits once the client count drains back to zero, so
    // the server thread below is still reliably joinable.
    let config = ServerConfig { address: Address::Unix(path.clone()), temporary: true };
    let server = Server::new(config, opener());
    let handle = std::thread::spawn(move || server.run());

    let a = connect_with_retry(&path);
    let mut a_writer = a.try_clone().unwrap();
    let mut a_reader = BufReader::new(a);

    let b = connect_with_retry(&path);
    let mut b_writer = b.try_clone().unwrap();
    let mut b_reader = BufReader::new(b);

    send_line(&mut a_writer, r#"{"command":"board_deselect"}"#);
    send_line(&mut b_writer, r#"{"command":"not_a_real_command"}"#);

    let a_reply = read_line(&mut a_reader);
    let b_reply = read_line(&mut b_reader);

    assert_eq!(a_reply["response"], "board_deselect");
    assert_eq!(b_reply["error"], "CommandError");

    drop(a_writer);
    drop(a_reader);
    drop(b_writer);
    drop(b_reader);
    handle.join().unwrap().unwrap();
}

#[test]
fn temporary_server_exits_once_the_last_client_disconnects() {
    let path = unique_socket_path("temporary");
    let config = ServerConfig { address: Address::Unix(path.clone()), temporary: true };
    let server = Server::new(config, opener());
    let handle = std::thread::spawn(move || server.run());

    {
        let stream = connect_with_retry(&path);
        let mut writer = stream.try_clone().unwrap();
        let mut reader = BufReader::new(stream);
        send_line(&mut writer, r#"{"command":"server_info"}"#);
        let _ = read_line(&mut reader);
    } // socket drops here, disconnecting the only client

    handle.join().unwrap().unwrap();
    assert!(UnixStream::connect(&path).is_err(), "listener should have unlinked its socket on shutdown");
}

#[test]
fn a_malformed_line_gets_a_command_error_reply_and_the_connection_stays_open() {
    let path = unique_socket_path("malformed");
    let config = ServerConfig { address: Address::Unix(path.clone()), temporary: true };
    let server = Server::new(config, opener());
    let handle = std::thread::spawn(move || server.run());

    let stream = connect_with_retry(&path);
    let mut writer = stream.try_clone().unwrap();
    let mut reader = BufReader::new(stream);

    send_line(&mut writer, "{not json at all");
    let reply = read_line(&mut reader);
    assert_eq!(reply["error"], "CommandError");

    send_line(&mut writer, r#"{"command":"server_info"}"#);
    let reply = read_line(&mut reader);
    assert_eq!(reply["response"], "server_info");

    drop(writer);
    drop(reader);
    handle.join().unwrap().unwrap();
}
