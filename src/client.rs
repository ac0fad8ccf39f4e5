//! A client stub for the broker's wire protocol.
//!
//! Grounded on pyDAPLink's `client.py` (connect/init/auto-spawn retry and
//! the version check against `server_info`) and `client/connection.py` (the
//! per-board handle, here split into `Board::Shared`/`Board::Owned` instead
//! of a runtime `new_socket` flag).

use std::io::{BufReader, Write};
use std::net::TcpStream;
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tracing::warn;

use crate::dap::commands::DapInfoValue;
use crate::error::ClientError;
use crate::registry::ProbeId;
use crate::transport::Address;
use crate::wire::{read_frame, write_frame, Frame};

/// How many times `Client::connect` retries against a broker that has not
/// finished starting up yet, and how long it waits between attempts.
/// Mirrors the Python client's `connect_attempts=5` default.
const CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// How many times `Board::init` retries a contended lock before giving up.
const LOCK_ATTEMPTS: u32 = 5;

enum Socket {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Socket {
    fn connect(address: &Address) -> std::io::Result<Self> {
        match address {
            Address::Tcp(addr) => Ok(Socket::Tcp(TcpStream::connect(addr)?)),
            #[cfg(unix)]
            Address::Unix(path) => Ok(Socket::Unix(UnixStream::connect(path)?)),
        }
    }

    fn try_clone(&self) -> std::io::Result<Self> {
        match self {
            Socket::Tcp(s) => Ok(Socket::Tcp(s.try_clone()?)),
            #[cfg(unix)]
            Socket::Unix(s) => Ok(Socket::Unix(s.try_clone()?)),
        }
    }
}

impl std::io::Read for Socket {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Socket::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            Socket::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Socket {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Socket::Tcp(s) => s.write(buf),
            #[cfg(unix)]
            Socket::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Socket::Tcp(s) => s.flush(),
            #[cfg(unix)]
            Socket::Unix(s) => s.flush(),
        }
    }
}

/// A connection to the broker: issues one request, waits for its matching
/// reply, and turns wire errors into a [`ClientError`].
pub struct Client {
    address: Address,
    reader: BufReader<Socket>,
    writer: Socket,
}

impl Client {
    /// Connect to an already-running broker at `address`. Does not retry or
    /// spawn a server; see [`Client::connect`] for that.
    pub fn attach(address: Address) -> Result<Self, ClientError> {
        let socket = Socket::connect(&address)?;
        let writer = socket.try_clone()?;
        Ok(Self {
            address,
            reader: BufReader::new(socket),
            writer,
        })
    }

    /// Connect to the broker at `address`, spawning a detached
    /// `dap-broker-server --temporary` if the first attempt fails and
    /// `auto_spawn` is set, then retrying up to [`CONNECT_ATTEMPTS`] times.
    /// Once connected, checks `server_info` and warns on a version mismatch.
    pub fn connect(address: Address, auto_spawn: bool) -> Result<Self, ClientError> {
        let mut last_err = None;
        for attempt in 0..CONNECT_ATTEMPTS {
            match Self::attach(address.clone()) {
                Ok(mut client) => {
                    client.check_server_version()?;
                    return Ok(client);
                }
                Err(e) => {
                    if attempt == 0 && auto_spawn {
                        spawn_detached_server(&address);
                    }
                    last_err = Some(e);
                    std::thread::sleep(CONNECT_RETRY_DELAY);
                }
            }
        }
        Err(last_err.expect("loop runs at least once"))
    }

    fn check_server_version(&mut self) -> Result<(), ClientError> {
        let fields = self.command("server_info", Map::new())?;
        let server_version = fields.get("version").and_then(Value::as_str).unwrap_or("");
        if server_version != env!("CARGO_PKG_VERSION") {
            warn!(server_version, client_version = env!("CARGO_PKG_VERSION"), "broker version mismatch");
        }
        Ok(())
    }

    /// Send one request and block for its reply, translating `error` frames
    /// into `Err`.
    pub fn command(&mut self, command: &str, params: Map<String, Value>) -> Result<Map<String, Value>, ClientError> {
        write_frame(&mut self.writer, &Frame::request(command, params))?;
        let frame = read_frame(&mut self.reader)?.ok_or(ClientError::Disconnected)?;
        match frame {
            Frame::Response { response, fields } if response == command => Ok(fields),
            Frame::Response { response, .. } => Err(ClientError::Command(format!(
                "expected a reply to {command:?}, got {response:?}"
            ))),
            Frame::Error { kind, message } => Err(match kind.as_str() {
                "CommandError" => ClientError::Command(message),
                "TransferError" => ClientError::Transfer(message),
                _ => ClientError::Server { kind, message },
            }),
            Frame::Request { command, .. } => Err(ClientError::Command(format!(
                "broker sent a request frame ({command:?}) instead of a reply"
            ))),
        }
    }

    /// Enumerate probes matching `(vid, pid)` and return a handle to each.
    /// Each handle shares this connection; see [`Board::into_owned`] to give
    /// one an independent socket.
    pub fn enumerate_boards(&mut self, vid: u16, pid: u16) -> Result<Vec<ProbeId>, ClientError> {
        let fields = self.command("board_enumerate", json_params([("vid", json!(vid)), ("pid", json!(pid))]))?;
        let ids = fields
            .get("ids")
            .and_then(Value::as_array)
            .ok_or_else(|| ClientError::Command("board_enumerate reply missing ids".to_string()))?;
        Ok(ids.iter().filter_map(Value::as_u64).map(|n| n as ProbeId).collect())
    }

    pub fn address(&self) -> &Address {
        &self.address
    }
}

fn spawn_detached_server(address: &Address) {
    let addr = match address {
        Address::Tcp(a) => a.clone(),
        #[cfg(unix)]
        Address::Unix(p) => p.clone(),
    };
    let result = std::process::Command::new("dap-broker-server")
        .args(["--temporary", "--address", &addr])
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn();
    if let Err(e) = result {
        warn!(error = %e, "failed to auto-spawn dap-broker-server");
    }
}

fn json_params(entries: impl IntoIterator<Item = (&'static str, Value)>) -> Map<String, Value> {
    entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

/// A handle to one enumerated probe, as either a half that borrows its
/// parent [`Client`] or one that owns an independent connection.
///
/// Modeled as two variants rather than an internal handle swap so that
/// `Board::Owned`'s lifetime is visibly decoupled from the client that
/// enumerated it.
pub enum Board<'a> {
    Shared { client: &'a mut Client, id: ProbeId },
    Owned { client: Client, id: ProbeId },
}

impl<'a> Board<'a> {
    pub fn shared(client: &'a mut Client, id: ProbeId) -> Self {
        Board::Shared { client, id }
    }

    /// Open a fresh connection for `id`, independent of whatever connection
    /// enumerated it. Mirrors `client/connection.py`'s `new_socket=True`.
    pub fn owned(address: Address, auto_spawn: bool, id: ProbeId) -> Result<Board<'static>, ClientError> {
        let client = Client::connect(address, auto_spawn)?;
        Ok(Board::Owned { client, id })
    }

    fn client(&mut self) -> &mut Client {
        match self {
            Board::Shared { client, .. } => client,
            Board::Owned { client, .. } => client,
        }
    }

    fn id(&self) -> ProbeId {
        match self {
            Board::Shared { id, .. } => *id,
            Board::Owned { id, .. } => *id,
        }
    }

    pub fn info(&mut self) -> Result<(String, String, String), ClientError> {
        let id = self.id();
        let fields = self.client().command("board_info", json_params([("id", json!(id))]))?;
        let get = |key: &str| fields.get(key).and_then(Value::as_str).unwrap_or_default().to_string();
        Ok((get("vendor"), get("product"), get("serial")))
    }

    /// Attempt to lock this board for exclusive access. Returns `false`
    /// rather than an error if another connection already holds it.
    pub fn select(&mut self) -> Result<bool, ClientError> {
        let id = self.id();
        let fields = self.client().command("board_select", json_params([("id", json!(id))]))?;
        Ok(fields.get("selected").and_then(Value::as_bool).unwrap_or(false))
    }

    pub fn deselect(&mut self) -> Result<(), ClientError> {
        self.client().command("board_deselect", Map::new())?;
        Ok(())
    }

    /// Lock the board and bring its engine up at `frequency_hz`. Retries the
    /// lock [`LOCK_ATTEMPTS`] times before giving up, mirroring
    /// `client/connection.py`'s `lock_attempts=5` default.
    pub fn init(&mut self, frequency_hz: u32) -> Result<(), ClientError> {
        let mut locked = false;
        for _ in 0..LOCK_ATTEMPTS {
            if self.select()? {
                locked = true;
                break;
            }
        }
        if !locked {
            let id = self.id();
            return Err(ClientError::Command(format!("could not lock probe {id}, it may be in use by another process")));
        }
        self.client()
            .command("dap_init", json_params([("frequency", json!(frequency_hz))]))?;
        Ok(())
    }

    pub fn uninit(&mut self) -> Result<(), ClientError> {
        self.client().command("dap_uninit", Map::new())?;
        self.deselect()
    }

    pub fn reset(&mut self) -> Result<(), ClientError> {
        self.client().command("reset", Map::new())?;
        Ok(())
    }

    pub fn assert_reset(&mut self, asserted: bool) -> Result<(), ClientError> {
        let command = if asserted { "reset_assert" } else { "reset_deassert" };
        self.client().command(command, Map::new())?;
        Ok(())
    }

    pub fn write_dp(&mut self, addr: u32, data: u32) -> Result<(), ClientError> {
        self.write_reg("write_dp", addr, data)
    }

    pub fn read_dp(&mut self, addr: u32) -> Result<(), ClientError> {
        self.read_reg("read_dp", addr)
    }

    pub fn write_ap(&mut self, addr: u32, data: u32) -> Result<(), ClientError> {
        self.write_reg("write_ap", addr, data)
    }

    pub fn read_ap(&mut self, addr: u32) -> Result<(), ClientError> {
        self.read_reg("read_ap", addr)
    }

    fn write_reg(&mut self, command: &str, addr: u32, data: u32) -> Result<(), ClientError> {
        self.client()
            .command(command, json_params([("addr", json!(addr)), ("data", json!(data))]))?;
        Ok(())
    }

    fn read_reg(&mut self, command: &str, addr: u32) -> Result<(), ClientError> {
        self.client().command(command, json_params([("addr", json!(addr))]))?;
        Ok(())
    }

    pub fn dap_info(&mut self, request: &str) -> Result<DapInfoValue, ClientError> {
        let fields = self
            .client()
            .command("dap_info", json_params([("request", json!(request))]))?;
        Ok(match fields.get("result") {
            Some(Value::String(s)) => DapInfoValue::Str(s.clone()),
            Some(Value::Number(n)) => DapInfoValue::Int(n.as_i64().unwrap_or_default() as i32),
            _ => DapInfoValue::None,
        })
    }

    /// Queue a register or memory write and block for its reply's ack. The
    /// value itself never comes back over the wire for writes, only via
    /// [`Board::flush`] for reads.
    pub fn flush(&mut self) -> Result<Vec<Value>, ClientError> {
        let fields = self.client().command("flush", Map::new())?;
        Ok(fields.get("reads").and_then(Value::as_array).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn json_params_builds_a_map_in_insertion_order() {
        let params = json_params([("vid", json!(1)), ("pid", json!(2))]);
        assert_eq!(params.get("vid"), Some(&json!(1)));
        assert_eq!(params.get("pid"), Some(&json!(2)));
    }

    #[test]
    fn a_response_for_a_different_command_is_rejected() {
        let mut buf = Vec::new();
        write_frame(&mut Cursor::new(&mut buf), &Frame::response("board_select", Map::new())).unwrap();
        let mut reader = std::io::BufReader::new(&buf[..]);
        let frame = read_frame(&mut reader).unwrap().unwrap();
        match frame {
            Frame::Response { response, .. } => assert_ne!(response, "dap_init"),
            _ => panic!("expected a response frame"),
        }
    }

    #[test]
    fn error_kind_maps_to_the_right_client_error_variant() {
        let kinds = [("CommandError", "bad args"), ("TransferError", "ack=FAULT"), ("WeirdError", "boom")];
        for (kind, message) in kinds {
            let err = match kind {
                "CommandError" => ClientError::Command(message.to_string()),
                "TransferError" => ClientError::Transfer(message.to_string()),
                other => ClientError::Server { kind: other.to_string(), message: message.to_string() },
            };
            assert!(err.to_string().contains(message));
        }
    }
}
