//! The broker server: accepts connections and spawns one worker thread per
//! client, dispatching wire commands against a [`Session`].
//!
//! Grounded on pyDAPLink's `DAPLinkServer` (`server/server.py`): a dedicated
//! acceptor thread, one client thread per accepted socket, and a
//! `client_count` used to support a "temporary" server that exits once the
//! last client disconnects.

use std::io::BufReader;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use signal_hook::consts::signal;
use tracing::{debug, error, info, warn};

use crate::error::BrokerError;
use crate::hid::HidDevice;
use crate::registry::RegistryTable;
use crate::session::{Opener, Session};
use crate::transport::{Address, Connection, Listener};
use crate::wire::{read_frame, write_frame, Frame};

/// Server-wide options parsed from the CLI (see §6.3).
pub struct ServerConfig {
    pub address: Address,
    /// Exit once the client count returns to zero after at least one
    /// client has connected.
    pub temporary: bool,
}

/// Runs the accept loop until shut down. Generic over the HID device type
/// so integration tests can drive the whole server against a mock probe
/// backend.
pub struct Server<D> {
    config: ServerConfig,
    registry: Arc<RegistryTable>,
    opener: Opener<D>,
    next_connection_id: AtomicU64,
    client_count: Arc<AtomicUsize>,
}

impl<D: HidDevice + 'static> Server<D> {
    pub fn new(config: ServerConfig, opener: Opener<D>) -> Self {
        Self::with_registry(config, Arc::new(RegistryTable::new()), opener)
    }

    /// As [`Server::new`], but sharing an existing registry rather than
    /// starting from an empty one. Lets tests pre-seed probe entries
    /// (bypassing the real HID backend) before the accept loop starts.
    pub fn with_registry(config: ServerConfig, registry: Arc<RegistryTable>, opener: Opener<D>) -> Self {
        Self {
            config,
            registry,
            opener,
            next_connection_id: AtomicU64::new(1),
            client_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Bind and run until shutdown is triggered (via the returned handle,
    /// Ctrl-C, or `--temporary` draining to zero clients).
    pub fn run(self) -> Result<(), std::io::Error> {
        let listener = Listener::bind(self.config.address.clone())?;
        let shutdown = listener.shutdown_handle();
        info!(address = ?self.config.address, "broker listening");

        let _sigint_watcher = spawn_sigint_watcher(shutdown.clone());

        loop {
            match listener.accept() {
                Ok(Some(conn)) => {
                    let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
                    self.client_count.fetch_add(1, Ordering::SeqCst);
                    self.spawn_worker(id, conn, shutdown.clone());
                }
                Ok(None) => {
                    info!("acceptor woken for shutdown");
                    return Ok(());
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                    return Err(e);
                }
            }
        }
    }

    fn spawn_worker(&self, id: u64, conn: Connection, shutdown: crate::transport::ShutdownHandle) {
        let registry = self.registry.clone();
        let opener = self.opener.clone();
        let client_count = self.client_count.clone();
        let temporary = self.config.temporary;

        std::thread::spawn(move || {
            debug!(connection_id = id, "client connected");
            run_client(id, conn, registry, opener);
            debug!(connection_id = id, "client disconnected");

            let remaining = client_count.fetch_sub(1, Ordering::SeqCst) - 1;
            if temporary && remaining == 0 {
                info!("temporary server: last client disconnected, shutting down");
                let _ = shutdown.trigger();
            }
        });
    }
}

/// One client's read-dispatch-write loop. Runs until the socket closes or a
/// transport error occurs.
fn run_client<D: HidDevice>(connection_id: u64, conn: Connection, registry: Arc<RegistryTable>, opener: Opener<D>) {
    let mut writer = match conn.try_clone() {
        Ok(w) => w,
        Err(e) => {
            error!(error = %e, "failed to clone connection for writing");
            return;
        }
    };
    let mut reader = BufReader::new(conn);
    let mut session: Session<D> = Session::new(connection_id, registry, opener);

    loop {
        let frame = match read_frame(&mut reader) {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                warn!(connection_id, error = %e, "malformed wire message");
                let reply = Frame::error("CommandError", e.to_string());
                if write_frame(&mut writer, &reply).is_err() {
                    break;
                }
                continue;
            }
        };

        let Frame::Request { command, params } = frame else {
            let reply = Frame::error("CommandError", "expected a request frame");
            if write_frame(&mut writer, &reply).is_err() {
                break;
            }
            continue;
        };

        let reply = match session.dispatch(&command, &params) {
            Ok(reply) => reply,
            Err(err) => encode_error(&err),
        };

        if write_frame(&mut writer, &reply).is_err() {
            break;
        }
    }

    session.close();
}

fn encode_error(err: &BrokerError) -> Frame {
    Frame::error(err.kind(), err.to_string())
}

/// Registers a SIGINT flag with the process and spawns a thread that polls
/// it, triggering `shutdown` the moment Ctrl-C arrives. The watcher thread is
/// left detached: it outlives `Server::run`'s caller only as long as the
/// process itself does, and exits on its own once shutdown has fired.
fn spawn_sigint_watcher(shutdown: crate::transport::ShutdownHandle) -> Option<std::thread::JoinHandle<()>> {
    let flag = Arc::new(AtomicBool::new(false));
    if let Err(e) = signal_hook::flag::register(signal::SIGINT, flag.clone()) {
        warn!(error = %e, "failed to install SIGINT handler; Ctrl-C will not shut the broker down cleanly");
        return None;
    }
    Some(std::thread::spawn(move || {
        while !flag.load(Ordering::Relaxed) {
            std::thread::sleep(std::time::Duration::from_millis(100));
        }
        info!("received SIGINT");
        let _ = shutdown.trigger();
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hid::mock::MockHidDevice;
    use serde_json::{json, Map};
    use std::io::Cursor;

    fn opener() -> Opener<MockHidDevice> {
        Arc::new(|_sel, _info| Ok(MockHidDevice::default()))
    }

    #[test]
    fn unknown_command_is_framed_as_a_command_error() {
        let registry = Arc::new(RegistryTable::new());
        let mut session: Session<MockHidDevice> = Session::new(1, registry, opener());
        let err = session.dispatch("nonsense", &Map::new()).unwrap_err();
        let frame = encode_error(&err);
        match frame {
            Frame::Error { kind, .. } => assert_eq!(kind, "CommandError"),
            _ => panic!("expected an error frame"),
        }
    }

    #[test]
    fn server_info_round_trips_through_the_dispatch_loop() {
        let registry = Arc::new(RegistryTable::new());
        let mut session: Session<MockHidDevice> = Session::new(1, registry, opener());
        let reply = session.dispatch("server_info", &Map::new()).unwrap();
        match reply {
            Frame::Response { response, fields } => {
                assert_eq!(response, "server_info");
                assert_eq!(fields.get("version"), Some(&json!(env!("CARGO_PKG_VERSION"))));
            }
            _ => panic!("expected a response frame"),
        }
    }

    #[test]
    fn malformed_line_produces_a_command_error_reply_not_a_crash() {
        let mut buf: Vec<u8> = Vec::new();
        let reply = Frame::error("CommandError", "malformed wire message: unexpected end of file");
        write_frame(&mut Cursor::new(&mut buf), &reply).unwrap();
        assert!(String::from_utf8(buf).unwrap().ends_with('\n'));
    }
}
