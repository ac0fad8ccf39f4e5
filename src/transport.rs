//! Socket address parsing and the interruptible accept loop.
//!
//! Grounded on pyDAPLink's `server/server.py`, which listens on a Unix
//! domain socket or TCP depending on the address string. The acceptor is
//! interrupted the way that design note describes: rather than a platform
//! self-pipe, shutdown connects to the listener's own address, which
//! unblocks one pending `accept()`; the loop recognizes it via a shared flag
//! and exits instead of spawning a worker for it.

use std::io;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
#[cfg(unix)]
use std::os::unix::net::{UnixListener, UnixStream};

/// The default Unix domain socket path.
pub const DEFAULT_UNIX_PATH: &str = "/tmp/dap-broker.sock";
/// The default TCP bind address.
pub const DEFAULT_TCP_ADDR: &str = "localhost:4116";

/// One inbound connection, regardless of the address family it arrived on.
pub enum Connection {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Connection {
    /// A second handle to the same underlying socket, so a session can read
    /// and write through independent `BufReader`/raw-writer halves.
    pub fn try_clone(&self) -> io::Result<Connection> {
        match self {
            Connection::Tcp(s) => Ok(Connection::Tcp(s.try_clone()?)),
            #[cfg(unix)]
            Connection::Unix(s) => Ok(Connection::Unix(s.try_clone()?)),
        }
    }
}

impl io::Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Connection::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            Connection::Unix(s) => s.read(buf),
        }
    }
}

impl io::Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Connection::Tcp(s) => s.write(buf),
            #[cfg(unix)]
            Connection::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Connection::Tcp(s) => s.flush(),
            #[cfg(unix)]
            Connection::Unix(s) => s.flush(),
        }
    }
}

/// A parsed bind target: either a filesystem path for a Unix domain socket,
/// or a `host:port` pair for TCP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Unix(String),
    Tcp(String),
}

impl Address {
    /// An address with a leading `/` is a filesystem path; anything else
    /// (a bare `host:port`, or a hostname with no slashes) is TCP. This
    /// mirrors the common case of a Unix socket path always being absolute
    /// on the platforms this crate targets.
    pub fn parse(raw: &str) -> Self {
        if raw.starts_with('/') {
            Address::Unix(raw.to_string())
        } else {
            Address::Tcp(raw.to_string())
        }
    }
}

impl Default for Address {
    fn default() -> Self {
        Address::Unix(DEFAULT_UNIX_PATH.to_string())
    }
}

enum ListenerInner {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

/// A bound listener for either address family, with a shutdown switch the
/// acceptor loop checks each time `accept()` returns.
pub struct Listener {
    inner: ListenerInner,
    address: Address,
    shutting_down: Arc<AtomicBool>,
}

impl Listener {
    pub fn bind(address: Address) -> io::Result<Self> {
        let (inner, address) = match &address {
            // Store the OS-resolved address (port 0 becomes whatever port
            // the kernel actually picked), since that's the address the
            // shutdown self-pipe has to reconnect to.
            Address::Tcp(addr) => {
                let listener = TcpListener::bind(addr)?;
                let resolved = Address::Tcp(listener.local_addr()?.to_string());
                (ListenerInner::Tcp(listener), resolved)
            }
            #[cfg(unix)]
            Address::Unix(path) => {
                let _ = std::fs::remove_file(path);
                (ListenerInner::Unix(UnixListener::bind(path)?), address)
            }
        };
        Ok(Self {
            inner,
            address,
            shutting_down: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Block for the next inbound connection. Returns `Ok(None)` once
    /// shutdown has been triggered and this call was woken by the self-pipe
    /// connection rather than a real client.
    pub fn accept(&self) -> io::Result<Option<Connection>> {
        let conn = match &self.inner {
            ListenerInner::Tcp(listener) => Connection::Tcp(listener.accept()?.0),
            #[cfg(unix)]
            ListenerInner::Unix(listener) => Connection::Unix(listener.accept()?.0),
        };
        if self.shutting_down.load(Ordering::Acquire) {
            return Ok(None);
        }
        Ok(Some(conn))
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            address: self.address.clone(),
            shutting_down: self.shutting_down.clone(),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Address::Unix(path) = &self.address {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Wakes a blocked `accept()` and marks the listener as shutting down.
#[derive(Clone)]
pub struct ShutdownHandle {
    address: Address,
    shutting_down: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn trigger(&self) -> io::Result<()> {
        self.shutting_down.store(true, Ordering::Release);
        match &self.address {
            Address::Tcp(addr) => {
                TcpStream::connect(addr)?;
            }
            #[cfg(unix)]
            Address::Unix(path) => {
                UnixStream::connect(path)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leading_slash_is_treated_as_a_unix_path() {
        assert_eq!(Address::parse("/tmp/dap-broker.sock"), Address::Unix("/tmp/dap-broker.sock".into()));
    }

    #[test]
    fn host_port_without_a_leading_slash_is_tcp() {
        assert_eq!(Address::parse("localhost:4116"), Address::Tcp("localhost:4116".into()));
        assert_eq!(Address::parse("0.0.0.0:4116"), Address::Tcp("0.0.0.0:4116".into()));
    }

    #[test]
    fn default_address_is_the_well_known_unix_path() {
        assert_eq!(Address::default(), Address::Unix(DEFAULT_UNIX_PATH.to_string()));
    }

    #[test]
    fn shutdown_wakes_a_blocked_accept_with_none() {
        let listener = Listener::bind(Address::Tcp("127.0.0.1:0".into())).unwrap();
        let shutdown = listener.shutdown_handle();

        let accept_thread = std::thread::spawn(move || listener.accept());
        std::thread::sleep(std::time::Duration::from_millis(20));
        shutdown.trigger().unwrap();

        let result = accept_thread.join().unwrap().unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn shutdown_handle_reconnects_to_the_os_assigned_port_not_port_zero() {
        let listener = Listener::bind(Address::Tcp("127.0.0.1:0".into())).unwrap();
        let handle = listener.shutdown_handle();
        assert_ne!(handle.address, Address::Tcp("127.0.0.1:0".into()));
    }

    #[test]
    fn real_client_connections_are_returned_while_running() {
        let listener = Listener::bind(Address::Tcp("127.0.0.1:0".into())).unwrap();
        let addr = match &listener.inner {
            ListenerInner::Tcp(l) => l.local_addr().unwrap(),
            #[cfg(unix)]
            ListenerInner::Unix(_) => unreachable!(),
        };

        let accept_thread = std::thread::spawn(move || listener.accept());
        std::thread::sleep(std::time::Duration::from_millis(20));
        let _client = TcpStream::connect(addr).unwrap();

        let result = accept_thread.join().unwrap().unwrap();
        assert!(result.is_some());
    }
}
