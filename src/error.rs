//! Error types for every fallible layer of the broker, from the raw HID
//! transport up to the commands a client sends over the wire.

use std::fmt;

use thiserror::Error;

/// Failures opening or exchanging reports with a HID-attached probe.
#[derive(Debug, Error)]
pub enum HidError {
    #[error("no probe matched vid={vid:04x} pid={pid:04x} path={path}")]
    NotFound { vid: u16, pid: u16, path: String },
    #[error("hid transport error")]
    Backend(#[from] hidapi::HidError),
}

/// The ACK field of a DAP_Transfer / DAP_TransferBlock response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Ok,
    Wait,
    Fault,
    NoAck,
    Protocol,
}

impl fmt::Display for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Ack::Ok => "OK",
            Ack::Wait => "WAIT",
            Ack::Fault => "FAULT",
            Ack::NoAck => "NO_ACK",
            Ack::Protocol => "PROTOCOL_ERROR",
        };
        f.write_str(s)
    }
}

/// A sticky failure reported by the target debug bus while executing a
/// batched DAP_Transfer or DAP_TransferBlock.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("transfer error: ack={ack} executed {executed} of {requested} transfers")]
pub struct TransferError {
    pub ack: Ack,
    pub executed: usize,
    pub requested: usize,
}

/// Failures encoding/decoding CMSIS-DAP command packets, or raised by the
/// probe while executing one.
#[derive(Debug, Error)]
pub enum CmsisDapError {
    #[error("unexpected answer to command {command:#04x}: probe replied with {got:#04x}")]
    UnexpectedAnswer { command: u8, got: u8 },
    #[error("probe response was shorter than expected")]
    NotEnoughData,
    #[error("probe does not support SWD or JTAG")]
    NoSupportedProtocol,
    #[error("dap_info request {0:?} is not recognized")]
    UnknownInfoId(crate::dap::commands::DapInfoId),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Hid(#[from] HidError),
}

/// Failures from the debug-port engine: state-machine violations or a
/// `TransferError` bubbled up from the codec.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine is not connected; call dap_init first")]
    NotConnected,
    #[error("engine is already connected")]
    AlreadyConnected,
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Probe(#[from] CmsisDapError),
}

/// Caller-side protocol violations: unknown commands, bad arguments, or a
/// command issued while the session is in the wrong state.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    #[error("missing required field {0:?}")]
    MissingField(&'static str),
    #[error("field {field:?} has the wrong type")]
    BadFieldType { field: &'static str },
    #[error("no probe is selected on this connection")]
    NoProbeSelected,
    #[error("the debug engine has not been initialized; call dap_init first")]
    EngineNotInitialized,
    #[error("probe id {0} is not known to this selection")]
    UnknownProbeId(u16),
    #[error("dap_info request {0:?} is not recognized")]
    UnknownInfoId(String),
}

/// Every error kind that can be written across the wire in an `error` frame.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Hid(#[from] HidError),
    #[error("{0}")]
    Other(String),
}

impl BrokerError {
    /// The symbolic `ErrorKind` name placed in the wire `error` field.
    pub fn kind(&self) -> &'static str {
        match self {
            BrokerError::Command(_) => "CommandError",
            BrokerError::Transfer(_) => "TransferError",
            BrokerError::Engine(EngineError::Transfer(_)) => "TransferError",
            BrokerError::Engine(EngineError::Probe(CmsisDapError::Transfer(_))) => "TransferError",
            BrokerError::Engine(EngineError::Probe(CmsisDapError::Hid(_))) => "HidError",
            BrokerError::Engine(_) => "CommandError",
            BrokerError::Hid(_) => "HidError",
            BrokerError::Other(_) => "ServerError",
        }
    }
}

/// Errors raised by the client stub: a mirror of the wire error taxonomy
/// plus local transport failures.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("could not reach the broker: {0}")]
    Connect(#[from] std::io::Error),
    #[error("the broker closed the connection")]
    Disconnected,
    #[error("malformed wire message: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("command error: {0}")]
    Command(String),
    #[error("transfer error: {0}")]
    Transfer(String),
    #[error("server error ({kind}): {message}")]
    Server { kind: String, message: String },
}
