//! The CMSIS-DAP command layer: encoding/decoding the USB packets a probe
//! speaks, independent of the debug-port semantics built on top in
//! [`crate::engine`].

pub mod commands;

pub use commands::{Codec, DapInfoId, DapInfoValue, TransferItem, WireProtocol};
