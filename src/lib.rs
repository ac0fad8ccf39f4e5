//! `dap-broker`: a multi-client broker for CMSIS-DAP debug probes.
//!
//! A small number of blocking OS threads (one acceptor, one per connected
//! client) multiplex socket-connected clients over a shared pool of
//! USB-HID-attached ARM debug probes, serializing access to each physical
//! probe and batching SWD/JTAG transfers into CMSIS-DAP USB packets.
//!
//! [`engine`] is the debug-port protocol engine; [`server`] and [`session`]
//! are the broker side of the wire protocol defined in [`wire`]; [`client`]
//! is a thin stub for talking to a running broker.

pub mod client;
pub mod dap;
pub mod engine;
pub mod error;
pub mod hid;
pub mod registry;
pub mod server;
pub mod session;
pub mod transport;
pub mod wire;
