//! # ioq-core — leaf types for the ioq async I/O library
//!
//! This crate holds the pieces that do not depend on the ring: the raw
//! operation result type, the RAII file descriptor wrapper, IPv4 address
//! parsing and socket setup helpers, and the default logging sink.
//! Everything here is usable from any thread.

pub mod fd;
pub mod logging;
pub mod net;
pub mod result;

pub use fd::{Fd, Pipe};
pub use net::{IpAddress, IpAddressPort, SocketType};
pub use result::IoResult;
