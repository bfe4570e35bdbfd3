//! Shared library for the tunnel broker — line-framed protocol helpers and
//! the timeout/constant budget the broker and its tests agree on.
//!
//! This crate has no knowledge of the Store, the Registry, or the Tunnel
//! state machine; it only knows how to read and write the ASCII lines the
//! control protocol is built from.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod protocol;
pub mod timeouts;

pub use protocol::{
    format_conn_id, format_connect, format_error, format_success, parse_data_line, read_line,
    write_line, FramingError, CONTROL_PORT, MAX_LINE_BYTES,
};
pub use timeouts::{PAIRING_TIMEOUT, STALE_SESSION_THRESHOLD};
