//! NWRC echo server.
//!
//! Thin application layer over `nwrc-core`:
//! - [`echo`]: the Echo protocol group and a client helper
//! - [`cert`]: PEM loading and self-signed certificates for TLS
//! - [`cli`]: `serve` and `ping` subcommands

pub mod cert;
pub mod cli;
pub mod echo;

pub use echo::{ECHO_PROTOCOL_NAME, EchoGroup, echo};
