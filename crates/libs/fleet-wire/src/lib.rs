//! # fleet-wire
//!
//! Wire format for the fleet RPC protocol.
//!
//! Each message is one UTF-8 JSON object per line over a TCP stream,
//! terminated by CRLF. This crate is the shared contract between every
//! service in the fleet — all of them must produce and consume identical
//! frames.
//!
//! ## Frame layout
//!
//! ```text
//! {"__id": "<hex token>", "__method": "<name>", "__params": [...]}\r\n
//! {"__id": "<hex token>", "__data": <any>, "__error": null}\r\n
//! ```
//!
//! A frame, including the trailing delimiter, never exceeds
//! [`MAX_FRAME_SIZE`] bytes. Oversized or non-delimited input is a fatal
//! protocol violation for the connection that produced it; this crate only
//! reports the error, the connection layer enforces the teardown.

pub mod wire;

pub use wire::{decode_value, encode_frame, random_id, Request, Response, WireError};

/// Frame delimiter: one message per CRLF-terminated line.
pub const DELIMITER: &[u8; 2] = b"\r\n";

/// Maximum encoded frame size in bytes, including the trailing delimiter.
pub const MAX_FRAME_SIZE: usize = 1_048_576;
