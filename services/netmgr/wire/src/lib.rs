//! DNS-over-TCP message framing for netmgr.
//!
//! Every message on a DNS stream transport (plain TCP or TLS) is preceded by
//! its length as a 16-bit big-endian integer. This crate provides the
//! encoder and a bounded reassembly buffer that turns a byte stream with
//! arbitrary read boundaries back into whole messages.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | u16 length (BE)      | length of the payload      |
//! +----------------------+----------------------------+
//! | payload              | 0..=65535 bytes            |
//! +----------------------+----------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod frame;

// Re-export main types
pub use error::WireError;
pub use frame::{
    encode_frame, peek_length, FrameBuffer, DEFAULT_RECV_CHUNK, LENGTH_PREFIX_SIZE,
    MAX_FRAME_SIZE, MAX_MESSAGE_SIZE,
};
