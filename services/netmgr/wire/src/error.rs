//! Wire framing error types.

use thiserror::Error;

/// Wire framing errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    /// Payload does not fit the 16-bit length prefix
    #[error("message too large: {0} bytes")]
    TooLarge(usize),

    /// Appending would exceed the reassembly buffer bound
    #[error("reassembly buffer full: {buffered} buffered + {incoming} incoming > {limit}")]
    BufferFull {
        /// Bytes already buffered
        buffered: usize,
        /// Bytes offered
        incoming: usize,
        /// Configured bound
        limit: usize,
    },
}
