// PSP PROXY — ERROR TAXONOMY
// Transport failures are fatal for the engine that saw them. Protocol
// violations are recoverable only by tearing the session down.

use std::io;
use thiserror::Error;

/// Result type for all proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Errors surfaced by the proxy library.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// I/O on the underlying channel failed. The engine is henceforth unusable.
    #[error("transport failure: {0}")]
    Transport(#[from] io::Error),

    /// A poll deadline elapsed with no data.
    #[error("operation timed out")]
    Timeout,

    /// Header/footer validation failed, the PDU counter skewed, an unexpected
    /// RRN arrived, or a response payload did not match the expected size.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A beacon counter out of sequence: the stub resumed from reset. The
    /// engine latches this and fails every subsequent operation.
    #[error("peer reset detected (beacon counter out of sequence)")]
    PeerReset,

    /// The stub accepted the request but returned a non-success status.
    #[error("request rejected by stub (rc={rc:#010x})")]
    RequestFailed { rc: u32 },

    /// The caller-side facade rejected the inputs.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Unknown scheme in a device URI.
    #[error("no such provider: {0}")]
    NoSuchProvider(String),

    /// A device URI that does not parse for its scheme.
    #[error("malformed device URI: {0}")]
    InvalidDeviceUri(String),

    /// The transport does not implement the requested operation.
    #[error("operation not supported by this transport")]
    Unsupported,

    /// An operation that requires an established session was called before
    /// the connect handshake completed.
    #[error("not connected")]
    NotConnected,

    /// The PSP-side scratch region has no chunk large enough.
    #[error("scratch region exhausted")]
    ScratchExhausted,
}
