// PSP PROXY — HOST I/O SINKS
// Consumer-provided endpoints for the stub's asynchronous output and for the
// stdin-style byte source pumped during code module execution. Sink failures
// never fail the engine.

/// Host-side I/O callbacks. All methods have no-op defaults; embedders
/// override what they care about.
pub trait HostIo {
    /// One complete log line from the stub, including the trailing newline.
    fn log_msg(&mut self, _line: &str) {}

    /// Bytes the stub pushed into one of its output buffers.
    fn out_buf_write(&mut self, _id_out_buf: u32, _data: &[u8]) {}

    /// How many bytes are waiting in the given host input source. Polled
    /// only while a code module is executing.
    fn in_buf_peek(&mut self, _id_in_buf: u32) -> usize {
        0
    }

    /// Pull bytes from the host input source; returns the number copied.
    fn in_buf_read(&mut self, _id_in_buf: u32, _buf: &mut [u8]) -> usize {
        0
    }
}

/// Sink that discards everything and feeds nothing.
pub struct NullHostIo;

impl HostIo for NullHostIo {}
