// PSP PROXY — CRATE ROOT (LIBRARY)
// Userspace side of the PSP remote debug stub: typed operations against PSP
// SRAM/MMIO, SMN and x86 memory, carried as checksummed PDUs over a byte
// transport (TCP socket, raw serial line, or ring buffers embedded in a SPI
// flash emulator image).
//
// Module hierarchy:
//   protocol/  — wire format, frame emitter, receive state machine
//   transport/ — Transport trait + tcp / serial / em100 flash backends
//   engine/    — PDU engine: handshake, correlator, notifications, chunking
//   proxy      — typed facade and device URI entry point
//   scratch    — free-list allocator over the stub's scratch region
//   hostio     — embedder-provided sinks for log/output/input traffic

pub mod engine;
pub mod error;
pub mod hostio;
pub mod protocol;
pub mod proxy;
pub mod scratch;
pub mod transport;

#[cfg(test)]
pub(crate) mod testutil;

pub use engine::irq::IrqEvent;
pub use engine::{PduEngine, SessionInfo, XferData};
pub use error::{ProxyError, Result};
pub use hostio::{HostIo, NullHostIo};
pub use protocol::wire::{
    BRANCH_TO_F_THUMB, X86_ADDR_F_WRITEBACK, X86_ADDR_F_WRITECOMBINE, XFER_F_INCR_ADDR,
    XFER_F_MEMSET, XFER_F_READ, XFER_F_WRITE,
};
pub use proxy::{PspAddress, PspProxy};
pub use transport::{Interrupter, PollOutcome, Transport};
