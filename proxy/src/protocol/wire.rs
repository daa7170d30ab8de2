// PSP PROXY — WIRE PROTOCOL
// Canonical definitions for the stub PDU on-wire format (padded variant).
// Header and footer are serialized field by field in little-endian order;
// the checksum never depends on in-memory struct layout.
// Every wire constant lives here and nowhere else.

use bytemuck::{Pod, Zeroable};
use std::mem;

// ============================================================================
// WIRE CONSTANTS
// ============================================================================

/// Start magic of a host → stub PDU.
pub const EXT_2_PSP_START_MAGIC: u32 = 0xC0DE_BA5E;
/// End magic of a host → stub PDU.
pub const EXT_2_PSP_END_MAGIC: u32 = 0xC0DE_BAE5;
/// Start magic of a stub → host PDU.
pub const PSP_2_EXT_START_MAGIC: u32 = 0xC0DE_BAB5;
/// End magic of a stub → host PDU.
pub const PSP_2_EXT_END_MAGIC: u32 = 0xC0DE_BA3B;

/// Size of the PDU header on the wire.
pub const PDU_HDR_SIZE: usize = 32;
/// Size of the PDU footer on the wire.
pub const PDU_FOOTER_SIZE: usize = 8;
/// Fixed per-frame overhead (header + footer).
pub const PDU_FRAME_OVERHEAD: usize = PDU_HDR_SIZE + PDU_FOOTER_SIZE;

/// Size of the receive buffer a frame must fit into.
pub const PDU_RECV_BUF_SIZE: usize = 4096;
/// Largest payload the receiver accepts (fills the buffer exactly when padded).
pub const PDU_PAYLOAD_MAX: usize = PDU_RECV_BUF_SIZE - PDU_FRAME_OVERHEAD;

/// Stub status code for a successful request.
pub const STS_SUCCESS: u32 = 0;

/// Payloads are zero-padded to a multiple of this on the wire.
pub const PDU_PAYLOAD_ALIGN: usize = 8;

/// Payload length including the trailing zero pad.
#[inline]
pub const fn padded_len(cb: usize) -> usize {
    (cb + PDU_PAYLOAD_ALIGN - 1) & !(PDU_PAYLOAD_ALIGN - 1)
}

// ============================================================================
// RRN IDENTIFIERS
// ============================================================================
// One enumeration partitioned into disjoint contiguous ranges. Every request
// has exactly one response id at REQUEST + RRN_RESPONSE_BIAS.

pub const RRN_REQUEST_FIRST: u32 = 0x0001;
pub const RRN_REQ_CONNECT: u32 = 0x0001;
pub const RRN_REQ_PSP_MEM_READ: u32 = 0x0002;
pub const RRN_REQ_PSP_MEM_WRITE: u32 = 0x0003;
pub const RRN_REQ_PSP_MMIO_READ: u32 = 0x0004;
pub const RRN_REQ_PSP_MMIO_WRITE: u32 = 0x0005;
pub const RRN_REQ_PSP_SMN_READ: u32 = 0x0006;
pub const RRN_REQ_PSP_SMN_WRITE: u32 = 0x0007;
pub const RRN_REQ_PSP_X86_MEM_READ: u32 = 0x0008;
pub const RRN_REQ_PSP_X86_MEM_WRITE: u32 = 0x0009;
pub const RRN_REQ_PSP_X86_MMIO_READ: u32 = 0x000A;
pub const RRN_REQ_PSP_X86_MMIO_WRITE: u32 = 0x000B;
pub const RRN_REQ_PSP_ADDR_XFER: u32 = 0x000C;
pub const RRN_REQ_PSP_COPROC_READ: u32 = 0x000D;
pub const RRN_REQ_PSP_COPROC_WRITE: u32 = 0x000E;
pub const RRN_REQ_PSP_BRANCH_TO: u32 = 0x000F;
pub const RRN_REQ_PSP_CODE_MOD_LOAD: u32 = 0x0010;
pub const RRN_REQ_PSP_CODE_MOD_EXEC: u32 = 0x0011;
pub const RRN_REQ_PSP_IN_BUF_WRITE: u32 = 0x0012;
pub const RRN_REQUEST_INVALID_FIRST: u32 = 0x0013;

/// Added to a request id to form its response id.
pub const RRN_RESPONSE_BIAS: u32 = 0x0100;
pub const RRN_RESPONSE_FIRST: u32 = RRN_REQUEST_FIRST + RRN_RESPONSE_BIAS;
pub const RRN_RESP_CONNECT: u32 = RRN_REQ_CONNECT + RRN_RESPONSE_BIAS;
pub const RRN_RESPONSE_INVALID_FIRST: u32 = RRN_REQUEST_INVALID_FIRST + RRN_RESPONSE_BIAS;

pub const RRN_NOTIFICATION_FIRST: u32 = 0x0201;
pub const RRN_NOT_LOG_MSG: u32 = 0x0201;
pub const RRN_NOT_OUT_BUF_WRITE: u32 = 0x0202;
pub const RRN_NOT_BEACON: u32 = 0x0203;
pub const RRN_NOT_IRQ_CHANGE: u32 = 0x0204;
pub const RRN_NOT_CODE_MOD_EXEC_FINISHED: u32 = 0x0205;
pub const RRN_NOTIFICATION_INVALID_FIRST: u32 = 0x0206;

/// Response id a request expects back.
#[inline]
pub const fn response_for(rrn_req: u32) -> u32 {
    rrn_req + RRN_RESPONSE_BIAS
}

#[inline]
pub const fn is_response_id(rrn: u32) -> bool {
    rrn >= RRN_RESPONSE_FIRST && rrn < RRN_RESPONSE_INVALID_FIRST
}

#[inline]
pub const fn is_notification_id(rrn: u32) -> bool {
    rrn >= RRN_NOTIFICATION_FIRST && rrn < RRN_NOTIFICATION_INVALID_FIRST
}

// ============================================================================
// PDU HEADER / FOOTER
// ============================================================================

/// PDU header. 32 bytes on wire, little-endian fields in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PduHdr {
    pub start_magic: u32,
    /// Payload length in bytes, excluding the zero pad.
    pub payload_len: u32,
    /// Monotonically increasing per direction, first PDU carries 1.
    pub pdu_counter: u32,
    pub rrn_id: u32,
    pub target_ccd: u32,
    /// Emitter-local timestamp, informational only.
    pub timestamp_ms: u32,
    /// 0 on requests, stub status on responses.
    pub request_rc: u32,
    pub reserved: u32,
}

impl PduHdr {
    /// Serialize in canonical wire order. The checksum is computed over these
    /// bytes, never over in-memory layout.
    pub fn to_wire(&self) -> [u8; PDU_HDR_SIZE] {
        let mut ab = [0u8; PDU_HDR_SIZE];
        let fields = [
            self.start_magic,
            self.payload_len,
            self.pdu_counter,
            self.rrn_id,
            self.target_ccd,
            self.timestamp_ms,
            self.request_rc,
            self.reserved,
        ];
        for (i, f) in fields.iter().enumerate() {
            ab[i * 4..i * 4 + 4].copy_from_slice(&f.to_le_bytes());
        }
        ab
    }

    pub fn from_wire(ab: &[u8; PDU_HDR_SIZE]) -> Self {
        let f = |i: usize| u32::from_le_bytes([ab[i * 4], ab[i * 4 + 1], ab[i * 4 + 2], ab[i * 4 + 3]]);
        PduHdr {
            start_magic: f(0),
            payload_len: f(1),
            pdu_counter: f(2),
            rrn_id: f(3),
            target_ccd: f(4),
            timestamp_ms: f(5),
            request_rc: f(6),
            reserved: f(7),
        }
    }
}

/// PDU footer. 8 bytes on wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PduFooter {
    /// Two's complement of the byte sum over header + payload + pad, so the
    /// total byte sum of the frame up to the footer wraps to zero.
    pub checksum: u32,
    pub end_magic: u32,
}

impl PduFooter {
    pub fn to_wire(&self) -> [u8; PDU_FOOTER_SIZE] {
        let mut ab = [0u8; PDU_FOOTER_SIZE];
        ab[0..4].copy_from_slice(&self.checksum.to_le_bytes());
        ab[4..8].copy_from_slice(&self.end_magic.to_le_bytes());
        ab
    }

    pub fn from_wire(ab: &[u8; PDU_FOOTER_SIZE]) -> Self {
        PduFooter {
            checksum: u32::from_le_bytes([ab[0], ab[1], ab[2], ab[3]]),
            end_magic: u32::from_le_bytes([ab[4], ab[5], ab[6], ab[7]]),
        }
    }
}

/// Wrapping byte sum over a sequence of byte slices.
#[inline]
pub fn byte_sum(parts: &[&[u8]]) -> u32 {
    let mut sum = 0u32;
    for part in parts {
        for &b in *part {
            sum = sum.wrapping_add(b as u32);
        }
    }
    sum
}

// ============================================================================
// REQUEST / RESPONSE / NOTIFICATION PAYLOADS
// ============================================================================
// Plain #[repr(C)] structs of u32/u64 fields with no interior padding. The
// frame-level zero pad brings any odd payload size up to the 8-byte wire
// alignment, so the structs carry no padding fields of their own.

/// ConnectResponse payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ConnectResp {
    /// Largest frame the stub accepts or emits.
    pub cb_pdu_max: u32,
    /// Base of the stub-reserved scratch region in PSP SRAM.
    pub psp_addr_scratch: u32,
    pub cb_scratch: u32,
    pub sys_sockets: u32,
    pub ccds_per_socket: u32,
}
const _: () = assert!(mem::size_of::<ConnectResp>() == 20);

/// Beacon notification payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct BeaconNot {
    /// Beacons emitted since the stub came up, monotonically increasing.
    pub beacons_sent: u32,
    pub reserved: u32,
}
const _: () = assert!(mem::size_of::<BeaconNot>() == 8);

/// Transfer request against PSP SRAM or PSP MMIO.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct PspMemXferReq {
    pub addr_start: u32,
    pub cb_xfer: u32,
}
const _: () = assert!(mem::size_of::<PspMemXferReq>() == 8);

/// Transfer request against an SMN register.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct SmnXferReq {
    pub smn_addr: u32,
    pub cb_xfer: u32,
}
const _: () = assert!(mem::size_of::<SmnXferReq>() == 8);

/// Transfer request against x86 physical memory or x86 MMIO.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct X86MemXferReq {
    pub phys_x86_start: u64,
    pub cb_xfer: u32,
    pub reserved: u32,
}
const _: () = assert!(mem::size_of::<X86MemXferReq>() == 16);

// Address space selectors for the generic transfer request.
pub const ADDR_SPACE_PSP_MEM: u32 = 0;
pub const ADDR_SPACE_PSP_MMIO: u32 = 1;
pub const ADDR_SPACE_SMN: u32 = 2;
pub const ADDR_SPACE_X86_MEM: u32 = 3;
pub const ADDR_SPACE_X86_MMIO: u32 = 4;

// x86 caching attribute bits carried in AddrXferReq.addr_flags.
pub const X86_ADDR_F_WRITEBACK: u32 = 0x1;
pub const X86_ADDR_F_WRITECOMBINE: u32 = 0x2;

// Generic transfer flags. Exactly one of READ/WRITE/MEMSET, INCR_ADDR optional.
pub const XFER_F_READ: u32 = 0x1;
pub const XFER_F_WRITE: u32 = 0x2;
pub const XFER_F_MEMSET: u32 = 0x4;
pub const XFER_F_INCR_ADDR: u32 = 0x8;
pub const XFER_F_VALID_MASK: u32 = XFER_F_READ | XFER_F_WRITE | XFER_F_MEMSET | XFER_F_INCR_ADDR;

/// Generic address transfer request, superset of the typed transfers.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct AddrXferReq {
    pub space: u32,
    /// x86 caching attributes; 0 for every other space.
    pub addr_flags: u32,
    pub addr: u64,
    pub flags: u32,
    /// Access width in bytes: 1, 2 or 4.
    pub stride: u32,
    pub cb_xfer: u32,
    pub reserved: u32,
}
const _: () = assert!(mem::size_of::<AddrXferReq>() == 32);

/// Coprocessor register access request. The value field is only meaningful
/// for writes; reads return the value as a 4-byte response payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CoProcRwReq {
    pub coproc: u32,
    pub crn: u32,
    pub crm: u32,
    pub opc1: u32,
    pub opc2: u32,
    pub val: u32,
    pub reserved: [u32; 2],
}
const _: () = assert!(mem::size_of::<CoProcRwReq>() == 32);

/// Branch-to request flag: enter the target in Thumb state.
pub const BRANCH_TO_F_THUMB: u32 = 0x1;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct BranchToReq {
    pub psp_addr_pc: u32,
    pub flags: u32,
}
const _: () = assert!(mem::size_of::<BranchToReq>() == 8);

/// Code module type: flat binary, entry point at load address.
pub const CODE_MOD_TYPE_FLAT: u32 = 0;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CodeModLoadReq {
    pub cm_type: u32,
    /// Total size of the module that follows via input-buffer writes.
    pub cb_cm: u32,
}
const _: () = assert!(mem::size_of::<CodeModLoadReq>() == 8);

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CodeModExecReq {
    /// Arguments handed to the module entry point in r0..r3.
    pub args: [u32; 4],
}
const _: () = assert!(mem::size_of::<CodeModExecReq>() == 16);

/// Sub-header preceding the data of an input-buffer write request.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct InBufWriteReq {
    pub id_in_buf: u32,
    pub reserved: u32,
}
const _: () = assert!(mem::size_of::<InBufWriteReq>() == 8);

/// Sub-header preceding the data of an output-buffer write notification.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct OutBufWriteNot {
    pub id_out_buf: u32,
    pub reserved: u32,
}
const _: () = assert!(mem::size_of::<OutBufWriteNot>() == 8);

// Interrupt line bits in IrqChangeNot.irq_cur.
pub const IRQ_CUR_F_IRQ: u32 = 0x1;
pub const IRQ_CUR_F_FIRQ: u32 = 0x2;

/// Interrupt state change notification; the CCD is named in the PDU header.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct IrqChangeNot {
    /// Lines currently asserted on the CCD.
    pub irq_cur: u32,
    pub reserved: u32,
}
const _: () = assert!(mem::size_of::<IrqChangeNot>() == 8);

/// Code module finished notification carrying the module's return value.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CodeModExecFinishedNot {
    pub cm_ret: u32,
    pub reserved: u32,
}
const _: () = assert!(mem::size_of::<CodeModExecFinishedNot>() == 8);

/// Parse a Pod payload struct from the leading bytes of a PDU payload.
/// Returns `None` when the payload is shorter than the struct.
pub fn payload_as<T: Pod>(payload: &[u8]) -> Option<T> {
    let cb = mem::size_of::<T>();
    if payload.len() < cb {
        return None;
    }
    Some(bytemuck::pod_read_unaligned(&payload[..cb]))
}
