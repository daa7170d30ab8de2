// PSP PROXY — PDU ENGINE
// Owns the transport, the framer, both PDU counters and the session state.
// Single-threaded cooperative: every blocking wait happens inside the recv
// loop below, nowhere else. Requests are strictly serialized; notifications
// that interleave with a response are dispatched from the same loop.
//
// A beacon counter out of sequence marks the engine permanently failed. The
// session data stays readable, but every operation from that point returns
// PeerReset until the embedder tears the engine down.

pub mod clock;
pub mod irq;
pub mod logbuf;

use std::mem;

use bytemuck::bytes_of;
use log::{debug, warn};

use crate::engine::clock::{clock_ms, Deadline};
use crate::engine::irq::{IrqEvent, IrqTable, IRQ_MAX_CCDS};
use crate::engine::logbuf::LogLineBuffer;
use crate::error::{ProxyError, Result};
use crate::hostio::HostIo;
use crate::protocol::framer::{emit_pdu, FrameDecoder, PduFrame};
use crate::protocol::wire::*;
use crate::transport::{PollOutcome, Transport};

/// Input buffer the code-module runloop pumps host bytes into.
const DEFAULT_IN_BUF: u32 = 0;
/// Poll granularity of the exec runloop.
const EXEC_POLL_MS: u32 = 1;
/// Largest slice pulled from the host input source per runloop turn; the
/// stub posts its input-buffer reads in this granularity too.
const IN_BUF_SLICE: usize = 512;
/// Smallest maximum-PDU-size a stub may sanely advertise.
const CB_PDU_MAX_MIN: u32 = 128;

/// Session parameters learned from the ConnectResponse.
#[derive(Debug, Clone, Copy)]
pub struct SessionInfo {
    pub cb_pdu_max: u32,
    pub psp_addr_scratch: u32,
    pub cb_scratch: u32,
    pub sys_sockets: u32,
    pub ccds_per_socket: u32,
    pub ccd_count: u32,
    beacons_seen: u32,
}

enum SessionState {
    Disconnected,
    Connected(SessionInfo),
}

/// Remote address for the typed transfer operations.
#[derive(Debug, Clone, Copy)]
pub enum XferAddr {
    /// PSP SRAM or PSP MMIO, selected by the request id.
    Psp(u32),
    Smn(u32),
    /// x86 physical memory or x86 MMIO, selected by the request id.
    X86(u64),
}

impl XferAddr {
    fn req_size(&self) -> usize {
        match self {
            XferAddr::Psp(_) => mem::size_of::<PspMemXferReq>(),
            XferAddr::Smn(_) => mem::size_of::<SmnXferReq>(),
            XferAddr::X86(_) => mem::size_of::<X86MemXferReq>(),
        }
    }

    fn encode(&self, cb_xfer: u32) -> Vec<u8> {
        match *self {
            XferAddr::Psp(addr_start) => {
                bytes_of(&PspMemXferReq { addr_start, cb_xfer }).to_vec()
            }
            XferAddr::Smn(smn_addr) => bytes_of(&SmnXferReq { smn_addr, cb_xfer }).to_vec(),
            XferAddr::X86(phys_x86_start) => {
                bytes_of(&X86MemXferReq { phys_x86_start, cb_xfer, reserved: 0 }).to_vec()
            }
        }
    }

    fn advance(&mut self, cb: u32) {
        match self {
            XferAddr::Psp(a) => *a = a.wrapping_add(cb),
            XferAddr::Smn(a) => *a = a.wrapping_add(cb),
            XferAddr::X86(a) => *a = a.wrapping_add(cb as u64),
        }
    }
}

/// Data argument of the generic address transfer.
pub enum XferData<'a> {
    Read(&'a mut [u8]),
    Write(&'a [u8]),
    /// `pattern` is exactly one stride; `cb_xfer` bytes get set remotely.
    Memset { pattern: &'a [u8], cb_xfer: u32 },
}

pub struct PduEngine {
    xport: Box<dyn Transport>,
    io: Box<dyn HostIo>,
    dec: FrameDecoder,
    session: SessionState,
    /// Outbound PDUs emitted; the counter field of PDU N is N.
    pdus_sent: u32,
    /// Status code of the most recent response, success or not.
    rc_req_last: u32,
    peer_reset: bool,
    /// Return value stashed when an ExecFinished notification arrives while
    /// some other wait is in progress.
    exec_finished: Option<u32>,
    logbuf: LogLineBuffer,
    irq: IrqTable,
    epoch_ms: u64,
}

impl PduEngine {
    pub fn new(xport: Box<dyn Transport>, io: Box<dyn HostIo>) -> Self {
        PduEngine {
            xport,
            io,
            dec: FrameDecoder::new(),
            session: SessionState::Disconnected,
            pdus_sent: 0,
            rc_req_last: STS_SUCCESS,
            peer_reset: false,
            exec_finished: None,
            logbuf: LogLineBuffer::new(),
            irq: IrqTable::new(),
            epoch_ms: clock_ms(),
        }
    }

    /// Session parameters; an error before the handshake completed.
    pub fn session(&self) -> Result<&SessionInfo> {
        match &self.session {
            SessionState::Connected(info) => Ok(info),
            SessionState::Disconnected => Err(ProxyError::NotConnected),
        }
    }

    /// Scratch region advertised by the stub during connect.
    pub fn query_info(&self) -> Result<(u32, u32)> {
        let info = self.session()?;
        Ok((info.psp_addr_scratch, info.cb_scratch))
    }

    /// Stub status of the most recent request, success or failure.
    pub fn last_request_rc(&self) -> u32 {
        self.rc_req_last
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.peer_reset {
            return Err(ProxyError::PeerReset);
        }
        Ok(())
    }

    fn elapsed_ms(&self) -> u32 {
        (clock_ms() - self.epoch_ms) as u32
    }

    // ========================================================================
    // CONNECT HANDSHAKE
    // ========================================================================

    /// Wait for a beacon, then trade a ConnectRequest for the stub's
    /// topology. Transitions to Connected exactly once.
    pub fn connect(&mut self, ms: u32) -> Result<()> {
        self.ensure_usable()?;
        if matches!(self.session, SessionState::Connected(_)) {
            return Err(ProxyError::InvalidArgument("already connected"));
        }
        let deadline = Deadline::after(ms);

        let frame = self.recv_expected(RRN_NOT_BEACON, &deadline)?;
        if frame.payload.len() != mem::size_of::<BeaconNot>() {
            return Err(ProxyError::Protocol("beacon payload size mismatch".into()));
        }
        let beacon: BeaconNot = payload_as(&frame.payload).unwrap();
        let beacons_seen = beacon.beacons_sent;

        self.send_pdu(0, RRN_REQ_CONNECT, &[])?;
        let frame = self.recv_expected(RRN_RESP_CONNECT, &deadline)?;
        self.rc_req_last = frame.hdr.request_rc;
        if frame.hdr.request_rc != STS_SUCCESS {
            return Err(ProxyError::RequestFailed { rc: frame.hdr.request_rc });
        }
        if frame.payload.len() != mem::size_of::<ConnectResp>() {
            return Err(ProxyError::Protocol("connect response size mismatch".into()));
        }
        let resp: ConnectResp = payload_as(&frame.payload).unwrap();

        let ccd_count = resp.sys_sockets.saturating_mul(resp.ccds_per_socket);
        if ccd_count == 0 || ccd_count as usize > IRQ_MAX_CCDS {
            return Err(ProxyError::Protocol(format!(
                "implausible topology: {} sockets x {} ccds",
                resp.sys_sockets, resp.ccds_per_socket
            )));
        }
        if resp.cb_pdu_max < CB_PDU_MAX_MIN {
            return Err(ProxyError::Protocol(format!(
                "stub advertised cb_pdu_max {} below the workable minimum",
                resp.cb_pdu_max
            )));
        }

        // The stub restarts its outbound numbering with the session: the
        // first post-connect inbound PDU carries counter 1.
        self.dec.session_established(ccd_count);
        self.session = SessionState::Connected(SessionInfo {
            cb_pdu_max: resp.cb_pdu_max,
            psp_addr_scratch: resp.psp_addr_scratch,
            cb_scratch: resp.cb_scratch,
            sys_sockets: resp.sys_sockets,
            ccds_per_socket: resp.ccds_per_socket,
            ccd_count,
            beacons_seen,
        });
        debug!(
            "connected: cb_pdu_max={} scratch={:#010x}+{:#x} topology={}x{}",
            resp.cb_pdu_max, resp.psp_addr_scratch, resp.cb_scratch, resp.sys_sockets,
            resp.ccds_per_socket
        );
        Ok(())
    }

    // ========================================================================
    // SEND / RECEIVE CORE
    // ========================================================================

    fn send_pdu(&mut self, ccd: u32, rrn: u32, payload: &[u8]) -> Result<()> {
        self.pdus_sent += 1;
        let elapsed_ms = self.elapsed_ms();
        emit_pdu(self.xport.as_mut(), self.pdus_sent, ccd, rrn, elapsed_ms, payload)
    }

    /// Pull bytes until the framer yields one complete valid frame.
    fn recv_frame(&mut self, deadline: &Deadline) -> Result<PduFrame> {
        let mut ab = [0u8; PDU_RECV_BUF_SIZE];
        loop {
            let Some(remaining) = deadline.remaining_ms() else {
                return Err(ProxyError::Timeout);
            };
            match self.xport.poll(remaining)? {
                PollOutcome::TimedOut => return Err(ProxyError::Timeout),
                PollOutcome::Ready => {}
            }
            // Peek is a hint; a conservative zero still forces a one-byte
            // read so a closed link surfaces instead of spinning.
            let avail = self.xport.peek().max(1);
            let want = self.dec.want().min(avail);
            let cb = self.xport.read(&mut ab[..want])?;
            if cb == 0 {
                continue;
            }
            if let Some(frame) = self.dec.feed(&ab[..cb])? {
                return Ok(frame);
            }
        }
    }

    /// Receive until a frame with the wanted id arrives; everything else must
    /// be a notification and is dispatched in place.
    fn recv_expected(&mut self, rrn: u32, deadline: &Deadline) -> Result<PduFrame> {
        loop {
            let frame = self.recv_frame(deadline)?;
            if frame.hdr.rrn_id == rrn {
                return Ok(frame);
            }
            self.dispatch_notification(frame)?;
        }
    }

    fn dispatch_notification(&mut self, frame: PduFrame) -> Result<()> {
        match frame.hdr.rrn_id {
            RRN_NOT_LOG_MSG => {
                self.logbuf.feed(&frame.payload, &mut *self.io);
                Ok(())
            }
            RRN_NOT_OUT_BUF_WRITE => {
                let sub: OutBufWriteNot = payload_as(&frame.payload)
                    .ok_or_else(|| ProxyError::Protocol("short out-buf notification".into()))?;
                let off = mem::size_of::<OutBufWriteNot>();
                self.io.out_buf_write(sub.id_out_buf, &frame.payload[off..]);
                Ok(())
            }
            RRN_NOT_IRQ_CHANGE => {
                let sub: IrqChangeNot = payload_as(&frame.payload)
                    .ok_or_else(|| ProxyError::Protocol("short irq notification".into()))?;
                self.irq.update(frame.hdr.target_ccd, sub.irq_cur);
                Ok(())
            }
            RRN_NOT_BEACON => {
                let sub: BeaconNot = payload_as(&frame.payload)
                    .ok_or_else(|| ProxyError::Protocol("short beacon".into()))?;
                self.note_beacon(sub.beacons_sent)
            }
            RRN_NOT_CODE_MOD_EXEC_FINISHED => {
                let sub: CodeModExecFinishedNot = payload_as(&frame.payload)
                    .ok_or_else(|| ProxyError::Protocol("short exec-finished".into()))?;
                self.exec_finished = Some(sub.cm_ret);
                Ok(())
            }
            other => Err(ProxyError::Protocol(format!(
                "unexpected pdu id {other:#06x} in response wait"
            ))),
        }
    }

    /// Beacons must arrive in sequence once connected; anything else means
    /// the stub came back from reset and this engine is done for.
    fn note_beacon(&mut self, beacons_sent: u32) -> Result<()> {
        match &mut self.session {
            SessionState::Disconnected => Ok(()),
            SessionState::Connected(info) => {
                if beacons_sent == info.beacons_seen.wrapping_add(1) {
                    info.beacons_seen = beacons_sent;
                    Ok(())
                } else {
                    warn!(
                        "beacon counter skew ({} seen, {} announced): peer reset",
                        info.beacons_seen, beacons_sent
                    );
                    self.peer_reset = true;
                    Err(ProxyError::PeerReset)
                }
            }
        }
    }

    /// Single-shot request/response with strict response size checking.
    fn req_resp(
        &mut self,
        ccd: u32,
        rrn_req: u32,
        payload: &[u8],
        cb_resp: usize,
        deadline: &Deadline,
    ) -> Result<Vec<u8>> {
        self.ensure_usable()?;
        self.send_pdu(ccd, rrn_req, payload)?;
        let frame = self.recv_expected(response_for(rrn_req), deadline)?;
        self.rc_req_last = frame.hdr.request_rc;
        if frame.hdr.request_rc != STS_SUCCESS {
            return Err(ProxyError::RequestFailed { rc: frame.hdr.request_rc });
        }
        if frame.payload.len() != cb_resp {
            return Err(ProxyError::Protocol(format!(
                "response payload size mismatch: got {}, expected {}",
                frame.payload.len(),
                cb_resp
            )));
        }
        Ok(frame.payload)
    }

    // ========================================================================
    // TRANSFERS
    // ========================================================================

    /// Payload room of one request frame after the given request struct.
    fn chunk_cap(&self, cb_req: usize) -> Result<usize> {
        let info = self.session()?;
        let cb_frame = info.cb_pdu_max.min(PDU_RECV_BUF_SIZE as u32) as usize;
        Ok(cb_frame - PDU_FRAME_OVERHEAD - cb_req)
    }

    /// Read transfer, transparently split against the peer's maximum PDU
    /// size. The per-call timeout restarts at each chunk.
    pub fn xfer_read(
        &mut self,
        ccd: u32,
        rrn_req: u32,
        mut addr: XferAddr,
        buf: &mut [u8],
        ms: u32,
    ) -> Result<()> {
        let cap = self.chunk_cap(addr.req_size())?;
        for chunk in buf.chunks_mut(cap) {
            let req = addr.encode(chunk.len() as u32);
            let deadline = Deadline::after(ms);
            let resp = self.req_resp(ccd, rrn_req, &req, chunk.len(), &deadline)?;
            chunk.copy_from_slice(&resp);
            addr.advance(chunk.len() as u32);
        }
        Ok(())
    }

    /// Write transfer; request struct and bulk data travel as one payload.
    pub fn xfer_write(
        &mut self,
        ccd: u32,
        rrn_req: u32,
        mut addr: XferAddr,
        data: &[u8],
        ms: u32,
    ) -> Result<()> {
        let cap = self.chunk_cap(addr.req_size())?;
        for chunk in data.chunks(cap) {
            let mut payload = addr.encode(chunk.len() as u32);
            payload.extend_from_slice(chunk);
            let deadline = Deadline::after(ms);
            self.req_resp(ccd, rrn_req, &payload, 0, &deadline)?;
            addr.advance(chunk.len() as u32);
        }
        Ok(())
    }

    /// Generic address transfer. The facade has already validated the flag
    /// and stride combinations; chunking preserves the request semantics.
    pub fn addr_xfer(
        &mut self,
        ccd: u32,
        space: u32,
        addr_flags: u32,
        addr: u64,
        stride: u32,
        incr_addr: bool,
        data: XferData<'_>,
        ms: u32,
    ) -> Result<()> {
        let cap = self.chunk_cap(mem::size_of::<AddrXferReq>())?;
        let cap = cap - cap % stride as usize;
        let incr = if incr_addr { XFER_F_INCR_ADDR } else { 0 };
        let mut addr = addr;

        let mut req = AddrXferReq {
            space,
            addr_flags,
            addr,
            flags: 0,
            stride,
            cb_xfer: 0,
            reserved: 0,
        };

        match data {
            XferData::Read(buf) => {
                for chunk in buf.chunks_mut(cap) {
                    req.addr = addr;
                    req.flags = XFER_F_READ | incr;
                    req.cb_xfer = chunk.len() as u32;
                    let deadline = Deadline::after(ms);
                    let resp =
                        self.req_resp(ccd, RRN_REQ_PSP_ADDR_XFER, bytes_of(&req), chunk.len(), &deadline)?;
                    chunk.copy_from_slice(&resp);
                    if incr_addr {
                        addr = addr.wrapping_add(chunk.len() as u64);
                    }
                }
            }
            XferData::Write(data) => {
                for chunk in data.chunks(cap) {
                    req.addr = addr;
                    req.flags = XFER_F_WRITE | incr;
                    req.cb_xfer = chunk.len() as u32;
                    let mut payload = bytes_of(&req).to_vec();
                    payload.extend_from_slice(chunk);
                    let deadline = Deadline::after(ms);
                    self.req_resp(ccd, RRN_REQ_PSP_ADDR_XFER, &payload, 0, &deadline)?;
                    if incr_addr {
                        addr = addr.wrapping_add(chunk.len() as u64);
                    }
                }
            }
            XferData::Memset { pattern, cb_xfer } => {
                debug_assert_eq!(pattern.len(), stride as usize);
                let mut remaining = cb_xfer as usize;
                while remaining != 0 {
                    let cb = remaining.min(cap);
                    req.addr = addr;
                    req.flags = XFER_F_MEMSET | incr;
                    req.cb_xfer = cb as u32;
                    // The fill pattern is one stride no matter how much the
                    // request covers; it is never advanced.
                    let mut payload = bytes_of(&req).to_vec();
                    payload.extend_from_slice(pattern);
                    let deadline = Deadline::after(ms);
                    self.req_resp(ccd, RRN_REQ_PSP_ADDR_XFER, &payload, 0, &deadline)?;
                    remaining -= cb;
                    if incr_addr {
                        addr = addr.wrapping_add(cb as u64);
                    }
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // COPROCESSOR / BRANCH
    // ========================================================================

    pub fn coproc_read(
        &mut self,
        ccd: u32,
        coproc: u32,
        crn: u32,
        crm: u32,
        opc1: u32,
        opc2: u32,
        ms: u32,
    ) -> Result<u32> {
        let req = CoProcRwReq { coproc, crn, crm, opc1, opc2, val: 0, reserved: [0; 2] };
        let deadline = Deadline::after(ms);
        let resp = self.req_resp(ccd, RRN_REQ_PSP_COPROC_READ, bytes_of(&req), 4, &deadline)?;
        Ok(u32::from_le_bytes(resp[..4].try_into().unwrap()))
    }

    pub fn coproc_write(
        &mut self,
        ccd: u32,
        coproc: u32,
        crn: u32,
        crm: u32,
        opc1: u32,
        opc2: u32,
        val: u32,
        ms: u32,
    ) -> Result<()> {
        let req = CoProcRwReq { coproc, crn, crm, opc1, opc2, val, reserved: [0; 2] };
        let deadline = Deadline::after(ms);
        self.req_resp(ccd, RRN_REQ_PSP_COPROC_WRITE, bytes_of(&req), 0, &deadline)?;
        Ok(())
    }

    /// Redirect the PSP to arbitrary code. The response only acknowledges
    /// that the stub is about to jump.
    pub fn branch_to(&mut self, ccd: u32, psp_addr_pc: u32, thumb: bool, ms: u32) -> Result<()> {
        let req = BranchToReq {
            psp_addr_pc,
            flags: if thumb { BRANCH_TO_F_THUMB } else { 0 },
        };
        let deadline = Deadline::after(ms);
        self.req_resp(ccd, RRN_REQ_PSP_BRANCH_TO, bytes_of(&req), 0, &deadline)?;
        Ok(())
    }

    // ========================================================================
    // CODE MODULES
    // ========================================================================

    /// Announce a flat-binary code module, then stream it through the stub's
    /// input buffer in 512-aligned slices.
    pub fn code_mod_load(&mut self, ccd: u32, module: &[u8], ms: u32) -> Result<()> {
        let req = CodeModLoadReq { cm_type: CODE_MOD_TYPE_FLAT, cb_cm: module.len() as u32 };
        let deadline = Deadline::after(ms);
        self.req_resp(ccd, RRN_REQ_PSP_CODE_MOD_LOAD, bytes_of(&req), 0, &deadline)?;

        let cap = self.in_buf_chunk_cap()?;
        debug!("code module upload: {} bytes in {} byte chunks", module.len(), cap);
        for chunk in module.chunks(cap) {
            self.in_buf_write(ccd, DEFAULT_IN_BUF, chunk, ms)?;
        }
        Ok(())
    }

    fn in_buf_chunk_cap(&self) -> Result<usize> {
        let cap = self.chunk_cap(mem::size_of::<InBufWriteReq>())?;
        let aligned = cap / IN_BUF_SLICE * IN_BUF_SLICE;
        Ok(if aligned == 0 { cap } else { aligned })
    }

    /// Feed bytes into a stub input buffer.
    pub fn in_buf_write(&mut self, ccd: u32, id_in_buf: u32, data: &[u8], ms: u32) -> Result<()> {
        let mut payload = bytes_of(&InBufWriteReq { id_in_buf, reserved: 0 }).to_vec();
        payload.extend_from_slice(data);
        let deadline = Deadline::after(ms);
        self.req_resp(ccd, RRN_REQ_PSP_IN_BUF_WRITE, &payload, 0, &deadline)?;
        Ok(())
    }

    /// Start a previously loaded module and babysit it until it finishes:
    /// short receive polls for the finish notification, with host input
    /// forwarded between polls.
    pub fn code_mod_exec(&mut self, ccd: u32, args: [u32; 4], ms: u32) -> Result<u32> {
        self.exec_finished = None;
        let req = CodeModExecReq { args };
        let deadline = Deadline::after(ms);
        self.req_resp(ccd, RRN_REQ_PSP_CODE_MOD_EXEC, bytes_of(&req), 0, &deadline)?;

        loop {
            if let Some(ret) = self.exec_finished.take() {
                debug!("code module finished: ret={ret:#010x}");
                return Ok(ret);
            }
            if deadline.expired() {
                return Err(ProxyError::Timeout);
            }
            match self.recv_frame(&Deadline::after(EXEC_POLL_MS)) {
                Ok(frame) => self.dispatch_notification(frame)?,
                Err(ProxyError::Timeout) => {
                    if self.io.in_buf_peek(DEFAULT_IN_BUF) != 0 {
                        let mut ab = [0u8; IN_BUF_SLICE];
                        let cb = self.io.in_buf_read(DEFAULT_IN_BUF, &mut ab);
                        if cb != 0 {
                            self.in_buf_write(ccd, DEFAULT_IN_BUF, &ab[..cb], ms)?;
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    // ========================================================================
    // INTERRUPT WAITING
    // ========================================================================

    /// Hand out one recorded interrupt change, oldest CCD first. With an
    /// empty table and a zero timeout this is a "no change" result, not an
    /// error; with a timeout it blocks for the next IrqChange notification.
    pub fn wait_for_irq(&mut self, ms: u32) -> Result<Option<IrqEvent>> {
        self.ensure_usable()?;
        if let Some(ev) = self.irq.drain() {
            return Ok(Some(ev));
        }
        if ms == 0 {
            return Ok(None);
        }
        let deadline = Deadline::after(ms);
        loop {
            let frame = self.recv_frame(&deadline)?;
            self.dispatch_notification(frame)?;
            if let Some(ev) = self.irq.drain() {
                return Ok(Some(ev));
            }
        }
    }
}
