// PSP PROXY — TYPED FACADE
// Thin wrappers over the PDU engine: validate argument shapes, build the
// request structs, delegate. Every operation runs against the proxy's
// current CCD and takes a per-call timeout in milliseconds.

use crate::engine::irq::IrqEvent;
use crate::engine::{PduEngine, SessionInfo, XferAddr, XferData};
use crate::error::{ProxyError, Result};
use crate::hostio::HostIo;
use crate::protocol::wire::*;
use crate::scratch::ScratchAllocator;
use crate::transport::{self, Transport};

/// A location in one of the address spaces the stub can reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PspAddress {
    /// PSP SRAM.
    PspMem(u32),
    /// PSP MMIO register space.
    PspMmio(u32),
    /// System Management Network.
    Smn(u32),
    /// x86 physical memory with caching attribute bits.
    X86Mem { addr: u64, caching: u32 },
    /// x86 MMIO, always uncached.
    X86Mmio(u64),
}

impl PspAddress {
    fn space(&self) -> u32 {
        match self {
            PspAddress::PspMem(_) => ADDR_SPACE_PSP_MEM,
            PspAddress::PspMmio(_) => ADDR_SPACE_PSP_MMIO,
            PspAddress::Smn(_) => ADDR_SPACE_SMN,
            PspAddress::X86Mem { .. } => ADDR_SPACE_X86_MEM,
            PspAddress::X86Mmio(_) => ADDR_SPACE_X86_MMIO,
        }
    }

    fn addr64(&self) -> u64 {
        match *self {
            PspAddress::PspMem(a) | PspAddress::PspMmio(a) | PspAddress::Smn(a) => a as u64,
            PspAddress::X86Mem { addr, .. } => addr,
            PspAddress::X86Mmio(a) => a,
        }
    }

    fn addr_flags(&self) -> u32 {
        match self {
            PspAddress::X86Mem { caching, .. } => *caching,
            _ => 0,
        }
    }
}

/// Connected proxy for one PSP stub. Owns the engine, the transport behind
/// it, and the scratch-space allocator. Single-threaded by design.
pub struct PspProxy {
    engine: PduEngine,
    scratch: ScratchAllocator,
    ccd: u32,
}

impl PspProxy {
    /// Open a device URI (`tcp://…`, `serial://…`, `em100tcp://…`) and run
    /// the connect handshake against the stub.
    pub fn open(device: &str, io: Box<dyn HostIo>, ms: u32) -> Result<Self> {
        let xport = transport::create(device)?;
        Self::with_transport(xport, io, ms)
    }

    /// Same handshake over a caller-supplied transport.
    pub fn with_transport(xport: Box<dyn Transport>, io: Box<dyn HostIo>, ms: u32) -> Result<Self> {
        let mut engine = PduEngine::new(xport, io);
        engine.connect(ms)?;
        Ok(PspProxy { engine, scratch: ScratchAllocator::new(), ccd: 0 })
    }

    pub fn session(&self) -> Result<&SessionInfo> {
        self.engine.session()
    }

    /// Scratch region advertised during the handshake.
    pub fn query_info(&self) -> Result<(u32, u32)> {
        self.engine.query_info()
    }

    /// Status code of the most recent stub response.
    pub fn last_request_rc(&self) -> u32 {
        self.engine.last_request_rc()
    }

    /// Select the CCD subsequent operations run against.
    pub fn set_ccd(&mut self, ccd: u32) -> Result<()> {
        if ccd >= self.engine.session()?.ccd_count {
            return Err(ProxyError::InvalidArgument("ccd id beyond the connected topology"));
        }
        self.ccd = ccd;
        Ok(())
    }

    pub fn ccd(&self) -> u32 {
        self.ccd
    }

    // ========================================================================
    // REGISTER ACCESS
    // ========================================================================

    pub fn smn_read(&mut self, smn_addr: u32, cb_val: u32, ms: u32) -> Result<u64> {
        check_reg_size(cb_val)?;
        let mut ab = [0u8; 8];
        self.engine.xfer_read(
            self.ccd,
            RRN_REQ_PSP_SMN_READ,
            XferAddr::Smn(smn_addr),
            &mut ab[..cb_val as usize],
            ms,
        )?;
        Ok(u64::from_le_bytes(ab))
    }

    pub fn smn_write(&mut self, smn_addr: u32, cb_val: u32, val: u64, ms: u32) -> Result<()> {
        check_reg_size(cb_val)?;
        let ab = val.to_le_bytes();
        self.engine.xfer_write(
            self.ccd,
            RRN_REQ_PSP_SMN_WRITE,
            XferAddr::Smn(smn_addr),
            &ab[..cb_val as usize],
            ms,
        )
    }

    pub fn psp_mmio_read(&mut self, psp_addr: u32, cb_val: u32, ms: u32) -> Result<u64> {
        check_reg_size(cb_val)?;
        let mut ab = [0u8; 8];
        self.engine.xfer_read(
            self.ccd,
            RRN_REQ_PSP_MMIO_READ,
            XferAddr::Psp(psp_addr),
            &mut ab[..cb_val as usize],
            ms,
        )?;
        Ok(u64::from_le_bytes(ab))
    }

    pub fn psp_mmio_write(&mut self, psp_addr: u32, cb_val: u32, val: u64, ms: u32) -> Result<()> {
        check_reg_size(cb_val)?;
        let ab = val.to_le_bytes();
        self.engine.xfer_write(
            self.ccd,
            RRN_REQ_PSP_MMIO_WRITE,
            XferAddr::Psp(psp_addr),
            &ab[..cb_val as usize],
            ms,
        )
    }

    pub fn x86_mmio_read(&mut self, phys: u64, cb_val: u32, ms: u32) -> Result<u64> {
        check_reg_size(cb_val)?;
        let mut ab = [0u8; 8];
        self.engine.xfer_read(
            self.ccd,
            RRN_REQ_PSP_X86_MMIO_READ,
            XferAddr::X86(phys),
            &mut ab[..cb_val as usize],
            ms,
        )?;
        Ok(u64::from_le_bytes(ab))
    }

    pub fn x86_mmio_write(&mut self, phys: u64, cb_val: u32, val: u64, ms: u32) -> Result<()> {
        check_reg_size(cb_val)?;
        let ab = val.to_le_bytes();
        self.engine.xfer_write(
            self.ccd,
            RRN_REQ_PSP_X86_MMIO_WRITE,
            XferAddr::X86(phys),
            &ab[..cb_val as usize],
            ms,
        )
    }

    // ========================================================================
    // BULK MEMORY
    // ========================================================================

    pub fn psp_mem_read(&mut self, psp_addr: u32, buf: &mut [u8], ms: u32) -> Result<()> {
        self.engine.xfer_read(self.ccd, RRN_REQ_PSP_MEM_READ, XferAddr::Psp(psp_addr), buf, ms)
    }

    pub fn psp_mem_write(&mut self, psp_addr: u32, data: &[u8], ms: u32) -> Result<()> {
        self.engine.xfer_write(self.ccd, RRN_REQ_PSP_MEM_WRITE, XferAddr::Psp(psp_addr), data, ms)
    }

    pub fn x86_mem_read(&mut self, phys: u64, buf: &mut [u8], ms: u32) -> Result<()> {
        self.engine.xfer_read(self.ccd, RRN_REQ_PSP_X86_MEM_READ, XferAddr::X86(phys), buf, ms)
    }

    pub fn x86_mem_write(&mut self, phys: u64, data: &[u8], ms: u32) -> Result<()> {
        self.engine.xfer_write(self.ccd, RRN_REQ_PSP_X86_MEM_WRITE, XferAddr::X86(phys), data, ms)
    }

    // ========================================================================
    // GENERIC TRANSFER
    // ========================================================================

    /// The superset transfer: any address space, stride 1/2/4, exactly one
    /// of read/write/memset, optional per-stride address increment.
    pub fn addr_xfer(
        &mut self,
        addr: PspAddress,
        flags: u32,
        stride: u32,
        data: XferData<'_>,
        ms: u32,
    ) -> Result<()> {
        if flags & !XFER_F_VALID_MASK != 0 {
            return Err(ProxyError::InvalidArgument("unknown transfer flag bits"));
        }
        let dir = flags & (XFER_F_READ | XFER_F_WRITE | XFER_F_MEMSET);
        if dir.count_ones() != 1 {
            return Err(ProxyError::InvalidArgument(
                "exactly one of read/write/memset must be set",
            ));
        }
        if !matches!(stride, 1 | 2 | 4) {
            return Err(ProxyError::InvalidArgument("stride must be 1, 2 or 4"));
        }
        let cb_xfer = match &data {
            XferData::Read(buf) => {
                if dir != XFER_F_READ {
                    return Err(ProxyError::InvalidArgument("read buffer without read flag"));
                }
                buf.len() as u32
            }
            XferData::Write(data) => {
                if dir != XFER_F_WRITE {
                    return Err(ProxyError::InvalidArgument("write data without write flag"));
                }
                data.len() as u32
            }
            XferData::Memset { pattern, cb_xfer } => {
                if dir != XFER_F_MEMSET {
                    return Err(ProxyError::InvalidArgument("memset pattern without memset flag"));
                }
                if pattern.len() != stride as usize {
                    return Err(ProxyError::InvalidArgument("memset pattern must be one stride"));
                }
                *cb_xfer
            }
        };
        if cb_xfer % stride != 0 {
            return Err(ProxyError::InvalidArgument("transfer size not a stride multiple"));
        }

        self.engine.addr_xfer(
            self.ccd,
            addr.space(),
            addr.addr_flags(),
            addr.addr64(),
            stride,
            flags & XFER_F_INCR_ADDR != 0,
            data,
            ms,
        )
    }

    // ========================================================================
    // COPROCESSOR / EXECUTION
    // ========================================================================

    pub fn coproc_read(
        &mut self,
        coproc: u32,
        crn: u32,
        crm: u32,
        opc1: u32,
        opc2: u32,
        ms: u32,
    ) -> Result<u32> {
        check_coproc_args(coproc, crn, crm, opc1, opc2)?;
        self.engine.coproc_read(self.ccd, coproc, crn, crm, opc1, opc2, ms)
    }

    pub fn coproc_write(
        &mut self,
        coproc: u32,
        crn: u32,
        crm: u32,
        opc1: u32,
        opc2: u32,
        val: u32,
        ms: u32,
    ) -> Result<()> {
        check_coproc_args(coproc, crn, crm, opc1, opc2)?;
        self.engine.coproc_write(self.ccd, coproc, crn, crm, opc1, opc2, val, ms)
    }

    /// Make the PSP jump to arbitrary code at `psp_addr_pc`.
    pub fn branch_to(&mut self, psp_addr_pc: u32, thumb: bool, ms: u32) -> Result<()> {
        self.engine.branch_to(self.ccd, psp_addr_pc, thumb, ms)
    }

    /// Upload a flat-binary code module into the stub.
    pub fn code_mod_load(&mut self, module: &[u8], ms: u32) -> Result<()> {
        if module.is_empty() {
            return Err(ProxyError::InvalidArgument("empty code module"));
        }
        self.engine.code_mod_load(self.ccd, module, ms)
    }

    /// Run the loaded module and return its exit value. Host input bytes are
    /// forwarded to the stub while the module runs.
    pub fn code_mod_exec(&mut self, args: [u32; 4], ms: u32) -> Result<u32> {
        self.engine.code_mod_exec(self.ccd, args, ms)
    }

    /// One recorded interrupt change per call, oldest first; `None` when the
    /// table is empty and no wait was requested.
    pub fn wait_for_irq(&mut self, ms: u32) -> Result<Option<IrqEvent>> {
        self.engine.wait_for_irq(ms)
    }

    // ========================================================================
    // SCRATCH SPACE
    // ========================================================================

    /// Carve a block out of the stub's scratch region.
    pub fn scratch_alloc(&mut self, cb: u32) -> Result<u32> {
        if cb == 0 {
            return Err(ProxyError::InvalidArgument("zero-size scratch allocation"));
        }
        if !self.scratch.is_seeded() {
            let (addr, cb_region) = self.engine.query_info()?;
            self.scratch.seed(addr, cb_region);
        }
        self.scratch.alloc(cb).ok_or(ProxyError::ScratchExhausted)
    }

    /// Return a previously allocated scratch block.
    pub fn scratch_free(&mut self, psp_addr: u32, cb: u32) -> Result<()> {
        if !self.scratch.is_seeded() {
            return Err(ProxyError::InvalidArgument("free without a prior allocation"));
        }
        self.scratch.free(psp_addr, cb);
        Ok(())
    }
}

fn check_reg_size(cb_val: u32) -> Result<()> {
    if !matches!(cb_val, 1 | 2 | 4 | 8) {
        return Err(ProxyError::InvalidArgument("register size must be 1, 2, 4 or 8"));
    }
    Ok(())
}

fn check_coproc_args(coproc: u32, crn: u32, crm: u32, opc1: u32, opc2: u32) -> Result<()> {
    if coproc > 15 || crn > 15 || crm > 15 || opc1 > 7 || opc2 > 7 {
        return Err(ProxyError::InvalidArgument("coprocessor register selector out of range"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;

    /// Handshake + a responder that answers every request kind with an empty
    /// success response, counting from stub counter 3.
    fn connected_proxy(
        cb_pdu_max: u32,
        scratch: (u32, u32),
        topology: (u32, u32),
    ) -> (PspProxy, MockLink, TestHostIo) {
        let (xport, link) = mock_pair();
        link.push_raw(&beacon_frame(1, 17));
        let mut counter = 1u32;
        let (scratch_addr, cb_scratch) = scratch;
        let (sockets, ccds) = topology;
        link.set_responder(move |hdr, payload| {
            counter += 1;
            match hdr.rrn_id {
                RRN_REQ_CONNECT => {
                    let resp = connect_resp_frame(
                        counter, cb_pdu_max, scratch_addr, cb_scratch, sockets, ccds,
                    );
                    // Inbound numbering restarts at 1 with the session.
                    counter = 0;
                    vec![resp]
                }
                RRN_REQ_PSP_SMN_READ => {
                    let req: SmnXferReq = payload_as(payload).unwrap();
                    assert_eq!(req.smn_addr, 0x02DC_4000);
                    assert_eq!(req.cb_xfer, 4);
                    vec![stub_frame(
                        counter,
                        response_for(hdr.rrn_id),
                        hdr.target_ccd,
                        STS_SUCCESS,
                        &[0xDE, 0xAD, 0xBE, 0xEF],
                    )]
                }
                _ => vec![stub_frame(counter, response_for(hdr.rrn_id), hdr.target_ccd, 0, &[])],
            }
        });
        let io = TestHostIo::default();
        let proxy =
            PspProxy::with_transport(Box::new(xport), Box::new(io.clone()), 1000).unwrap();
        (proxy, link, io)
    }

    #[test]
    fn smn_read_roundtrip() {
        let (mut proxy, _link, _io) = connected_proxy(4096, (0x20000, 0x10000), (1, 1));
        let val = proxy.smn_read(0x02DC_4000, 4, 1000).unwrap();
        assert_eq!(val, 0xEFBE_ADDE);
        assert_eq!(proxy.last_request_rc(), 0);
    }

    #[test]
    fn register_size_validation() {
        let (mut proxy, link, _io) = connected_proxy(4096, (0x20000, 0x10000), (1, 1));
        let before = link.requests().len();
        assert!(matches!(
            proxy.psp_mmio_read(0x0320_0000, 3, 1000),
            Err(ProxyError::InvalidArgument(_))
        ));
        assert!(matches!(
            proxy.smn_write(0x0100, 16, 0, 1000),
            Err(ProxyError::InvalidArgument(_))
        ));
        // Rejected at the facade: nothing went on the wire.
        assert_eq!(link.requests().len(), before);
    }

    #[test]
    fn addr_xfer_flag_validation() {
        let (mut proxy, _link, _io) = connected_proxy(4096, (0x20000, 0x10000), (1, 1));
        let mut ab = [0u8; 8];

        // Two direction bits.
        assert!(matches!(
            proxy.addr_xfer(
                PspAddress::PspMem(0x1000),
                XFER_F_READ | XFER_F_WRITE,
                4,
                XferData::Read(&mut ab),
                1000
            ),
            Err(ProxyError::InvalidArgument(_))
        ));
        // Bad stride.
        assert!(matches!(
            proxy.addr_xfer(PspAddress::Smn(0x1000), XFER_F_READ, 3, XferData::Read(&mut ab), 1000),
            Err(ProxyError::InvalidArgument(_))
        ));
        // Size not a stride multiple.
        let mut odd = [0u8; 6];
        assert!(matches!(
            proxy.addr_xfer(PspAddress::Smn(0x1000), XFER_F_READ, 4, XferData::Read(&mut odd), 1000),
            Err(ProxyError::InvalidArgument(_))
        ));
        // Data kind contradicting the flags.
        assert!(matches!(
            proxy.addr_xfer(PspAddress::Smn(0x1000), XFER_F_WRITE, 4, XferData::Read(&mut ab), 1000),
            Err(ProxyError::InvalidArgument(_))
        ));
        // Memset pattern must be one stride.
        assert!(matches!(
            proxy.addr_xfer(
                PspAddress::PspMem(0x1000),
                XFER_F_MEMSET,
                4,
                XferData::Memset { pattern: &[0u8; 2], cb_xfer: 16 },
                1000
            ),
            Err(ProxyError::InvalidArgument(_))
        ));
    }

    #[test]
    fn addr_xfer_encodes_space_and_caching() {
        let (mut proxy, link, _io) = connected_proxy(4096, (0x20000, 0x10000), (1, 1));
        let mut ab = [0u8; 8];
        proxy
            .addr_xfer(
                PspAddress::X86Mem { addr: 0x1_0000_0000, caching: X86_ADDR_F_WRITEBACK },
                XFER_F_READ | XFER_F_INCR_ADDR,
                4,
                XferData::Read(&mut ab),
                1000,
            )
            .unwrap_err(); // responder answers with an empty payload: size mismatch
        let reqs = link.requests_of(RRN_REQ_PSP_ADDR_XFER);
        assert_eq!(reqs.len(), 1);
        let req: AddrXferReq = payload_as(&reqs[0].1).unwrap();
        assert_eq!(req.space, ADDR_SPACE_X86_MEM);
        assert_eq!(req.addr, 0x1_0000_0000);
        assert_eq!(req.addr_flags, X86_ADDR_F_WRITEBACK);
        assert_eq!(req.flags, XFER_F_READ | XFER_F_INCR_ADDR);
        assert_eq!(req.stride, 4);
    }

    #[test]
    fn set_ccd_respects_topology() {
        let (mut proxy, _link, _io) = connected_proxy(4096, (0x20000, 0x10000), (1, 2));
        proxy.set_ccd(1).unwrap();
        assert_eq!(proxy.ccd(), 1);
        assert!(matches!(proxy.set_ccd(2), Err(ProxyError::InvalidArgument(_))));
    }

    #[test]
    fn coproc_selector_validation() {
        let (mut proxy, _link, _io) = connected_proxy(4096, (0x20000, 0x10000), (1, 1));
        assert!(matches!(
            proxy.coproc_read(16, 0, 0, 0, 0, 1000),
            Err(ProxyError::InvalidArgument(_))
        ));
        assert!(matches!(
            proxy.coproc_write(15, 0, 0, 8, 0, 0, 1000),
            Err(ProxyError::InvalidArgument(_))
        ));
    }

    #[test]
    fn scratch_allocator_seeds_from_query_info_and_coalesces() {
        let (mut proxy, _link, _io) = connected_proxy(4096, (0x20000, 0x10000), (1, 1));

        let a = proxy.scratch_alloc(0x1000).unwrap();
        assert_eq!(a, 0x2F000);
        let b = proxy.scratch_alloc(0x1000).unwrap();
        assert_eq!(b, 0x2E000);
        proxy.scratch_free(a, 0x1000).unwrap();
        proxy.scratch_free(b, 0x1000).unwrap();

        // The whole region is one chunk again.
        let c = proxy.scratch_alloc(0x10000).unwrap();
        assert_eq!(c, 0x20000);
        assert!(matches!(proxy.scratch_alloc(1), Err(ProxyError::ScratchExhausted)));
    }

    #[test]
    fn free_before_alloc_is_rejected() {
        let (mut proxy, _link, _io) = connected_proxy(4096, (0x20000, 0x10000), (1, 1));
        assert!(matches!(
            proxy.scratch_free(0x20000, 0x100),
            Err(ProxyError::InvalidArgument(_))
        ));
    }

    #[test]
    fn query_info_reports_the_advertised_region() {
        let (proxy, _link, _io) = connected_proxy(4096, (0x4_2000, 0x8000), (1, 1));
        assert_eq!(proxy.query_info().unwrap(), (0x4_2000, 0x8000));
        let info = proxy.session().unwrap();
        assert_eq!(info.cb_pdu_max, 4096);
        assert_eq!(info.ccd_count, 1);
    }
}
