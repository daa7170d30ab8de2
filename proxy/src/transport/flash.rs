// PSP PROXY — FLASH RING-BUFFER TRANSPORT
// Device URI: em100tcp://<host>:<port>. Speaks the flash emulator's framed
// read/write protocol and layers two single-producer/single-consumer ring
// buffers over a message channel embedded at a fixed offset in the flash
// image. Every peek costs a network round trip for the channel header, so
// latency is dominated by the emulator link: expect milliseconds, not
// microseconds, per poll cycle.

use std::io::{Read, Write};
use std::mem;
use std::net::{TcpStream, ToSocketAddrs};
use std::thread;
use std::time::Duration;

use bytemuck::{Pod, Zeroable};
use log::debug;

use crate::engine::clock::Deadline;
use crate::error::{ProxyError, Result};
use crate::transport::{Interrupter, PollOutcome, Transport};

/// Request header of the emulator protocol.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct EmuReqHdr {
    magic: u32,
    /// 0 = read, 1 = write.
    cmd: u32,
    addr_start: u32,
    cb_xfer: u32,
}

const EMU_REQ_MAGIC: u32 = 0xEBAD_C0DE;
const EMU_CMD_READ: u32 = 0;
const EMU_CMD_WRITE: u32 = 1;

/// One ring buffer header inside the message channel.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct SpiRingBuf {
    cb_ring: u32,
    /// Producer offset.
    off_head: u32,
    /// Consumer offset.
    off_tail: u32,
}

/// The message channel header at the fixed flash offset. The magic sits at
/// the end so a partially written header never looks valid.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct MsgChanHdr {
    off_ext2psp: u32,
    off_psp2ext: u32,
    rb_ext2psp: SpiRingBuf,
    rb_psp2ext: SpiRingBuf,
    magic: u32,
}
const _: () = assert!(mem::size_of::<MsgChanHdr>() == 36);

/// Flash offset of the message channel.
const MSG_CHAN_OFF: u32 = 0x00AA_B000;
const MSG_CHAN_MAGIC: u32 = 0x1892_0103;
/// Data capacity of each ring.
const RING_SIZE: u32 = 4096;

// Byte offsets of the two pointer fields that get published individually.
const OFF_EXT2PSP_HEAD: u32 = 12;
const OFF_PSP2EXT_TAIL: u32 = 28;

/// Interval between header fetches while waiting for ring space or data.
const RING_BACKOFF_MS: u64 = 1;

#[inline]
fn ring_free(rb: &SpiRingBuf) -> u32 {
    if rb.off_head >= rb.off_tail {
        rb.cb_ring - (rb.off_head - rb.off_tail)
    } else {
        rb.off_tail - rb.off_head
    }
}

#[inline]
fn ring_used(rb: &SpiRingBuf) -> u32 {
    rb.cb_ring - ring_free(rb)
}

/// Bytes writable in one go, up to the head pointer wrap.
#[inline]
fn ring_contig_write(rb: &SpiRingBuf) -> u32 {
    ring_free(rb).min(rb.cb_ring - rb.off_head)
}

/// Bytes readable in one go, up to the tail pointer wrap.
#[inline]
fn ring_contig_read(rb: &SpiRingBuf) -> u32 {
    ring_used(rb).min(rb.cb_ring - rb.off_tail)
}

pub struct FlashRbTransport {
    stream: TcpStream,
    /// Shadow copy of the channel header, refreshed before every ring access.
    hdr: MsgChanHdr,
}

impl FlashRbTransport {
    pub fn open(details: &str) -> Result<Self> {
        let (host, port) = details
            .rsplit_once(':')
            .ok_or_else(|| ProxyError::InvalidDeviceUri(format!("em100tcp://{details}")))?;
        let port: u16 = port
            .parse()
            .map_err(|_| ProxyError::InvalidDeviceUri(format!("em100tcp://{details}")))?;

        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(ProxyError::Transport)?
            .collect::<Vec<_>>();
        let stream = TcpStream::connect(&addrs[..]).map_err(ProxyError::Transport)?;
        stream.set_nodelay(true).map_err(ProxyError::Transport)?;

        let mut xport = FlashRbTransport { stream, hdr: MsgChanHdr::zeroed() };
        xport.channel_init()?;
        debug!("flash ring-buffer transport initialized against {host}:{port}");
        Ok(xport)
    }

    /// Publish an empty message channel so the stub finds pristine rings.
    fn channel_init(&mut self) -> Result<()> {
        let cb_hdr = mem::size_of::<MsgChanHdr>() as u32;
        self.hdr = MsgChanHdr {
            off_ext2psp: cb_hdr,
            off_psp2ext: cb_hdr + RING_SIZE,
            rb_ext2psp: SpiRingBuf { cb_ring: RING_SIZE, off_head: 0, off_tail: 0 },
            rb_psp2ext: SpiRingBuf { cb_ring: RING_SIZE, off_head: 0, off_tail: 0 },
            magic: MSG_CHAN_MAGIC,
        };
        let ab = bytemuck::bytes_of(&self.hdr).to_vec();
        self.flash_write(MSG_CHAN_OFF, &ab)
    }

    fn flash_read(&mut self, addr: u32, buf: &mut [u8]) -> Result<()> {
        let req = EmuReqHdr {
            magic: EMU_REQ_MAGIC,
            cmd: EMU_CMD_READ,
            addr_start: addr,
            cb_xfer: buf.len() as u32,
        };
        self.stream.write_all(bytemuck::bytes_of(&req)).map_err(ProxyError::Transport)?;
        let rc = self.emu_status()?;
        if rc != 0 {
            return Err(ProxyError::Protocol(format!("flash emulator read failed (rc={rc})")));
        }
        self.stream.read_exact(buf).map_err(ProxyError::Transport)
    }

    fn flash_write(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        let req = EmuReqHdr {
            magic: EMU_REQ_MAGIC,
            cmd: EMU_CMD_WRITE,
            addr_start: addr,
            cb_xfer: data.len() as u32,
        };
        self.stream.write_all(bytemuck::bytes_of(&req)).map_err(ProxyError::Transport)?;
        self.stream.write_all(data).map_err(ProxyError::Transport)?;
        let rc = self.emu_status()?;
        if rc != 0 {
            return Err(ProxyError::Protocol(format!("flash emulator write failed (rc={rc})")));
        }
        Ok(())
    }

    fn emu_status(&mut self) -> Result<i32> {
        let mut ab = [0u8; 4];
        self.stream.read_exact(&mut ab).map_err(ProxyError::Transport)?;
        Ok(i32::from_le_bytes(ab))
    }

    /// Refresh the shadow header from flash.
    fn hdr_fetch(&mut self) -> Result<()> {
        let mut ab = [0u8; mem::size_of::<MsgChanHdr>()];
        self.flash_read(MSG_CHAN_OFF, &mut ab)?;
        let hdr: MsgChanHdr = bytemuck::pod_read_unaligned(&ab);
        if hdr.magic != MSG_CHAN_MAGIC {
            return Err(ProxyError::Protocol(format!(
                "flash message channel magic gone ({:#010x})",
                hdr.magic
            )));
        }
        self.hdr = hdr;
        Ok(())
    }

    /// Publish a single advanced pointer field back to flash.
    fn publish_u32(&mut self, field_off: u32, val: u32) -> Result<()> {
        self.flash_write(MSG_CHAN_OFF + field_off, &val.to_le_bytes())
    }
}

impl Transport for FlashRbTransport {
    fn peek(&mut self) -> usize {
        match self.hdr_fetch() {
            Ok(()) => ring_used(&self.hdr.rb_psp2ext) as usize,
            Err(_) => 0,
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.hdr_fetch()?;
        let rb = self.hdr.rb_psp2ext;
        let contig = (ring_contig_read(&rb) as usize).min(buf.len());
        if contig == 0 {
            return Ok(0);
        }
        let off_data = MSG_CHAN_OFF + self.hdr.off_psp2ext + rb.off_tail;
        self.flash_read(off_data, &mut buf[..contig])?;
        let tail = (rb.off_tail + contig as u32) % rb.cb_ring;
        self.hdr.rb_psp2ext.off_tail = tail;
        self.publish_u32(OFF_PSP2EXT_TAIL, tail)?;
        Ok(contig)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        let mut rest = buf;
        while !rest.is_empty() {
            self.hdr_fetch()?;
            let rb = self.hdr.rb_ext2psp;
            let contig = (ring_contig_write(&rb) as usize).min(rest.len());
            if contig == 0 {
                // Ring full until the stub drains it.
                thread::sleep(Duration::from_millis(RING_BACKOFF_MS));
                continue;
            }
            let off_data = MSG_CHAN_OFF + self.hdr.off_ext2psp + rb.off_head;
            self.flash_write(off_data, &rest[..contig])?;
            let head = (rb.off_head + contig as u32) % rb.cb_ring;
            self.hdr.rb_ext2psp.off_head = head;
            self.publish_u32(OFF_EXT2PSP_HEAD, head)?;
            rest = &rest[contig..];
        }
        Ok(())
    }

    /// Busy peek with a short sleep between header fetches. There is no
    /// event channel in a flash image; this is as good as it gets.
    fn poll(&mut self, ms: u32) -> Result<PollOutcome> {
        let deadline = Deadline::after(ms);
        loop {
            self.hdr_fetch()?;
            if ring_used(&self.hdr.rb_psp2ext) != 0 {
                return Ok(PollOutcome::Ready);
            }
            if deadline.expired() {
                return Ok(PollOutcome::TimedOut);
            }
            thread::sleep(Duration::from_millis(RING_BACKOFF_MS));
        }
    }

    fn interrupter(&self) -> Option<Interrupter> {
        // Nothing can unblock the busy peek; callers must rely on timeouts.
        None
    }
}
