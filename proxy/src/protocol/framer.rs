// PSP PROXY — PDU FRAMER
// Emit: header, payload, zero pad, footer in three or four transport writes.
// Receive: SeekMagic → Hdr → Payload → Footer state machine over a 4 KiB
// buffer. A mismatched start magic shifts the lookahead by one byte, so the
// receiver re-synchronizes on arbitrary garbage. A counter skew on an
// otherwise well-formed header is the one validation failure that surfaces
// as an error instead of a silent resync.

use log::{trace, warn};

use crate::error::{ProxyError, Result};
use crate::protocol::wire::*;
use crate::transport::Transport;

/// A complete, validated inbound PDU.
#[derive(Debug, Clone)]
pub struct PduFrame {
    pub hdr: PduHdr,
    pub payload: Vec<u8>,
}

/// Emit one host → stub PDU. The caller owns the outbound counter.
pub fn emit_pdu(
    xport: &mut dyn Transport,
    pdu_counter: u32,
    target_ccd: u32,
    rrn_id: u32,
    timestamp_ms: u32,
    payload: &[u8],
) -> Result<()> {
    debug_assert!(payload.len() <= PDU_PAYLOAD_MAX);

    let hdr = PduHdr {
        start_magic: EXT_2_PSP_START_MAGIC,
        payload_len: payload.len() as u32,
        pdu_counter,
        rrn_id,
        target_ccd,
        timestamp_ms,
        request_rc: 0,
        reserved: 0,
    };
    let ab_hdr = hdr.to_wire();

    let pad = [0u8; PDU_PAYLOAD_ALIGN];
    let cb_pad = padded_len(payload.len()) - payload.len();

    let sum = byte_sum(&[&ab_hdr, payload, &pad[..cb_pad]]);
    let footer = PduFooter {
        checksum: sum.wrapping_neg(),
        end_magic: EXT_2_PSP_END_MAGIC,
    };

    xport.write(&ab_hdr)?;
    if !payload.is_empty() {
        xport.write(payload)?;
        if cb_pad != 0 {
            xport.write(&pad[..cb_pad])?;
        }
    }
    xport.write(&footer.to_wire())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecvState {
    SeekMagic,
    Hdr,
    Payload,
    Footer,
}

/// Receive state machine for stub → host PDUs.
///
/// The engine drives it with `want()`-sized reads; `feed` returns a complete
/// frame once the footer validates. Until the connect handshake finishes the
/// decoder accepts any inbound counter and assumes a single CCD.
pub struct FrameDecoder {
    buf: Box<[u8; PDU_RECV_BUF_SIZE]>,
    off: usize,
    need: usize,
    state: RecvState,
    hdr: Option<PduHdr>,
    connected: bool,
    recv_next: u32,
    ccd_count: u32,
}

impl FrameDecoder {
    pub fn new() -> Self {
        let mut dec = FrameDecoder {
            buf: Box::new([0u8; PDU_RECV_BUF_SIZE]),
            off: 0,
            need: 0,
            state: RecvState::SeekMagic,
            hdr: None,
            connected: false,
            recv_next: 1,
            // A single CCD until the ConnectResponse reports the topology,
            // so the handshake frames targeting CCD 0 pass validation.
            ccd_count: 1,
        };
        dec.reset();
        dec
    }

    /// Restart frame assembly. Does not touch the session parameters.
    pub fn reset(&mut self) {
        self.state = RecvState::SeekMagic;
        self.off = 0;
        self.need = 4;
        self.hdr = None;
    }

    /// Called once the ConnectResponse was validated: from here on the
    /// inbound counter is a strict sequence restarting at 1 and the CCD
    /// bound is enforced.
    pub fn session_established(&mut self, ccd_count: u32) {
        self.connected = true;
        self.recv_next = 1;
        self.ccd_count = ccd_count;
    }

    /// Number of bytes the current state still needs.
    #[inline]
    pub fn want(&self) -> usize {
        self.need
    }

    /// Append up to `want()` bytes. Returns a frame when one completes.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Option<PduFrame>> {
        debug_assert!(bytes.len() <= self.need);
        self.buf[self.off..self.off + bytes.len()].copy_from_slice(bytes);
        self.off += bytes.len();
        self.need -= bytes.len();
        if self.need != 0 {
            return Ok(None);
        }
        self.advance()
    }

    /// Process a completed state and move to the next one.
    fn advance(&mut self) -> Result<Option<PduFrame>> {
        match self.state {
            RecvState::SeekMagic => {
                let magic = u32::from_le_bytes(self.buf[0..4].try_into().unwrap());
                if magic == PSP_2_EXT_START_MAGIC {
                    self.state = RecvState::Hdr;
                    self.need = PDU_HDR_SIZE - 4;
                } else {
                    // Byte-wise resync: drop the oldest byte, pull one more.
                    trace!("resync: no start magic in {magic:#010x}");
                    self.buf.copy_within(1..4, 0);
                    self.off = 3;
                    self.need = 1;
                }
                Ok(None)
            }
            RecvState::Hdr => {
                let hdr = PduHdr::from_wire(self.buf[..PDU_HDR_SIZE].try_into().unwrap());
                match self.validate_hdr(&hdr) {
                    Ok(()) => {}
                    Err(HdrReject::Resync(reason)) => {
                        warn!("dropping inbound pdu header: {reason}");
                        self.reset();
                        return Ok(None);
                    }
                    Err(HdrReject::CounterSkew { got, expected }) => {
                        self.reset();
                        return Err(ProxyError::Protocol(format!(
                            "inbound pdu counter skew: got {got}, expected {expected}"
                        )));
                    }
                }
                self.hdr = Some(hdr);
                if hdr.payload_len != 0 {
                    self.state = RecvState::Payload;
                    self.need = padded_len(hdr.payload_len as usize);
                } else {
                    self.state = RecvState::Footer;
                    self.need = PDU_FOOTER_SIZE;
                }
                Ok(None)
            }
            RecvState::Payload => {
                self.state = RecvState::Footer;
                self.need = PDU_FOOTER_SIZE;
                Ok(None)
            }
            RecvState::Footer => {
                let frame = self.complete_frame();
                self.reset();
                Ok(frame)
            }
        }
    }

    fn validate_hdr(&self, hdr: &PduHdr) -> std::result::Result<(), HdrReject> {
        if hdr.start_magic != PSP_2_EXT_START_MAGIC {
            return Err(HdrReject::Resync("bad start magic"));
        }
        if hdr.payload_len as usize > PDU_PAYLOAD_MAX {
            return Err(HdrReject::Resync("payload exceeds receive buffer"));
        }
        if !is_rrn_plausible(hdr) {
            return Err(HdrReject::Resync("rrn id outside response/notification ranges"));
        }
        if self.connected && hdr.pdu_counter != self.recv_next {
            return Err(HdrReject::CounterSkew { got: hdr.pdu_counter, expected: self.recv_next });
        }
        if hdr.target_ccd >= self.ccd_count {
            return Err(HdrReject::Resync("ccd id out of range"));
        }
        Ok(())
    }

    /// Footer checks over the fully buffered frame.
    fn complete_frame(&mut self) -> Option<PduFrame> {
        let hdr = self.hdr.take()?;
        let cb_padded = padded_len(hdr.payload_len as usize);
        let off_footer = PDU_HDR_SIZE + cb_padded;

        let footer = PduFooter::from_wire(
            self.buf[off_footer..off_footer + PDU_FOOTER_SIZE].try_into().unwrap(),
        );
        if footer.end_magic != PSP_2_EXT_END_MAGIC {
            warn!("dropping inbound pdu: bad end magic {:#010x}", footer.end_magic);
            return None;
        }
        let sum = byte_sum(&[&self.buf[..off_footer]]);
        if sum.wrapping_add(footer.checksum) != 0 {
            warn!("dropping inbound pdu: checksum mismatch");
            return None;
        }

        self.recv_next = hdr.pdu_counter.wrapping_add(1);
        let payload = self.buf[PDU_HDR_SIZE..PDU_HDR_SIZE + hdr.payload_len as usize].to_vec();
        Some(PduFrame { hdr, payload })
    }
}

#[inline]
fn is_rrn_plausible(hdr: &PduHdr) -> bool {
    is_response_id(hdr.rrn_id) || is_notification_id(hdr.rrn_id)
}

enum HdrReject {
    /// Malformed header, most likely line noise: drop and resync.
    Resync(&'static str),
    /// Well-formed header with a broken sequence: a real protocol violation.
    CounterSkew { got: u32, expected: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::stub_frame;
    use proptest::prelude::*;

    fn feed_all(dec: &mut FrameDecoder, mut bytes: &[u8]) -> Result<Vec<PduFrame>> {
        let mut frames = Vec::new();
        while !bytes.is_empty() {
            let n = dec.want().min(bytes.len());
            if let Some(frame) = dec.feed(&bytes[..n])? {
                frames.push(frame);
            }
            bytes = &bytes[n..];
        }
        Ok(frames)
    }

    #[test]
    fn accepts_a_well_formed_frame() {
        let mut dec = FrameDecoder::new();
        let ab = stub_frame(1, RRN_NOT_LOG_MSG, 0, 0, b"hello\n");
        let frames = feed_all(&mut dec, &ab).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].hdr.rrn_id, RRN_NOT_LOG_MSG);
        assert_eq!(frames[0].payload, b"hello\n");
    }

    #[test]
    fn resyncs_over_leading_garbage() {
        let mut dec = FrameDecoder::new();
        let mut ab = vec![0x11u8, 0x22, 0x33];
        ab.extend_from_slice(&stub_frame(1, RRN_NOT_BEACON, 0, 0, &[1, 0, 0, 0, 0, 0, 0, 0]));
        let frames = feed_all(&mut dec, &ab).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].hdr.rrn_id, RRN_NOT_BEACON);
    }

    #[test]
    fn rejects_request_range_ids_inbound() {
        let mut dec = FrameDecoder::new();
        let ab = stub_frame(1, RRN_REQ_CONNECT, 0, 0, &[]);
        let frames = feed_all(&mut dec, &ab).unwrap();
        assert!(frames.is_empty());
    }

    #[test]
    fn counter_skew_is_an_error_once_connected() {
        let mut dec = FrameDecoder::new();
        dec.session_established(1);
        // The first post-connect inbound PDU must carry counter 1.
        let ab = stub_frame(5, RRN_NOT_BEACON, 0, 0, &[9, 0, 0, 0, 0, 0, 0, 0]);
        let err = feed_all(&mut dec, &ab).unwrap_err();
        assert!(matches!(err, ProxyError::Protocol(_)));
    }

    #[test]
    fn ccd_bound_is_enforced_after_connect() {
        let mut dec = FrameDecoder::new();
        dec.session_established(2);
        let ab = stub_frame(1, RRN_NOT_IRQ_CHANGE, 7, 0, &[1, 0, 0, 0, 0, 0, 0, 0]);
        assert!(feed_all(&mut dec, &ab).unwrap().is_empty());
        // A frame for a valid CCD with the same counter is still accepted:
        // the dropped frame must not have consumed the expected counter.
        let ab = stub_frame(1, RRN_NOT_IRQ_CHANGE, 1, 0, &[1, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(feed_all(&mut dec, &ab).unwrap().len(), 1);
    }

    #[test]
    fn zero_len_payload_skips_payload_state() {
        let mut dec = FrameDecoder::new();
        let ab = stub_frame(3, response_for(RRN_REQ_PSP_MEM_WRITE), 0, 0, &[]);
        let frames = feed_all(&mut dec, &ab).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].payload.is_empty());
    }

    proptest! {
        /// emit → receive round-trips payload bytes exactly, pad is invisible.
        #[test]
        fn roundtrip_preserves_payload(payload in proptest::collection::vec(any::<u8>(), 0..1024),
                                       counter in 1u32..1000,
                                       ccd in 0u32..1) {
            let mut dec = FrameDecoder::new();
            let ab = stub_frame(counter, RRN_NOT_LOG_MSG, ccd, 0, &payload);
            let frames = feed_all(&mut dec, &ab).unwrap();
            prop_assert_eq!(frames.len(), 1);
            prop_assert_eq!(&frames[0].payload, &payload);
            prop_assert_eq!(frames[0].hdr.pdu_counter, counter);
        }

        /// Garbage that cannot contain the start magic's first byte always
        /// resolves to exactly one accepted frame.
        #[test]
        fn resync_finds_the_frame(garbage in proptest::collection::vec(
                                      any::<u8>().prop_filter("not magic lead byte", |b| *b != 0xB5),
                                      0..64),
                                  payload in proptest::collection::vec(any::<u8>(), 0..64)) {
            let mut dec = FrameDecoder::new();
            let mut ab = garbage;
            ab.extend_from_slice(&stub_frame(1, RRN_NOT_LOG_MSG, 0, 0, &payload));
            let frames = feed_all(&mut dec, &ab).unwrap();
            prop_assert_eq!(frames.len(), 1);
            prop_assert_eq!(&frames[0].payload, &payload);
        }

        /// Any single corrupted byte makes the receiver drop or reject the
        /// frame; it is never accepted with the corrupted content.
        #[test]
        fn corruption_is_never_accepted(payload in proptest::collection::vec(any::<u8>(), 0..128),
                                        pos_seed in any::<usize>(),
                                        xor in 1u8..=255) {
            let ab = stub_frame(1, RRN_NOT_LOG_MSG, 0, 0, &payload);
            let mut corrupted = ab.clone();
            let pos = pos_seed % ab.len();
            corrupted[pos] ^= xor;

            let mut dec = FrameDecoder::new();
            let frames = match feed_all(&mut dec, &corrupted) {
                Ok(frames) => frames,
                Err(_) => Vec::new(),
            };
            // Either nothing surfaced, or whatever surfaced is not a
            // corrupted-yet-valid rendition of the original frame.
            for frame in frames {
                prop_assert_eq!(&frame.payload, &payload);
                prop_assert_eq!(corrupted[pos], ab[pos]);
            }
        }
    }
}
