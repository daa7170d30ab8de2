// PSP PROXY — TEST HARNESS
// In-memory transport with a scripted peer: outbound PDUs are parsed and
// handed to a responder closure, whose reply frames queue up as inbound
// bytes. Poll never sleeps, so engine timeout paths run instantly.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::error::Result;
use crate::hostio::HostIo;
use crate::protocol::wire::*;
use crate::transport::{Interrupter, PollOutcome, Transport};

/// Build one raw stub → host frame.
pub fn stub_frame(counter: u32, rrn: u32, ccd: u32, rc: u32, payload: &[u8]) -> Vec<u8> {
    let hdr = PduHdr {
        start_magic: PSP_2_EXT_START_MAGIC,
        payload_len: payload.len() as u32,
        pdu_counter: counter,
        rrn_id: rrn,
        target_ccd: ccd,
        timestamp_ms: 0,
        request_rc: rc,
        reserved: 0,
    };
    let ab_hdr = hdr.to_wire();
    let cb_pad = padded_len(payload.len()) - payload.len();
    let pad = [0u8; PDU_PAYLOAD_ALIGN];
    let sum = byte_sum(&[&ab_hdr, payload, &pad[..cb_pad]]);
    let footer =
        PduFooter { checksum: sum.wrapping_neg(), end_magic: PSP_2_EXT_END_MAGIC };

    let mut ab = Vec::with_capacity(PDU_FRAME_OVERHEAD + padded_len(payload.len()));
    ab.extend_from_slice(&ab_hdr);
    ab.extend_from_slice(payload);
    ab.extend_from_slice(&pad[..cb_pad]);
    ab.extend_from_slice(&footer.to_wire());
    ab
}

pub fn beacon_frame(counter: u32, beacons_sent: u32) -> Vec<u8> {
    let not = BeaconNot { beacons_sent, reserved: 0 };
    stub_frame(counter, RRN_NOT_BEACON, 0, 0, bytemuck::bytes_of(&not))
}

pub fn connect_resp_frame(
    counter: u32,
    cb_pdu_max: u32,
    psp_addr_scratch: u32,
    cb_scratch: u32,
    sys_sockets: u32,
    ccds_per_socket: u32,
) -> Vec<u8> {
    let resp = ConnectResp {
        cb_pdu_max,
        psp_addr_scratch,
        cb_scratch,
        sys_sockets,
        ccds_per_socket,
    };
    stub_frame(counter, RRN_RESP_CONNECT, 0, 0, bytemuck::bytes_of(&resp))
}

type Responder = Box<dyn FnMut(&PduHdr, &[u8]) -> Vec<Vec<u8>>>;

#[derive(Default)]
pub struct MockInner {
    inbound: VecDeque<u8>,
    pending: Vec<u8>,
    /// Every complete host → stub PDU seen, in emission order.
    pub requests: Vec<(PduHdr, Vec<u8>)>,
    responder: Option<Responder>,
}

/// Test-side handle onto the shared mock state.
#[derive(Clone)]
pub struct MockLink(Rc<RefCell<MockInner>>);

impl MockLink {
    pub fn push_raw(&self, bytes: &[u8]) {
        self.0.borrow_mut().inbound.extend(bytes.iter().copied());
    }

    pub fn set_responder(&self, f: impl FnMut(&PduHdr, &[u8]) -> Vec<Vec<u8>> + 'static) {
        self.0.borrow_mut().responder = Some(Box::new(f));
    }

    pub fn requests(&self) -> Vec<(PduHdr, Vec<u8>)> {
        self.0.borrow().requests.clone()
    }

    pub fn requests_of(&self, rrn: u32) -> Vec<(PduHdr, Vec<u8>)> {
        self.0.borrow().requests.iter().filter(|(h, _)| h.rrn_id == rrn).cloned().collect()
    }
}

pub struct MockTransport(Rc<RefCell<MockInner>>);

pub fn mock_pair() -> (MockTransport, MockLink) {
    let inner = Rc::new(RefCell::new(MockInner::default()));
    (MockTransport(inner.clone()), MockLink(inner))
}

impl Transport for MockTransport {
    fn peek(&mut self) -> usize {
        self.0.borrow().inbound.len()
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut inner = self.0.borrow_mut();
        let cb = inner.inbound.len().min(buf.len());
        for slot in buf[..cb].iter_mut() {
            *slot = inner.inbound.pop_front().unwrap();
        }
        Ok(cb)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        let mut inner = self.0.borrow_mut();
        inner.pending.extend_from_slice(buf);

        // Reassemble complete host frames and run them past the responder.
        loop {
            if inner.pending.len() < PDU_HDR_SIZE {
                break;
            }
            let hdr = PduHdr::from_wire(inner.pending[..PDU_HDR_SIZE].try_into().unwrap());
            assert_eq!(hdr.start_magic, EXT_2_PSP_START_MAGIC, "host frame with bad magic");
            let total = PDU_FRAME_OVERHEAD + padded_len(hdr.payload_len as usize);
            if inner.pending.len() < total {
                break;
            }
            let payload =
                inner.pending[PDU_HDR_SIZE..PDU_HDR_SIZE + hdr.payload_len as usize].to_vec();
            inner.pending.drain(..total);
            inner.requests.push((hdr, payload.clone()));

            let mut responder = inner.responder.take();
            let replies =
                responder.as_mut().map(|f| f(&hdr, &payload)).unwrap_or_default();
            inner.responder = responder;
            for frame in replies {
                inner.inbound.extend(frame);
            }
        }
        Ok(())
    }

    fn poll(&mut self, _ms: u32) -> Result<PollOutcome> {
        if self.0.borrow().inbound.is_empty() {
            Ok(PollOutcome::TimedOut)
        } else {
            Ok(PollOutcome::Ready)
        }
    }

    fn interrupter(&self) -> Option<Interrupter> {
        None
    }
}

/// Host I/O sink with shared, inspectable state.
#[derive(Clone, Default)]
pub struct TestHostIo {
    pub input: Rc<RefCell<VecDeque<u8>>>,
    pub lines: Rc<RefCell<Vec<String>>>,
    pub out_bufs: Rc<RefCell<Vec<(u32, Vec<u8>)>>>,
}

impl HostIo for TestHostIo {
    fn log_msg(&mut self, line: &str) {
        self.lines.borrow_mut().push(line.to_string());
    }

    fn out_buf_write(&mut self, id_out_buf: u32, data: &[u8]) {
        self.out_bufs.borrow_mut().push((id_out_buf, data.to_vec()));
    }

    fn in_buf_peek(&mut self, _id_in_buf: u32) -> usize {
        self.input.borrow().len()
    }

    fn in_buf_read(&mut self, _id_in_buf: u32, buf: &mut [u8]) -> usize {
        let mut input = self.input.borrow_mut();
        let cb = input.len().min(buf.len());
        for slot in buf[..cb].iter_mut() {
            *slot = input.pop_front().unwrap();
        }
        cb
    }
}
