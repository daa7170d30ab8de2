// PSP PROXY — LOG LINE ASSEMBLY
// LogMsg notifications carry arbitrary byte slices; the sink wants whole
// lines. Fixed 1 KiB assembly buffer; a message that would overflow it is
// dropped whole.

use log::warn;

use crate::hostio::HostIo;

const LOG_BUF_SIZE: usize = 1024;

pub struct LogLineBuffer {
    buf: [u8; LOG_BUF_SIZE],
    used: usize,
}

impl LogLineBuffer {
    pub fn new() -> Self {
        LogLineBuffer { buf: [0u8; LOG_BUF_SIZE], used: 0 }
    }

    /// Append a LogMsg payload and hand every completed line to the sink.
    /// Lines keep their trailing newline; the unterminated remainder stays
    /// buffered for the next message.
    pub fn feed(&mut self, msg: &[u8], sink: &mut dyn HostIo) {
        if self.used + msg.len() > LOG_BUF_SIZE {
            warn!("dropping {} byte log message (assembly buffer full)", msg.len());
            return;
        }
        self.buf[self.used..self.used + msg.len()].copy_from_slice(msg);
        self.used += msg.len();

        let mut start = 0;
        while let Some(pos) = self.buf[start..self.used].iter().position(|&b| b == b'\n') {
            let end = start + pos + 1;
            let line = String::from_utf8_lossy(&self.buf[start..end]).into_owned();
            sink.log_msg(&line);
            start = end;
        }
        if start != 0 {
            self.buf.copy_within(start..self.used, 0);
            self.used -= start;
        }
    }
}
