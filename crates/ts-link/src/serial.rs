use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::channel::{Channel, Claim, Framing, PublicationGuard};
use crate::{Link, LinkError, Result};

const READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Text link over a UART.
///
/// Requests are written from the calling thread; a [`SerialReceiver`] running
/// on its own thread feeds every received byte into the shared channel.
pub struct SerialLink {
    channel: Arc<Channel>,
    writer: Mutex<Box<dyn Write + Send>>,
}

impl SerialLink {
    pub fn new<W: Write + Send + 'static>(writer: W) -> Self {
        Self {
            channel: Arc::new(Channel::new(Framing::Text)),
            writer: Mutex::new(Box::new(writer)),
        }
    }

    /// Opens a serial port and returns the link plus the receiver to run.
    pub fn open(path: &str, baud_rate: u32) -> Result<(Self, SerialReceiver<Box<dyn serialport::SerialPort>>)> {
        let port = serialport::new(path, baud_rate)
            .timeout(READ_TIMEOUT)
            .open()?;
        let reader = port.try_clone()?;
        tracing::info!(path, baud_rate, "opened serial link");
        let link = Self::new(port);
        let receiver = link.receiver(reader);
        Ok((link, receiver))
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub fn receiver<R: Read>(&self, reader: R) -> SerialReceiver<R> {
        SerialReceiver {
            reader,
            lines: LineReceiver::new(self.channel.clone()),
        }
    }

    /// Sends one request line and returns the response line.
    ///
    /// `acquire` bounds the wait for a concurrent request to finish,
    /// `response` the wait for the device to answer.
    pub fn request(&self, query: &[u8], acquire: Duration, response: Duration) -> Result<Vec<u8>> {
        let guard = self.channel.request(acquire)?;
        {
            let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
            writer.write_all(query)?;
            writer.flush()?;
        }
        match guard.into_response(response) {
            Some(line) => Ok(line),
            None => {
                tracing::debug!(query = %String::from_utf8_lossy(query).trim_end(), "serial response timed out");
                Err(LinkError::Timeout(response))
            }
        }
    }

    /// Latest `#` publication line, if one arrives within `timeout`.
    pub fn publication(&self, timeout: Duration) -> Option<PublicationGuard<'_>> {
        self.channel.publication(timeout)
    }
}

impl Link for SerialLink {
    fn send(&self, request: &[u8], _address: u8, timeout: Duration) -> Result<Vec<u8>> {
        self.request(request, timeout, timeout)
    }
}

/// Byte-level line splitter in front of a [`Channel`].
///
/// The first byte of a line decides where the line goes. `\n` ends a line
/// and a trailing `\r` is stripped.
pub struct LineReceiver {
    channel: Arc<Channel>,
    line: Vec<u8>,
    claim: Claim,
    at_line_start: bool,
}

impl LineReceiver {
    pub fn new(channel: Arc<Channel>) -> Self {
        Self {
            channel,
            line: Vec::new(),
            claim: Claim::Discard,
            at_line_start: true,
        }
    }

    pub fn feed(&mut self, byte: u8) {
        if byte == b'\n' {
            if self.claim != Claim::Discard {
                let mut line = std::mem::take(&mut self.line);
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                self.channel.finish_frame(self.claim, line);
            }
            self.line.clear();
            self.claim = Claim::Discard;
            self.at_line_start = true;
            return;
        }
        if self.at_line_start {
            self.claim = self.channel.begin_frame(byte);
            self.at_line_start = false;
        }
        if self.claim != Claim::Discard && self.line.len() < self.channel.capacity() {
            self.line.push(byte);
        }
    }

    pub fn feed_all(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.feed(b);
        }
    }
}

/// Read loop of a serial link.
pub struct SerialReceiver<R> {
    reader: R,
    lines: LineReceiver,
}

impl<R: Read> SerialReceiver<R> {
    /// Reads until `stop` is set or the reader reaches end of file.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<()> {
        let mut buf = [0u8; 256];
        while !stop.load(Ordering::Relaxed) {
            match self.reader.read(&mut buf) {
                Ok(0) => {
                    tracing::info!("serial reader closed");
                    return Ok(());
                }
                Ok(n) => self.lines.feed_all(&buf[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelState;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    const WAIT: Duration = Duration::from_millis(500);

    /// Device emulation: answers each written request line on the spot.
    struct EchoDevice {
        lines: Arc<Mutex<Option<LineReceiver>>>,
        written: Arc<Mutex<Vec<u8>>>,
    }

    impl Write for EchoDevice {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.written.lock().unwrap().extend_from_slice(buf);
            let node = String::from_utf8_lossy(&buf[1..]).trim_end().to_string();
            if let Some(rx) = self.lines.lock().unwrap().as_mut() {
                rx.feed_all(b"#noise\r\n");
                rx.feed_all(format!(":85 Content. \"{node}\"\r\n").as_bytes());
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn echo_link() -> (SerialLink, Arc<Mutex<Vec<u8>>>) {
        let lines = Arc::new(Mutex::new(None));
        let written = Arc::new(Mutex::new(Vec::new()));
        let link = SerialLink::new(EchoDevice {
            lines: lines.clone(),
            written: written.clone(),
        });
        *lines.lock().unwrap() = Some(LineReceiver::new(link.channel().clone()));
        (link, written)
    }

    #[test]
    fn test_request_gets_its_response() {
        let (link, written) = echo_link();
        let resp = link.send(b"?info\n", 0, WAIT).unwrap();
        assert_eq!(resp, b":85 Content. \"info\"");
        assert_eq!(*written.lock().unwrap(), b"?info\n");
        assert_eq!(link.channel().state(), ChannelState::Idle);
        let publication = link.publication(WAIT).unwrap();
        assert_eq!(publication.as_str(), Some("#noise"));
    }

    #[test]
    fn test_concurrent_requests_do_not_interleave() {
        let (link, _) = echo_link();
        let link = Arc::new(link);
        let ok = Arc::new(AtomicUsize::new(0));
        let workers: Vec<_> = (0..8)
            .map(|i| {
                let link = link.clone();
                let ok = ok.clone();
                thread::spawn(move || {
                    let node = format!("node{i}");
                    let resp = link.send(format!("?{node}\n").as_bytes(), 0, WAIT).unwrap();
                    if resp == format!(":85 Content. \"{node}\"").into_bytes() {
                        ok.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(ok.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn test_busy_when_slot_is_held() {
        let link = SerialLink::new(Vec::new());
        let _held = link.channel().request(WAIT).unwrap();
        let err = link.send(b"?info\n", 0, Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, LinkError::Busy));
    }

    #[test]
    fn test_silent_device_times_out() {
        let link = SerialLink::new(Vec::new());
        let err = link.send(b"?info\n", 0, Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, LinkError::Timeout(_)));
        assert_eq!(link.channel().state(), ChannelState::Idle);
    }

    #[test]
    fn test_markers_inside_a_line_are_plain_bytes() {
        let ch = Arc::new(Channel::new(Framing::Text));
        let mut rx = LineReceiver::new(ch.clone());
        let mut guard = ch.request(WAIT).unwrap();
        rx.feed_all(b"log: #1 :85\n");
        assert_eq!(ch.state(), ChannelState::AwaitingResponse);
        rx.feed_all(b":85 Content. {\"t\":\"a:b#c\"}\n");
        assert_eq!(guard.response(WAIT), Some(&b":85 Content. {\"t\":\"a:b#c\"}"[..]));
    }

    #[test]
    fn test_line_beyond_capacity_is_cut() {
        let ch = Arc::new(Channel::with_capacity(Framing::Text, 8));
        let mut rx = LineReceiver::new(ch.clone());
        rx.feed_all(b"#0123456789\r\n");
        assert_eq!(&*ch.publication(WAIT).unwrap(), b"#0123456");
    }

    #[test]
    fn test_receiver_runs_until_eof() {
        let link = SerialLink::new(Vec::new());
        let mut receiver = link.receiver(&b"#pub {\"a\":1}\n"[..]);
        receiver.run(&AtomicBool::new(false)).unwrap();
        assert_eq!(link.publication(WAIT).unwrap().as_str(), Some("#pub {\"a\":1}"));
    }
}
