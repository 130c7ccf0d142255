//! git pkt-line framing and side-band demultiplexing
//!
//! each packet is prefixed with a 4-character hex length that includes
//! itself:
//!
//! - `0000` -- flush packet (end of section)
//! - `0001` -- delimiter packet
//! - `0002` -- response-end packet
//! - `0004`+ -- data packet

use std::io::{self, BufRead, Read, Write};

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::progress::CancellationToken;

/// largest packet including the length prefix
pub const MAX_PKT_LEN: usize = 65520;

/// largest side-band payload (packet minus prefix and band byte)
pub const MAX_SIDEBAND_DATA: usize = MAX_PKT_LEN - 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PktLine {
    Data(Vec<u8>),
    Flush,
    Delimiter,
    ResponseEnd,
}

impl PktLine {
    /// payload as text with the trailing newline stripped
    pub fn as_text(&self) -> Option<&str> {
        match self {
            PktLine::Data(data) => std::str::from_utf8(data)
                .ok()
                .map(|s| s.strip_suffix('\n').unwrap_or(s)),
            _ => None,
        }
    }
}

/// map an io failure on the wire to a transport error
pub(crate) fn wire_error(e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::UnexpectedEof => Error::Network("connection closed by remote".to_string()),
        _ => Error::Network(e.to_string()),
    }
}

/// write one data packet
pub fn write_pkt<W: Write + ?Sized>(w: &mut W, data: &[u8]) -> Result<()> {
    let total_len = data.len() + 4;
    if total_len > MAX_PKT_LEN {
        return Err(Error::Protocol(format!(
            "packet-line data too large ({} bytes)",
            total_len
        )));
    }
    w.write_all(format!("{:04x}", total_len).as_bytes())
        .and_then(|_| w.write_all(data))
        .map_err(wire_error)
}

/// write a text packet, appending the newline git expects
pub fn write_text<W: Write + ?Sized>(w: &mut W, line: &str) -> Result<()> {
    trace!(line, "pkt >");
    let mut data = Vec::with_capacity(line.len() + 1);
    data.extend_from_slice(line.as_bytes());
    data.push(b'\n');
    write_pkt(w, &data)
}

pub fn write_flush<W: Write + ?Sized>(w: &mut W) -> Result<()> {
    trace!("pkt > flush");
    w.write_all(b"0000").and_then(|_| w.flush()).map_err(wire_error)
}

/// write a side-band packet on the given band
pub fn write_band<W: Write + ?Sized>(w: &mut W, band: u8, data: &[u8]) -> Result<()> {
    for chunk in data.chunks(MAX_SIDEBAND_DATA) {
        let mut payload = Vec::with_capacity(chunk.len() + 1);
        payload.push(band);
        payload.extend_from_slice(chunk);
        write_pkt(w, &payload)?;
    }
    Ok(())
}

/// read one packet; None on a clean end of stream before any byte
pub fn read_pkt<R: Read + ?Sized>(r: &mut R) -> Result<Option<PktLine>> {
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < 4 {
        match r.read(&mut len_buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(Error::Network("truncated packet length".to_string())),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(wire_error(e)),
        }
    }

    let len_hex = std::str::from_utf8(&len_buf)
        .map_err(|_| Error::Protocol("non-utf-8 packet-line length prefix".to_string()))?;
    let pkt_len = usize::from_str_radix(len_hex, 16)
        .map_err(|_| Error::Protocol(format!("invalid packet-line length {:?}", len_hex)))?;

    let pkt = match pkt_len {
        0 => PktLine::Flush,
        1 => PktLine::Delimiter,
        2 => PktLine::ResponseEnd,
        3 => return Err(Error::Protocol("invalid packet-line length 0003".to_string())),
        n => {
            let mut payload = vec![0u8; n - 4];
            r.read_exact(&mut payload).map_err(wire_error)?;
            PktLine::Data(payload)
        }
    };
    Ok(Some(pkt))
}

/// read one packet and keep its wire bytes
///
/// a prefix that is not a hex length, such as the start of a raw pack, comes
/// back alone with no packet
pub fn read_pkt_or_raw<R: Read + ?Sized>(r: &mut R) -> Result<(Vec<u8>, Option<PktLine>)> {
    let mut prefix = [0u8; 4];
    r.read_exact(&mut prefix).map_err(wire_error)?;
    let mut wire = prefix.to_vec();
    let Some(pkt_len) = std::str::from_utf8(&prefix)
        .ok()
        .filter(|s| s.bytes().all(|b| b.is_ascii_hexdigit()))
        .and_then(|s| usize::from_str_radix(s, 16).ok())
    else {
        return Ok((wire, None));
    };

    let pkt = match pkt_len {
        0 => PktLine::Flush,
        1 => PktLine::Delimiter,
        2 => PktLine::ResponseEnd,
        3 => return Err(Error::Protocol("invalid packet-line length 0003".to_string())),
        n => {
            let mut payload = vec![0u8; n - 4];
            r.read_exact(&mut payload).map_err(wire_error)?;
            wire.extend_from_slice(&payload);
            PktLine::Data(payload)
        }
    };
    Ok((wire, Some(pkt)))
}

/// read one packet, treating end of stream as a dropped connection
pub fn expect_pkt<R: Read + ?Sized>(r: &mut R) -> Result<PktLine> {
    read_pkt(r)?.ok_or_else(|| Error::Network("connection closed by remote".to_string()))
}

/// pack data source: either side-band framed or raw
///
/// band 2 text is handed to `on_progress`, band 3 aborts with the remote's
/// message. the cancellation token is checked before every packet.
pub struct SidebandReader<'r, R: Read> {
    inner: &'r mut R,
    framed: bool,
    buf: Vec<u8>,
    pos: usize,
    eof: bool,
    cancel: CancellationToken,
    failure: Option<Error>,
    on_progress: Box<dyn FnMut(&str) + 'r>,
}

impl<'r, R: Read> SidebandReader<'r, R> {
    pub fn new(
        inner: &'r mut R,
        framed: bool,
        cancel: CancellationToken,
        on_progress: impl FnMut(&str) + 'r,
    ) -> Self {
        Self {
            inner,
            framed,
            buf: Vec::new(),
            pos: 0,
            eof: false,
            cancel,
            failure: None,
            on_progress: Box::new(on_progress),
        }
    }

    /// the error that stopped the stream, if it was not plain io
    pub fn take_failure(&mut self) -> Option<Error> {
        self.failure.take()
    }

    fn fail(&mut self, err: Error) -> io::Error {
        let message = err.to_string();
        self.failure = Some(err);
        io::Error::other(message)
    }

    fn refill(&mut self) -> io::Result<()> {
        while self.pos >= self.buf.len() && !self.eof {
            if self.cancel.is_cancelled() {
                return Err(self.fail(Error::Cancelled));
            }

            if !self.framed {
                self.buf.resize(64 * 1024, 0);
                let n = match self.inner.read(&mut self.buf) {
                    Ok(n) => n,
                    Err(e) => return Err(self.fail(wire_error(e))),
                };
                self.buf.truncate(n);
                self.pos = 0;
                self.eof = n == 0;
                continue;
            }

            let pkt = match read_pkt(self.inner) {
                Ok(pkt) => pkt,
                Err(e) => return Err(self.fail(e)),
            };
            match pkt {
                None | Some(PktLine::Flush) => self.eof = true,
                Some(PktLine::Data(mut data)) if !data.is_empty() => match data[0] {
                    1 => {
                        data.remove(0);
                        self.buf = data;
                        self.pos = 0;
                    }
                    2 => {
                        let text = String::from_utf8_lossy(&data[1..]);
                        for line in text.split(['\r', '\n']).filter(|l| !l.is_empty()) {
                            debug!(remote = line, "remote progress");
                            (self.on_progress)(line);
                        }
                    }
                    3 => {
                        let text = String::from_utf8_lossy(&data[1..]).trim().to_string();
                        return Err(self.fail(Error::Remote(text)));
                    }
                    band => {
                        return Err(self.fail(Error::Protocol(format!(
                            "unknown side-band {}",
                            band
                        ))))
                    }
                },
                Some(_) => {}
            }
        }
        Ok(())
    }
}

impl<R: Read> Read for SidebandReader<'_, R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let available = self.fill_buf()?;
        let n = available.len().min(out.len());
        out[..n].copy_from_slice(&available[..n]);
        self.consume(n);
        Ok(n)
    }
}

impl<R: Read> BufRead for SidebandReader<'_, R> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.refill()?;
        Ok(&self.buf[self.pos..])
    }

    fn consume(&mut self, amt: usize) {
        self.pos = (self.pos + amt).min(self.buf.len());
    }
}
