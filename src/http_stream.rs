//! HTTP audio stream ingest.
//!
//! The server hands the player a literal HTTP request; it is sent verbatim
//! on a raw TCP socket and the response is parsed just far enough to get
//! the status line and the `icy-metaint` header. When ICY metadata is
//! present the read path strips it transparently, so decoders only ever
//! see audio bytes.
//!
//! Reads are non-blocking-ish: a short socket timeout lets the audio thread
//! interleave network waits with decoding and ring-buffer pushes.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Poll timeout used by `read_timed`.
pub const READ_TIMEOUT: Duration = Duration::from_millis(2);

const HEADER_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_HEADER_BYTES: usize = 16 * 1024;
const RECV_BUFFER_BYTES: usize = 256 * 1024;

/// Outcome of a timed read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` audio bytes were written to the buffer.
    Data(usize),
    /// No data within the poll timeout (or only metadata arrived).
    Idle,
    /// The server closed the connection: end of stream.
    Eof,
}

/// Strips ICY metadata blocks out of a raw stream in place.
///
/// With `icy-metaint: M`, the stream is M payload bytes, one length byte L,
/// then L*16 metadata bytes, repeating.
#[derive(Debug)]
struct IcyFilter {
    metaint: usize,
    until_metadata: usize,
    awaiting_length: bool,
    metadata_remaining: usize,
}

impl IcyFilter {
    fn new(metaint: usize) -> Self {
        Self {
            metaint,
            until_metadata: metaint,
            awaiting_length: false,
            metadata_remaining: 0,
        }
    }

    /// Filter `buf` in place, returning the audio byte count kept at the
    /// front. State carries across calls, so chunks may split anywhere.
    fn strip_in_place(&mut self, buf: &mut [u8]) -> usize {
        if self.metaint == 0 {
            return buf.len();
        }

        let mut read = 0usize;
        let mut write = 0usize;
        while read < buf.len() {
            if self.metadata_remaining > 0 {
                let skip = self.metadata_remaining.min(buf.len() - read);
                read += skip;
                self.metadata_remaining -= skip;
                continue;
            }
            if self.awaiting_length {
                self.metadata_remaining = buf[read] as usize * 16;
                read += 1;
                self.awaiting_length = false;
                self.until_metadata = self.metaint;
                continue;
            }
            let take = self.until_metadata.min(buf.len() - read);
            buf.copy_within(read..read + take, write);
            read += take;
            write += take;
            self.until_metadata -= take;
            if self.until_metadata == 0 {
                self.awaiting_length = true;
            }
        }
        write
    }
}

pub struct HttpStream {
    stream: TcpStream,
    status: u16,
    response_headers: String,
    icy: IcyFilter,
    bytes_received: u64,
    eof: bool,
}

impl HttpStream {
    /// Connect to the audio server and send `request` verbatim, then parse
    /// the response head.
    pub fn connect(server: Ipv4Addr, port: u16, request: &[u8]) -> Result<Self> {
        let addr = SocketAddr::from((server, port));
        tracing::debug!(%addr, "connecting to audio server");
        let stream = TcpStream::connect(addr).with_context(|| format!("connect {addr}"))?;
        stream.set_nodelay(true).ok();
        set_recv_buffer(&stream, RECV_BUFFER_BYTES);

        (&stream).write_all(request).context("send http request")?;

        stream.set_read_timeout(Some(HEADER_TIMEOUT)).ok();
        let headers = read_response_head(&stream)?;
        let status = parse_status_line(&headers);
        if status != 200 {
            tracing::warn!(status, "unexpected http status");
        }
        let metaint = parse_icy_metaint(&headers).unwrap_or(0);
        if metaint > 0 {
            tracing::info!(metaint, "icy metadata stripping enabled");
        }
        stream.set_read_timeout(Some(READ_TIMEOUT)).ok();

        tracing::info!(status, "audio stream connected");
        Ok(Self {
            stream,
            status,
            response_headers: headers,
            icy: IcyFilter::new(metaint),
            bytes_received: 0,
            eof: false,
        })
    }

    /// Read audio bytes with the short poll timeout. Metadata blocks are
    /// stripped before the bytes are handed back.
    pub fn read_timed(&mut self, buf: &mut [u8]) -> ReadOutcome {
        if self.eof {
            return ReadOutcome::Eof;
        }
        match (&self.stream).read(buf) {
            Ok(0) => {
                self.eof = true;
                ReadOutcome::Eof
            }
            Ok(n) => {
                self.bytes_received += n as u64;
                let audio = self.icy.strip_in_place(&mut buf[..n]);
                if audio == 0 {
                    ReadOutcome::Idle
                } else {
                    ReadOutcome::Data(audio)
                }
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::Interrupted =>
            {
                ReadOutcome::Idle
            }
            Err(e) => {
                tracing::warn!("audio stream read failed: {e}");
                self.eof = true;
                ReadOutcome::Eof
            }
        }
    }

    pub fn disconnect(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    /// The raw response head, forwarded to the control server via RESP.
    pub fn response_headers(&self) -> &str {
        &self.response_headers
    }

    /// Raw bytes received after the response head (metadata included).
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }
}

fn set_recv_buffer(stream: &TcpStream, bytes: usize) {
    let value = bytes as libc::c_int;
    // Safety: plain setsockopt on a valid fd with an int-sized option.
    let rc = unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        tracing::debug!("SO_RCVBUF not applied");
    }
}

/// Read the response head byte by byte until the blank line.
fn read_response_head(stream: &TcpStream) -> Result<String> {
    let mut head = Vec::with_capacity(1024);
    let mut byte = [0u8; 1];
    loop {
        match (&*stream).read(&mut byte) {
            Ok(0) => bail!("connection closed while reading response headers"),
            Ok(_) => {
                head.push(byte[0]);
                if head.ends_with(b"\r\n\r\n") {
                    break;
                }
                if head.len() > MAX_HEADER_BYTES {
                    bail!("response headers exceed {MAX_HEADER_BYTES} bytes");
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).context("read response headers"),
        }
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}

/// Status code from a `HTTP/1.x 200 ...` or `ICY 200 OK` status line.
fn parse_status_line(head: &str) -> u16 {
    let first_line = head.lines().next().unwrap_or("");
    first_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

/// Case-insensitive `icy-metaint:` header value.
fn parse_icy_metaint(head: &str) -> Option<usize> {
    for line in head.lines() {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("icy-metaint") {
                return value.trim().parse().ok();
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn status_line_accepts_http_and_icy_shapes() {
        assert_eq!(parse_status_line("HTTP/1.0 200 OK\r\n\r\n"), 200);
        assert_eq!(parse_status_line("HTTP/1.1 404 Not Found\r\n\r\n"), 404);
        assert_eq!(parse_status_line("ICY 200 OK\r\n\r\n"), 200);
        assert_eq!(parse_status_line("garbage"), 0);
    }

    #[test]
    fn icy_metaint_header_is_case_insensitive() {
        let head = "ICY 200 OK\r\nicy-name: radio\r\nIcy-MetaInt: 16000\r\n\r\n";
        assert_eq!(parse_icy_metaint(head), Some(16_000));
        assert_eq!(parse_icy_metaint("HTTP/1.0 200 OK\r\n\r\n"), None);
    }

    #[test]
    fn filter_with_no_metaint_passes_everything() {
        let mut filter = IcyFilter::new(0);
        let mut buf = [1u8, 2, 3, 4];
        assert_eq!(filter.strip_in_place(&mut buf), 4);
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn metadata_windows_are_stripped_exactly() {
        // icy-metaint 16000: 16000 audio, length byte 2, 32 metadata bytes,
        // 16000 more audio. Decoders must see exactly the 32000 audio bytes.
        let metaint = 16_000usize;
        let mut stream = Vec::new();
        for i in 0..metaint {
            stream.push((i % 251) as u8);
        }
        stream.push(0x02);
        stream.extend_from_slice(&[0xEEu8; 32]);
        for i in metaint..2 * metaint {
            stream.push((i % 251) as u8);
        }

        let mut filter = IcyFilter::new(metaint);
        let mut audio = Vec::new();
        // Deliberately awkward chunk size so boundaries split everywhere.
        for chunk in stream.chunks(1237) {
            let mut buf = chunk.to_vec();
            let n = filter.strip_in_place(&mut buf);
            audio.extend_from_slice(&buf[..n]);
        }

        assert_eq!(audio.len(), 2 * metaint);
        for (i, b) in audio.iter().enumerate() {
            assert_eq!(*b, (i % 251) as u8, "audio byte {i}");
        }
    }

    #[test]
    fn zero_length_metadata_block_costs_one_byte() {
        let mut filter = IcyFilter::new(4);
        let mut buf = vec![1, 2, 3, 4, 0x00, 5, 6, 7, 8, 0x00, 9];
        let n = filter.strip_in_place(&mut buf);
        assert_eq!(&buf[..n], &[1, 2, 3, 4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn metadata_split_across_reads_is_still_stripped() {
        let mut filter = IcyFilter::new(4);
        let mut audio = Vec::new();

        let mut part1 = vec![1, 2, 3, 4, 0x01, 0xAA, 0xAA]; // meta starts, 14 bytes left
        let n = filter.strip_in_place(&mut part1);
        audio.extend_from_slice(&part1[..n]);

        let mut part2 = vec![0xAA; 14];
        part2.extend_from_slice(&[5, 6]);
        let n = filter.strip_in_place(&mut part2);
        audio.extend_from_slice(&part2[..n]);

        assert_eq!(audio, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn connect_parses_head_and_strips_metadata_end_to_end() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut req = [0u8; 64];
            let n = sock.read(&mut req).unwrap();
            assert!(req[..n].starts_with(b"GET /radio"));

            sock.write_all(b"ICY 200 OK\r\nicy-metaint: 8\r\n\r\n").unwrap();
            sock.write_all(&[10, 11, 12, 13, 14, 15, 16, 17]).unwrap();
            sock.write_all(&[0x01]).unwrap();
            sock.write_all(&[0xBB; 16]).unwrap();
            sock.write_all(&[20, 21, 22, 23]).unwrap();
        });

        let mut http = HttpStream::connect(
            Ipv4Addr::LOCALHOST,
            port,
            b"GET /radio HTTP/1.0\r\n\r\n",
        )
        .unwrap();
        assert_eq!(http.status(), 200);
        assert!(http.response_headers().contains("icy-metaint"));

        let mut audio = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            match http.read_timed(&mut buf) {
                ReadOutcome::Data(n) => audio.extend_from_slice(&buf[..n]),
                ReadOutcome::Idle => continue,
                ReadOutcome::Eof => break,
            }
        }
        assert_eq!(audio, vec![10, 11, 12, 13, 14, 15, 16, 17, 20, 21, 22, 23]);
        server.join().unwrap();
    }
}
