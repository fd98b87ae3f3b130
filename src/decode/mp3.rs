//! MPEG layer III stream decoder.
//!
//! Frames the raw byte stream on MPEG audio frame headers (sync + legal
//! field codes + computed frame length + next-sync confirmation) and feeds
//! whole frames to the codec, which carries the bit reservoir across them.
//! A header that does not check out advances the scan by one byte — the
//! silent-resync behavior internet radio needs. A leading ID3v2 tag is
//! skipped wholesale.

use symphonia::core::codecs::{CodecParameters, Decoder as _, DecoderOptions, CODEC_TYPE_MP3};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::Packet;

use super::{append_interleaved_i32, InputBuffer, OutputBuffer};
use crate::format::DecodedFormat;

pub struct Mp3Decoder {
    input: InputBuffer,
    output: OutputBuffer,
    codec: Option<Box<dyn symphonia::core::codecs::Decoder>>,
    format: DecodedFormat,
    format_ready: bool,
    stream_started: bool,
    eof: bool,
    error: bool,
    finished: bool,
    decoded_samples: u64,
}

impl Mp3Decoder {
    pub fn new() -> Self {
        Self {
            input: InputBuffer::default(),
            output: OutputBuffer::default(),
            codec: None,
            format: DecodedFormat::default(),
            format_ready: false,
            stream_started: false,
            eof: false,
            error: false,
            finished: false,
            decoded_samples: 0,
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.input.push(bytes);
    }

    pub fn set_eof(&mut self) {
        self.eof = true;
    }

    pub fn read_decoded(&mut self, out: &mut [i32], max_frames: usize) -> usize {
        if self.error || self.finished {
            return 0;
        }
        if self.codec.is_none() && !self.init_codec() {
            return 0;
        }

        self.decode_frames(max_frames);

        let channels = self.format.channels as usize;
        let frames = if channels > 0 {
            self.output.take_frames(out, max_frames, channels)
        } else {
            0
        };

        if frames == 0 && self.eof && self.input.len_remaining() < 4 {
            self.finished = true;
        }
        frames
    }

    pub fn is_format_ready(&self) -> bool {
        self.format_ready
    }

    pub fn format(&self) -> DecodedFormat {
        self.format
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn has_error(&self) -> bool {
        self.error
    }

    pub fn decoded_samples(&self) -> u64 {
        self.decoded_samples
    }

    pub fn flush(&mut self) {
        self.input.clear();
        self.output.clear();
        self.codec = None;
        self.format = DecodedFormat::default();
        self.format_ready = false;
        self.stream_started = false;
        self.eof = false;
        self.error = false;
        self.finished = false;
        self.decoded_samples = 0;
    }

    fn init_codec(&mut self) -> bool {
        let mut params = CodecParameters::new();
        params.for_codec(CODEC_TYPE_MP3);
        match symphonia::default::get_codecs().make(&params, &DecoderOptions::default()) {
            Ok(codec) => {
                self.codec = Some(codec);
                true
            }
            Err(e) => {
                tracing::error!("mp3 codec init failed: {e}");
                self.error = true;
                false
            }
        }
    }

    fn decode_frames(&mut self, max_frames: usize) {
        loop {
            let channels = self.format.channels as usize;
            if channels > 0 && self.output.frames_available(channels) >= max_frames {
                break;
            }

            // Leading ID3v2 tag: skip it whole once it is fully buffered.
            if !self.stream_started {
                let buf = self.input.remaining();
                if buf.len() < 3 && !self.eof {
                    break;
                }
                if buf.len() >= 3 && &buf[..3] == b"ID3" {
                    if buf.len() < 10 {
                        break;
                    }
                    let size = syncsafe_u32(&buf[6..10]) as usize + 10;
                    if buf.len() < size {
                        break;
                    }
                    tracing::debug!(bytes = size, "skipping id3v2 tag");
                    self.input.advance(size);
                    self.input.compact();
                }
                self.stream_started = true;
                continue;
            }

            let buf = self.input.remaining();
            if buf.len() < 4 {
                break;
            }

            let Some((start, frame_len)) = find_mpeg_frame(buf, self.eof) else {
                if self.eof {
                    self.input.advance(buf.len());
                    self.input.compact();
                }
                break;
            };
            if start > 0 {
                tracing::debug!(skipped = start, "mp3 resync");
                self.input.advance(start);
                self.input.compact();
                continue;
            }
            if buf.len() < frame_len {
                if !self.eof {
                    break;
                }
                // Truncated trailing frame: nothing more will arrive.
                self.input.advance(buf.len());
                self.input.compact();
                break;
            }

            let packet = Packet::new_from_slice(0, self.decoded_samples, 0, &buf[..frame_len]);
            let codec = self.codec.as_mut().expect("codec initialized");
            match codec.decode(&packet) {
                Ok(decoded) => {
                    let spec = *decoded.spec();
                    if !self.format_ready {
                        self.format = DecodedFormat {
                            sample_rate: spec.rate,
                            bit_depth: 32,
                            channels: spec.channels.count() as u32,
                            total_samples: 0,
                        };
                        self.format_ready = true;
                        tracing::info!(
                            rate = spec.rate,
                            channels = spec.channels.count(),
                            "mp3 stream"
                        );
                    }
                    let frames = append_interleaved_i32(decoded, &mut self.output);
                    self.decoded_samples += frames as u64;
                }
                Err(SymphoniaError::DecodeError(e)) => {
                    tracing::debug!("mp3 frame dropped (resyncing): {e}");
                }
                Err(SymphoniaError::ResetRequired) => codec.reset(),
                Err(e) => {
                    tracing::error!("mp3 decode failed: {e}");
                    self.error = true;
                    return;
                }
            }

            self.input.advance(frame_len);
            self.input.compact();
        }
    }
}

/// Locate the next MPEG layer III frame: returns (offset, frame length).
///
/// A candidate must parse as a legal header and, when enough bytes are
/// buffered, be followed by a compatible header at `offset + length`. `None`
/// means no complete candidate yet (or none at all when `eof`).
fn find_mpeg_frame(buf: &[u8], eof: bool) -> Option<(usize, usize)> {
    let mut i = 0usize;
    while i + 4 <= buf.len() {
        if let Some(header) = parse_mpeg_header(&buf[i..i + 4]) {
            let next = i + header.frame_len;
            if next + 4 <= buf.len() {
                if let Some(next_header) = parse_mpeg_header(&buf[next..next + 4]) {
                    if next_header.compatible(&header) {
                        return Some((i, header.frame_len));
                    }
                }
                // False sync: keep scanning.
            } else if eof {
                // No room for a confirming header; trust the parse.
                return Some((i, header.frame_len));
            } else {
                return None; // wait for the confirming header
            }
        }
        i += 1;
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MpegHeader {
    version: u8, // 3 = MPEG1, 2 = MPEG2, 0 = MPEG2.5
    sample_rate: u32,
    frame_len: usize,
}

impl MpegHeader {
    fn compatible(&self, other: &MpegHeader) -> bool {
        self.version == other.version && self.sample_rate == other.sample_rate
    }
}

fn parse_mpeg_header(h: &[u8]) -> Option<MpegHeader> {
    if h[0] != 0xFF || h[1] & 0xE0 != 0xE0 {
        return None;
    }
    let version = (h[1] >> 3) & 0x03;
    let layer = (h[1] >> 1) & 0x03;
    if version == 1 || layer != 1 {
        return None; // reserved version, or not layer III
    }
    let bitrate_idx = (h[2] >> 4) as usize;
    let rate_idx = ((h[2] >> 2) & 0x03) as usize;
    if bitrate_idx == 0 || bitrate_idx == 15 || rate_idx == 3 {
        return None; // free-format or invalid
    }
    let padding = ((h[2] >> 1) & 1) as usize;

    const BITRATE_V1_L3: [u32; 15] = [
        0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320,
    ];
    const BITRATE_V2_L3: [u32; 15] = [
        0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160,
    ];
    const RATES_V1: [u32; 3] = [44_100, 48_000, 32_000];
    const RATES_V2: [u32; 3] = [22_050, 24_000, 16_000];
    const RATES_V25: [u32; 3] = [11_025, 12_000, 8_000];

    let (bitrate, sample_rate, coef) = match version {
        3 => (BITRATE_V1_L3[bitrate_idx], RATES_V1[rate_idx], 144),
        2 => (BITRATE_V2_L3[bitrate_idx], RATES_V2[rate_idx], 72),
        _ => (BITRATE_V2_L3[bitrate_idx], RATES_V25[rate_idx], 72),
    };

    let frame_len = (coef * bitrate * 1000 / sample_rate) as usize + padding;
    if frame_len < 24 {
        return None;
    }
    Some(MpegHeader {
        version,
        sample_rate,
        frame_len,
    })
}

fn syncsafe_u32(b: &[u8]) -> u32 {
    ((b[0] as u32 & 0x7F) << 21)
        | ((b[1] as u32 & 0x7F) << 14)
        | ((b[2] as u32 & 0x7F) << 7)
        | (b[3] as u32 & 0x7F)
}

#[cfg(test)]
mod tests {
    use super::*;

    // MPEG1 layer III, 128 kbps, 44.1 kHz, no padding: 417-byte frames.
    const HDR: [u8; 4] = [0xFF, 0xFB, 0x90, 0x00];

    #[test]
    fn header_parses_and_sizes_the_frame() {
        let h = parse_mpeg_header(&HDR).unwrap();
        assert_eq!(h.version, 3);
        assert_eq!(h.sample_rate, 44_100);
        assert_eq!(h.frame_len, 144 * 128_000 / 44_100);
    }

    #[test]
    fn reserved_fields_are_rejected() {
        assert!(parse_mpeg_header(&[0xFF, 0xEB, 0x90, 0x00]).is_none()); // reserved version
        assert!(parse_mpeg_header(&[0xFF, 0xFD, 0x90, 0x00]).is_none()); // layer II
        assert!(parse_mpeg_header(&[0xFF, 0xFB, 0xF0, 0x00]).is_none()); // bad bitrate
        assert!(parse_mpeg_header(&[0xFF, 0xFB, 0x9C, 0x00]).is_none()); // bad rate
        assert!(parse_mpeg_header(&[0xFE, 0xFB, 0x90, 0x00]).is_none()); // no sync
    }

    #[test]
    fn frame_search_requires_a_confirming_header() {
        let frame_len = parse_mpeg_header(&HDR).unwrap().frame_len;
        let mut stream = Vec::new();
        stream.extend_from_slice(&HDR);
        stream.resize(frame_len, 0);

        // One frame without a successor: undecided unless EOF.
        assert_eq!(find_mpeg_frame(&stream, false), None);
        assert_eq!(find_mpeg_frame(&stream, true), Some((0, frame_len)));

        // With the next header present it is confirmed.
        stream.extend_from_slice(&HDR);
        assert_eq!(find_mpeg_frame(&stream, false), Some((0, frame_len)));
    }

    #[test]
    fn garbage_before_sync_is_skipped() {
        let frame_len = parse_mpeg_header(&HDR).unwrap().frame_len;
        let mut stream = vec![0x12, 0x34, 0x56];
        stream.extend_from_slice(&HDR);
        stream.resize(3 + frame_len, 0);
        stream.extend_from_slice(&HDR);
        assert_eq!(find_mpeg_frame(&stream, false), Some((3, frame_len)));
    }

    #[test]
    fn id3v2_tag_is_skipped_whole() {
        let mut dec = Mp3Decoder::new();
        // 100-byte tag body.
        let mut stream = Vec::new();
        stream.extend_from_slice(b"ID3");
        stream.extend_from_slice(&[0x04, 0x00, 0x00]); // version + flags
        stream.extend_from_slice(&[0, 0, 0, 100]); // syncsafe size
        stream.extend_from_slice(&[0xAA; 100]);

        dec.feed(&stream[..50]);
        let mut out = [0i32; 8];
        assert_eq!(dec.read_decoded(&mut out, 2), 0);
        assert!(!dec.has_error());

        dec.feed(&stream[50..]);
        assert_eq!(dec.read_decoded(&mut out, 2), 0);
        // Tag consumed; stream position is now at the audio start.
        assert_eq!(dec.input.len_remaining(), 0);
    }

    #[test]
    fn syncsafe_decoding() {
        assert_eq!(syncsafe_u32(&[0, 0, 0x02, 0x01]), 257);
        assert_eq!(syncsafe_u32(&[0, 0, 0x01, 0x7F]), 255);
    }
}
