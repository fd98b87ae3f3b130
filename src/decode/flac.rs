//! FLAC stream decoder.
//!
//! Two phases. Phase 1 walks the `fLaC` metadata region; until the whole
//! region is buffered (album art can run to hundreds of kilobytes) every
//! fed byte is retained and `read_decoded` keeps answering "need more
//! input". STREAMINFO provides the format and the codec's extra data.
//!
//! Phase 2 frames the stream sync-to-sync: a frame spans one validated
//! frame header (15-bit sync, legal field codes, CRC-8) to the next, or to
//! the buffer end once EOF is signaled. The input position only advances
//! past frames the codec confirmed, so an incomplete trailing frame is
//! re-presented intact on the next call; the buffer is compacted to that
//! confirmed position. Frames the codec rejects (CRC mismatch, bad header)
//! are dropped at debug level and decoding resyncs at the next header.

use symphonia::core::codecs::{CodecParameters, Decoder as _, DecoderOptions, CODEC_TYPE_FLAC};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::Packet;

use super::{append_interleaved_i32, InputBuffer, OutputBuffer};
use crate::format::DecodedFormat;

const STREAMINFO_LEN: usize = 34;

pub struct FlacDecoder {
    input: InputBuffer,
    output: OutputBuffer,
    codec: Option<Box<dyn symphonia::core::codecs::Decoder>>,
    format: DecodedFormat,
    format_ready: bool,
    metadata_done: bool,
    eof: bool,
    error: bool,
    finished: bool,
    decoded_samples: u64,
}

impl FlacDecoder {
    pub fn new() -> Self {
        Self {
            input: InputBuffer::default(),
            output: OutputBuffer::default(),
            codec: None,
            format: DecodedFormat::default(),
            format_ready: false,
            metadata_done: false,
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

        if !self.metadata_done && !self.process_metadata() {
            if self.eof {
                // Truncated before the metadata completed.
                self.finished = true;
            }
            return 0;
        }

        self.decode_frames(max_frames);

        let channels = self.format.channels as usize;
        let frames = self.output.take_frames(out, max_frames, channels);

        if frames == 0 && self.eof && self.input.len_remaining() == 0 {
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
        self.metadata_done = false;
        self.eof = false;
        self.error = false;
        self.finished = false;
        self.decoded_samples = 0;
    }

    /// Walk the metadata region. Returns true once audio frames can follow.
    fn process_metadata(&mut self) -> bool {
        let buf = self.input.remaining();
        if buf.len() < 4 {
            return false;
        }
        if &buf[..4] != b"fLaC" {
            tracing::error!(magic = ?&buf[..4], "not a flac stream");
            self.error = true;
            return false;
        }

        let mut pos = 4usize;
        let mut streaminfo: Option<Vec<u8>> = None;
        loop {
            if pos + 4 > buf.len() {
                return false; // metadata incomplete, keep everything
            }
            let last = buf[pos] & 0x80 != 0;
            let block_type = buf[pos] & 0x7F;
            let len = ((buf[pos + 1] as usize) << 16)
                | ((buf[pos + 2] as usize) << 8)
                | buf[pos + 3] as usize;
            if pos + 4 + len > buf.len() {
                return false;
            }
            if block_type == 0 && len >= STREAMINFO_LEN {
                streaminfo = Some(buf[pos + 4..pos + 4 + STREAMINFO_LEN].to_vec());
            }
            pos += 4 + len;
            if last {
                break;
            }
        }

        let Some(info) = streaminfo else {
            tracing::error!("flac metadata has no streaminfo");
            self.error = true;
            return false;
        };

        let (rate, channels, bits, total) = parse_streaminfo(&info);
        if rate == 0 || channels == 0 {
            tracing::error!("flac streaminfo is invalid");
            self.error = true;
            return false;
        }

        let mut params = CodecParameters::new();
        params
            .for_codec(CODEC_TYPE_FLAC)
            .with_sample_rate(rate)
            .with_extra_data(info.into_boxed_slice());
        match symphonia::default::get_codecs().make(&params, &DecoderOptions::default()) {
            Ok(codec) => self.codec = Some(codec),
            Err(e) => {
                tracing::error!("flac codec init failed: {e}");
                self.error = true;
                return false;
            }
        }

        self.format = DecodedFormat {
            sample_rate: rate,
            bit_depth: bits,
            channels,
            total_samples: total,
        };
        self.format_ready = true;
        self.metadata_done = true;

        tracing::info!(
            rate,
            bits,
            channels,
            total_samples = total,
            "flac stream"
        );

        // Metadata is consumed for good; the codec keeps STREAMINFO.
        self.input.advance(pos);
        self.input.compact();
        true
    }

    /// Decode whole frames from the input buffer until `max_frames` of
    /// output are staged or the buffer runs out of complete frames.
    fn decode_frames(&mut self, max_frames: usize) {
        let channels = self.format.channels as usize;

        while self.output.frames_available(channels) < max_frames {
            let buf = self.input.remaining();
            if buf.is_empty() {
                break;
            }

            // Resync: drop garbage before the next plausible frame header.
            let Some(start) = find_frame_header(buf, 0, self.eof) else {
                if self.eof {
                    // Nothing decodable remains.
                    self.input.advance(buf.len());
                    self.input.compact();
                }
                break;
            };
            if start > 0 {
                tracing::debug!(skipped = start, "flac resync");
                self.input.advance(start);
                self.input.compact();
                continue;
            }

            let buf = self.input.remaining();
            let frame_end = match find_frame_header(buf, 2, self.eof) {
                Some(end) => end,
                None if self.eof => buf.len(), // trailing frame
                None => break,                 // incomplete frame, wait for more input
            };

            let frame = &buf[..frame_end];
            let packet = Packet::new_from_slice(0, self.decoded_samples, 0, frame);
            let codec = self.codec.as_mut().expect("codec after metadata");
            match codec.decode(&packet) {
                Ok(decoded) => {
                    let frames = append_interleaved_i32(decoded, &mut self.output);
                    self.decoded_samples += frames as u64;
                }
                Err(SymphoniaError::DecodeError(e)) => {
                    // Bad header or CRC mismatch: recoverable, resync.
                    tracing::debug!("flac frame dropped: {e}");
                }
                Err(SymphoniaError::ResetRequired) => {
                    codec.reset();
                }
                Err(e) => {
                    tracing::error!("flac decode failed: {e}");
                    self.error = true;
                    return;
                }
            }

            // Frame confirmed (decoded or deliberately dropped).
            self.input.advance(frame_end);
            self.input.compact();
        }
    }
}

/// Find the next offset >= `from` that holds a validated frame header.
///
/// Returns `None` when no complete candidate exists yet — including the case
/// where a candidate sits too close to the buffer end to validate, unless
/// `eof` says no more bytes will arrive.
fn find_frame_header(buf: &[u8], from: usize, eof: bool) -> Option<usize> {
    let mut i = from;
    while i + 1 < buf.len() {
        if buf[i] == 0xFF && buf[i + 1] & 0xFE == 0xF8 {
            match validate_frame_header(&buf[i..]) {
                HeaderCheck::Valid => return Some(i),
                HeaderCheck::NeedMore if !eof => return None,
                _ => {}
            }
        }
        i += 1;
    }
    None
}

enum HeaderCheck {
    Valid,
    Invalid,
    NeedMore,
}

/// Validate a FLAC frame header at the start of `buf`.
fn validate_frame_header(buf: &[u8]) -> HeaderCheck {
    if buf.len() < 4 {
        return HeaderCheck::NeedMore;
    }
    if buf[0] != 0xFF || buf[1] & 0xFE != 0xF8 {
        return HeaderCheck::Invalid;
    }

    let blocksize_code = buf[2] >> 4;
    let rate_code = buf[2] & 0x0F;
    let channel_code = buf[3] >> 4;
    let size_code = (buf[3] >> 1) & 0x07;

    if blocksize_code == 0 || rate_code == 15 {
        return HeaderCheck::Invalid;
    }
    if channel_code > 10 || size_code == 3 || size_code == 7 || buf[3] & 1 != 0 {
        return HeaderCheck::Invalid;
    }

    // UTF-8 coded frame/sample number (1..7 bytes).
    let mut pos = 4usize;
    if pos >= buf.len() {
        return HeaderCheck::NeedMore;
    }
    let lead = buf[pos];
    let cont = match lead {
        0x00..=0x7F => 0,
        0xC0..=0xDF => 1,
        0xE0..=0xEF => 2,
        0xF0..=0xF7 => 3,
        0xF8..=0xFB => 4,
        0xFC..=0xFD => 5,
        0xFE => 6,
        _ => return HeaderCheck::Invalid,
    };
    pos += 1;
    for _ in 0..cont {
        if pos >= buf.len() {
            return HeaderCheck::NeedMore;
        }
        if buf[pos] & 0xC0 != 0x80 {
            return HeaderCheck::Invalid;
        }
        pos += 1;
    }

    // Explicit blocksize / sample-rate fields.
    pos += match blocksize_code {
        6 => 1,
        7 => 2,
        _ => 0,
    };
    pos += match rate_code {
        12 => 1,
        13 | 14 => 2,
        _ => 0,
    };
    if pos >= buf.len() {
        return HeaderCheck::NeedMore;
    }

    if crc8(&buf[..pos]) != buf[pos] {
        return HeaderCheck::Invalid;
    }
    HeaderCheck::Valid
}

/// CRC-8 with polynomial 0x07 (the FLAC frame header CRC).
fn crc8(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for &b in data {
        crc ^= b;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x07
            } else {
                crc << 1
            };
        }
    }
    crc
}

fn parse_streaminfo(info: &[u8]) -> (u32, u32, u32, u64) {
    let rate = ((info[10] as u32) << 12) | ((info[11] as u32) << 4) | (info[12] as u32 >> 4);
    let channels = ((info[12] as u32 >> 1) & 0x07) + 1;
    let bits = (((info[12] as u32 & 1) << 4) | (info[13] as u32 >> 4)) + 1;
    let total = (((info[13] & 0x0F) as u64) << 32)
        | u32::from_be_bytes([info[14], info[15], info[16], info[17]]) as u64;
    (rate, channels, bits, total)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// STREAMINFO payload for 44.1 kHz / 16-bit / stereo, 1000 samples.
    fn streaminfo_44100_16_2() -> [u8; STREAMINFO_LEN] {
        let mut b = [0u8; STREAMINFO_LEN];
        b[0..2].copy_from_slice(&4096u16.to_be_bytes()); // min blocksize
        b[2..4].copy_from_slice(&4096u16.to_be_bytes()); // max blocksize
        // rate 44100 = 0x0AC44 over 20 bits, channels-1 = 1, bps-1 = 15
        b[10] = 0x0A;
        b[11] = 0xC4;
        b[12] = 0x40 | (1 << 1) | 0; // rate low nibble, channels, bps high bit
        b[13] = 0xF0; // bps low bits, total high nibble
        b[14..18].copy_from_slice(&1000u32.to_be_bytes());
        b
    }

    fn metadata_stream(last: bool) -> Vec<u8> {
        let info = streaminfo_44100_16_2();
        let mut s = Vec::new();
        s.extend_from_slice(b"fLaC");
        s.push(if last { 0x80 } else { 0x00 }); // STREAMINFO block header
        s.extend_from_slice(&[0, 0, STREAMINFO_LEN as u8]);
        s.extend_from_slice(&info);
        s
    }

    #[test]
    fn streaminfo_fields_decode() {
        let (rate, channels, bits, total) = parse_streaminfo(&streaminfo_44100_16_2());
        assert_eq!(rate, 44_100);
        assert_eq!(channels, 2);
        assert_eq!(bits, 16);
        assert_eq!(total, 1000);
    }

    #[test]
    fn metadata_parses_once_complete() {
        let mut dec = FlacDecoder::new();
        let stream = metadata_stream(true);

        // Partial metadata: need more input, no error, format not ready.
        dec.feed(&stream[..10]);
        let mut out = [0i32; 16];
        assert_eq!(dec.read_decoded(&mut out, 4), 0);
        assert!(!dec.is_format_ready());
        assert!(!dec.has_error());

        dec.feed(&stream[10..]);
        assert_eq!(dec.read_decoded(&mut out, 4), 0); // no frames yet
        assert!(dec.is_format_ready());
        let fmt = dec.format();
        assert_eq!(
            (fmt.sample_rate, fmt.bit_depth, fmt.channels, fmt.total_samples),
            (44_100, 16, 2, 1000)
        );
    }

    #[test]
    fn metadata_with_trailing_blocks_needs_all_of_them() {
        let mut dec = FlacDecoder::new();
        let mut stream = metadata_stream(false);
        // A 200-byte PADDING block marked last.
        stream.push(0x81);
        stream.extend_from_slice(&[0, 0, 200]);
        let padding_start = stream.len();
        stream.extend_from_slice(&[0u8; 200]);

        let mut out = [0i32; 4];
        dec.feed(&stream[..padding_start + 50]);
        assert_eq!(dec.read_decoded(&mut out, 1), 0);
        assert!(!dec.is_format_ready());

        dec.feed(&stream[padding_start + 50..]);
        dec.read_decoded(&mut out, 1);
        assert!(dec.is_format_ready());
    }

    #[test]
    fn bad_magic_is_fatal() {
        let mut dec = FlacDecoder::new();
        dec.feed(b"MP3 junk....");
        let mut out = [0i32; 4];
        assert_eq!(dec.read_decoded(&mut out, 1), 0);
        assert!(dec.has_error());
    }

    #[test]
    fn frame_header_validation_accepts_a_well_formed_header() {
        // blocksize code 12, rate code 9, stereo, 16-bit, frame number 0.
        let mut header = vec![0xFF, 0xF8, 0xC9, 0x18, 0x00];
        let crc = crc8(&header);
        header.push(crc);
        assert!(matches!(
            validate_frame_header(&header),
            HeaderCheck::Valid
        ));
        assert_eq!(find_frame_header(&header, 0, false), Some(0));
    }

    #[test]
    fn frame_header_validation_rejects_bad_crc() {
        let mut header = vec![0xFF, 0xF8, 0xC9, 0x18, 0x00];
        let crc = crc8(&header);
        header.push(crc ^ 0x5A);
        assert!(matches!(
            validate_frame_header(&header),
            HeaderCheck::Invalid
        ));
    }

    #[test]
    fn truncated_header_asks_for_more() {
        let header = [0xFF, 0xF8, 0xC9];
        assert!(matches!(
            validate_frame_header(&header),
            HeaderCheck::NeedMore
        ));
    }

    #[test]
    fn reserved_field_codes_are_rejected() {
        // blocksize code 0 is reserved.
        let bad = [0xFF, 0xF8, 0x09, 0x18, 0x00, 0x00];
        assert!(matches!(validate_frame_header(&bad), HeaderCheck::Invalid));
        // rate code 15 is invalid.
        let bad = [0xFF, 0xF8, 0xCF, 0x18, 0x00, 0x00];
        assert!(matches!(validate_frame_header(&bad), HeaderCheck::Invalid));
    }

    #[test]
    fn flush_resets_to_pre_feed_state() {
        let mut dec = FlacDecoder::new();
        dec.feed(&metadata_stream(true));
        let mut out = [0i32; 4];
        dec.read_decoded(&mut out, 1);
        assert!(dec.is_format_ready());

        dec.flush();
        assert!(!dec.is_format_ready());
        assert!(!dec.has_error());
        assert_eq!(dec.decoded_samples(), 0);
    }
}
