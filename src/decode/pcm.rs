//! Container PCM decoder: RIFF/WAVE (little-endian) and FORM/AIFF
//! (big-endian), plus raw PCM streams whose format arrives in the strm
//! command.
//!
//! Conversion rule: sign-extend the N-bit source sample to i32, then shift
//! left by `32 - N` so the value is MSB-aligned. IEEE-float WAV data is
//! scaled to full-scale i32 instead.

use crate::format::DecodedFormat;

const WAV_MIN_HEADER: usize = 44; // RIFF(12) + fmt(24) + data(8)
const AIFF_MIN_HEADER: usize = 46; // FORM(12) + COMM(26) + SSND(8)

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Detect,
    ParseWav,
    ParseAiff,
    Data,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SampleKind {
    Int,
    Float,
}

pub struct PcmDecoder {
    state: State,
    header: Vec<u8>,
    data: Vec<u8>,
    format: DecodedFormat,
    format_ready: bool,
    big_endian: bool,
    kind: SampleKind,
    /// Bytes of the data chunk still expected; 0 = unbounded stream.
    data_remaining: u64,
    raw_configured: bool,
    eof: bool,
    error: bool,
    finished: bool,
    decoded_samples: u64,
}

impl PcmDecoder {
    pub fn new() -> Self {
        Self {
            state: State::Detect,
            header: Vec::with_capacity(256),
            data: Vec::with_capacity(32 * 1024),
            format: DecodedFormat::default(),
            format_ready: false,
            big_endian: false,
            kind: SampleKind::Int,
            data_remaining: 0,
            raw_configured: false,
            eof: false,
            error: false,
            finished: false,
            decoded_samples: 0,
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        match self.state {
            State::Detect | State::ParseWav | State::ParseAiff => {
                self.header.extend_from_slice(bytes)
            }
            State::Data => self.data.extend_from_slice(bytes),
            State::Error => {}
        }
    }

    pub fn set_eof(&mut self) {
        self.eof = true;
    }

    pub fn read_decoded(&mut self, out: &mut [i32], max_frames: usize) -> usize {
        if self.error || self.finished {
            return 0;
        }

        if self.state == State::Detect && !self.detect_container() {
            if self.eof {
                // Truncated before the container was identifiable.
                self.finished = true;
            }
            return 0;
        }
        match self.state {
            State::ParseWav => {
                if !self.parse_wav_header() {
                    if self.eof {
                        self.finished = true;
                    }
                    return 0;
                }
            }
            State::ParseAiff => {
                if !self.parse_aiff_header() {
                    if self.eof {
                        self.finished = true;
                    }
                    return 0;
                }
            }
            _ => {}
        }
        if self.state != State::Data {
            return 0;
        }

        let bytes_per_sample = (self.format.bit_depth as usize).div_ceil(8);
        let bytes_per_frame = bytes_per_sample * self.format.channels as usize;
        if bytes_per_frame == 0 {
            return 0;
        }

        let mut avail_bytes = self.data.len();
        if self.data_remaining > 0 {
            avail_bytes = avail_bytes.min(self.data_remaining as usize);
        }

        let frames = (avail_bytes / bytes_per_frame).min(max_frames);
        if frames == 0 {
            // Finish only when no more data can arrive: EOF was signaled or
            // the data chunk has been fully consumed. A temporarily empty
            // buffer is not EOF — the next HTTP read may refill it.
            if self.eof {
                self.finished = true;
            }
            return 0;
        }

        let bytes = frames * bytes_per_frame;
        let samples = frames * self.format.channels as usize;
        convert_samples(
            &self.data[..bytes],
            &mut out[..samples],
            self.format.bit_depth,
            self.big_endian,
            self.kind,
        );

        self.data.drain(..bytes);
        if self.data_remaining > 0 {
            self.data_remaining -= bytes as u64;
            if self.data_remaining == 0 {
                self.finished = true;
            }
        }

        self.decoded_samples += frames as u64;
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

    pub fn set_raw_pcm_format(&mut self, rate: u32, bits: u32, channels: u32, big_endian: bool) {
        self.format = DecodedFormat {
            sample_rate: rate,
            bit_depth: bits,
            channels,
            total_samples: 0,
        };
        self.big_endian = big_endian;
        self.kind = SampleKind::Int;
        self.raw_configured = true;
    }

    pub fn flush(&mut self) {
        self.state = State::Detect;
        self.header.clear();
        self.data.clear();
        self.format = DecodedFormat::default();
        self.format_ready = false;
        self.big_endian = false;
        self.kind = SampleKind::Int;
        self.data_remaining = 0;
        self.raw_configured = false;
        self.eof = false;
        self.error = false;
        self.finished = false;
        self.decoded_samples = 0;
    }

    fn fail(&mut self) -> bool {
        self.state = State::Error;
        self.error = true;
        false
    }

    fn detect_container(&mut self) -> bool {
        if self.header.len() < 4 {
            return false;
        }

        if &self.header[..4] == b"RIFF" {
            self.state = State::ParseWav;
            tracing::debug!("wav container detected");
            return true;
        }
        if &self.header[..4] == b"FORM" {
            self.state = State::ParseAiff;
            tracing::debug!("aiff container detected");
            return true;
        }

        // No container magic: raw PCM as described by the strm command.
        if self.raw_configured {
            self.format_ready = true;
            self.data_remaining = 0;
            let header = std::mem::take(&mut self.header);
            self.data.extend_from_slice(&header);
            self.state = State::Data;
            tracing::info!(
                rate = self.format.sample_rate,
                bits = self.format.bit_depth,
                channels = self.format.channels,
                big_endian = self.big_endian,
                "raw pcm stream"
            );
            return true;
        }

        tracing::error!(magic = ?&self.header[..4], "unknown pcm container magic");
        self.fail()
    }

    fn parse_wav_header(&mut self) -> bool {
        if self.header.len() < WAV_MIN_HEADER {
            return false;
        }
        if &self.header[..4] != b"RIFF" || &self.header[8..12] != b"WAVE" {
            tracing::error!("invalid wav header");
            return self.fail();
        }

        let mut pos = 12usize;
        let mut found_fmt = false;
        let mut found_data = false;
        let mut data_start = 0usize;

        while pos + 8 <= self.header.len() {
            let chunk_size = read_le32(&self.header[pos + 4..]) as usize;

            if &self.header[pos..pos + 4] == b"fmt " {
                if pos + 8 + chunk_size > self.header.len() {
                    return false; // need more header bytes
                }
                if chunk_size < 16 {
                    tracing::error!(chunk_size, "fmt chunk too small");
                    return self.fail();
                }
                let body = &self.header[pos + 8..pos + 8 + chunk_size];
                let mut audio_format = read_le16(body);
                let extensible = audio_format == 0xFFFE;

                if extensible {
                    if chunk_size < 40 {
                        tracing::error!(chunk_size, "extensible fmt chunk too small");
                        return self.fail();
                    }
                    // SubFormat GUID: the leading u16 is the actual format code.
                    audio_format = read_le16(&body[24..]);
                }

                self.kind = match audio_format {
                    1 => SampleKind::Int,
                    3 => SampleKind::Float,
                    other => {
                        tracing::error!(format = other, "unsupported wav format");
                        return self.fail();
                    }
                };

                self.format.channels = read_le16(&body[2..]) as u32;
                self.format.sample_rate = read_le32(&body[4..]);
                self.format.bit_depth = read_le16(&body[14..]) as u32;

                if extensible {
                    let valid_bits = read_le16(&body[18..]);
                    if valid_bits > 0 {
                        self.format.bit_depth = valid_bits as u32;
                    }
                }

                self.big_endian = false;
                found_fmt = true;
            } else if &self.header[pos..pos + 4] == b"data" {
                self.data_remaining = chunk_size as u64;
                data_start = pos + 8;
                found_data = true;
            }

            if found_fmt && found_data {
                break;
            }
            pos += 8 + chunk_size;
            if chunk_size & 1 != 0 {
                pos += 1; // chunks are word-aligned
            }
        }

        if !found_fmt || !found_data {
            return false;
        }
        if self.format.channels == 0
            || self.format.bit_depth == 0
            || self.format.bit_depth > 32
            || (self.kind == SampleKind::Float && self.format.bit_depth != 32)
        {
            tracing::error!(
                bits = self.format.bit_depth,
                channels = self.format.channels,
                "unsupported wav sample layout"
            );
            return self.fail();
        }

        self.format.total_samples = self.data_remaining
            / ((self.format.bit_depth as u64).div_ceil(8) * self.format.channels as u64).max(1);
        self.format_ready = true;

        tracing::info!(
            rate = self.format.sample_rate,
            bits = self.format.bit_depth,
            channels = self.format.channels,
            float = self.kind == SampleKind::Float,
            "wav stream"
        );

        self.enter_data(data_start);
        true
    }

    fn parse_aiff_header(&mut self) -> bool {
        if self.header.len() < AIFF_MIN_HEADER {
            return false;
        }
        if &self.header[..4] != b"FORM"
            || (&self.header[8..12] != b"AIFF" && &self.header[8..12] != b"AIFC")
        {
            tracing::error!("invalid aiff header");
            return self.fail();
        }

        let mut pos = 12usize;
        let mut found_comm = false;
        let mut found_ssnd = false;
        let mut data_start = 0usize;

        while pos + 8 <= self.header.len() {
            let chunk_size = read_be32(&self.header[pos + 4..]) as usize;

            if &self.header[pos..pos + 4] == b"COMM" {
                if pos + 8 + chunk_size > self.header.len() {
                    return false;
                }
                if chunk_size < 18 {
                    tracing::error!(chunk_size, "COMM chunk too small");
                    return self.fail();
                }
                let body = &self.header[pos + 8..];
                self.format.channels = read_be16(body) as u32;
                let num_frames = read_be32(&body[2..]);
                self.format.bit_depth = read_be16(&body[6..]) as u32;
                self.format.sample_rate = extended_to_u32(&body[8..18]);
                self.format.total_samples = num_frames as u64;
                self.big_endian = true;
                self.kind = SampleKind::Int;
                found_comm = true;
            } else if &self.header[pos..pos + 4] == b"SSND" {
                if pos + 16 > self.header.len() {
                    return false;
                }
                let offset = read_be32(&self.header[pos + 8..]) as usize;
                // Chunk size includes the offset + blockSize fields.
                self.data_remaining = chunk_size.saturating_sub(8) as u64;
                data_start = pos + 16 + offset;
                found_ssnd = true;
            }

            if found_comm && found_ssnd {
                break;
            }
            pos += 8 + chunk_size;
            if chunk_size & 1 != 0 {
                pos += 1;
            }
        }

        if !found_comm || !found_ssnd {
            return false;
        }
        if self.format.channels == 0 || self.format.bit_depth == 0 || self.format.bit_depth > 32 {
            tracing::error!(
                bits = self.format.bit_depth,
                channels = self.format.channels,
                "unsupported aiff sample layout"
            );
            return self.fail();
        }

        self.format_ready = true;
        tracing::info!(
            rate = self.format.sample_rate,
            bits = self.format.bit_depth,
            channels = self.format.channels,
            "aiff stream"
        );

        self.enter_data(data_start);
        true
    }

    /// Move bytes past the header into the data buffer and switch state.
    fn enter_data(&mut self, data_start: usize) {
        if data_start < self.header.len() {
            let tail = self.header.split_off(data_start);
            self.data.extend_from_slice(&tail);
        }
        self.header.clear();
        self.state = State::Data;
    }
}

fn convert_samples(src: &[u8], dst: &mut [i32], bit_depth: u32, big_endian: bool, kind: SampleKind) {
    if kind == SampleKind::Float {
        for (i, chunk) in src.chunks_exact(4).enumerate() {
            let v = if big_endian {
                f32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])
            } else {
                f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])
            };
            let scaled = (v as f64 * 2147483648.0).clamp(-2147483648.0, 2147483647.0);
            dst[i] = scaled as i32;
        }
        return;
    }

    match (bit_depth.div_ceil(8), big_endian) {
        (1, _) => {
            for (i, &b) in src.iter().enumerate() {
                dst[i] = (b as i8 as i32) << 24;
            }
        }
        (2, false) => {
            for (i, c) in src.chunks_exact(2).enumerate() {
                dst[i] = (i16::from_le_bytes([c[0], c[1]]) as i32) << 16;
            }
        }
        (2, true) => {
            for (i, c) in src.chunks_exact(2).enumerate() {
                dst[i] = (i16::from_be_bytes([c[0], c[1]]) as i32) << 16;
            }
        }
        (3, false) => {
            for (i, c) in src.chunks_exact(3).enumerate() {
                dst[i] = ((c[2] as i32) << 24) | ((c[1] as i32) << 16) | ((c[0] as i32) << 8);
            }
        }
        (3, true) => {
            for (i, c) in src.chunks_exact(3).enumerate() {
                dst[i] = ((c[0] as i32) << 24) | ((c[1] as i32) << 16) | ((c[2] as i32) << 8);
            }
        }
        (4, false) => {
            for (i, c) in src.chunks_exact(4).enumerate() {
                dst[i] = i32::from_le_bytes([c[0], c[1], c[2], c[3]]);
            }
        }
        (4, true) => {
            for (i, c) in src.chunks_exact(4).enumerate() {
                dst[i] = i32::from_be_bytes([c[0], c[1], c[2], c[3]]);
            }
        }
        _ => {}
    }

    // 20-bit sources sit in 3 container bytes; the shift above already
    // MSB-aligns them, with the low 12 bits zero.
}

fn read_le16(p: &[u8]) -> u16 {
    u16::from_le_bytes([p[0], p[1]])
}

fn read_le32(p: &[u8]) -> u32 {
    u32::from_le_bytes([p[0], p[1], p[2], p[3]])
}

fn read_be16(p: &[u8]) -> u16 {
    u16::from_be_bytes([p[0], p[1]])
}

fn read_be32(p: &[u8]) -> u32 {
    u32::from_be_bytes([p[0], p[1], p[2], p[3]])
}

/// IEEE 754 80-bit extended precision to u32 (AIFF sample rates).
fn extended_to_u32(bytes: &[u8]) -> u32 {
    let exponent = (((bytes[0] & 0x7F) as i32) << 8) | bytes[1] as i32;
    let mut mantissa: u64 = 0;
    for &b in &bytes[2..10] {
        mantissa = (mantissa << 8) | b as u64;
    }
    if exponent == 0 && mantissa == 0 {
        return 0;
    }
    let f = (mantissa as f64) * 2f64.powi(exponent - 16383 - 63);
    (f + 0.5) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wav_header(rate: u32, bits: u16, channels: u16, data_len: u32) -> Vec<u8> {
        let byte_rate = rate * channels as u32 * bits as u32 / 8;
        let block_align = channels * bits / 8;
        let mut h = Vec::new();
        h.extend_from_slice(b"RIFF");
        h.extend_from_slice(&(36 + data_len).to_le_bytes());
        h.extend_from_slice(b"WAVE");
        h.extend_from_slice(b"fmt ");
        h.extend_from_slice(&16u32.to_le_bytes());
        h.extend_from_slice(&1u16.to_le_bytes()); // PCM
        h.extend_from_slice(&channels.to_le_bytes());
        h.extend_from_slice(&rate.to_le_bytes());
        h.extend_from_slice(&byte_rate.to_le_bytes());
        h.extend_from_slice(&block_align.to_le_bytes());
        h.extend_from_slice(&bits.to_le_bytes());
        h.extend_from_slice(b"data");
        h.extend_from_slice(&data_len.to_le_bytes());
        h
    }

    fn aiff_header(rate_extended: [u8; 10], bits: u16, channels: u16, frames: u32, data_len: u32) -> Vec<u8> {
        let mut h = Vec::new();
        h.extend_from_slice(b"FORM");
        h.extend_from_slice(&(4 + 26 + 16 + data_len).to_be_bytes());
        h.extend_from_slice(b"AIFF");
        h.extend_from_slice(b"COMM");
        h.extend_from_slice(&18u32.to_be_bytes());
        h.extend_from_slice(&channels.to_be_bytes());
        h.extend_from_slice(&frames.to_be_bytes());
        h.extend_from_slice(&bits.to_be_bytes());
        h.extend_from_slice(&rate_extended);
        h.extend_from_slice(b"SSND");
        h.extend_from_slice(&(8 + data_len).to_be_bytes());
        h.extend_from_slice(&0u32.to_be_bytes()); // offset
        h.extend_from_slice(&0u32.to_be_bytes()); // blockSize
        h
    }

    // 44100 Hz as an 80-bit extended float.
    const RATE_44100_EXT: [u8; 10] = [0x40, 0x0E, 0xAC, 0x44, 0, 0, 0, 0, 0, 0];

    #[test]
    fn wav_16bit_stereo_ramp_is_shifted_left_16() {
        // 1024 stereo frames of a ramp over the i16 range.
        let frames = 1024usize;
        let mut payload = Vec::new();
        let mut src = Vec::new();
        for i in 0..frames {
            let v = (i as i32 * 64 - 32768).clamp(-32768, 32767) as i16;
            for _ in 0..2 {
                payload.extend_from_slice(&v.to_le_bytes());
                src.push(v);
            }
        }

        let mut dec = PcmDecoder::new();
        dec.feed(&wav_header(44_100, 16, 2, payload.len() as u32));
        dec.feed(&payload);

        let mut out = vec![0i32; frames * 2];
        let got = dec.read_decoded(&mut out, frames);
        assert_eq!(got, frames);
        assert!(dec.is_format_ready());
        let fmt = dec.format();
        assert_eq!(
            (fmt.sample_rate, fmt.bit_depth, fmt.channels),
            (44_100, 16, 2)
        );
        for (o, s) in out.iter().zip(src.iter()) {
            assert_eq!(*o, (*s as i32) << 16);
            assert_eq!(*o & 0xFFFF, 0);
        }
        assert!(dec.is_finished());
    }

    #[test]
    fn wav_format_reported_from_header_alone() {
        let mut dec = PcmDecoder::new();
        dec.feed(&wav_header(96_000, 24, 2, 0));
        let mut out = [0i32; 2];
        dec.read_decoded(&mut out, 1);
        assert!(dec.is_format_ready());
        assert_eq!(dec.format().bit_depth, 24);
        assert_eq!(dec.format().sample_rate, 96_000);
    }

    #[test]
    fn aiff_24bit_mono_sign_extends_into_top_bits() {
        // 300 24-bit BE samples: 0x010000, 0x020000, ...
        let frames = 300usize;
        let mut payload = Vec::new();
        for i in 1..=frames as u32 {
            let v = i << 16;
            payload.extend_from_slice(&[(v >> 16) as u8, (v >> 8) as u8, v as u8]);
        }

        let mut dec = PcmDecoder::new();
        dec.feed(&aiff_header(
            RATE_44100_EXT,
            24,
            1,
            frames as u32,
            payload.len() as u32,
        ));
        dec.feed(&payload);

        let mut out = vec![0i32; frames];
        let got = dec.read_decoded(&mut out, frames);
        assert_eq!(got, frames);
        let fmt = dec.format();
        assert_eq!(
            (fmt.sample_rate, fmt.bit_depth, fmt.channels),
            (44_100, 24, 1)
        );
        for (i, o) in out.iter().enumerate() {
            let expected = (((i as u32 + 1) << 16) as i32) << 8;
            assert_eq!(*o, expected);
            assert_eq!(*o & 0xFF, 0);
        }
    }

    #[test]
    fn extensible_wav_overrides_format_and_valid_bits() {
        let mut h = Vec::new();
        h.extend_from_slice(b"RIFF");
        h.extend_from_slice(&100u32.to_le_bytes());
        h.extend_from_slice(b"WAVE");
        h.extend_from_slice(b"fmt ");
        h.extend_from_slice(&40u32.to_le_bytes());
        h.extend_from_slice(&0xFFFEu16.to_le_bytes()); // extensible
        h.extend_from_slice(&2u16.to_le_bytes()); // channels
        h.extend_from_slice(&192_000u32.to_le_bytes());
        h.extend_from_slice(&0u32.to_le_bytes()); // byte rate (unused)
        h.extend_from_slice(&8u16.to_le_bytes()); // block align
        h.extend_from_slice(&32u16.to_le_bytes()); // container bits
        h.extend_from_slice(&22u16.to_le_bytes()); // cbSize
        h.extend_from_slice(&24u16.to_le_bytes()); // valid bits
        h.extend_from_slice(&0u32.to_le_bytes()); // channel mask
        h.extend_from_slice(&1u16.to_le_bytes()); // subformat: PCM
        h.extend_from_slice(&[0u8; 14]); // rest of GUID
        h.extend_from_slice(b"data");
        h.extend_from_slice(&0u32.to_le_bytes());

        let mut dec = PcmDecoder::new();
        dec.feed(&h);
        let mut out = [0i32; 2];
        dec.read_decoded(&mut out, 1);
        assert!(dec.is_format_ready());
        assert_eq!(dec.format().bit_depth, 24);
        assert_eq!(dec.format().sample_rate, 192_000);
    }

    #[test]
    fn raw_pcm_uses_configured_format() {
        let mut dec = PcmDecoder::new();
        dec.set_raw_pcm_format(48_000, 16, 2, false);
        // No container magic: the first bytes are already audio.
        dec.feed(&[0x01, 0x00, 0xFF, 0xFF, 0x00, 0x80, 0x00, 0x7F]);

        let mut out = [0i32; 4];
        let got = dec.read_decoded(&mut out, 2);
        assert_eq!(got, 2);
        assert_eq!(out[0], 1 << 16);
        assert_eq!(out[1], -1 << 16);
        assert_eq!(out[2], (i16::MIN as i32) << 16);
        assert_eq!(out[3], 0x7F00 << 16);
    }

    #[test]
    fn unknown_magic_without_raw_config_is_an_error() {
        let mut dec = PcmDecoder::new();
        dec.feed(b"OggSxxxx");
        let mut out = [0i32; 2];
        assert_eq!(dec.read_decoded(&mut out, 1), 0);
        assert!(dec.has_error());
    }

    #[test]
    fn incremental_feed_matches_single_feed() {
        let frames = 64usize;
        let mut payload = Vec::new();
        for i in 0..frames as i16 {
            payload.extend_from_slice(&(i * 3).to_le_bytes());
            payload.extend_from_slice(&(-i * 2).to_le_bytes());
        }
        let full = {
            let mut dec = PcmDecoder::new();
            dec.feed(&wav_header(44_100, 16, 2, payload.len() as u32));
            dec.feed(&payload);
            let mut out = vec![0i32; frames * 2];
            assert_eq!(dec.read_decoded(&mut out, frames), frames);
            out
        };

        let mut dec = PcmDecoder::new();
        let stream: Vec<u8> = wav_header(44_100, 16, 2, payload.len() as u32)
            .into_iter()
            .chain(payload)
            .collect();
        let mut got = Vec::new();
        for chunk in stream.chunks(7) {
            dec.feed(chunk);
            let mut out = vec![0i32; frames * 2];
            let n = dec.read_decoded(&mut out, frames);
            got.extend_from_slice(&out[..n * 2]);
        }
        assert_eq!(got, full);
    }

    #[test]
    fn float_wav_scales_to_full_range() {
        let mut h = wav_header(48_000, 32, 1, 12);
        // Patch the format tag to IEEE float.
        h[20] = 3;
        let mut dec = PcmDecoder::new();
        dec.feed(&h);
        let mut payload = Vec::new();
        for v in [0.0f32, 0.5, -1.0] {
            payload.extend_from_slice(&v.to_le_bytes());
        }
        dec.feed(&payload);

        let mut out = [0i32; 3];
        assert_eq!(dec.read_decoded(&mut out, 3), 3);
        assert_eq!(out[0], 0);
        assert_eq!(out[1], 1 << 30);
        assert_eq!(out[2], i32::MIN);
    }

    #[test]
    fn wav_written_by_hound_round_trips() {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 44_100,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for i in 0..256i16 {
                writer.write_sample(i).unwrap();
                writer.write_sample(-i).unwrap();
            }
            writer.finalize().unwrap();
        }
        let bytes = cursor.into_inner();

        let mut dec = PcmDecoder::new();
        dec.feed(&bytes);
        dec.set_eof();
        let mut out = vec![0i32; 512];
        assert_eq!(dec.read_decoded(&mut out, 256), 256);
        assert_eq!(out[0], 0);
        assert_eq!(out[2], 1 << 16);
        assert_eq!(out[3], -1 << 16);
        assert_eq!(dec.format().sample_rate, 44_100);
    }

    #[test]
    fn flush_then_replay_is_identical() {
        let payload: Vec<u8> = (0..200u16).flat_map(|v| v.to_le_bytes()).collect();
        let stream: Vec<u8> = wav_header(44_100, 16, 2, payload.len() as u32)
            .into_iter()
            .chain(payload)
            .collect();

        let mut dec = PcmDecoder::new();
        let mut first = vec![0i32; 200];
        dec.feed(&stream);
        let n1 = dec.read_decoded(&mut first, 100);

        dec.flush();
        let mut second = vec![0i32; 200];
        dec.feed(&stream);
        let n2 = dec.read_decoded(&mut second, 100);

        assert_eq!(n1, n2);
        assert_eq!(first, second);
    }
}
