//! AAC (ADTS transport) stream decoder.
//!
//! Frames the stream on ADTS headers, strips them, and feeds the raw access
//! units to the codec configured from the header's rate and channel fields.
//! Transport desync (mid-stream garbage, common on radio streams) advances
//! the scan byte-wise until the next validated header. The reported format
//! follows what the codec actually outputs.

use symphonia::core::audio::Channels;
use symphonia::core::codecs::{CodecParameters, Decoder as _, DecoderOptions, CODEC_TYPE_AAC};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::Packet;

use super::{append_interleaved_i32, InputBuffer, OutputBuffer};
use crate::format::DecodedFormat;

const ADTS_RATES: [u32; 13] = [
    96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025, 8_000,
    7_350,
];

pub struct AacDecoder {
    input: InputBuffer,
    output: OutputBuffer,
    codec: Option<Box<dyn symphonia::core::codecs::Decoder>>,
    format: DecodedFormat,
    format_ready: bool,
    eof: bool,
    error: bool,
    finished: bool,
    decoded_samples: u64,
}

impl AacDecoder {
    pub fn new() -> Self {
        Self {
            input: InputBuffer::default(),
            output: OutputBuffer::default(),
            codec: None,
            format: DecodedFormat::default(),
            format_ready: false,
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

        self.decode_frames(max_frames);

        let channels = self.format.channels as usize;
        let frames = if channels > 0 {
            self.output.take_frames(out, max_frames, channels)
        } else {
            0
        };

        if frames == 0 && self.eof && self.input.len_remaining() < 7 {
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
        self.eof = false;
        self.error = false;
        self.finished = false;
        self.decoded_samples = 0;
    }

    fn ensure_codec(&mut self, header: &AdtsHeader) -> bool {
        if self.codec.is_some() {
            return true;
        }
        let channels = match header.channels {
            1 => Channels::FRONT_LEFT,
            2 => Channels::FRONT_LEFT | Channels::FRONT_RIGHT,
            _ => {
                tracing::error!(channels = header.channels, "unsupported aac channel config");
                self.error = true;
                return false;
            }
        };
        let mut params = CodecParameters::new();
        params
            .for_codec(CODEC_TYPE_AAC)
            .with_sample_rate(header.sample_rate)
            .with_channels(channels);
        match symphonia::default::get_codecs().make(&params, &DecoderOptions::default()) {
            Ok(codec) => {
                self.codec = Some(codec);
                true
            }
            Err(e) => {
                tracing::error!("aac codec init failed: {e}");
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

            let buf = self.input.remaining();
            if buf.len() < 7 {
                break;
            }

            let Some((start, header)) = find_adts_frame(buf, self.eof) else {
                if self.eof {
                    self.input.advance(buf.len());
                    self.input.compact();
                }
                break;
            };
            if start > 0 {
                tracing::debug!(skipped = start, "adts resync");
                self.input.advance(start);
                self.input.compact();
                continue;
            }
            if buf.len() < header.frame_len {
                if !self.eof {
                    break;
                }
                self.input.advance(buf.len());
                self.input.compact();
                break;
            }

            // The codec wants the access unit without the transport header.
            let payload = buf[header.header_len..header.frame_len].to_vec();
            if !self.ensure_codec(&header) {
                return;
            }

            let packet = Packet::new_from_slice(0, self.decoded_samples, 0, &payload);
            let codec = self.codec.as_mut().expect("codec initialized");
            match codec.decode(&packet) {
                Ok(decoded) => {
                    let spec = *decoded.spec();
                    if !self.format_ready {
                        // The codec's output rate, not the transport's core rate.
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
                            "aac stream"
                        );
                    }
                    let frames = append_interleaved_i32(decoded, &mut self.output);
                    self.decoded_samples += frames as u64;
                }
                Err(SymphoniaError::DecodeError(e)) => {
                    tracing::debug!("aac frame dropped (resyncing): {e}");
                }
                Err(SymphoniaError::ResetRequired) => codec.reset(),
                Err(e) => {
                    tracing::error!("aac decode failed: {e}");
                    self.error = true;
                    return;
                }
            }

            self.input.advance(header.frame_len);
            self.input.compact();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AdtsHeader {
    sample_rate: u32,
    channels: u32,
    header_len: usize,
    frame_len: usize,
}

/// Parse an ADTS header at the start of `h` (needs 7 bytes).
fn parse_adts_header(h: &[u8]) -> Option<AdtsHeader> {
    if h.len() < 7 {
        return None;
    }
    if h[0] != 0xFF || h[1] & 0xF0 != 0xF0 {
        return None;
    }
    if (h[1] >> 1) & 0x03 != 0 {
        return None; // layer must be 0
    }
    let protection_absent = h[1] & 1 == 1;

    let rate_idx = ((h[2] >> 2) & 0x0F) as usize;
    if rate_idx >= ADTS_RATES.len() {
        return None;
    }
    let channels = (((h[2] & 1) as u32) << 2) | (h[3] >> 6) as u32;
    if channels == 0 {
        return None; // channel config in PCE unsupported
    }

    let frame_len =
        (((h[3] & 0x03) as usize) << 11) | ((h[4] as usize) << 3) | ((h[5] >> 5) as usize);
    let header_len = if protection_absent { 7 } else { 9 };
    if frame_len <= header_len {
        return None;
    }

    Some(AdtsHeader {
        sample_rate: ADTS_RATES[rate_idx],
        channels,
        header_len,
        frame_len,
    })
}

/// Locate the next ADTS frame, confirmed by the following header when the
/// bytes for it are buffered.
fn find_adts_frame(buf: &[u8], eof: bool) -> Option<(usize, AdtsHeader)> {
    let mut i = 0usize;
    while i + 7 <= buf.len() {
        if let Some(header) = parse_adts_header(&buf[i..]) {
            let next = i + header.frame_len;
            if next + 7 <= buf.len() {
                if parse_adts_header(&buf[next..]).is_some() {
                    return Some((i, header));
                }
                // False sync inside payload bytes.
            } else if eof {
                return Some((i, header));
            } else {
                return None;
            }
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build an ADTS header for 44.1 kHz stereo with the given frame length.
    fn adts_header(frame_len: usize) -> [u8; 7] {
        let mut h = [0u8; 7];
        h[0] = 0xFF;
        h[1] = 0xF1; // MPEG-4, layer 0, no CRC
        h[2] = (1 << 6) | (4 << 2); // AAC LC, rate index 4 = 44100
        h[3] = (2 << 6) as u8 | ((frame_len >> 11) & 0x03) as u8;
        h[4] = ((frame_len >> 3) & 0xFF) as u8;
        h[5] = ((frame_len & 0x07) as u8) << 5;
        h[6] = 0xFC;
        h
    }

    #[test]
    fn header_fields_decode() {
        let h = adts_header(512);
        let parsed = parse_adts_header(&h).unwrap();
        assert_eq!(parsed.sample_rate, 44_100);
        assert_eq!(parsed.channels, 2);
        assert_eq!(parsed.header_len, 7);
        assert_eq!(parsed.frame_len, 512);
    }

    #[test]
    fn crc_header_is_nine_bytes() {
        let mut h = adts_header(512);
        h[1] = 0xF0; // protection present
        let parsed = parse_adts_header(&h).unwrap();
        assert_eq!(parsed.header_len, 9);
    }

    #[test]
    fn bad_headers_are_rejected() {
        assert!(parse_adts_header(&[0xFF, 0xF2, 0x50, 0x80, 0, 0, 0]).is_none()); // layer != 0
        assert!(parse_adts_header(&[0xFE, 0xF1, 0x50, 0x80, 0, 0, 0]).is_none()); // no sync
        let mut h = adts_header(512);
        h[2] = (1 << 6) | (15 << 2); // rate index 15
        assert!(parse_adts_header(&h).is_none());
        assert!(parse_adts_header(&adts_header(5)).is_none()); // frame shorter than header
    }

    #[test]
    fn frame_search_confirms_with_next_header() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&adts_header(64));
        stream.resize(64, 0xAB);

        assert!(find_adts_frame(&stream, false).is_none());
        let (off, header) = find_adts_frame(&stream, true).unwrap();
        assert_eq!((off, header.frame_len), (0, 64));

        stream.extend_from_slice(&adts_header(64));
        let (off, header) = find_adts_frame(&stream, false).unwrap();
        assert_eq!((off, header.frame_len), (0, 64));
    }

    #[test]
    fn garbage_prefix_is_skipped() {
        let mut stream = vec![0u8; 5];
        stream.extend_from_slice(&adts_header(64));
        stream.resize(5 + 64, 0);
        stream.extend_from_slice(&adts_header(64));
        let (off, _) = find_adts_frame(&stream, false).unwrap();
        assert_eq!(off, 5);
    }
}
