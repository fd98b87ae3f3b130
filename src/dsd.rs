//! DSD container stream reader.
//!
//! Parses DSF and DFF (DSDIFF) headers, then hands out raw planar DSD
//! bytes. DSF payloads are block-interleaved (already planar per block
//! group, LSB-first bits); DFF payloads are byte-interleaved (MSB-first)
//! and get de-interleaved on the way out. A raw stream with an externally
//! supplied format is treated like DFF data.
//!
//! This is not a decoder — DSD is a raw bitstream. The API mirrors the
//! decoder contract, with `read_planar` in place of `read_decoded`.

pub mod processor;

use crate::format::{DsdContainer, DsdFormat};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Detect,
    ParseDsf,
    ParseDff,
    Data,
    Done,
    Error,
}

pub struct DsdStreamReader {
    state: State,
    header: Vec<u8>,
    data: Vec<u8>,
    format: DsdFormat,
    format_ready: bool,
    raw_configured: bool,
    /// Payload bytes still expected from the container; 0 = unbounded.
    data_remaining: u64,
    total_bytes_output: u64,
    eof: bool,
    error: bool,
    finished: bool,
}

impl DsdStreamReader {
    pub fn new() -> Self {
        Self {
            state: State::Detect,
            header: Vec::with_capacity(256),
            data: Vec::with_capacity(64 * 1024),
            format: DsdFormat::default(),
            format_ready: false,
            raw_configured: false,
            data_remaining: 0,
            total_bytes_output: 0,
            eof: false,
            error: false,
            finished: false,
        }
    }

    /// Pre-configure a raw DSD stream (no container header on the wire).
    pub fn set_raw_dsd_format(&mut self, dsd_rate: u32, channels: u32) {
        self.format = DsdFormat {
            sample_rate: dsd_rate,
            channels,
            block_size_per_channel: 0,
            total_dsd_bytes: 0,
            container: DsdContainer::Raw,
            // Raw DSD follows the DFF convention: MSB-first.
            lsb_first: false,
        };
        self.raw_configured = true;
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        if self.state == State::Done || self.state == State::Error {
            return;
        }

        match self.state {
            State::Detect | State::ParseDsf | State::ParseDff => {
                self.header.extend_from_slice(bytes);
                if self.state == State::Detect {
                    self.detect_container();
                }
                match self.state {
                    State::ParseDsf => {
                        self.parse_dsf_header();
                    }
                    State::ParseDff => {
                        self.parse_dff_header();
                    }
                    _ => {}
                }
            }
            State::Data => {
                let mut take = bytes.len();
                if self.data_remaining > 0 {
                    take = take.min(self.data_remaining as usize);
                }
                self.data.extend_from_slice(&bytes[..take]);
                if self.data_remaining > 0 {
                    self.data_remaining -= take as u64;
                }
            }
            _ => {}
        }
    }

    pub fn set_eof(&mut self) {
        self.eof = true;
    }

    /// Pull planar DSD bytes. Returns 0 when more input is needed.
    pub fn read_planar(&mut self, out: &mut [u8], max_bytes: usize) -> usize {
        if self.state != State::Data || !self.format_ready {
            if self.eof && self.state != State::Done && self.state != State::Error {
                // Truncated before the container header completed.
                self.finished = true;
                self.state = State::Done;
            }
            return 0;
        }

        let max_bytes = max_bytes.min(out.len());
        let n = match self.format.container {
            DsdContainer::Dsf => self.read_dsf_blocks(out, max_bytes),
            DsdContainer::Dff | DsdContainer::Raw => self.read_interleaved(out, max_bytes),
        };

        if n == 0 && self.eof {
            let ch = self.format.channels.max(1) as usize;
            let consumable = self.data.len().min(max_bytes) / ch * ch;
            // A DSF stream cut off mid-payload never completes a block group.
            let truncated_dsf =
                self.format.container == DsdContainer::Dsf && self.data_remaining > 0;
            if consumable == 0 || truncated_dsf {
                if !self.data.is_empty() {
                    tracing::debug!(bytes = self.data.len(), "dropping unplayable tail at eof");
                    self.data.clear();
                }
                self.finished = true;
                self.state = State::Done;
            }
        }
        n
    }

    pub fn is_format_ready(&self) -> bool {
        self.format_ready
    }

    pub fn format(&self) -> DsdFormat {
        self.format
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn has_error(&self) -> bool {
        self.error
    }

    pub fn total_bytes_output(&self) -> u64 {
        self.total_bytes_output
    }

    /// Bytes currently staged in the internal data buffer.
    pub fn buffered_bytes(&self) -> usize {
        self.data.len()
    }

    pub fn flush(&mut self) {
        self.state = State::Detect;
        self.header.clear();
        self.data.clear();
        self.format = DsdFormat::default();
        self.format_ready = false;
        self.raw_configured = false;
        self.data_remaining = 0;
        self.total_bytes_output = 0;
        self.eof = false;
        self.error = false;
        self.finished = false;
    }

    fn fail(&mut self) {
        self.state = State::Error;
        self.error = true;
    }

    fn detect_container(&mut self) {
        if self.header.len() < 4 {
            return;
        }

        if &self.header[..4] == b"DSD " {
            self.state = State::ParseDsf;
            tracing::info!("dsf container detected");
            return;
        }
        if &self.header[..4] == b"FRM8" {
            self.state = State::ParseDff;
            tracing::info!("dff (dsdiff) container detected");
            return;
        }

        if self.raw_configured {
            self.format_ready = true;
            self.data_remaining = 0;
            let header = std::mem::take(&mut self.header);
            self.data.extend_from_slice(&header);
            self.state = State::Data;
            tracing::info!(
                rate = self.format.sample_rate,
                channels = self.format.channels,
                "raw dsd stream"
            );
            return;
        }

        tracing::error!(magic = ?&self.header[..4], "unknown dsd container magic");
        self.fail();
    }

    /// DSF layout: "DSD " chunk (28 B), "fmt " chunk (52 B), "data" chunk
    /// header (12 B), then block-interleaved payload.
    fn parse_dsf_header(&mut self) {
        const DSF_MIN_HEADER: usize = 28 + 52 + 12;
        if self.header.len() < DSF_MIN_HEADER {
            return;
        }

        let p = &self.header;
        if &p[28..32] != b"fmt " {
            tracing::error!("dsf: missing fmt chunk at offset 28");
            self.fail();
            return;
        }

        let fmt_chunk_size = read_le64(&p[32..]);
        let format_id = read_le32(&p[44..]);
        let channel_count = read_le32(&p[52..]);
        let sample_rate = read_le32(&p[56..]);
        let bits_per_sample = read_le32(&p[60..]);
        let sample_count = read_le64(&p[64..]);
        let block_size = read_le32(&p[72..]);

        if format_id != 0 {
            tracing::error!(format_id, "dsf: unsupported format id (want 0 = DSD raw)");
            self.fail();
            return;
        }
        if bits_per_sample != 1 {
            tracing::warn!(bits_per_sample, "dsf: unexpected bits per sample");
        }
        if channel_count == 0 || channel_count > 8 {
            tracing::error!(channel_count, "dsf: invalid channel count");
            self.fail();
            return;
        }
        if block_size == 0 {
            tracing::error!("dsf: invalid block size 0");
            self.fail();
            return;
        }

        let data_chunk_offset = 28 + fmt_chunk_size as usize;
        if self.header.len() < data_chunk_offset + 12 {
            return;
        }
        if &p[data_chunk_offset..data_chunk_offset + 4] != b"data" {
            tracing::error!(offset = data_chunk_offset, "dsf: missing data chunk");
            self.fail();
            return;
        }
        let data_chunk_size = read_le64(&p[data_chunk_offset + 4..]);
        let data_bytes = data_chunk_size.saturating_sub(12);

        self.format = DsdFormat {
            sample_rate,
            channels: channel_count,
            block_size_per_channel: block_size,
            total_dsd_bytes: data_bytes,
            container: DsdContainer::Dsf,
            lsb_first: true,
        };
        self.data_remaining = data_bytes;
        self.format_ready = true;

        tracing::info!(
            rate_name = processor::rate_name(sample_rate),
            rate = sample_rate,
            channels = channel_count,
            block_size,
            data_bytes,
            samples_per_channel = sample_count,
            "dsf stream"
        );

        self.enter_data(data_chunk_offset + 12);
    }

    /// DFF layout: outer `FRM8 .. DSD ` form, then 12-byte-headed chunks:
    /// FVER (skipped), PROP/SND (FS, CHNL, CMPR), and the `DSD ` data chunk.
    fn parse_dff_header(&mut self) {
        if self.header.len() < 16 {
            return;
        }
        let p = &self.header;
        if &p[12..16] != b"DSD " {
            tracing::error!("dff: invalid FRM8 form type");
            self.fail();
            return;
        }

        let buf_len = self.header.len();
        let mut sample_rate = 0u32;
        let mut channels = 0u32;
        let mut found_fs = false;
        let mut found_chnl = false;
        let mut data_start = 0usize;
        let mut data_size = 0u64;
        let mut found_data = false;

        let mut pos = 16usize;
        while pos + 12 <= buf_len {
            let chunk_id = &p[pos..pos + 4];
            let chunk_size = read_be64(&p[pos + 4..]) as usize;

            if chunk_id == b"PROP" {
                if pos + 16 > buf_len {
                    return; // need more data
                }
                if &p[pos + 12..pos + 16] == b"SND " {
                    let prop_end = pos + 12 + chunk_size;
                    let mut sub = pos + 16;
                    while sub + 12 <= buf_len && sub + 12 <= prop_end {
                        let sub_id = &p[sub..sub + 4];
                        let sub_size = read_be64(&p[sub + 4..]) as usize;

                        if sub_id == b"FS  " {
                            if sub + 16 > buf_len {
                                return;
                            }
                            sample_rate = read_be32(&p[sub + 12..]);
                            found_fs = true;
                        } else if sub_id == b"CHNL" {
                            if sub + 14 > buf_len {
                                return;
                            }
                            channels = ((p[sub + 12] as u32) << 8) | p[sub + 13] as u32;
                            found_chnl = true;
                        } else if sub_id == b"CMPR" {
                            if sub + 16 > buf_len {
                                return;
                            }
                            if &p[sub + 12..sub + 16] != b"DSD " {
                                tracing::error!("dff: compressed dsd not supported");
                                self.fail();
                                return;
                            }
                        }

                        sub += 12 + sub_size;
                        if sub & 1 != 0 {
                            sub += 1; // chunks are word-aligned
                        }
                    }
                    pos = prop_end;
                    if pos & 1 != 0 {
                        pos += 1;
                    }
                    continue;
                }
            } else if chunk_id == b"DSD " {
                data_size = chunk_size as u64;
                data_start = pos + 12;
                found_data = true;
                break;
            }

            // FVER and anything unrecognized: skip.
            pos += 12 + chunk_size;
            if pos & 1 != 0 {
                pos += 1;
            }
        }

        if !found_data {
            return; // need more header data
        }
        if !found_fs || sample_rate == 0 {
            tracing::error!("dff: missing FS (sample rate) chunk");
            self.fail();
            return;
        }
        if !found_chnl || channels == 0 {
            tracing::error!("dff: missing CHNL (channels) chunk");
            self.fail();
            return;
        }

        self.format = DsdFormat {
            sample_rate,
            channels,
            block_size_per_channel: 0,
            total_dsd_bytes: data_size,
            container: DsdContainer::Dff,
            lsb_first: false,
        };
        self.data_remaining = data_size;
        self.format_ready = true;

        tracing::info!(
            rate_name = processor::rate_name(sample_rate),
            rate = sample_rate,
            channels,
            data_bytes = data_size,
            "dff stream"
        );

        self.enter_data(data_start);
    }

    /// Move payload bytes past the header into the data buffer.
    fn enter_data(&mut self, data_start: usize) {
        if self.header.len() > data_start {
            let mut take = self.header.len() - data_start;
            if self.data_remaining > 0 {
                take = take.min(self.data_remaining as usize);
            }
            self.data
                .extend_from_slice(&self.header[data_start..data_start + take]);
            if self.data_remaining > 0 {
                self.data_remaining -= take as u64;
            }
        }
        self.header.clear();
        self.state = State::Data;
    }

    /// DSF data: repeating groups of `block_size` bytes per channel, already
    /// planar within each group. Emit whole groups by direct copy; at EOF a
    /// trailing partial group goes out if it divides evenly by channels.
    fn read_dsf_blocks(&mut self, out: &mut [u8], max_bytes: usize) -> usize {
        let group = (self.format.block_size_per_channel * self.format.channels) as usize;
        if group == 0 {
            return 0;
        }

        let groups = (self.data.len() / group).min(max_bytes / group);
        if groups == 0 {
            if self.eof && !self.data.is_empty() && self.data_remaining == 0 {
                let ch = self.format.channels as usize;
                let mut usable = self.data.len() / ch * ch;
                usable = usable.min(max_bytes / ch * ch);
                if usable == 0 {
                    return 0;
                }
                out[..usable].copy_from_slice(&self.data[..usable]);
                self.data.drain(..usable);
                self.total_bytes_output += usable as u64;
                return usable;
            }
            return 0;
        }

        let bytes = groups * group;
        out[..bytes].copy_from_slice(&self.data[..bytes]);
        self.data.drain(..bytes);
        self.total_bytes_output += bytes as u64;
        bytes
    }

    /// DFF/raw data: byte-interleaved, de-interleaved to planar on the way
    /// out. Only whole multiples of the channel count are consumed.
    fn read_interleaved(&mut self, out: &mut [u8], max_bytes: usize) -> usize {
        let ch = self.format.channels as usize;
        if ch == 0 || self.data.is_empty() {
            return 0;
        }

        let usable = self.data.len().min(max_bytes) / ch * ch;
        if usable == 0 {
            return 0;
        }

        processor::deinterleave_to_planar(&self.data[..usable], &mut out[..usable], ch as u32);
        self.data.drain(..usable);
        self.total_bytes_output += usable as u64;
        usable
    }
}

fn read_le32(p: &[u8]) -> u32 {
    u32::from_le_bytes([p[0], p[1], p[2], p[3]])
}

fn read_le64(p: &[u8]) -> u64 {
    u64::from_le_bytes([p[0], p[1], p[2], p[3], p[4], p[5], p[6], p[7]])
}

fn read_be32(p: &[u8]) -> u32 {
    u32::from_be_bytes([p[0], p[1], p[2], p[3]])
}

fn read_be64(p: &[u8]) -> u64 {
    u64::from_be_bytes([p[0], p[1], p[2], p[3], p[4], p[5], p[6], p[7]])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dsf_stream(rate: u32, channels: u32, block_size: u32, payload: &[u8]) -> Vec<u8> {
        let mut s = Vec::new();
        s.extend_from_slice(b"DSD ");
        s.extend_from_slice(&28u64.to_le_bytes());
        s.extend_from_slice(&0u64.to_le_bytes()); // total file size (unknown)
        s.extend_from_slice(&0u64.to_le_bytes()); // metadata offset

        s.extend_from_slice(b"fmt ");
        s.extend_from_slice(&52u64.to_le_bytes());
        s.extend_from_slice(&1u32.to_le_bytes()); // format version
        s.extend_from_slice(&0u32.to_le_bytes()); // format id = DSD raw
        s.extend_from_slice(&2u32.to_le_bytes()); // channel type
        s.extend_from_slice(&channels.to_le_bytes());
        s.extend_from_slice(&rate.to_le_bytes());
        s.extend_from_slice(&1u32.to_le_bytes()); // bits per sample
        s.extend_from_slice(&((payload.len() as u64 / channels as u64) * 8).to_le_bytes());
        s.extend_from_slice(&block_size.to_le_bytes());
        s.extend_from_slice(&0u32.to_le_bytes()); // reserved

        s.extend_from_slice(b"data");
        s.extend_from_slice(&(12 + payload.len() as u64).to_le_bytes());
        s.extend_from_slice(payload);
        s
    }

    fn dff_stream(rate: u32, channels: u16, payload: &[u8]) -> Vec<u8> {
        let mut prop = Vec::new();
        prop.extend_from_slice(b"SND ");
        prop.extend_from_slice(b"FS  ");
        prop.extend_from_slice(&4u64.to_be_bytes());
        prop.extend_from_slice(&rate.to_be_bytes());
        prop.extend_from_slice(b"CHNL");
        prop.extend_from_slice(&(2 + 4 * channels as u64).to_be_bytes());
        prop.extend_from_slice(&channels.to_be_bytes());
        for _ in 0..channels {
            prop.extend_from_slice(b"SLFT");
        }
        prop.extend_from_slice(b"CMPR");
        prop.extend_from_slice(&4u64.to_be_bytes());
        prop.extend_from_slice(b"DSD ");

        let mut s = Vec::new();
        s.extend_from_slice(b"FRM8");
        s.extend_from_slice(&0u64.to_be_bytes()); // outer size (unused)
        s.extend_from_slice(b"DSD ");
        s.extend_from_slice(b"FVER");
        s.extend_from_slice(&4u64.to_be_bytes());
        s.extend_from_slice(&[0x01, 0x05, 0x00, 0x00]);
        s.extend_from_slice(b"PROP");
        s.extend_from_slice(&(prop.len() as u64).to_be_bytes());
        s.extend_from_slice(&prop);
        s.extend_from_slice(b"DSD ");
        s.extend_from_slice(&(payload.len() as u64).to_be_bytes());
        s.extend_from_slice(payload);
        s
    }

    #[test]
    fn dsf_single_block_group_copies_through_planar() {
        // 4096-byte blocks: channel 0 is a rising ramp, channel 1 falling.
        let block = 4096usize;
        let mut payload = Vec::with_capacity(block * 2);
        for i in 0..block {
            payload.push((i % 256) as u8);
        }
        for i in 0..block {
            payload.push((255 - i % 256) as u8);
        }

        let mut reader = DsdStreamReader::new();
        reader.feed(&dsf_stream(2_822_400, 2, block as u32, &payload));
        assert!(reader.is_format_ready());
        let fmt = reader.format();
        assert_eq!(fmt.sample_rate, 2_822_400);
        assert_eq!(fmt.channels, 2);
        assert_eq!(fmt.block_size_per_channel, 4096);
        assert_eq!(fmt.container, DsdContainer::Dsf);
        assert!(fmt.lsb_first);

        let mut out = vec![0u8; 16 * 1024];
        let out_len = out.len();
        let n = reader.read_planar(&mut out, out_len);
        assert_eq!(n, 8192);
        assert_eq!(&out[..4096], &payload[..4096]);
        assert_eq!(&out[4096..8192], &payload[4096..8192]);
    }

    #[test]
    fn dsf_waits_for_a_whole_block_group() {
        let block = 512usize;
        let payload = vec![7u8; block * 2];
        let stream = dsf_stream(2_822_400, 2, block as u32, &payload);

        let mut reader = DsdStreamReader::new();
        // Everything except the last payload byte: no complete group yet.
        reader.feed(&stream[..stream.len() - 1]);
        let mut out = vec![0u8; 4096];
        let out_len = out.len();
        assert_eq!(reader.read_planar(&mut out, out_len), 0);

        reader.feed(&stream[stream.len() - 1..]);
        assert_eq!(reader.read_planar(&mut out, out_len), block * 2);
    }

    #[test]
    fn dsf_partial_tail_is_emitted_at_eof_when_channel_aligned() {
        let block = 1024usize;
        // One full group plus a 6-byte tail.
        let mut payload = vec![1u8; block * 2];
        payload.extend_from_slice(&[9, 9, 9, 9, 9, 9]);

        let mut reader = DsdStreamReader::new();
        reader.feed(&dsf_stream(2_822_400, 2, block as u32, &payload));
        let mut out = vec![0u8; 8192];
        let out_len = out.len();
        assert_eq!(reader.read_planar(&mut out, out_len), block * 2);
        assert_eq!(reader.read_planar(&mut out, out_len), 0);

        reader.set_eof();
        assert_eq!(reader.read_planar(&mut out, out_len), 6);
        assert_eq!(reader.total_bytes_output() % 2, 0);
        assert_eq!(reader.read_planar(&mut out, out_len), 0);
        assert!(reader.is_finished());
    }

    #[test]
    fn dff_stereo_deinterleaves_to_planar() {
        // 256 bytes interleaved [L0 R0 L1 R1 ..].
        let mut payload = Vec::with_capacity(256);
        for i in 0..128u32 {
            payload.push(i as u8); // L
            payload.push((128 + i) as u8); // R
        }

        let mut reader = DsdStreamReader::new();
        reader.feed(&dff_stream(5_644_800, 2, &payload));
        assert!(reader.is_format_ready());
        let fmt = reader.format();
        assert_eq!(fmt.sample_rate, 5_644_800);
        assert_eq!(fmt.channels, 2);
        assert_eq!(fmt.container, DsdContainer::Dff);
        assert!(!fmt.lsb_first);

        let mut out = vec![0u8; 256];
        let n = reader.read_planar(&mut out, 256);
        assert_eq!(n, 256);
        for i in 0..128usize {
            assert_eq!(out[i], i as u8);
            assert_eq!(out[128 + i], (128 + i) as u8);
        }
    }

    #[test]
    fn dff_compressed_stream_is_rejected() {
        let mut stream = dff_stream(2_822_400, 2, &[0u8; 16]);
        // Corrupt the CMPR compression type.
        let pos = stream
            .windows(4)
            .position(|w| w == b"CMPR")
            .expect("CMPR chunk");
        stream[pos + 12..pos + 16].copy_from_slice(b"DST ");

        let mut reader = DsdStreamReader::new();
        reader.feed(&stream);
        assert!(reader.has_error());
    }

    #[test]
    fn raw_stream_needs_preconfigured_format() {
        let mut reader = DsdStreamReader::new();
        reader.set_raw_dsd_format(2_822_400, 2);
        // No container magic: bytes are audio data.
        let payload: Vec<u8> = (0..64u8).collect();
        reader.feed(&payload);
        assert!(reader.is_format_ready());
        assert_eq!(reader.format().container, DsdContainer::Raw);

        let mut out = vec![0u8; 64];
        assert_eq!(reader.read_planar(&mut out, 64), 64);
        // Interleaved input was split planar.
        assert_eq!(out[0], 0);
        assert_eq!(out[1], 2);
        assert_eq!(out[32], 1);
        assert_eq!(out[33], 3);
    }

    #[test]
    fn unknown_magic_without_raw_config_errors() {
        let mut reader = DsdStreamReader::new();
        reader.feed(b"RIFFxxxx");
        assert!(reader.has_error());
    }

    #[test]
    fn output_is_always_a_channel_multiple() {
        let mut reader = DsdStreamReader::new();
        reader.set_raw_dsd_format(2_822_400, 2);
        reader.feed(&[1, 2, 3, 4, 5]); // odd byte count
        let mut out = vec![0u8; 16];
        assert_eq!(reader.read_planar(&mut out, 16), 4);
        assert_eq!(reader.total_bytes_output() % 2, 0);
    }
}
