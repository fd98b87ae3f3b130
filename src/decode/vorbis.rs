//! Ogg Vorbis stream decoder.
//!
//! A hand demuxer assembles Vorbis packets from Ogg pages (including
//! packets spanning pages via 255-byte lacing continuation), then the
//! three header packets and the audio packets go through lewton's packet
//! API. Packet-level decode failures are data gaps — normal on lossy radio
//! streams — and are skipped at debug level. A new BOS page after audio
//! started means a chained stream: headers are re-read and the format
//! refreshed. Page CRCs are not verified; corrupt packets surface as
//! decode errors and are dropped.

use std::collections::VecDeque;

use lewton::audio::{read_audio_packet, PreviousWindowRight};
use lewton::header::{read_header_comment, read_header_ident, read_header_setup, IdentHeader, SetupHeader};

use super::{InputBuffer, OutputBuffer};
use crate::format::DecodedFormat;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeaderStage {
    Ident,
    Comment,
    Setup,
    Audio,
}

pub struct VorbisDecoder {
    input: InputBuffer,
    output: OutputBuffer,
    packets: VecDeque<Vec<u8>>,
    /// Packet data carried across a page boundary.
    partial: Vec<u8>,
    stage: HeaderStage,
    ident: Option<IdentHeader>,
    setup: Option<SetupHeader>,
    pwr: PreviousWindowRight,
    format: DecodedFormat,
    format_ready: bool,
    eof: bool,
    error: bool,
    finished: bool,
    decoded_samples: u64,
}

impl VorbisDecoder {
    pub fn new() -> Self {
        Self {
            input: InputBuffer::default(),
            output: OutputBuffer::default(),
            packets: VecDeque::new(),
            partial: Vec::new(),
            stage: HeaderStage::Ident,
            ident: None,
            setup: None,
            pwr: PreviousWindowRight::new(),
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

        loop {
            let channels = self.format.channels as usize;
            if channels > 0 && self.output.frames_available(channels) >= max_frames {
                break;
            }
            if let Some(packet) = self.packets.pop_front() {
                self.process_packet(&packet);
                if self.error {
                    return 0;
                }
                continue;
            }
            if !self.demux_page() {
                break;
            }
        }

        let channels = self.format.channels as usize;
        let frames = if channels > 0 {
            self.output.take_frames(out, max_frames, channels)
        } else {
            0
        };

        if frames == 0
            && self.eof
            && self.packets.is_empty()
            && self.input.len_remaining() < 27
        {
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
        self.packets.clear();
        self.partial.clear();
        self.stage = HeaderStage::Ident;
        self.ident = None;
        self.setup = None;
        self.pwr = PreviousWindowRight::new();
        self.format = DecodedFormat::default();
        self.format_ready = false;
        self.eof = false;
        self.error = false;
        self.finished = false;
        self.decoded_samples = 0;
    }

    /// Parse one complete Ogg page out of the input buffer.
    /// Returns false when no complete page is available.
    fn demux_page(&mut self) -> bool {
        let buf = self.input.remaining();

        // Resync to the capture pattern if needed.
        let Some(start) = find_capture(buf) else {
            if self.eof && !buf.is_empty() {
                self.input.advance(buf.len());
                self.input.compact();
            }
            return false;
        };
        if start > 0 {
            tracing::debug!(skipped = start, "ogg resync");
            self.input.advance(start);
            self.input.compact();
        }

        let buf = self.input.remaining();
        if buf.len() < 27 {
            return self.discard_if_eof();
        }
        if buf[4] != 0 {
            // Unknown stream structure version: skip the capture pattern.
            self.input.advance(4);
            self.input.compact();
            return true;
        }
        let header_type = buf[5];
        let nsegs = buf[26] as usize;
        if buf.len() < 27 + nsegs {
            return self.discard_if_eof();
        }
        let lacing = &buf[27..27 + nsegs];
        let body_len: usize = lacing.iter().map(|&v| v as usize).sum();
        if buf.len() < 27 + nsegs + body_len {
            return self.discard_if_eof();
        }

        let continued = header_type & 0x01 != 0;
        let bos = header_type & 0x02 != 0;

        if bos && self.stage == HeaderStage::Audio {
            // Chained stream: a fresh logical stream follows.
            tracing::debug!("chained ogg stream, re-reading headers");
            self.stage = HeaderStage::Ident;
            self.ident = None;
            self.setup = None;
            self.pwr = PreviousWindowRight::new();
            self.partial.clear();
        } else if !continued && !self.partial.is_empty() {
            // The previous page's packet never completed.
            tracing::debug!("dropping unterminated ogg packet (data gap)");
            self.partial.clear();
        }

        let lacing = lacing.to_vec();
        let body = buf[27 + nsegs..27 + nsegs + body_len].to_vec();
        self.input.advance(27 + nsegs + body_len);
        self.input.compact();

        let mut offset = 0usize;
        for &seg in &lacing {
            let seg = seg as usize;
            self.partial.extend_from_slice(&body[offset..offset + seg]);
            offset += seg;
            if seg < 255 {
                self.packets.push_back(std::mem::take(&mut self.partial));
            }
        }
        true
    }

    /// A page that can never complete (EOF) is dead weight; drop it so the
    /// finished condition can latch.
    fn discard_if_eof(&mut self) -> bool {
        if self.eof {
            let len = self.input.len_remaining();
            if len > 0 {
                tracing::debug!(bytes = len, "dropping truncated ogg page at eof");
                self.input.advance(len);
                self.input.compact();
            }
        }
        false
    }

    fn process_packet(&mut self, packet: &[u8]) {
        match self.stage {
            HeaderStage::Ident => match read_header_ident(packet) {
                Ok(ident) => {
                    let rate = ident.audio_sample_rate;
                    let channels = ident.audio_channels as u32;
                    if self.format_ready
                        && (rate != self.format.sample_rate || channels != self.format.channels)
                    {
                        tracing::info!(rate, channels, "chain format change");
                    }
                    self.format = DecodedFormat {
                        sample_rate: rate,
                        bit_depth: 16,
                        channels,
                        total_samples: 0,
                    };
                    self.ident = Some(ident);
                    self.stage = HeaderStage::Comment;
                }
                Err(e) => tracing::debug!("bad vorbis ident packet: {e:?}"),
            },
            HeaderStage::Comment => match read_header_comment(packet) {
                Ok(_) => self.stage = HeaderStage::Setup,
                Err(e) => tracing::debug!("bad vorbis comment packet: {e:?}"),
            },
            HeaderStage::Setup => {
                let ident = self.ident.as_ref().expect("ident before setup");
                match read_header_setup(
                    packet,
                    ident.audio_channels,
                    (ident.blocksize_0, ident.blocksize_1),
                ) {
                    Ok(setup) => {
                        self.setup = Some(setup);
                        self.pwr = PreviousWindowRight::new();
                        self.format_ready = true;
                        self.stage = HeaderStage::Audio;
                        tracing::info!(
                            rate = self.format.sample_rate,
                            channels = self.format.channels,
                            "vorbis stream"
                        );
                    }
                    Err(e) => {
                        tracing::error!("bad vorbis setup packet: {e:?}");
                        self.error = true;
                    }
                }
            }
            HeaderStage::Audio => {
                let ident = self.ident.as_ref().expect("ident in audio stage");
                let setup = self.setup.as_ref().expect("setup in audio stage");
                match read_audio_packet(ident, setup, packet, &mut self.pwr) {
                    Ok(pcm) => {
                        let channels = pcm.len();
                        let frames = pcm.first().map(|c| c.len()).unwrap_or(0);
                        if channels == 0 || frames == 0 {
                            return;
                        }
                        let mut interleaved = Vec::with_capacity(frames * channels);
                        for i in 0..frames {
                            for ch in pcm.iter() {
                                interleaved.push((ch[i] as i32) << 16);
                            }
                        }
                        self.output.push(&interleaved);
                        self.decoded_samples += frames as u64;
                    }
                    Err(e) => {
                        // Data gap: normal for lossy streams, keep going.
                        tracing::debug!("vorbis packet dropped (data gap): {e:?}");
                    }
                }
            }
        }
    }
}

fn find_capture(buf: &[u8]) -> Option<usize> {
    if buf.len() < 4 {
        return None;
    }
    (0..=buf.len() - 4).find(|&i| &buf[i..i + 4] == b"OggS")
}
