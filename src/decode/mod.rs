//! Push/pull stream decoders.
//!
//! One variant per Slimproto wire format. All of them accept encoded bytes
//! through `feed` and hand back interleaved 32-bit signed samples,
//! MSB-aligned (an N-bit source is left-shifted by `32 - N`), through
//! `read_decoded`. A zero return means "need more input", not EOF; decoders
//! never error out of the feed/read paths — status is latched and observed
//! through `has_error` / `is_finished`.

mod aac;
mod flac;
mod mp3;
mod pcm;
mod vorbis;

pub use aac::AacDecoder;
pub use flac::FlacDecoder;
pub use mp3::Mp3Decoder;
pub use pcm::PcmDecoder;
pub use vorbis::VorbisDecoder;

use symphonia::core::audio::{AudioBufferRef, SampleBuffer};

use crate::format::DecodedFormat;

/// Tagged sum of the stream decoder variants.
pub enum Decoder {
    Flac(FlacDecoder),
    Pcm(PcmDecoder),
    Mp3(Mp3Decoder),
    Vorbis(VorbisDecoder),
    Aac(AacDecoder),
}

macro_rules! dispatch {
    ($self:expr, $inner:ident => $body:expr) => {
        match $self {
            Decoder::Flac($inner) => $body,
            Decoder::Pcm($inner) => $body,
            Decoder::Mp3($inner) => $body,
            Decoder::Vorbis($inner) => $body,
            Decoder::Aac($inner) => $body,
        }
    };
}

impl Decoder {
    /// Create the decoder for a strm format code; `None` for unsupported
    /// formats. DSD (`'d'`) is not a decoder — the stream reader handles it.
    pub fn create(format_code: u8) -> Option<Self> {
        match format_code {
            b'f' => Some(Self::Flac(FlacDecoder::new())),
            b'p' => Some(Self::Pcm(PcmDecoder::new())),
            b'm' => Some(Self::Mp3(Mp3Decoder::new())),
            b'o' => Some(Self::Vorbis(VorbisDecoder::new())),
            b'a' => Some(Self::Aac(AacDecoder::new())),
            _ => None,
        }
    }

    /// Push encoded bytes; always accepts the whole slice.
    pub fn feed(&mut self, data: &[u8]) {
        dispatch!(self, d => d.feed(data))
    }

    /// Signal that no more input will arrive.
    pub fn set_eof(&mut self) {
        dispatch!(self, d => d.set_eof())
    }

    /// Pull up to `max_frames` interleaved MSB-aligned frames into `out`.
    pub fn read_decoded(&mut self, out: &mut [i32], max_frames: usize) -> usize {
        dispatch!(self, d => d.read_decoded(out, max_frames))
    }

    pub fn is_format_ready(&self) -> bool {
        dispatch!(self, d => d.is_format_ready())
    }

    pub fn format(&self) -> DecodedFormat {
        dispatch!(self, d => d.format())
    }

    pub fn is_finished(&self) -> bool {
        dispatch!(self, d => d.is_finished())
    }

    pub fn has_error(&self) -> bool {
        dispatch!(self, d => d.has_error())
    }

    /// Total decoded frames (per channel).
    pub fn decoded_samples(&self) -> u64 {
        dispatch!(self, d => d.decoded_samples())
    }

    /// Reset to the pre-feed state so the decoder can be reused for the
    /// next track.
    pub fn flush(&mut self) {
        dispatch!(self, d => d.flush())
    }

    /// Format hint for container-less PCM carried in the strm command.
    pub fn set_raw_pcm_format(&mut self, rate: u32, bits: u32, channels: u32, big_endian: bool) {
        if let Decoder::Pcm(d) = self {
            d.set_raw_pcm_format(rate, bits, channels, big_endian);
        }
    }
}

/// Growable input byte buffer with a read position.
///
/// Bytes before the read position are kept until `compact` so a decoder can
/// roll back to a confirmed position after an incomplete parse.
#[derive(Default)]
pub(crate) struct InputBuffer {
    data: Vec<u8>,
    pos: usize,
}

impl InputBuffer {
    pub(crate) fn push(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub(crate) fn remaining(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    pub(crate) fn len_remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub(crate) fn advance(&mut self, n: usize) {
        self.pos = (self.pos + n).min(self.data.len());
    }

    /// Drop consumed bytes up to the read position.
    pub(crate) fn compact(&mut self) {
        if self.pos > 0 {
            self.data.drain(..self.pos);
            self.pos = 0;
        }
    }

    pub(crate) fn clear(&mut self) {
        self.data.clear();
        self.pos = 0;
    }
}

/// Interleaved i32 staging buffer between the codec and `read_decoded`.
#[derive(Default)]
pub(crate) struct OutputBuffer {
    samples: Vec<i32>,
    pos: usize,
}

impl OutputBuffer {
    pub(crate) fn push(&mut self, samples: &[i32]) {
        self.samples.extend_from_slice(samples);
    }

    pub(crate) fn frames_available(&self, channels: usize) -> usize {
        if channels == 0 {
            return 0;
        }
        (self.samples.len() - self.pos) / channels
    }

    /// Copy up to `max_frames` into `out`, compacting afterwards.
    pub(crate) fn take_frames(&mut self, out: &mut [i32], max_frames: usize, channels: usize) -> usize {
        let frames = self.frames_available(channels).min(max_frames);
        if frames == 0 {
            return 0;
        }
        let n = frames * channels;
        out[..n].copy_from_slice(&self.samples[self.pos..self.pos + n]);
        self.pos += n;
        self.samples.drain(..self.pos);
        self.pos = 0;
        frames
    }

    pub(crate) fn clear(&mut self) {
        self.samples.clear();
        self.pos = 0;
    }
}

/// Convert a decoded symphonia buffer to interleaved i32 and append it.
pub(crate) fn append_interleaved_i32(decoded: AudioBufferRef<'_>, out: &mut OutputBuffer) -> usize {
    let frames = decoded.frames();
    if frames == 0 {
        return 0;
    }
    let mut buf = SampleBuffer::<i32>::new(frames as u64, *decoded.spec());
    buf.copy_interleaved_ref(decoded);
    out.push(buf.samples());
    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_maps_format_codes() {
        assert!(matches!(Decoder::create(b'f'), Some(Decoder::Flac(_))));
        assert!(matches!(Decoder::create(b'p'), Some(Decoder::Pcm(_))));
        assert!(matches!(Decoder::create(b'm'), Some(Decoder::Mp3(_))));
        assert!(matches!(Decoder::create(b'o'), Some(Decoder::Vorbis(_))));
        assert!(matches!(Decoder::create(b'a'), Some(Decoder::Aac(_))));
        assert!(Decoder::create(b'd').is_none());
        assert!(Decoder::create(b'w').is_none());
    }

    #[test]
    fn input_buffer_keeps_bytes_until_compaction() {
        let mut buf = InputBuffer::default();
        buf.push(&[1, 2, 3, 4, 5, 6]);
        buf.advance(4);
        assert_eq!(buf.remaining(), &[5, 6]);
        assert_eq!(buf.len_remaining(), 2);

        buf.compact();
        buf.push(&[7]);
        assert_eq!(buf.remaining(), &[5, 6, 7]);
    }

    #[test]
    fn output_buffer_hands_back_whole_frames() {
        let mut buf = OutputBuffer::default();
        buf.push(&[1, 2, 3, 4, 5, 6, 7]);
        let mut out = [0i32; 8];
        // 2 channels: only 3 whole frames are available.
        assert_eq!(buf.frames_available(2), 3);
        assert_eq!(buf.take_frames(&mut out, 2, 2), 2);
        assert_eq!(&out[..4], &[1, 2, 3, 4]);
        assert_eq!(buf.take_frames(&mut out, 8, 2), 1);
        assert_eq!(&out[..2], &[5, 6]);
    }
}
