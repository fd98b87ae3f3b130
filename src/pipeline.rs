//! Per-track audio thread.
//!
//! One loop per track, interleaving four jobs on a 2 ms network poll: HTTP
//! ingest into the decoder, decoder drain into a local cache, prebuffered
//! sink open, and steady-state pushes that honor the sink's high-water
//! mark. The DSD path runs the same scaffold without a decode cache — the
//! container reader's buffer is the only staging area and planar chunks go
//! to the sink whole, in small pieces, so the planar layout is never split.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::decode::Decoder;
use crate::dsd::{processor, DsdStreamReader};
use crate::format::{sample_rate_from_code, sample_size_from_code, AudioFormat};
use crate::http_stream::{HttpStream, ReadOutcome};
use crate::sink::{Sink, SinkState};
use crate::slimproto::messages::StatEvent;
use crate::slimproto::SlimprotoClient;

/// Prebuffer before the sink opens.
const PREBUFFER_MS: u64 = 500;

/// Decode-cache cap: about 2 s at 192 kHz stereo, in interleaved samples.
const CACHE_CAP_SAMPLES: usize = 768_000;

/// Consumed-prefix length that triggers cache compaction.
const CACHE_COMPACT_SAMPLES: usize = 100_000;

/// Frames pushed to the sink per steady-state iteration.
const PUSH_CHUNK_FRAMES: usize = 1024;

/// Producer backs off above this ring fullness.
const SINK_HIGH_WATER: f64 = 0.95;

/// DSD planar push size. Kept small so a push always fits the ring whole;
/// a partial planar write would land the right channel at the wrong offset.
const DSD_SCRATCH_BYTES: usize = 16 * 1024;

/// DSD reader staging cap; ingest backs off above it.
const DSD_DATA_CAP: usize = 2 * 1024 * 1024;

const PAUSE_POLL: Duration = Duration::from_millis(100);
const ELAPSED_LOG_PERIOD: Duration = Duration::from_secs(10);

/// What the strm start command tells us about the incoming track.
#[derive(Debug, Clone, Copy)]
pub struct TrackParams {
    pub format_code: u8,
    pub pcm_sample_size: u8,
    pub pcm_sample_rate: u8,
    pub pcm_channels: u8,
    pub pcm_endian: u8,
    pub max_sample_rate: u32,
    pub dsd_enabled: bool,
}

/// Entry point for the audio thread spawned on each stream start.
pub fn run_track(
    mut http: HttpStream,
    params: TrackParams,
    sink: Arc<Sink>,
    client: Arc<SlimprotoClient>,
    running: Arc<AtomicBool>,
) {
    let result = if params.format_code == b'd' {
        if params.dsd_enabled {
            run_dsd_track(&mut http, &sink, &client, &running)
        } else {
            tracing::error!("dsd stream refused (disabled by configuration)");
            Err(TrackError::Unsupported)
        }
    } else {
        run_pcm_track(&mut http, params, &sink, &client, &running)
    };

    match result {
        Ok(()) => {}
        Err(TrackError::Unsupported) | Err(TrackError::Decoder) => {
            let _ = client.send_stat(StatEvent::NotSupported, 0);
            sink.stop(false);
        }
        Err(TrackError::Canceled) => {}
    }
    http.disconnect();
}

enum TrackError {
    /// Format not playable (unknown code, rate above limit, DSD disabled).
    Unsupported,
    /// Decoder or sink reported a fatal condition mid-track.
    Decoder,
    /// The running flag was cleared; exit without status traffic.
    Canceled,
}

fn run_pcm_track(
    http: &mut HttpStream,
    params: TrackParams,
    sink: &Arc<Sink>,
    client: &Arc<SlimprotoClient>,
    running: &AtomicBool,
) -> Result<(), TrackError> {
    let Some(mut decoder) = Decoder::create(params.format_code) else {
        tracing::error!(format = %(params.format_code as char), "unsupported format code");
        return Err(TrackError::Unsupported);
    };

    // Container-less PCM: the command itself carries the format.
    if params.format_code == b'p' {
        let rate = sample_rate_from_code(params.pcm_sample_rate);
        let bits = sample_size_from_code(params.pcm_sample_size);
        let channels = match params.pcm_channels {
            b'1' => 1,
            b'2' => 2,
            _ => 0,
        };
        if rate > 0 && bits > 0 && channels > 0 {
            decoder.set_raw_pcm_format(rate, bits, channels, params.pcm_endian == b'0');
        }
    }

    let mut cache: Vec<i32> = Vec::with_capacity(CACHE_CAP_SAMPLES);
    let mut read_pos = 0usize;
    let mut net_buf = vec![0u8; 16 * 1024];
    let mut decode_buf = vec![0i32; PUSH_CHUNK_FRAMES * 8];

    let mut http_eof = false;
    let mut track_format: Option<AudioFormat> = None;
    let mut prebuffer_frames = 0usize;
    let mut prebuffered = false;
    let mut pushed_frames: u64 = 0;
    let mut first_audio_logged = false;
    let mut last_elapsed_log = Instant::now();

    loop {
        if !running.load(Ordering::Acquire) {
            return Err(TrackError::Canceled);
        }

        // HTTP ingest, backed off while the cache is comfortably full.
        let mut got_data = false;
        if !http_eof && cache.len() - read_pos < CACHE_CAP_SAMPLES {
            match http.read_timed(&mut net_buf) {
                ReadOutcome::Data(n) => {
                    decoder.feed(&net_buf[..n]);
                    client.update_stream_bytes(http.bytes_received());
                    got_data = true;
                }
                ReadOutcome::Idle => {}
                ReadOutcome::Eof => {
                    tracing::debug!(bytes = http.bytes_received(), "audio stream reached end");
                    http_eof = true;
                    decoder.set_eof();
                }
            }
        }

        // Drain the decoder into the cache.
        let mut new_frames = 0usize;
        loop {
            if cache.len() - read_pos >= CACHE_CAP_SAMPLES {
                break;
            }
            let channels = decoder.format().channels.max(1) as usize;
            let max_frames = (decode_buf.len() / channels).min(PUSH_CHUNK_FRAMES);
            let frames = decoder.read_decoded(&mut decode_buf, max_frames);
            if frames == 0 {
                break;
            }
            cache.extend_from_slice(&decode_buf[..frames * channels]);
            new_frames += frames;
        }
        if decoder.has_error() {
            tracing::error!("decoder failed, abandoning track");
            return Err(TrackError::Decoder);
        }
        if new_frames > 0 && !first_audio_logged {
            first_audio_logged = true;
            tracing::debug!("first audio decoded");
        }

        // Format detection.
        if track_format.is_none() && decoder.is_format_ready() {
            let decoded = decoder.format();
            if decoded.sample_rate > params.max_sample_rate {
                tracing::error!(
                    rate = decoded.sample_rate,
                    max = params.max_sample_rate,
                    "sample rate above configured maximum"
                );
                return Err(TrackError::Unsupported);
            }
            let format = AudioFormat::pcm(decoded.sample_rate, decoded.channels);
            prebuffer_frames = (PREBUFFER_MS * decoded.sample_rate as u64 / 1000) as usize;
            track_format = Some(format);
            tracing::info!(
                rate = decoded.sample_rate,
                bits = decoded.bit_depth,
                channels = decoded.channels,
                "track format"
            );
        }

        // Prebuffer, then hand the whole thing to the sink at once.
        if !prebuffered {
            if let Some(format) = track_format {
                let channels = format.channels as usize;
                let frames_cached = (cache.len() - read_pos) / channels;
                if frames_cached >= prebuffer_frames || http_eof {
                    if let Err(e) = sink.open(format) {
                        tracing::error!("sink open failed: {e:#}");
                        return Err(TrackError::Decoder);
                    }
                    let _ = client.send_stat(StatEvent::TrackStarted, 0);
                    push_cache(sink, &cache, &mut read_pos, frames_cached, channels);
                    pushed_frames += frames_cached as u64;
                    prebuffered = true;
                    let _ = client.send_stat(StatEvent::BufferThreshold, 0);
                    tracing::info!(frames = frames_cached, "prebuffer handed to sink");
                }
            }
        } else if let Some(format) = track_format {
            let channels = format.channels as usize;
            if sink.state() == SinkState::Paused {
                std::thread::sleep(PAUSE_POLL);
            } else if sink.buffer_level() > SINK_HIGH_WATER {
                std::thread::sleep(Duration::from_millis(1));
            } else {
                let frames_cached = (cache.len() - read_pos) / channels;
                let frames = frames_cached.min(PUSH_CHUNK_FRAMES);
                if frames > 0 {
                    push_cache(sink, &cache, &mut read_pos, frames, channels);
                    pushed_frames += frames as u64;
                }
            }

            report_progress(
                client,
                sink,
                format,
                pushed_frames,
                (cache.len() - read_pos) as u32,
                &mut last_elapsed_log,
            );
        }

        // Compact the consumed cache prefix.
        if read_pos > CACHE_COMPACT_SAMPLES {
            cache.drain(..read_pos);
            read_pos = 0;
        }

        // End of stream: the remaining cache drains below.
        if http_eof && decoder.is_finished() && cache.len() == read_pos {
            break;
        }

        if !got_data && new_frames == 0 && !http_eof {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    let Some(format) = track_format else {
        tracing::warn!("stream ended without decodable audio");
        return Err(TrackError::Decoder);
    };

    // Final drain with flow control.
    let channels = format.channels as usize;
    while cache.len() > read_pos {
        if !running.load(Ordering::Acquire) {
            return Err(TrackError::Canceled);
        }
        if sink.buffer_level() > SINK_HIGH_WATER {
            sink.wait_for_space(Duration::from_millis(100));
            continue;
        }
        let frames = ((cache.len() - read_pos) / channels).min(PUSH_CHUNK_FRAMES);
        if frames == 0 {
            break;
        }
        push_cache(sink, &cache, &mut read_pos, frames, channels);
        pushed_frames += frames as u64;
    }

    let _ = client.send_stat(StatEvent::DecoderReady, 0);
    wait_ring_drained(sink, running);
    sink.stop(false);
    let elapsed_ms = pushed_frames * 1000 / format.sample_rate.max(1) as u64;
    client.update_elapsed((elapsed_ms / 1000) as u32, elapsed_ms as u32);
    let _ = client.send_stat(StatEvent::Underrun, 0);
    tracing::info!(
        frames = pushed_frames,
        elapsed_s = elapsed_ms / 1000,
        "track finished"
    );
    Ok(())
}

fn run_dsd_track(
    http: &mut HttpStream,
    sink: &Arc<Sink>,
    client: &Arc<SlimprotoClient>,
    running: &AtomicBool,
) -> Result<(), TrackError> {
    let mut reader = DsdStreamReader::new();
    let mut net_buf = vec![0u8; 16 * 1024];
    let mut scratch = vec![0u8; DSD_SCRATCH_BYTES];

    let mut http_eof = false;
    let mut track_format: Option<AudioFormat> = None;
    let mut prebuffer_bytes = 0usize;
    let mut prebuffered = false;
    let mut pushed_bytes: u64 = 0;
    let mut last_elapsed_log = Instant::now();

    loop {
        if !running.load(Ordering::Acquire) {
            return Err(TrackError::Canceled);
        }

        let mut got_data = false;
        if !http_eof && reader.buffered_bytes() < DSD_DATA_CAP {
            match http.read_timed(&mut net_buf) {
                ReadOutcome::Data(n) => {
                    reader.feed(&net_buf[..n]);
                    client.update_stream_bytes(http.bytes_received());
                    got_data = true;
                }
                ReadOutcome::Idle => {}
                ReadOutcome::Eof => {
                    http_eof = true;
                    reader.set_eof();
                }
            }
        }
        if reader.has_error() {
            tracing::error!("dsd stream parse failed");
            return Err(TrackError::Decoder);
        }

        if track_format.is_none() && reader.is_format_ready() {
            let dsd = reader.format();
            let format = AudioFormat::dsd(dsd.sample_rate, dsd.channels, dsd.container);
            let byte_rate = format.bytes_per_second() as usize;
            prebuffer_bytes =
                (byte_rate * PREBUFFER_MS as usize / 1000).min(DSD_DATA_CAP * 3 / 4);
            track_format = Some(format);
            tracing::info!(
                rate_name = processor::rate_name(dsd.sample_rate),
                rate = dsd.sample_rate,
                channels = dsd.channels,
                "dsd track format"
            );
        }

        let mut pushed_now = 0usize;
        if !prebuffered {
            if let Some(format) = track_format {
                if reader.buffered_bytes() >= prebuffer_bytes || http_eof {
                    if let Err(e) = sink.open(format) {
                        tracing::error!("sink open failed: {e:#}");
                        return Err(TrackError::Decoder);
                    }
                    let _ = client.send_stat(StatEvent::TrackStarted, 0);
                    // The ring starts empty; the prebuffer fits without flow
                    // control.
                    loop {
                        let n = reader.read_planar(&mut scratch, DSD_SCRATCH_BYTES);
                        if n == 0 {
                            break;
                        }
                        sink.send_audio(&scratch[..n], 0);
                        pushed_bytes += n as u64;
                    }
                    prebuffered = true;
                    let _ = client.send_stat(StatEvent::BufferThreshold, 0);
                    tracing::info!(bytes = pushed_bytes, "dsd prebuffer handed to sink");
                }
            }
        } else if let Some(format) = track_format {
            if sink.state() == SinkState::Paused {
                std::thread::sleep(PAUSE_POLL);
            } else if sink.buffer_level() > SINK_HIGH_WATER
                || sink.buffer_capacity() - sink.buffered_bytes() < DSD_SCRATCH_BYTES
            {
                std::thread::sleep(Duration::from_millis(1));
            } else {
                // Whole-chunk push: the sink computes channel offsets from
                // the pushed size, so a chunk must never be split.
                let n = reader.read_planar(&mut scratch, DSD_SCRATCH_BYTES);
                if n > 0 {
                    sink.send_audio(&scratch[..n], 0);
                    pushed_bytes += n as u64;
                    pushed_now = n;
                }
            }

            report_dsd_progress(
                client,
                sink,
                format,
                pushed_bytes,
                reader.buffered_bytes() as u32,
                &mut last_elapsed_log,
            );
        }

        if http_eof && (reader.is_finished() || track_format.is_none()) {
            break;
        }
        if !got_data && pushed_now == 0 && !http_eof {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    let Some(format) = track_format else {
        tracing::warn!("dsd stream ended without a parsed container");
        return Err(TrackError::Decoder);
    };

    let _ = client.send_stat(StatEvent::DecoderReady, 0);
    wait_ring_drained(sink, running);
    sink.stop(false);
    let byte_rate = format.bytes_per_second().max(1);
    let elapsed_ms = pushed_bytes * 1000 / byte_rate;
    client.update_elapsed((elapsed_ms / 1000) as u32, elapsed_ms as u32);
    let _ = client.send_stat(StatEvent::Underrun, 0);
    tracing::info!(
        bytes = pushed_bytes,
        elapsed_s = elapsed_ms / 1000,
        "dsd track finished"
    );
    Ok(())
}

/// Push `frames` interleaved samples from the cache into the sink.
fn push_cache(sink: &Sink, cache: &[i32], read_pos: &mut usize, frames: usize, channels: usize) {
    let samples = frames * channels;
    let slice = &cache[*read_pos..*read_pos + samples];
    // i32 samples cross the ring as native-endian bytes.
    let bytes = unsafe {
        std::slice::from_raw_parts(slice.as_ptr() as *const u8, std::mem::size_of_val(slice))
    };
    let mut offset = 0usize;
    while offset < bytes.len() {
        let written = sink.send_audio(&bytes[offset..], frames);
        if written == 0 {
            std::thread::sleep(Duration::from_millis(1));
            continue;
        }
        offset += written;
    }
    *read_pos += samples;
}

fn report_progress(
    client: &SlimprotoClient,
    sink: &Sink,
    format: AudioFormat,
    pushed_frames: u64,
    cache_samples: u32,
    last_log: &mut Instant,
) {
    let elapsed_ms = pushed_frames * 1000 / format.sample_rate.max(1) as u64;
    client.update_elapsed((elapsed_ms / 1000) as u32, elapsed_ms as u32);
    client.update_buffer_state(
        (CACHE_CAP_SAMPLES * 4) as u32,
        cache_samples.saturating_mul(4),
        sink.buffer_capacity() as u32,
        sink.buffered_bytes() as u32,
    );
    if sink.take_underruns() > 0 {
        let _ = client.send_stat(StatEvent::OutputUnderrun, 0);
    }
    if last_log.elapsed() >= ELAPSED_LOG_PERIOD {
        *last_log = Instant::now();
        tracing::info!(
            elapsed_s = elapsed_ms / 1000,
            buffer_level = sink.buffer_level(),
            "playing"
        );
    }
}

fn report_dsd_progress(
    client: &SlimprotoClient,
    sink: &Sink,
    format: AudioFormat,
    pushed_bytes: u64,
    staged_bytes: u32,
    last_log: &mut Instant,
) {
    let byte_rate = format.bytes_per_second().max(1);
    let elapsed_ms = pushed_bytes * 1000 / byte_rate;
    client.update_elapsed((elapsed_ms / 1000) as u32, elapsed_ms as u32);
    client.update_buffer_state(
        DSD_DATA_CAP as u32,
        staged_bytes,
        sink.buffer_capacity() as u32,
        sink.buffered_bytes() as u32,
    );
    if sink.take_underruns() > 0 {
        let _ = client.send_stat(StatEvent::OutputUnderrun, 0);
    }
    if last_log.elapsed() >= ELAPSED_LOG_PERIOD {
        *last_log = Instant::now();
        tracing::info!(
            elapsed_s = elapsed_ms / 1000,
            buffer_level = sink.buffer_level(),
            "playing dsd"
        );
    }
}

/// Let the worker push out what is already in the ring.
fn wait_ring_drained(sink: &Sink, running: &AtomicBool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while sink.buffered_bytes() > 0 && running.load(Ordering::Acquire) && Instant::now() < deadline
    {
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prebuffer_sizing_follows_the_rate() {
        let frames = PREBUFFER_MS * 44_100 / 1000;
        assert_eq!(frames, 22_050);

        let dsd64_stereo = AudioFormat::dsd(2_822_400, 2, crate::format::DsdContainer::Dsf);
        let bytes = dsd64_stereo.bytes_per_second() as usize * PREBUFFER_MS as usize / 1000;
        assert_eq!(bytes, 352_800);
        assert!(bytes < DSD_DATA_CAP * 3 / 4);
    }

    #[test]
    fn cache_cap_matches_two_seconds_at_192k_stereo() {
        assert_eq!(CACHE_CAP_SAMPLES, 192_000 * 2 * 2);
    }
}
