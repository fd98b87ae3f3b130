//! Diretta output sink.
//!
//! Owns the SPSC ring and a worker thread that drains it toward the target
//! at a fixed packet cycle. The producer side (`send_audio`) is called from
//! the audio thread; control transitions (`open`/`pause`/`stop`/`close`)
//! are funneled through the orchestrator.
//!
//! State machine: Disabled -> Idle -> Open -> Playing <-> Paused, with a
//! transient Stopping while a small tail drains. `stop` keeps the
//! negotiated session alive so the next `open` with the same format is a
//! quick resume (no renegotiation).

use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};

use crate::diretta::{self, DirettaConfig, Target};
use crate::format::AudioFormat;
use crate::ring::RingBuffer;

/// Ring capacity: holds a 500 ms prebuffer at the highest supported rates.
const RING_CAPACITY: usize = 8 * 1024 * 1024;

/// Per-packet allowance for IP/UDP and SDK framing.
const PACKET_OVERHEAD: usize = 64;

/// Upper bound on a single packet payload regardless of MTU.
const MAX_PACKET_BYTES: usize = 16 * 1024;

/// A drain on `stop(true)` is honored only for tails up to this size.
const DRAIN_MAX_BYTES: usize = 256 * 1024;

const DRAIN_WAIT: Duration = Duration::from_millis(500);

/// Consecutive send failures before the sink falls back to enabled-idle.
const MAX_SEND_FAILURES: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SinkState {
    Disabled = 0,
    Idle = 1,
    Open = 2,
    Playing = 3,
    Paused = 4,
    Stopping = 5,
}

impl SinkState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Idle,
            2 => Self::Open,
            3 => Self::Playing,
            4 => Self::Paused,
            5 => Self::Stopping,
            _ => Self::Disabled,
        }
    }
}

/// Packet sizing and pacing negotiated by `open`.
#[derive(Debug, Clone, Copy)]
struct Session {
    format: AudioFormat,
    packet_bytes: usize,
    cycle: Duration,
}

#[derive(Debug, Default)]
struct Stats {
    packets: AtomicU64,
    silence_packets: AtomicU64,
    bytes: AtomicU64,
    underruns: AtomicU64,
    send_failures: AtomicU64,
}

struct Shared {
    ring: RingBuffer,
    state: AtomicU8,
    session: Mutex<Option<Session>>,
    target: Mutex<Option<Box<dyn Target>>>,
    /// Notified by the worker after every drain cycle.
    space: (Mutex<()>, Condvar),
    stats: Stats,
    /// Underruns not yet reported to the control plane.
    pending_underruns: AtomicUsize,
}

pub struct Sink {
    shared: Arc<Shared>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    config: DirettaConfig,
    last_format: Mutex<Option<AudioFormat>>,
}

impl Sink {
    /// Acquire the configured target and start the worker thread.
    pub fn enable(config: DirettaConfig) -> Result<Self> {
        let target = diretta::acquire(&config)
            .with_context(|| format!("acquire target #{}", config.target_index))?;
        tracing::info!(target = target.name(), mtu = target.mtu(), "target acquired");

        let shared = Arc::new(Shared {
            ring: RingBuffer::new(RING_CAPACITY),
            state: AtomicU8::new(SinkState::Idle as u8),
            session: Mutex::new(None),
            target: Mutex::new(Some(target)),
            space: (Mutex::new(()), Condvar::new()),
            stats: Stats::default(),
            pending_underruns: AtomicUsize::new(0),
        });

        let worker = {
            let shared = shared.clone();
            let thread_mode = config.thread_mode;
            thread::Builder::new()
                .name("sink-worker".to_string())
                .spawn(move || worker_loop(shared, thread_mode))
                .context("spawn sink worker")?
        };

        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
            config,
            last_format: Mutex::new(None),
        })
    }

    pub fn state(&self) -> SinkState {
        SinkState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Negotiate the sink for `format`.
    ///
    /// If the session left behind by the previous track has the same format,
    /// the session is kept (quick resume); otherwise packet sizing is
    /// recomputed and the target renegotiated.
    pub fn open(&self, format: AudioFormat) -> Result<()> {
        if self.state() == SinkState::Disabled {
            bail!("sink is disabled");
        }

        let mut last = self.last_format.lock().unwrap();
        if *last == Some(format) && self.shared.session.lock().unwrap().is_some() {
            tracing::info!(
                rate = format.sample_rate,
                channels = format.channels,
                dsd = format.is_dsd,
                "quick resume (format unchanged)"
            );
            self.shared.ring.clear();
            self.shared.state.store(SinkState::Open as u8, Ordering::Release);
            return Ok(());
        }

        let mut target_guard = self.shared.target.lock().unwrap();
        let target = target_guard.as_mut().context("no target acquired")?;

        if last.is_some() {
            target.close_session();
        }
        target.set_format(&format)?;

        let mtu = if self.config.mtu > 0 {
            self.config.mtu as usize
        } else {
            target.mtu()
        };
        let session = compute_session(&format, mtu, &self.config);
        tracing::info!(
            rate = format.sample_rate,
            channels = format.channels,
            dsd = format.is_dsd,
            packet_bytes = session.packet_bytes,
            cycle_us = session.cycle.as_micros() as u64,
            "sink open"
        );

        *self.shared.session.lock().unwrap() = Some(session);
        *last = Some(format);
        drop(target_guard);

        self.shared.ring.clear();
        self.shared.state.store(SinkState::Open as u8, Ordering::Release);
        Ok(())
    }

    /// Push planar/interleaved audio bytes into the ring.
    ///
    /// Writes as much as fits and returns the byte count; the caller is
    /// expected to respect `buffer_level` and retry via `wait_for_space`.
    pub fn send_audio(&self, bytes: &[u8], _frames: usize) -> usize {
        let state = self.state();
        if state == SinkState::Open {
            self.shared
                .state
                .store(SinkState::Playing as u8, Ordering::Release);
        } else if state != SinkState::Playing && state != SinkState::Paused {
            return 0;
        }
        self.shared.ring.write(bytes)
    }

    pub fn pause(&self) {
        if self.state() == SinkState::Playing {
            self.shared
                .state
                .store(SinkState::Paused as u8, Ordering::Release);
            tracing::debug!("sink paused");
        }
    }

    pub fn resume(&self) {
        if self.state() == SinkState::Paused {
            self.shared
                .state
                .store(SinkState::Playing as u8, Ordering::Release);
            tracing::debug!("sink resumed");
        }
    }

    /// Stop producing packets, keeping the session alive for a fast reopen.
    ///
    /// With `drain` set and a small pending tail the worker is given time to
    /// push the remaining bytes out first; otherwise they are dropped.
    pub fn stop(&self, drain: bool) {
        let state = self.state();
        if state != SinkState::Playing && state != SinkState::Paused {
            return;
        }

        if drain && self.shared.ring.available() <= DRAIN_MAX_BYTES {
            self.shared
                .state
                .store(SinkState::Stopping as u8, Ordering::Release);
            let deadline = Instant::now() + DRAIN_WAIT;
            while self.shared.ring.available() > 0 && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(1));
            }
        }

        self.shared.state.store(SinkState::Open as u8, Ordering::Release);
        // Let an in-flight worker cycle finish before touching the read side.
        thread::sleep(Duration::from_millis(2));
        self.shared.ring.clear();
        tracing::debug!(drained = drain, "sink stopped");
    }

    /// Release the session but keep the target acquired.
    pub fn close(&self) {
        self.stop(false);
        if let Some(target) = self.shared.target.lock().unwrap().as_mut() {
            target.close_session();
        }
        *self.shared.session.lock().unwrap() = None;
        *self.last_format.lock().unwrap() = None;
        self.shared.state.store(SinkState::Idle as u8, Ordering::Release);
    }

    /// Instantaneous ring fullness in [0, 1].
    pub fn buffer_level(&self) -> f64 {
        self.shared.ring.available() as f64 / self.shared.ring.capacity() as f64
    }

    pub fn buffer_capacity(&self) -> usize {
        self.shared.ring.capacity()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.shared.ring.available()
    }

    /// Block until the worker has freed space or the timeout expires.
    /// Returns true if any free space is available on return.
    pub fn wait_for_space(&self, timeout: Duration) -> bool {
        if self.shared.ring.free_space() > 0 {
            return true;
        }
        let (lock, cv) = &self.shared.space;
        let guard = lock.lock().unwrap();
        let _ = cv.wait_timeout(guard, timeout).unwrap();
        self.shared.ring.free_space() > 0
    }

    /// Underruns observed by the worker since the last call.
    pub fn take_underruns(&self) -> usize {
        self.shared.pending_underruns.swap(0, Ordering::AcqRel)
    }

    /// Log a stats snapshot (driven by SIGUSR1).
    pub fn dump_stats(&self) {
        let s = &self.shared.stats;
        let session = *self.shared.session.lock().unwrap();
        tracing::info!(
            state = ?self.state(),
            packets = s.packets.load(Ordering::Relaxed),
            silence_packets = s.silence_packets.load(Ordering::Relaxed),
            bytes = s.bytes.load(Ordering::Relaxed),
            underruns = s.underruns.load(Ordering::Relaxed),
            send_failures = s.send_failures.load(Ordering::Relaxed),
            buffered = self.shared.ring.available(),
            rate = session.map(|s| s.format.sample_rate).unwrap_or(0),
            cycle_us = session.map(|s| s.cycle.as_micros() as u64).unwrap_or(0),
            packet_bytes = session.map(|s| s.packet_bytes).unwrap_or(0),
            "sink stats"
        );
    }

    /// Release the target and stop the worker.
    pub fn disable(&self) {
        self.close();
        self.shared
            .state
            .store(SinkState::Disabled as u8, Ordering::Release);
        if let Some(worker) = self.worker.lock().unwrap().take() {
            let _ = worker.join();
        }
        *self.shared.target.lock().unwrap() = None;
        tracing::info!("sink disabled");
    }
}

impl Drop for Sink {
    fn drop(&mut self) {
        if self.worker.lock().unwrap().is_some() {
            self.disable();
        }
    }
}

/// Compute packet sizing so each packet carries a whole number of frames
/// and the delivery rate matches the input byte rate.
fn compute_session(format: &AudioFormat, mtu: usize, config: &DirettaConfig) -> Session {
    let bytes_per_frame = format.bytes_per_frame().max(1);
    let payload = mtu
        .saturating_sub(PACKET_OVERHEAD)
        .clamp(bytes_per_frame, MAX_PACKET_BYTES);
    let frames_per_packet = (payload / bytes_per_frame).max(1);
    let packet_bytes = frames_per_packet * bytes_per_frame;

    let byte_rate = format.bytes_per_second().max(1);
    let cycle_us = if config.cycle_auto {
        (packet_bytes as u64 * 1_000_000 / byte_rate).max(100)
    } else {
        config.cycle_time_us.max(100) as u64
    };

    Session {
        format: *format,
        packet_bytes,
        cycle: Duration::from_micros(cycle_us),
    }
}

fn worker_loop(shared: Arc<Shared>, thread_mode: i32) {
    if thread_mode > 0 {
        request_realtime_priority();
    }

    let mut packet = vec![0u8; MAX_PACKET_BYTES];
    let mut next = Instant::now();
    let mut consecutive_failures: u32 = 0;

    loop {
        let state = SinkState::from_u8(shared.state.load(Ordering::Acquire));
        if state == SinkState::Disabled {
            break;
        }

        let session = *shared.session.lock().unwrap();
        let Some(session) = session else {
            // Nothing negotiated yet; idle at a coarse poll.
            thread::sleep(Duration::from_millis(5));
            next = Instant::now();
            continue;
        };

        let packet_bytes = session.packet_bytes.min(packet.len());
        let mut send: Option<usize> = None;

        match state {
            SinkState::Playing => {
                let n = shared.ring.read(&mut packet[..packet_bytes]);
                if n == 0 {
                    // Underrun: keep the target fed with silence.
                    packet[..packet_bytes].fill(0);
                    shared.stats.underruns.fetch_add(1, Ordering::Relaxed);
                    shared.stats.silence_packets.fetch_add(1, Ordering::Relaxed);
                    shared.pending_underruns.fetch_add(1, Ordering::Release);
                } else if n < packet_bytes {
                    packet[n..packet_bytes].fill(0);
                }
                send = Some(packet_bytes);
            }
            SinkState::Paused => {
                packet[..packet_bytes].fill(0);
                shared.stats.silence_packets.fetch_add(1, Ordering::Relaxed);
                send = Some(packet_bytes);
            }
            SinkState::Stopping => {
                let n = shared.ring.read(&mut packet[..packet_bytes]);
                if n > 0 {
                    packet[n..packet_bytes].fill(0);
                    send = Some(packet_bytes);
                }
            }
            SinkState::Idle | SinkState::Open => {
                next = Instant::now();
            }
            SinkState::Disabled => break,
        }

        if let Some(len) = send {
            let result = {
                let mut target = shared.target.lock().unwrap();
                match target.as_mut() {
                    Some(t) => t.send(&packet[..len]),
                    None => Ok(()),
                }
            };
            match result {
                Ok(()) => {
                    consecutive_failures = 0;
                    shared.stats.packets.fetch_add(1, Ordering::Relaxed);
                    shared.stats.bytes.fetch_add(len as u64, Ordering::Relaxed);
                }
                Err(e) => {
                    consecutive_failures += 1;
                    shared.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                    if consecutive_failures == 1 {
                        tracing::warn!("target send failed: {e:#}");
                    }
                    if consecutive_failures >= MAX_SEND_FAILURES {
                        tracing::error!("target unreachable, sink falling back to idle");
                        shared.state.store(SinkState::Idle as u8, Ordering::Release);
                        *shared.session.lock().unwrap() = None;
                        consecutive_failures = 0;
                    }
                }
            }
        }

        // Wake any producer waiting on ring space.
        shared.space.1.notify_all();

        match state {
            SinkState::Playing | SinkState::Paused | SinkState::Stopping => {
                next += session.cycle;
                let now = Instant::now();
                if next > now {
                    thread::sleep(next - now);
                } else {
                    // Fell behind (scheduling hiccup); restart the cadence.
                    next = now;
                }
            }
            _ => thread::sleep(Duration::from_millis(1)),
        }
    }

    shared.space.1.notify_all();
}

#[cfg(target_os = "linux")]
fn request_realtime_priority() {
    // Best effort; needs CAP_SYS_NICE or rtprio limits.
    unsafe {
        let param = libc::sched_param { sched_priority: 50 };
        if libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) != 0 {
            tracing::debug!("real-time priority unavailable for sink worker");
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn request_realtime_priority() {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diretta::TransferMode;
    use crate::format::{AudioFormat, DsdContainer};

    fn test_config() -> DirettaConfig {
        DirettaConfig {
            target_index: 1,
            thread_mode: 0,
            mtu: 1500,
            cycle_time_us: 10_000,
            cycle_auto: true,
            transfer_mode: TransferMode::Auto,
            info_cycle_us: 100_000,
            cycle_min_time_us: 0,
            target_profile_limit_us: 200,
        }
    }

    #[test]
    fn session_packets_carry_whole_frames() {
        let config = test_config();
        let format = AudioFormat::pcm(44_100, 2);
        let session = compute_session(&format, 1500, &config);
        assert_eq!(session.packet_bytes % format.bytes_per_frame(), 0);
        assert!(session.packet_bytes <= 1500 - PACKET_OVERHEAD);

        // Delivery rate matches the byte rate within rounding.
        let per_second = 1_000_000.0 / session.cycle.as_micros() as f64;
        let byte_rate = per_second * session.packet_bytes as f64;
        let expected = format.bytes_per_second() as f64;
        assert!((byte_rate - expected).abs() / expected < 0.01);
    }

    #[test]
    fn session_cycle_respects_manual_override() {
        let mut config = test_config();
        config.cycle_auto = false;
        config.cycle_time_us = 5_000;
        let session = compute_session(&AudioFormat::pcm(48_000, 2), 9014, &config);
        assert_eq!(session.cycle, Duration::from_micros(5_000));
    }

    #[test]
    fn dsd_session_uses_byte_rate() {
        let config = test_config();
        let format = AudioFormat::dsd(5_644_800, 2, DsdContainer::Dff);
        let session = compute_session(&format, 1500, &config);
        assert_eq!(session.packet_bytes % 2, 0);
        let per_second = 1_000_000.0 / session.cycle.as_micros() as f64;
        let byte_rate = per_second * session.packet_bytes as f64;
        let expected = (5_644_800u64 / 8 * 2) as f64;
        assert!((byte_rate - expected).abs() / expected < 0.01);
    }

    #[test]
    fn open_send_stop_quick_resume() {
        let sink = Sink::enable(test_config()).unwrap();
        assert_eq!(sink.state(), SinkState::Idle);

        let format = AudioFormat::pcm(48_000, 2);
        sink.open(format).unwrap();
        assert_eq!(sink.state(), SinkState::Open);

        let written = sink.send_audio(&[0u8; 4096], 512);
        assert_eq!(written, 4096);
        assert_eq!(sink.state(), SinkState::Playing);

        sink.pause();
        assert_eq!(sink.state(), SinkState::Paused);
        sink.resume();
        assert_eq!(sink.state(), SinkState::Playing);

        sink.stop(false);
        assert_eq!(sink.state(), SinkState::Open);
        assert_eq!(sink.buffered_bytes(), 0);

        // Same format: quick resume keeps the session.
        sink.open(format).unwrap();
        assert_eq!(sink.state(), SinkState::Open);

        sink.disable();
        assert_eq!(sink.state(), SinkState::Disabled);
    }

    #[test]
    fn buffer_level_tracks_ring_fill() {
        let sink = Sink::enable(test_config()).unwrap();
        sink.open(AudioFormat::pcm(48_000, 2)).unwrap();
        assert_eq!(sink.buffer_level(), 0.0);
        sink.send_audio(&vec![0u8; sink.buffer_capacity() / 2], 0);
        assert!(sink.buffer_level() >= 0.49);
        sink.disable();
    }
}
