//! Slimproto TCP control client.
//!
//! Registers with the server via HELO, then runs a blocking receive loop on
//! its own thread, dispatching server commands to callbacks. Status replies
//! (STAT) can be sent from any thread; socket writes are serialized by a
//! mutex and the counters they carry are atomics updated from the audio
//! thread.
//!
//! Clean-room implementation from the public protocol documentation.

pub mod messages;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::{Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use anyhow::{Context, Result};

use messages::{AudgCommand, StatCounters, StatEvent, StrmCommand};

/// Invoked for every stream-control command (never for heartbeats).
pub type StreamCallback = Box<dyn Fn(&StrmCommand, &[u8]) + Send + Sync>;
/// Invoked with the 16.16 fixed-point gains of an `audg` command. The gains
/// are surfaced for telemetry only; output stays at full scale.
pub type VolumeCallback = Box<dyn Fn(u32, u32) + Send + Sync>;

pub struct SlimprotoClient {
    stream: TcpStream,
    send_lock: Mutex<()>,
    running: AtomicBool,
    connected: AtomicBool,
    server_ip: Ipv4Addr,
    player_name: String,
    mac: [u8; 6],
    start_time: Instant,
    stream_cb: Mutex<Option<StreamCallback>>,
    volume_cb: Mutex<Option<VolumeCallback>>,
    // Counters for STAT payloads, updated from the audio thread.
    bytes_received: AtomicU64,
    elapsed_seconds: AtomicU32,
    elapsed_ms: AtomicU32,
    stream_buf_size: AtomicU32,
    stream_buf_full: AtomicU32,
    output_buf_size: AtomicU32,
    output_buf_full: AtomicU32,
    last_heartbeat_log: AtomicU32,
}

impl SlimprotoClient {
    /// Connect and register with the server.
    ///
    /// `start_time` anchors the jiffies counter (ms since process start).
    pub fn connect(
        server: Ipv4Addr,
        port: u16,
        player_name: &str,
        mac: [u8; 6],
        capabilities: &str,
        start_time: Instant,
    ) -> Result<Self> {
        let addr = SocketAddr::from((server, port));
        tracing::info!(%addr, "connecting to server");
        let stream = TcpStream::connect(addr).with_context(|| format!("connect {addr}"))?;
        stream.set_nodelay(true).ok();

        let client = Self {
            stream,
            send_lock: Mutex::new(()),
            running: AtomicBool::new(false),
            connected: AtomicBool::new(true),
            server_ip: server,
            player_name: player_name.to_string(),
            mac,
            start_time,
            stream_cb: Mutex::new(None),
            volume_cb: Mutex::new(None),
            bytes_received: AtomicU64::new(0),
            elapsed_seconds: AtomicU32::new(0),
            elapsed_ms: AtomicU32::new(0),
            stream_buf_size: AtomicU32::new(0),
            stream_buf_full: AtomicU32::new(0),
            output_buf_size: AtomicU32::new(0),
            output_buf_full: AtomicU32::new(0),
            last_heartbeat_log: AtomicU32::new(0),
        };

        client.send_message(b"HELO", &messages::build_helo(&mac, capabilities))?;
        tracing::info!(capabilities, "registered with server");
        client.send_setd(0, player_name.as_bytes())?;
        Ok(client)
    }

    pub fn on_stream(&self, cb: StreamCallback) {
        *self.stream_cb.lock().unwrap() = Some(cb);
    }

    pub fn on_volume(&self, cb: VolumeCallback) {
        *self.volume_cb.lock().unwrap() = Some(cb);
    }

    pub fn server_ip(&self) -> Ipv4Addr {
        self.server_ip
    }

    pub fn mac(&self) -> [u8; 6] {
        self.mac
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Blocking receive loop; returns when the connection drops or `stop`
    /// shuts the socket down. Run this on a dedicated thread.
    pub fn run(&self) {
        self.running.store(true, Ordering::Release);
        tracing::debug!("receive loop started");

        while self.running.load(Ordering::Acquire) {
            let mut len_buf = [0u8; 2];
            if self.read_exact(&mut len_buf).is_err() {
                if self.running.load(Ordering::Acquire) {
                    tracing::warn!("lost connection to server");
                }
                break;
            }
            let frame_len = u16::from_be_bytes(len_buf) as usize;
            if frame_len < 4 {
                tracing::warn!(frame_len, "invalid frame length");
                continue;
            }

            let mut opcode = [0u8; 4];
            if self.read_exact(&mut opcode).is_err() {
                break;
            }
            let mut payload = vec![0u8; frame_len - 4];
            if self.read_exact(&mut payload).is_err() {
                break;
            }

            self.dispatch(&opcode, &payload);
        }

        tracing::debug!("receive loop ended");
        self.connected.store(false, Ordering::Release);
    }

    /// Unblock the receive loop and drop the connection.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    /// Orderly disconnect: BYE! then socket shutdown.
    pub fn disconnect(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            let _ = self.send_message(b"BYE!", &[0]);
        }
        self.stop();
    }

    fn dispatch(&self, opcode: &[u8; 4], payload: &[u8]) {
        match opcode {
            b"strm" => self.handle_strm(payload),
            b"audg" => self.handle_audg(payload),
            b"setd" => self.handle_setd(payload),
            b"serv" => {
                if payload.len() >= 4 {
                    let ip = Ipv4Addr::from([payload[0], payload[1], payload[2], payload[3]]);
                    tracing::info!(%ip, "server redirect requested");
                }
            }
            b"vers" => {
                tracing::info!(version = %String::from_utf8_lossy(payload), "server version");
            }
            b"aude" => {
                tracing::debug!("audio enable acknowledged");
            }
            b"vfdc" | b"grfe" | b"grfb" => {
                // Display/visualization commands: this player has no screen.
            }
            other => {
                tracing::debug!(
                    opcode = %String::from_utf8_lossy(other),
                    len = payload.len(),
                    "unknown opcode skipped"
                );
            }
        }
    }

    fn handle_strm(&self, payload: &[u8]) {
        let Some((cmd, http_request)) = StrmCommand::parse(payload) else {
            tracing::warn!(len = payload.len(), "strm too short");
            return;
        };

        match cmd.command {
            messages::STRM_START => {
                tracing::info!(
                    format = %(cmd.format as char),
                    rate_code = %(cmd.pcm_sample_rate as char),
                    size_code = %(cmd.pcm_sample_size as char),
                    channels_code = %(cmd.pcm_channels as char),
                    port = cmd.server_port,
                    "strm start"
                );
            }
            messages::STRM_STOP => tracing::info!("strm stop"),
            messages::STRM_PAUSE => {
                if cmd.replay_gain > 0 {
                    tracing::info!(interval_ms = cmd.replay_gain, "strm pause with interval");
                } else {
                    tracing::info!("strm pause");
                }
            }
            messages::STRM_UNPAUSE => tracing::info!("strm unpause"),
            messages::STRM_FLUSH => tracing::info!("strm flush"),
            messages::STRM_SKIP => tracing::info!(ms = cmd.replay_gain, "strm skip"),
            messages::STRM_STATUS => {
                // Heartbeat: echo the timestamp, never invoke the callback.
                let ts = cmd.replay_gain;
                let _ = self.send_stat(StatEvent::Timer, ts);
                let last = self.last_heartbeat_log.load(Ordering::Relaxed);
                if ts == 0 || ts >= last.wrapping_add(60_000) {
                    tracing::debug!(ts, "heartbeat");
                    self.last_heartbeat_log.store(ts, Ordering::Relaxed);
                }
                return;
            }
            other => {
                tracing::warn!(command = %(other as char), "unknown strm sub-command");
                return;
            }
        }

        if let Some(cb) = self.stream_cb.lock().unwrap().as_ref() {
            cb(&cmd, http_request);
        }
    }

    fn handle_audg(&self, payload: &[u8]) {
        let Some(cmd) = AudgCommand::parse(payload) else {
            tracing::warn!(len = payload.len(), "audg too short");
            return;
        };
        // Logged and surfaced, but never applied: output stays bit-perfect.
        tracing::debug!(
            gain_left = cmd.new_gain_left,
            gain_right = cmd.new_gain_right,
            "audg ignored (full-scale output)"
        );
        if let Some(cb) = self.volume_cb.lock().unwrap().as_ref() {
            cb(cmd.new_gain_left, cmd.new_gain_right);
        }
    }

    fn handle_setd(&self, payload: &[u8]) {
        let Some(&id) = payload.first() else {
            return;
        };
        if id == 0 && payload.len() > 1 {
            let name = String::from_utf8_lossy(&payload[1..]);
            let name = name.trim_end_matches('\0');
            tracing::info!(name, "player name assigned by server");
        } else if id == 0 {
            // Name query: answer with the configured name.
            let _ = self.send_setd(0, self.player_name.as_bytes());
        } else {
            tracing::debug!(id, len = payload.len() - 1, "setd ignored");
        }
    }

    /// Send a STAT reply. Thread-safe; counters come from the atomics the
    /// audio thread maintains.
    pub fn send_stat(&self, event: StatEvent, server_timestamp: u32) -> Result<()> {
        let counters = StatCounters {
            stream_buf_size: self.stream_buf_size.load(Ordering::Relaxed),
            stream_buf_full: self.stream_buf_full.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            jiffies: self.jiffies(),
            output_buf_size: self.output_buf_size.load(Ordering::Relaxed),
            output_buf_full: self.output_buf_full.load(Ordering::Relaxed),
            elapsed_seconds: self.elapsed_seconds.load(Ordering::Relaxed),
            elapsed_ms: self.elapsed_ms.load(Ordering::Relaxed),
            server_timestamp,
        };
        self.send_message(b"STAT", &messages::build_stat(event, &counters))?;
        if event != StatEvent::Timer {
            tracing::debug!(event = %String::from_utf8_lossy(event.code()), "stat sent");
        }
        Ok(())
    }

    /// Forward the audio server's HTTP response headers.
    pub fn send_resp(&self, headers: &str) -> Result<()> {
        self.send_message(b"RESP", headers.as_bytes())?;
        tracing::debug!(len = headers.len(), "resp sent");
        Ok(())
    }

    fn send_setd(&self, id: u8, data: &[u8]) -> Result<()> {
        let mut payload = Vec::with_capacity(1 + data.len());
        payload.push(id);
        payload.extend_from_slice(data);
        self.send_message(b"SETD", &payload)
    }

    pub fn update_stream_bytes(&self, bytes: u64) {
        self.bytes_received.store(bytes, Ordering::Relaxed);
    }

    pub fn update_elapsed(&self, seconds: u32, milliseconds: u32) {
        self.elapsed_seconds.store(seconds, Ordering::Relaxed);
        self.elapsed_ms.store(milliseconds, Ordering::Relaxed);
    }

    pub fn update_buffer_state(
        &self,
        stream_buf_size: u32,
        stream_buf_full: u32,
        output_buf_size: u32,
        output_buf_full: u32,
    ) {
        self.stream_buf_size.store(stream_buf_size, Ordering::Relaxed);
        self.stream_buf_full.store(stream_buf_full, Ordering::Relaxed);
        self.output_buf_size.store(output_buf_size, Ordering::Relaxed);
        self.output_buf_full.store(output_buf_full, Ordering::Relaxed);
    }

    fn jiffies(&self) -> u32 {
        self.start_time.elapsed().as_millis() as u32
    }

    fn read_exact(&self, buf: &mut [u8]) -> std::io::Result<()> {
        (&self.stream).read_exact(buf)
    }

    fn send_message(&self, opcode: &[u8; 4], payload: &[u8]) -> Result<()> {
        let frame = messages::build_frame(opcode, payload);
        let _guard = self.send_lock.lock().unwrap();
        (&self.stream)
            .write_all(&frame)
            .context("control socket write")?;
        Ok(())
    }
}

/// Parse a `aa:bb:cc:dd:ee:ff` (or `-`-separated) MAC address.
pub fn parse_mac(s: &str) -> Option<[u8; 6]> {
    let parts: Vec<&str> = if s.contains(':') {
        s.split(':').collect()
    } else {
        s.split('-').collect()
    };
    if parts.len() != 6 {
        return None;
    }
    let mut mac = [0u8; 6];
    for (i, part) in parts.iter().enumerate() {
        mac[i] = u8::from_str_radix(part, 16).ok()?;
    }
    Some(mac)
}

/// Derive a stable MAC from the player name: locally administered unicast
/// prefix plus five bytes of the name's hash.
pub fn derive_mac(player_name: &str) -> [u8; 6] {
    let mut hasher = DefaultHasher::new();
    player_name.hash(&mut hasher);
    let h = hasher.finish();
    [
        0x02,
        h as u8,
        (h >> 8) as u8,
        (h >> 16) as u8,
        (h >> 24) as u8,
        (h >> 32) as u8,
    ]
}

/// Build the HELO capabilities string.
pub fn build_capabilities(dsd_enabled: bool, max_sample_rate: u32) -> String {
    let mut caps = String::from("flc,pcm,aif,wav,mp3,ogg,aac");
    if dsd_enabled {
        caps.push_str(",dsf,dff");
    }
    caps.push_str(&format!(",MaxSampleRate={max_sample_rate}"));
    caps.push_str(",Model=slim2diretta,ModelName=slim2diretta");
    caps.push_str(",AccuratePlayPoints=1,HasDigitalOut=1");
    caps
}
