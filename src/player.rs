//! Player orchestration.
//!
//! Owns the sink and the control client, runs the reconnection loop, and
//! turns stream commands into per-track audio threads. The slimproto
//! receive thread translates commands onto a channel; the control loop
//! here owns every sink state transition so control stays single-threaded.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};

use crate::config::Config;
use crate::format::AudioFormat;
use crate::http_stream::HttpStream;
use crate::pipeline::{self, TrackParams};
use crate::sink::Sink;
use crate::slimproto::messages::{self, StatEvent, StrmCommand};
use crate::slimproto::SlimprotoClient;

const RECONNECT_BACKOFF_INITIAL: Duration = Duration::from_secs(2);
const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(30);
const TRACK_JOIN_TIMEOUT: Duration = Duration::from_millis(500);
const CONTROL_POLL: Duration = Duration::from_millis(100);

/// Warm-up format: exercises the full init path at startup and leaves the
/// session alive so a first 48 kHz track quick-resumes.
const WARMUP_FORMAT: AudioFormat = AudioFormat {
    sample_rate: 48_000,
    bit_depth: 32,
    channels: 2,
    is_dsd: false,
    dsd_container: None,
};

#[derive(Debug)]
enum PlayerCommand {
    Start {
        cmd: StrmCommand,
        http_request: Vec<u8>,
    },
    Stop,
    Pause { interval_ms: u32 },
    Unpause,
    Skip { ms: u32 },
}

struct TrackSession {
    running: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
}

/// Run the player until `shutdown` is set: connect, serve, reconnect with
/// exponential backoff.
pub fn run(
    config: &Config,
    sink: &Arc<Sink>,
    shutdown: &AtomicBool,
    stats_requested: &AtomicBool,
) {
    let start_time = Instant::now();

    // Warm-up open so the target session exists before the first track.
    match sink.open(WARMUP_FORMAT) {
        Ok(()) => sink.stop(false),
        Err(e) => tracing::warn!("warm-up open failed: {e:#}"),
    }

    let capabilities =
        crate::slimproto::build_capabilities(config.dsd_enabled, config.max_sample_rate);
    let mut backoff = RECONNECT_BACKOFF_INITIAL;

    while !shutdown.load(Ordering::Acquire) {
        match SlimprotoClient::connect(
            config.server,
            config.port,
            &config.player_name,
            config.mac,
            &capabilities,
            start_time,
        ) {
            Ok(client) => {
                backoff = RECONNECT_BACKOFF_INITIAL;
                serve_connection(config, sink, Arc::new(client), shutdown, stats_requested);
            }
            Err(e) => {
                tracing::warn!("server connection failed: {e:#}");
            }
        }

        if shutdown.load(Ordering::Acquire) {
            break;
        }
        tracing::info!(seconds = backoff.as_secs(), "reconnecting after backoff");
        sleep_observing(backoff, shutdown, stats_requested, sink);
        backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX);
    }
}

/// Serve one control connection until it drops or shutdown is requested.
fn serve_connection(
    config: &Config,
    sink: &Arc<Sink>,
    client: Arc<SlimprotoClient>,
    shutdown: &AtomicBool,
    stats_requested: &AtomicBool,
) {
    let (tx, rx) = unbounded::<PlayerCommand>();
    register_callbacks(&client, tx);

    let receive_thread = {
        let client = client.clone();
        thread::Builder::new()
            .name("slimproto-recv".to_string())
            .spawn(move || client.run())
            .expect("spawn receive thread")
    };

    let mut session: Option<TrackSession> = None;
    let mut pending_resume: Option<Instant> = None;

    loop {
        if shutdown.load(Ordering::Acquire) {
            break;
        }
        if !client.is_connected() {
            tracing::warn!("control connection lost");
            break;
        }
        if stats_requested.swap(false, Ordering::AcqRel) {
            sink.dump_stats();
        }
        if let Some(at) = pending_resume {
            if Instant::now() >= at {
                pending_resume = None;
                sink.resume();
                let _ = client.send_stat(StatEvent::Resumed, 0);
                tracing::info!("auto-resume after pause interval");
            }
        }

        let command = match rx.recv_timeout(CONTROL_POLL) {
            Ok(command) => command,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        match command {
            PlayerCommand::Start { cmd, http_request } => {
                pending_resume = None;
                stop_session(&mut session, sink, true);
                start_track(config, sink, &client, &mut session, &cmd, &http_request);
            }
            PlayerCommand::Stop => {
                pending_resume = None;
                stop_session(&mut session, sink, true);
                let _ = client.send_stat(StatEvent::Flushed, 0);
            }
            PlayerCommand::Pause { interval_ms } => {
                sink.pause();
                let _ = client.send_stat(StatEvent::Paused, 0);
                if interval_ms > 0 {
                    // Advisory: pause for N ms, then resume on our own.
                    pending_resume =
                        Some(Instant::now() + Duration::from_millis(interval_ms as u64));
                }
            }
            PlayerCommand::Unpause => {
                pending_resume = None;
                sink.resume();
                let _ = client.send_stat(StatEvent::Resumed, 0);
            }
            PlayerCommand::Skip { ms } => {
                tracing::info!(ms, "skip-ahead requested (not applied)");
            }
        }
    }

    stop_session(&mut session, sink, false);
    client.disconnect();
    let _ = receive_thread.join();
}

/// Translate receive-thread callbacks into control-loop commands.
fn register_callbacks(client: &Arc<SlimprotoClient>, tx: Sender<PlayerCommand>) {
    client.on_stream(Box::new(move |cmd, http_request| {
        let command = match cmd.command {
            messages::STRM_START => PlayerCommand::Start {
                cmd: *cmd,
                http_request: http_request.to_vec(),
            },
            messages::STRM_STOP | messages::STRM_FLUSH => PlayerCommand::Stop,
            messages::STRM_PAUSE => PlayerCommand::Pause {
                interval_ms: cmd.replay_gain,
            },
            messages::STRM_UNPAUSE => PlayerCommand::Unpause,
            messages::STRM_SKIP => PlayerCommand::Skip {
                ms: cmd.replay_gain,
            },
            _ => return,
        };
        let _ = tx.send(command);
    }));

    // Gains are telemetry only; samples are never scaled.
    client.on_volume(Box::new(|left, right| {
        tracing::trace!(left, right, "volume event");
    }));
}

fn start_track(
    config: &Config,
    sink: &Arc<Sink>,
    client: &Arc<SlimprotoClient>,
    session: &mut Option<TrackSession>,
    cmd: &StrmCommand,
    http_request: &[u8],
) {
    client.update_stream_bytes(0);
    client.update_elapsed(0, 0);

    let server = if cmd.server_ip != 0 {
        Ipv4Addr::from(cmd.server_ip)
    } else {
        client.server_ip()
    };
    let port = if cmd.server_port != 0 {
        cmd.server_port
    } else {
        messages::SLIMPROTO_HTTP_PORT
    };

    let _ = client.send_stat(StatEvent::Connect, 0);
    let http = match HttpStream::connect(server, port, http_request) {
        Ok(http) => http,
        Err(e) => {
            tracing::error!("audio connection failed: {e:#}");
            let _ = client.send_stat(StatEvent::NotSupported, 0);
            return;
        }
    };
    let _ = client.send_resp(http.response_headers());
    let _ = client.send_stat(StatEvent::Headers, 0);

    let params = TrackParams {
        format_code: cmd.format,
        pcm_sample_size: cmd.pcm_sample_size,
        pcm_sample_rate: cmd.pcm_sample_rate,
        pcm_channels: cmd.pcm_channels,
        pcm_endian: cmd.pcm_endian,
        max_sample_rate: config.max_sample_rate,
        dsd_enabled: config.dsd_enabled,
    };

    let running = Arc::new(AtomicBool::new(true));
    let handle = {
        let running = running.clone();
        let sink = sink.clone();
        let client = client.clone();
        thread::Builder::new()
            .name("audio".to_string())
            .spawn(move || pipeline::run_track(http, params, sink, client, running))
            .expect("spawn audio thread")
    };

    *session = Some(TrackSession { running, handle });
    tracing::info!(format = %(cmd.format as char), %server, port, "track started");
}

/// Stop the current audio thread (if any) and quiesce the sink.
fn stop_session(session: &mut Option<TrackSession>, sink: &Sink, drain: bool) {
    let Some(track) = session.take() else {
        sink.stop(drain);
        return;
    };

    track.running.store(false, Ordering::Release);
    let deadline = Instant::now() + TRACK_JOIN_TIMEOUT;
    while !track.handle.is_finished() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    if track.handle.is_finished() {
        let _ = track.handle.join();
    } else {
        // Detach: the thread observes the flag at its next poll and exits
        // on its own shortly after.
        tracing::warn!("audio thread join timed out, detaching");
    }

    sink.stop(drain);
}

/// Sleep that stays responsive to shutdown and stats requests.
fn sleep_observing(
    total: Duration,
    shutdown: &AtomicBool,
    stats_requested: &AtomicBool,
    sink: &Sink,
) {
    let deadline = Instant::now() + total;
    while Instant::now() < deadline {
        if shutdown.load(Ordering::Acquire) {
            return;
        }
        if stats_requested.swap(false, Ordering::AcqRel) {
            sink.dump_stats();
        }
        thread::sleep(CONTROL_POLL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warmup_format_matches_a_48k_first_track() {
        assert_eq!(WARMUP_FORMAT, AudioFormat::pcm(48_000, 2));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = RECONNECT_BACKOFF_INITIAL;
        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(backoff.as_secs());
            backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX);
        }
        assert_eq!(seen, vec![2, 4, 8, 16, 30, 30]);
    }
}
