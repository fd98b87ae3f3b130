//! Binary message layouts of the Slimproto control protocol.
//!
//! All multi-byte integers are big-endian. Framing is asymmetric:
//!
//! - client -> server: `[4-byte opcode][u32 length][payload]`
//! - server -> client: `[u16 length][4-byte opcode][payload of length-4]`

pub const SLIMPROTO_PORT: u16 = 3483;
pub const SLIMPROTO_HTTP_PORT: u16 = 9000;

/// HELO device id: squeezeslave-class software player.
pub const DEVICE_ID_SQUEEZESLAVE: u8 = 8;

pub const STRM_HEADER_LEN: usize = 24;
pub const AUDG_MIN_LEN: usize = 18;
pub const HELO_HEAD_LEN: usize = 36;
pub const STAT_PAYLOAD_LEN: usize = 53;

// strm sub-commands (byte 0 of the header).
pub const STRM_START: u8 = b's';
pub const STRM_STOP: u8 = b'q';
pub const STRM_PAUSE: u8 = b'p';
pub const STRM_UNPAUSE: u8 = b'u';
pub const STRM_FLUSH: u8 = b'f';
pub const STRM_STATUS: u8 = b't';
pub const STRM_SKIP: u8 = b'a';

/// STAT event codes, named for the moments they are sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatEvent {
    /// STMc — HTTP connect initiated.
    Connect,
    /// STMh — HTTP response headers received.
    Headers,
    /// STMs — first audio byte decoded / track started.
    TrackStarted,
    /// STMl — prebuffer threshold reached.
    BufferThreshold,
    /// STMp — pause confirmed.
    Paused,
    /// STMr — resume confirmed.
    Resumed,
    /// STMf — flush/stop acknowledged.
    Flushed,
    /// STMn — decoder or connection failure.
    NotSupported,
    /// STMo — output underrun.
    OutputUnderrun,
    /// STMd — decoder finished; ready for the next track.
    DecoderReady,
    /// STMu — natural end of stream.
    Underrun,
    /// STMt — heartbeat response.
    Timer,
}

impl StatEvent {
    pub fn code(self) -> &'static [u8; 4] {
        match self {
            Self::Connect => b"STMc",
            Self::Headers => b"STMh",
            Self::TrackStarted => b"STMs",
            Self::BufferThreshold => b"STMl",
            Self::Paused => b"STMp",
            Self::Resumed => b"STMr",
            Self::Flushed => b"STMf",
            Self::NotSupported => b"STMn",
            Self::OutputUnderrun => b"STMo",
            Self::DecoderReady => b"STMd",
            Self::Underrun => b"STMu",
            Self::Timer => b"STMt",
        }
    }
}

/// The 24-byte fixed head of a `strm` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrmCommand {
    pub command: u8,
    pub autostart: u8,
    pub format: u8,
    pub pcm_sample_size: u8,
    pub pcm_sample_rate: u8,
    pub pcm_channels: u8,
    pub pcm_endian: u8,
    /// KB of input buffer before autostart.
    pub threshold: u8,
    pub spdif_enable: u8,
    pub trans_period: u8,
    pub trans_type: u8,
    pub flags: u8,
    pub output_threshold: u8,
    /// Replay gain in 16.16 fixed point, or an interval/timestamp for the
    /// pause/unpause/status sub-commands.
    pub replay_gain: u32,
    pub server_port: u16,
    /// 0 = use the control-connection address.
    pub server_ip: u32,
}

impl StrmCommand {
    /// Parse the fixed head; returns the command and the trailing HTTP
    /// request bytes.
    pub fn parse(payload: &[u8]) -> Option<(Self, &[u8])> {
        if payload.len() < STRM_HEADER_LEN {
            return None;
        }
        let cmd = Self {
            command: payload[0],
            autostart: payload[1],
            format: payload[2],
            pcm_sample_size: payload[3],
            pcm_sample_rate: payload[4],
            pcm_channels: payload[5],
            pcm_endian: payload[6],
            threshold: payload[7],
            spdif_enable: payload[8],
            trans_period: payload[9],
            trans_type: payload[10],
            flags: payload[11],
            output_threshold: payload[12],
            replay_gain: u32::from_be_bytes([payload[14], payload[15], payload[16], payload[17]]),
            server_port: u16::from_be_bytes([payload[18], payload[19]]),
            server_ip: u32::from_be_bytes([payload[20], payload[21], payload[22], payload[23]]),
        };
        Some((cmd, &payload[STRM_HEADER_LEN..]))
    }
}

/// The `audg` volume command (first 18 bytes; v7+ appends a sequence).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudgCommand {
    pub old_gain_left: u32,
    pub old_gain_right: u32,
    pub dvc: u8,
    pub preamp: u8,
    /// 16.16 fixed-point gains.
    pub new_gain_left: u32,
    pub new_gain_right: u32,
}

impl AudgCommand {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < AUDG_MIN_LEN {
            return None;
        }
        Some(Self {
            old_gain_left: u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]),
            old_gain_right: u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]),
            dvc: payload[8],
            preamp: payload[9],
            new_gain_left: u32::from_be_bytes([payload[10], payload[11], payload[12], payload[13]]),
            new_gain_right: u32::from_be_bytes([payload[14], payload[15], payload[16], payload[17]]),
        })
    }
}

/// Build the HELO payload: 36-byte fixed head + capabilities string.
pub fn build_helo(mac: &[u8; 6], capabilities: &str) -> Vec<u8> {
    let mut p = Vec::with_capacity(HELO_HEAD_LEN + capabilities.len());
    p.push(DEVICE_ID_SQUEEZESLAVE);
    p.push(0); // firmware revision
    p.extend_from_slice(mac);
    p.extend_from_slice(&[0u8; 16]); // uuid
    p.extend_from_slice(&0u16.to_be_bytes()); // wlan channels
    p.extend_from_slice(&0u32.to_be_bytes()); // bytes received (hi)
    p.extend_from_slice(&0u32.to_be_bytes()); // bytes received (lo)
    p.extend_from_slice(b"en");
    debug_assert_eq!(p.len(), HELO_HEAD_LEN);
    p.extend_from_slice(capabilities.as_bytes());
    p
}

/// Counter snapshot carried by a STAT reply.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatCounters {
    pub stream_buf_size: u32,
    pub stream_buf_full: u32,
    pub bytes_received: u64,
    pub jiffies: u32,
    pub output_buf_size: u32,
    pub output_buf_full: u32,
    pub elapsed_seconds: u32,
    pub elapsed_ms: u32,
    pub server_timestamp: u32,
}

/// Encode the 53-byte STAT payload.
pub fn build_stat(event: StatEvent, c: &StatCounters) -> Vec<u8> {
    let mut p = Vec::with_capacity(STAT_PAYLOAD_LEN);
    p.extend_from_slice(event.code());
    p.extend_from_slice(&[0u8; 3]); // crlf, mas_init, mas_mode
    p.extend_from_slice(&c.stream_buf_size.to_be_bytes());
    p.extend_from_slice(&c.stream_buf_full.to_be_bytes());
    p.extend_from_slice(&((c.bytes_received >> 32) as u32).to_be_bytes());
    p.extend_from_slice(&(c.bytes_received as u32).to_be_bytes());
    p.extend_from_slice(&0xFFFFu16.to_be_bytes()); // signal strength: wired
    p.extend_from_slice(&c.jiffies.to_be_bytes());
    p.extend_from_slice(&c.output_buf_size.to_be_bytes());
    p.extend_from_slice(&c.output_buf_full.to_be_bytes());
    p.extend_from_slice(&c.elapsed_seconds.to_be_bytes());
    p.extend_from_slice(&0u16.to_be_bytes()); // voltage
    p.extend_from_slice(&c.elapsed_ms.to_be_bytes());
    p.extend_from_slice(&c.server_timestamp.to_be_bytes());
    p.extend_from_slice(&0u16.to_be_bytes()); // error code
    debug_assert_eq!(p.len(), STAT_PAYLOAD_LEN);
    p
}

/// Frame a client -> server message.
pub fn build_frame(opcode: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8 + payload.len());
    frame.extend_from_slice(opcode);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{sample_rate_from_code, sample_size_from_code};

    #[test]
    fn strm_start_header_parses_field_for_field() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&[
            b's', b'1', b'f', b'3', b'3', b'2', b'0', // cmd..endian
            0x20, b'0', 0, b'0', 0, 0, 0, // threshold..reserved
        ]);
        payload.extend_from_slice(&0u32.to_be_bytes()); // replay gain
        payload.extend_from_slice(&0x2328u16.to_be_bytes()); // port 9000
        payload.extend_from_slice(&0u32.to_be_bytes()); // ip: control address
        payload.extend_from_slice(b"GET /stream.mp3?player=ab HTTP/1.0\r\n\r\n");

        let (cmd, http) = StrmCommand::parse(&payload).unwrap();
        assert_eq!(cmd.command, STRM_START);
        assert_eq!(cmd.format, b'f');
        assert_eq!(sample_size_from_code(cmd.pcm_sample_size), 24);
        assert_eq!(sample_rate_from_code(cmd.pcm_sample_rate), 44_100);
        assert_eq!(cmd.pcm_channels, b'2');
        assert_eq!(cmd.server_port, 9000);
        assert_eq!(cmd.server_ip, 0);
        assert!(http.starts_with(b"GET /stream.mp3"));
    }

    #[test]
    fn strm_shorter_than_header_is_rejected() {
        assert!(StrmCommand::parse(&[0u8; 23]).is_none());
    }

    #[test]
    fn strm_heartbeat_carries_the_server_timestamp() {
        let mut payload = vec![0u8; STRM_HEADER_LEN];
        payload[0] = STRM_STATUS;
        payload[14..18].copy_from_slice(&0xDEADBEEFu32.to_be_bytes());
        let (cmd, rest) = StrmCommand::parse(&payload).unwrap();
        assert_eq!(cmd.command, STRM_STATUS);
        assert_eq!(cmd.replay_gain, 0xDEADBEEF);
        assert!(rest.is_empty());
    }

    #[test]
    fn audg_parses_new_gains() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&100u32.to_be_bytes());
        payload.extend_from_slice(&100u32.to_be_bytes());
        payload.push(1);
        payload.push(255);
        payload.extend_from_slice(&0x0001_8000u32.to_be_bytes());
        payload.extend_from_slice(&0x0001_0000u32.to_be_bytes());

        let cmd = AudgCommand::parse(&payload).unwrap();
        assert_eq!(cmd.new_gain_left, 0x0001_8000);
        assert_eq!(cmd.new_gain_right, 0x0001_0000);
        assert!(AudgCommand::parse(&payload[..17]).is_none());
    }

    #[test]
    fn helo_head_is_36_bytes_plus_capabilities() {
        let mac = [0x02, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE];
        let payload = build_helo(&mac, "flc,pcm,MaxSampleRate=768000");
        assert_eq!(payload.len(), HELO_HEAD_LEN + 28);
        assert_eq!(payload[0], DEVICE_ID_SQUEEZESLAVE);
        assert_eq!(&payload[2..8], &mac);
        assert_eq!(&payload[34..36], b"en");
        assert_eq!(&payload[36..39], b"flc");
    }

    #[test]
    fn stat_payload_is_exactly_53_bytes() {
        let counters = StatCounters {
            stream_buf_size: 1_048_576,
            stream_buf_full: 4096,
            bytes_received: 0x1_0000_0001,
            jiffies: 123_456,
            output_buf_size: 8 * 1024 * 1024,
            output_buf_full: 777,
            elapsed_seconds: 42,
            elapsed_ms: 42_500,
            server_timestamp: 0xDEADBEEF,
        };
        let p = build_stat(StatEvent::Timer, &counters);
        assert_eq!(p.len(), STAT_PAYLOAD_LEN);
        assert_eq!(&p[..4], b"STMt");
        // bytes received split across two u32s
        assert_eq!(u32::from_be_bytes([p[15], p[16], p[17], p[18]]), 1);
        assert_eq!(u32::from_be_bytes([p[19], p[20], p[21], p[22]]), 1);
        // signal strength is wired
        assert_eq!(u16::from_be_bytes([p[23], p[24]]), 0xFFFF);
        // server timestamp echoes back
        assert_eq!(
            u32::from_be_bytes([p[47], p[48], p[49], p[50]]),
            0xDEADBEEF
        );
    }

    #[test]
    fn stat_event_codes_round_trip() {
        for event in [
            StatEvent::Connect,
            StatEvent::Headers,
            StatEvent::TrackStarted,
            StatEvent::BufferThreshold,
            StatEvent::Paused,
            StatEvent::Resumed,
            StatEvent::Flushed,
            StatEvent::NotSupported,
            StatEvent::OutputUnderrun,
            StatEvent::DecoderReady,
            StatEvent::Underrun,
            StatEvent::Timer,
        ] {
            let p = build_stat(event, &StatCounters::default());
            assert_eq!(&p[..4], event.code());
        }
    }

    #[test]
    fn client_frame_layout() {
        let frame = build_frame(b"STAT", &[1, 2, 3]);
        assert_eq!(&frame[..4], b"STAT");
        assert_eq!(u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]), 3);
        assert_eq!(&frame[8..], &[1, 2, 3]);
    }
}
