//! LMS auto-discovery.
//!
//! A single `'e'` byte broadcast to UDP 3483; any reply from any address
//! identifies the server. Tried three times with a five second wait each.

use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::slimproto::messages::SLIMPROTO_PORT;

const ATTEMPTS: u32 = 3;
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

pub fn discover() -> Result<Ipv4Addr> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).context("bind discovery socket")?;
    socket.set_broadcast(true).context("enable broadcast")?;
    socket
        .set_read_timeout(Some(REPLY_TIMEOUT))
        .context("set discovery timeout")?;

    let mut reply = [0u8; 128];
    for attempt in 1..=ATTEMPTS {
        tracing::info!(attempt, "broadcasting server discovery");
        socket
            .send_to(&[b'e'], (Ipv4Addr::BROADCAST, SLIMPROTO_PORT))
            .context("send discovery broadcast")?;

        match socket.recv_from(&mut reply) {
            Ok((_, SocketAddr::V4(addr))) => {
                tracing::info!(server = %addr.ip(), "server discovered");
                return Ok(*addr.ip());
            }
            Ok((_, SocketAddr::V6(addr))) => {
                tracing::debug!(%addr, "ignoring non-ipv4 discovery reply");
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => return Err(e).context("discovery receive"),
        }
    }

    bail!("no server answered discovery after {ATTEMPTS} attempts")
}
