//! Log forwarding: newline-delimited, pipe-tagged lines over UDP.
//!
//! The web player posts its console lines to `/forward-log`; the server
//! tags its own lines directly. The receiving side is a collaborator (any
//! netcat-style listener works); delivery is fire-and-forget.

use std::net::{SocketAddr, UdpSocket};

use anyhow::{Context, Result};
use log::{info, trace};

/// Messages longer than this are truncated before sending.
pub const MAX_MESSAGE_BYTES: usize = 4_000;

pub struct LogSink {
    socket: UdpSocket,
    target: SocketAddr,
}

impl LogSink {
    pub fn new(target: &str) -> Result<Self> {
        let target: SocketAddr = target
            .parse()
            .with_context(|| format!("invalid log forward address: {}", target))?;
        let socket = UdpSocket::bind("0.0.0.0:0").context("binding log forward socket")?;
        info!("Forwarding logs to udp://{}", target);
        Ok(Self { socket, target })
    }

    /// Send one `TAG|message` line, truncated to [`MAX_MESSAGE_BYTES`].
    /// Errors are swallowed; logging must never take the stream down.
    pub fn send(&self, tag: &str, message: &str) {
        let mut line = format!("{}|{}\n", tag, message.trim_end_matches('\n'));
        if line.len() > MAX_MESSAGE_BYTES {
            let mut cut = MAX_MESSAGE_BYTES;
            while !line.is_char_boundary(cut) {
                cut -= 1;
            }
            line.truncate(cut);
            line.push('\n');
        }
        if let Err(e) = self.socket.send_to(line.as_bytes(), self.target) {
            trace!("Log forward send failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwards_tagged_lines() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = receiver.local_addr().unwrap();
        let sink = LogSink::new(&addr.to_string()).unwrap();

        sink.send("JS", "player ready");

        let mut buf = [0u8; 64];
        receiver
            .set_read_timeout(Some(std::time::Duration::from_secs(2)))
            .unwrap();
        let (len, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"JS|player ready\n");
    }

    #[test]
    fn long_messages_are_truncated() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = receiver.local_addr().unwrap();
        let sink = LogSink::new(&addr.to_string()).unwrap();

        let long = "x".repeat(MAX_MESSAGE_BYTES * 2);
        sink.send("JS", &long);

        let mut buf = vec![0u8; MAX_MESSAGE_BYTES * 3];
        receiver
            .set_read_timeout(Some(std::time::Duration::from_secs(2)))
            .unwrap();
        let (len, _) = receiver.recv_from(&mut buf).unwrap();
        assert!(len <= MAX_MESSAGE_BYTES);
        assert!(buf[..len].ends_with(b"\n"));
    }
}
