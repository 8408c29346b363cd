//! Serialises/deserialises [`Message`]s over a single UDP socket per replica.
//!
//! The real test harness this system is built against is an external
//! collaborator (§1 of the design notes): an unreliable, unordered, possibly
//! duplicating channel that routes by the `dst` field of the envelope. Since
//! no such harness ships with this crate, this adaptor is a minimal, complete
//! stand-in that honours the same contract — framed JSON objects addressed by
//! string id, with [`BROADCAST`] fanning out to every configured peer — so a
//! real simulating harness could be dropped in behind the same shape without
//! touching any consensus code.

use crate::message::{Body, Message, BROADCAST};
use anyhow::{Context, Result};
use log::{debug, warn};
use socket2::{Domain, Socket, Type};
use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket as StdUdpSocket};
use std::time::Duration;
use tokio::net::UdpSocket;

/// Largest datagram this adaptor will attempt to decode; matches the
/// external interface's stated size ceiling.
const MAX_DATAGRAM_BYTES: usize = 65535;

pub struct Transport {
    socket: UdpSocket,
    self_id: String,
    peers: HashMap<String, SocketAddr>,
}

impl Transport {
    /// Binds a UDP socket on `127.0.0.1:port` and builds the id -> address
    /// peer table this replica will send to.
    pub fn bind(self_id: String, port: u16, peers: HashMap<String, SocketAddr>) -> Result<Self> {
        let bind_addr: SocketAddr = format!("127.0.0.1:{port}").parse()?;
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, None).context("create udp socket")?;
        socket.set_reuse_address(true).context("set reuse address")?;
        socket.set_recv_buffer_size(1 << 20).ok();
        socket.set_send_buffer_size(1 << 20).ok();
        socket.bind(&bind_addr.into()).with_context(|| format!("bind {bind_addr}"))?;
        socket.set_nonblocking(true).context("set nonblocking")?;
        let std_socket: StdUdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket).context("adopt udp socket into tokio runtime")?;

        Ok(Transport { socket, self_id, peers })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Sends `msg` to `dst`. `BROADCAST` fans out to every configured peer.
    /// Send failures are logged and swallowed: the leader's pacing loop will
    /// simply retry on the next tick, matching the "no explicit RPC timeout"
    /// semantics of the design.
    pub async fn send(&self, dst: &str, msg: &Message) -> Result<()> {
        let bytes = serde_json::to_vec(msg).context("encode message")?;
        if dst == BROADCAST {
            for (peer_id, addr) in &self.peers {
                if let Err(e) = self.socket.send_to(&bytes, addr).await {
                    warn!("[{}] send to {} ({}) failed: {}", self.self_id, peer_id, addr, e);
                }
            }
            return Ok(());
        }
        match self.peers.get(dst) {
            Some(addr) => {
                if let Err(e) = self.socket.send_to(&bytes, addr).await {
                    warn!("[{}] send to {} ({}) failed: {}", self.self_id, dst, addr, e);
                }
            }
            None => warn!("[{}] unknown destination id {}", self.self_id, dst),
        }
        Ok(())
    }

    pub async fn send_reply_to(&self, addr: SocketAddr, msg: &Message) -> Result<()> {
        let bytes = serde_json::to_vec(msg).context("encode message")?;
        if let Err(e) = self.socket.send_to(&bytes, addr).await {
            warn!("[{}] reply to {} failed: {}", self.self_id, addr, e);
        }
        Ok(())
    }

    /// Polls for a single datagram with a bounded wait. Decode failures and
    /// short reads are logged and the datagram is dropped; this never
    /// surfaces as an error (§7: transport errors are not fatal).
    pub async fn recv_timeout(&self, wait: Duration) -> Option<(Message, SocketAddr)> {
        let mut buf = vec![0u8; MAX_DATAGRAM_BYTES];
        let recv = self.socket.recv_from(&mut buf);
        let (len, addr) = match tokio::time::timeout(wait, recv).await {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                warn!("[{}] transport read error: {}", self.self_id, e);
                return None;
            }
            Err(_) => return None, // bounded wait elapsed, nothing to do this tick
        };
        match serde_json::from_slice::<Message>(&buf[..len]) {
            Ok(msg) => {
                debug!("[{}] recv {:?} from {}", self.self_id, msg.body, addr);
                Some((msg, addr))
            }
            Err(e) => {
                warn!("[{}] dropping undecodable datagram from {}: {}", self.self_id, addr, e);
                None
            }
        }
    }

    pub fn peer_ids(&self) -> impl Iterator<Item = &String> {
        self.peers.keys()
    }

    pub async fn announce_hello(&self) -> Result<()> {
        let hello = Message::new(self.self_id.clone(), BROADCAST, BROADCAST, Body::Hello);
        self.send(BROADCAST, &hello).await
    }
}

/// Parses a `<peer_id>:<port>` CLI token into an id and a loopback address.
pub fn parse_peer_token(token: &str) -> Result<(String, SocketAddr)> {
    let (id, port) = token
        .rsplit_once(':')
        .with_context(|| format!("peer token '{token}' must be '<id>:<port>'"))?;
    let port: u16 = port.parse().with_context(|| format!("invalid port in peer token '{token}'"))?;
    let addr: SocketAddr = format!("127.0.0.1:{port}").parse()?;
    Ok((id.to_string(), addr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_id_and_port() {
        let (id, addr) = parse_peer_token("n2:9002").unwrap();
        assert_eq!(id, "n2");
        assert_eq!(addr.port(), 9002);
    }

    #[test]
    fn rejects_token_without_port() {
        assert!(parse_peer_token("n2").is_err());
    }
}
