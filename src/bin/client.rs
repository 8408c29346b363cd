//! A small blocking CLI client for the replicated key-value store:
//! `client <client_id> <server_id:port>... get <key>` or
//! `client <client_id> <server_id:port>... put <key> <value>`.
//!
//! Follows the `redirect` protocol the way the replica daemon expects:
//! send to any known replica, and if told to redirect, resend to the
//! `leader` id's address from the same server table.

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use raft_kv::{Body, Message, BROADCAST};
use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Parser)]
#[command(version, about = "Key-value client for the Raft replica cluster", long_about = None)]
struct Cli {
    /// This client's id, used as the message `src` and for MID prefixing.
    #[arg(long, default_value = "client")]
    client_id: String,

    /// Known replicas as `<id>:<port>` tokens; repeat for each replica.
    #[arg(long = "server", required = true)]
    servers: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch the current value of a key.
    Get { key: String },
    /// Set a key to a value.
    Put { key: String, value: String },
}

const MAX_ATTEMPTS: usize = 10;
const RETRY_DELAY: Duration = Duration::from_millis(500);
const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut servers: HashMap<String, SocketAddr> = HashMap::new();
    for token in &cli.servers {
        let (id, addr) = raft_kv::transport::parse_peer_token(token)?;
        servers.insert(id, addr);
    }
    if servers.is_empty() {
        bail!("at least one --server is required");
    }

    let socket = UdpSocket::bind("127.0.0.1:0")?;
    socket.set_read_timeout(Some(REPLY_TIMEOUT))?;

    let mid = format!(
        "{}-{}",
        cli.client_id,
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos()
    );

    let body = match cli.command {
        Command::Get { key } => Body::Get { key, mid: mid.clone() },
        Command::Put { key, value } => Body::Put { key, value, mid: mid.clone() },
    };

    let mut target = servers.values().next().copied().unwrap();
    let mut recv_buf = [0u8; 65535];

    for attempt in 1..=MAX_ATTEMPTS {
        println!("attempt {attempt}/{MAX_ATTEMPTS}: sending to {target}");
        let msg = Message::new(cli.client_id.clone(), BROADCAST, BROADCAST, body.clone());
        let bytes = serde_json::to_vec(&msg)?;
        socket.send_to(&bytes, target)?;

        match socket.recv_from(&mut recv_buf) {
            Ok((len, _)) => {
                let reply: Message = serde_json::from_slice(&recv_buf[..len])?;
                match reply.body {
                    Body::Ok { value, .. } => {
                        match value {
                            Some(v) => println!("ok: {v}"),
                            None => println!("ok"),
                        }
                        return Ok(());
                    }
                    Body::Redirect { .. } => {
                        println!("redirected to leader {}", reply.leader);
                        if let Some(addr) = servers.get(&reply.leader) {
                            target = *addr;
                        }
                    }
                    other => println!("unexpected reply: {other:?}"),
                }
            }
            Err(e) => {
                println!("no reply from {target} ({e}); trying another replica");
                if let Some(addr) = servers.values().find(|a| **a != target) {
                    target = *addr;
                }
            }
        }
        std::thread::sleep(RETRY_DELAY);
    }

    bail!("no successful response after {MAX_ATTEMPTS} attempts")
}
