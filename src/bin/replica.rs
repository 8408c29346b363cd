//! The replica daemon: `replica <port> <id> <peer_id>...`.
//!
//! Each `peer_id` token is `<id>:<port>` (§10.3 of the design notes): since
//! the datagram transport/simulating harness is an external collaborator not
//! shipped with this crate, addresses are baked into the peer tokens so the
//! replica can run standalone on loopback.

use anyhow::{bail, Result};
use clap::Parser;
use log::info;
use raft_kv::transport::{parse_peer_token, Transport};
use raft_kv::Replica;
use std::sync::Arc;

#[derive(Parser)]
#[command(version, about = "Raft-replicated key-value store replica", long_about = None)]
struct Cli {
    /// UDP port this replica listens on.
    port: u16,
    /// This replica's id.
    id: String,
    /// Peer tokens, each `<id>:<port>`.
    #[arg(trailing_var_arg = true)]
    peers: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    if cli.peers.is_empty() {
        bail!("at least one peer is required; usage: replica <port> <id> <peer_id:port>...");
    }

    let mut peer_table = std::collections::HashMap::new();
    let mut peer_ids = Vec::new();
    for token in &cli.peers {
        let (id, addr) = parse_peer_token(token)?;
        peer_ids.push(id.clone());
        peer_table.insert(id, addr);
    }

    info!("starting replica {} on port {} with peers {:?}", cli.id, cli.port, peer_ids);

    let transport = Transport::bind(cli.id.clone(), cli.port, peer_table)?;
    let replica = Arc::new(Replica::new(cli.id, peer_ids, transport)?);

    replica.run().await
}
