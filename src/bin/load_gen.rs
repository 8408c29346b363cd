//! Concurrent put/get load generator for manual soak testing against a
//! running cluster. Tooling, not part of the Raft core.
//!
//! Run examples:
//! # Fire 1000 puts across 10 threads at the given replicas
//! cargo run --bin load_gen -- -n 1000 -t 10 --server n1:9001 --server n2:9002

use anyhow::{bail, Result};
use clap::Parser;
use raft_kv::{Body, Message, BROADCAST};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

#[derive(Parser, Clone)]
#[command(version, about = "Load generator for the Raft key-value cluster", long_about = None)]
struct Cli {
    /// Number of put requests to send in total.
    #[arg(short = 'n', long, default_value = "1000")]
    num_requests: usize,

    /// Number of concurrent worker threads.
    #[arg(short = 't', long, default_value = "10")]
    num_threads: usize,

    /// Known replicas as `<id>:<port>` tokens; requests round-robin across them.
    #[arg(long = "server", required = true)]
    servers: Vec<String>,

    /// Per-request reply timeout, in milliseconds.
    #[arg(long, default_value = "2000")]
    timeout_ms: u64,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut addrs = Vec::new();
    for token in &cli.servers {
        let (_, addr) = raft_kv::transport::parse_peer_token(token)?;
        addrs.push(addr);
    }
    if addrs.is_empty() {
        bail!("at least one --server is required");
    }

    let succeeded = Arc::new(AtomicU64::new(0));
    let failed = Arc::new(AtomicU64::new(0));
    let started = Instant::now();

    let per_thread = cli.num_requests.div_ceil(cli.num_threads);
    let mut handles = Vec::new();
    for worker in 0..cli.num_threads {
        let addrs = addrs.clone();
        let succeeded = Arc::clone(&succeeded);
        let failed = Arc::clone(&failed);
        let timeout = Duration::from_millis(cli.timeout_ms);
        handles.push(thread::spawn(move || {
            run_worker(worker, per_thread, &addrs, timeout, &succeeded, &failed);
        }));
    }
    for h in handles {
        let _ = h.join();
    }

    let elapsed = started.elapsed();
    println!(
        "done: {} ok, {} failed, in {:.2}s ({:.0} req/s)",
        succeeded.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        elapsed.as_secs_f64(),
        cli.num_requests as f64 / elapsed.as_secs_f64().max(0.001)
    );
    Ok(())
}

fn run_worker(worker: usize, count: usize, addrs: &[SocketAddr], timeout: Duration, succeeded: &AtomicU64, failed: &AtomicU64) {
    let Ok(socket) = UdpSocket::bind("127.0.0.1:0") else { return };
    let _ = socket.set_read_timeout(Some(timeout));
    let mut target = addrs[worker % addrs.len()];
    let mut buf = [0u8; 65535];

    for i in 0..count {
        let mid = format!(
            "load-{worker}-{i}-{}",
            SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos()
        );
        let body = Body::Put { key: format!("k{worker}"), value: format!("v{i}"), mid };
        let msg = Message::new(format!("load-{worker}"), BROADCAST, BROADCAST, body);
        let Ok(bytes) = serde_json::to_vec(&msg) else { continue };
        let _ = socket.send_to(&bytes, target);

        match socket.recv_from(&mut buf) {
            Ok((len, _)) => match serde_json::from_slice::<Message>(&buf[..len]) {
                Ok(reply) => match reply.body {
                    Body::Ok { .. } => {
                        succeeded.fetch_add(1, Ordering::Relaxed);
                    }
                    Body::Redirect { .. } => {
                        if let Some(addr) = addrs.iter().find(|a| **a != target) {
                            target = *addr;
                        }
                        failed.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {
                        failed.fetch_add(1, Ordering::Relaxed);
                    }
                },
                Err(_) => {
                    failed.fetch_add(1, Ordering::Relaxed);
                }
            },
            Err(_) => {
                failed.fetch_add(1, Ordering::Relaxed);
                target = addrs[(worker + i) % addrs.len()];
            }
        }
    }
}
