//! Multi-node integration tests, in the style of this lineage's existing
//! `tests/replication.rs`: spin up real `Replica`s over real UDP sockets on
//! loopback and drive them with the actual client wire protocol.

use raft_kv::transport::Transport;
use raft_kv::{Body, Command, Message, Replica, BROADCAST};
use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

fn free_port() -> u16 {
    UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

/// Builds and starts a `count`-node cluster, returning the replicas, a map
/// from id to address any client/test driver can send to directly, and each
/// replica's event-loop task handle (so a test can `abort()` one to simulate
/// that node going away).
async fn spawn_cluster(ids: &[&str]) -> (Vec<Arc<Replica>>, HashMap<String, SocketAddr>, Vec<JoinHandle<()>>) {
    let ports: Vec<u16> = ids.iter().map(|_| free_port()).collect();
    let addrs: HashMap<String, SocketAddr> =
        ids.iter().zip(&ports).map(|(id, p)| (id.to_string(), format!("127.0.0.1:{p}").parse().unwrap())).collect();

    let mut replicas = Vec::new();
    for (i, id) in ids.iter().enumerate() {
        let peers: HashMap<String, SocketAddr> =
            addrs.iter().filter(|(k, _)| *k != id).map(|(k, v)| (k.clone(), *v)).collect();
        let peer_ids: Vec<String> = peers.keys().cloned().collect();
        let transport = Transport::bind(id.to_string(), ports[i], peers).unwrap();
        let replica = Arc::new(Replica::new(id.to_string(), peer_ids, transport).unwrap());
        replicas.push(replica);
    }
    let mut handles = Vec::new();
    for r in &replicas {
        let r = Arc::clone(r);
        handles.push(tokio::spawn(async move {
            let _ = r.run().await;
        }));
    }
    (replicas, addrs, handles)
}

async fn current_leader(replicas: &[Arc<Replica>]) -> Option<String> {
    for r in replicas {
        let state = r.state.lock().await;
        if state.role.is_leader() {
            return Some(r.id.clone());
        }
    }
    None
}

async fn wait_for_leader(replicas: &[Arc<Replica>], timeout: Duration) -> String {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(leader) = current_leader(replicas).await {
            return leader;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("no leader elected within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn send(socket: &UdpSocket, addr: SocketAddr, body: Body) {
    let msg = Message::new("client", BROADCAST, BROADCAST, body);
    socket.send_to(&serde_json::to_vec(&msg).unwrap(), addr).unwrap();
}

fn recv(socket: &UdpSocket) -> Message {
    let mut buf = [0u8; 65535];
    let (len, _) = socket.recv_from(&mut buf).unwrap();
    serde_json::from_slice(&buf[..len]).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_leader_elected_in_five_node_cluster() {
    let ids = ["n1", "n2", "n3", "n4", "n5"];
    let (replicas, _addrs, _handles) = spawn_cluster(&ids).await;

    let leader = wait_for_leader(&replicas, Duration::from_secs(2)).await;

    let mut leader_count = 0;
    for r in &replicas {
        let state = r.state.lock().await;
        if state.role.is_leader() {
            leader_count += 1;
        }
        assert!(state.current_term >= 1);
    }
    assert_eq!(leader_count, 1, "exactly one replica should be leader");

    // All replicas should agree on the elected leader within a few ticks.
    tokio::time::sleep(Duration::from_millis(300)).await;
    for r in &replicas {
        let state = r.state.lock().await;
        assert_eq!(state.current_leader, leader);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn put_then_get_round_trip() {
    let ids = ["n1", "n2", "n3"];
    let (replicas, addrs, _handles) = spawn_cluster(&ids).await;
    wait_for_leader(&replicas, Duration::from_secs(2)).await;

    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

    // Any replica may not be the leader; retry against each until one answers.
    let mut value = None;
    for (_, addr) in addrs.iter() {
        send(&client, *addr, Body::Put { key: "x".into(), value: "1".into(), mid: "m1".into() });
        if let Ok(reply) = tokio::task::spawn_blocking({
            let client = client.try_clone().unwrap();
            move || recv(&client)
        })
        .await
        {
            if matches!(reply.body, Body::Ok { .. }) {
                value = Some(());
                break;
            }
        }
    }
    assert!(value.is_some(), "put should eventually be acknowledged by the leader");

    // Ask the leader directly for the committed value.
    let leader_id = wait_for_leader(&replicas, Duration::from_secs(1)).await;
    let leader_addr = addrs[&leader_id];
    send(&client, leader_addr, Body::Get { key: "x".into(), mid: "m2".into() });
    let reply = tokio::task::spawn_blocking({
        let client = client.try_clone().unwrap();
        move || recv(&client)
    })
    .await
    .unwrap();
    assert!(matches!(reply.body, Body::Ok { value: Some(v), .. } if v == "1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn follower_redirects_to_leader() {
    let ids = ["n1", "n2", "n3"];
    let (replicas, addrs, _handles) = spawn_cluster(&ids).await;
    let leader_id = wait_for_leader(&replicas, Duration::from_secs(2)).await;

    let follower_id = ids.iter().find(|id| **id != leader_id).unwrap();
    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

    send(&client, addrs[*follower_id], Body::Put { key: "y".into(), value: "2".into(), mid: "m3".into() });
    let reply = recv(&client);
    assert!(matches!(reply.body, Body::Redirect { .. }));
    assert_eq!(reply.leader, leader_id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_mid_is_committed_once() {
    let ids = ["n1", "n2", "n3"];
    let (replicas, addrs, _handles) = spawn_cluster(&ids).await;
    let leader_id = wait_for_leader(&replicas, Duration::from_secs(2)).await;
    let leader_addr = addrs[&leader_id];

    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

    send(&client, leader_addr, Body::Put { key: "z".into(), value: "9".into(), mid: "m4".into() });
    let first = recv(&client);
    assert!(matches!(first.body, Body::Ok { .. }));

    send(&client, leader_addr, Body::Put { key: "z".into(), value: "9".into(), mid: "m4".into() });
    let second = recv(&client);
    assert!(matches!(second.body, Body::Ok { .. }));

    let leader = replicas.iter().find(|r| r.id == leader_id).unwrap();
    let state = leader.state.lock().await;
    let count = state
        .log
        .committed_slice(state.commit_index)
        .iter()
        .filter(|e| matches!(&e.command, Command::Put { mid, .. } if mid == "m4"))
        .count();
    assert_eq!(count, 1, "only one log entry should exist for a duplicate MID");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn new_leader_elected_after_leader_is_removed() {
    let ids = ["n1", "n2", "n3"];
    let (replicas, _addrs, handles) = spawn_cluster(&ids).await;
    let first_leader_id = wait_for_leader(&replicas, Duration::from_secs(2)).await;
    let first_term = {
        let leader = replicas.iter().find(|r| r.id == first_leader_id).unwrap();
        leader.state.lock().await.current_term
    };

    let leader_slot = replicas.iter().position(|r| r.id == first_leader_id).unwrap();
    handles[leader_slot].abort();

    let survivors: Vec<Arc<Replica>> =
        replicas.iter().filter(|r| r.id != first_leader_id).cloned().collect();

    let second_leader_id = wait_for_leader(&survivors, Duration::from_secs(3)).await;
    let second_term = {
        let leader = survivors.iter().find(|r| r.id == second_leader_id).unwrap();
        leader.state.lock().await.current_term
    };

    assert_ne!(second_leader_id, first_leader_id);
    assert!(second_term > first_term);
}
