//! End-to-end gateway tests over loopback connections.

#![allow(clippy::unwrap_used)]

use std::time::Duration;

use serde_json::{Value, json};
use stratus_common::types::NetAddress;
use stratus_gateway::{Gateway, GatewayConfig, error::GatewayError, rpc};
use tempfile::TempDir;
use tokio::sync::mpsc;

fn test_config(datadir: &TempDir) -> GatewayConfig {
    GatewayConfig {
        listen_addr: "127.0.0.1:0".parse().expect("addr"),
        datadir: datadir.path().to_path_buf(),
        dial_timeout: Duration::from_secs(5),
        handshake_timeout: Duration::from_secs(5),
        rpc_timeout: Duration::from_secs(5),
        // Slow the background loops down so tests drive the interesting
        // transitions themselves.
        peer_manager_interval: Duration::from_secs(3600),
        node_manager_interval: Duration::from_secs(3600),
        purge_interval: Duration::from_secs(3600),
        save_interval: Duration::from_secs(3600),
        ..Default::default()
    }
}

async fn started_gateway(datadir: &TempDir) -> (Gateway, NetAddress) {
    let gateway = Gateway::new(test_config(datadir)).expect("gateway");
    let addr = gateway.start().await.expect("start");
    (gateway, NetAddress::from(addr))
}

async fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn connect_registers_peers_on_both_sides() {
    let (dir_a, dir_b) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let (a, _addr_a) = started_gateway(&dir_a).await;
    let (b, addr_b) = started_gateway(&dir_b).await;

    a.connect(&addr_b).await.expect("connect");

    let peers_a = a.peers();
    assert_eq!(peers_a.len(), 1);
    assert!(!peers_a[0].inbound);
    assert_eq!(peers_a[0].address, addr_b);

    wait_for("inbound peer on b", || b.peers().len() == 1).await;
    assert!(b.peers()[0].inbound);

    // The node list learned the address too.
    assert!(a.nodes().iter().any(|n| n.address == addr_b));

    // Loopback peers never count for the online check.
    assert!(!a.online());
}

#[tokio::test]
async fn duplicate_connect_is_rejected() {
    let (dir_a, dir_b) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let (a, _) = started_gateway(&dir_a).await;
    let (b, addr_b) = started_gateway(&dir_b).await;
    let _ = b;

    a.connect(&addr_b).await.expect("first connect");
    assert!(matches!(
        a.connect(&addr_b).await,
        Err(GatewayError::AlreadyConnected(_))
    ));
}

#[tokio::test]
async fn disconnect_removes_peer() {
    let (dir_a, dir_b) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let (a, _) = started_gateway(&dir_a).await;
    let (b, addr_b) = started_gateway(&dir_b).await;

    a.connect(&addr_b).await.expect("connect");
    a.disconnect(&addr_b).await.expect("disconnect");
    assert!(a.peers().is_empty());
    assert!(matches!(
        a.disconnect(&addr_b).await,
        Err(GatewayError::UnknownPeer(_))
    ));

    // The remote side notices the closed stream.
    wait_for("peer removal on b", || b.peers().is_empty()).await;
}

#[tokio::test]
async fn rpc_round_trip_and_unknown_rpc() {
    let (dir_a, dir_b) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let (a, _) = started_gateway(&dir_a).await;
    let (b, addr_b) = started_gateway(&dir_b).await;

    b.register_rpc(
        "Echo",
        rpc::handler(|_peer, body| async move { Ok(json!({ "echo": body })) }),
    );

    a.connect(&addr_b).await.expect("connect");

    let reply = a.rpc(&addr_b, "Echo", json!("ping")).await.expect("rpc");
    assert_eq!(reply, json!({ "echo": "ping" }));

    let err = a.rpc(&addr_b, "NoSuchRpc", Value::Null).await;
    assert!(matches!(err, Err(GatewayError::RemoteRpc { .. })));
}

#[tokio::test]
async fn discover_ip_reports_observed_host() {
    let (dir_a, dir_b) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let (a, _) = started_gateway(&dir_a).await;
    let (_b, addr_b) = started_gateway(&dir_b).await;

    a.connect(&addr_b).await.expect("connect");
    let reply = a
        .rpc(&addr_b, "DiscoverIP", Value::Null)
        .await
        .expect("rpc");
    assert_eq!(reply, Value::String("127.0.0.1".to_string()));
}

#[tokio::test]
async fn share_nodes_returns_known_nodes() {
    let (dir_a, dir_b) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let (a, _) = started_gateway(&dir_a).await;
    let (b, addr_b) = started_gateway(&dir_b).await;

    a.connect(&addr_b).await.expect("connect");
    wait_for("inbound registered", || !b.peers().is_empty()).await;

    let reply = a
        .rpc(&addr_b, "ShareNodes", Value::Null)
        .await
        .expect("rpc");
    let nodes: Vec<NetAddress> = serde_json::from_value(reply).expect("decode");
    // b learned a's ephemeral address when it accepted the connection.
    assert!(!nodes.is_empty());
}

#[tokio::test]
async fn broadcast_reaches_registered_handler() {
    let (dir_a, dir_b) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let (a, _) = started_gateway(&dir_a).await;
    let (b, addr_b) = started_gateway(&dir_b).await;

    let (tx, mut rx) = mpsc::channel::<Value>(4);
    b.register_rpc(
        "RelayBlock",
        rpc::handler(move |_peer, body| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(body).await;
                Ok(Value::Null)
            }
        }),
    );

    a.connect(&addr_b).await.expect("connect");
    a.broadcast("RelayBlock", json!({ "height": 7 }), None).await;

    let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("broadcast timely")
        .expect("channel open");
    assert_eq!(received, json!({ "height": 7 }));
}

#[tokio::test]
async fn connect_call_runs_against_new_outbound_peer() {
    let (dir_a, dir_b) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let (a, _) = started_gateway(&dir_a).await;
    let (_b, addr_b) = started_gateway(&dir_b).await;

    let (tx, mut rx) = mpsc::channel::<NetAddress>(1);
    a.register_connect_call(
        "GreetPeer",
        rpc::connect_call(move |_gateway, peer| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(peer).await;
            }
        }),
    );

    a.connect(&addr_b).await.expect("connect");
    let greeted = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("connect call timely")
        .expect("channel open");
    assert_eq!(greeted, addr_b);
}

#[tokio::test]
async fn blocklisted_dialer_is_refused() {
    let (dir_a, dir_b) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let (a, _) = started_gateway(&dir_a).await;
    let (b, addr_b) = started_gateway(&dir_b).await;

    b.add_to_blocklist(&[NetAddress::from("127.0.0.1:1")]).await;
    assert_eq!(b.blocklist(), vec!["127.0.0.1".to_string()]);

    let err = a.connect(&addr_b).await;
    assert!(matches!(err, Err(GatewayError::Rejected(_))), "{err:?}");

    // And the dialer side refuses outbound connections to blocklisted hosts.
    a.add_to_blocklist(&[addr_b.clone()]).await;
    assert!(matches!(
        a.connect(&addr_b).await,
        Err(GatewayError::Blocklisted(_))
    ));
}

#[tokio::test]
async fn blocklisting_drops_existing_peer_and_nodes() {
    let (dir_a, dir_b) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let (a, _) = started_gateway(&dir_a).await;
    let (b, addr_b) = started_gateway(&dir_b).await;
    let _ = b;

    a.connect(&addr_b).await.expect("connect");
    assert_eq!(a.peers().len(), 1);

    a.add_to_blocklist(&[addr_b.clone()]).await;
    assert!(a.peers().is_empty());
    assert!(a.nodes().is_empty());

    a.remove_from_blocklist(&[addr_b.clone()]);
    assert!(a.blocklist().is_empty());
}

#[tokio::test]
async fn same_ip_inbound_replaces_existing_inbound() {
    let dir_l = TempDir::new().unwrap();
    let (listener, addr_l) = started_gateway(&dir_l).await;

    let dir_1 = TempDir::new().unwrap();
    let (d1, _) = started_gateway(&dir_1).await;
    let dir_2 = TempDir::new().unwrap();
    let (d2, _) = started_gateway(&dir_2).await;

    d1.connect(&addr_l).await.expect("first dial");
    wait_for("first inbound", || listener.peers().len() == 1).await;

    // Second inbound from the same IP evicts the first: the listener ends
    // up with exactly one inbound peer and the first dialer's session dies.
    d2.connect(&addr_l).await.expect("second dial");
    wait_for("eviction settled", || {
        listener.peers().len() == 1 && d1.peers().is_empty() && d2.peers().len() == 1
    })
    .await;
}

#[tokio::test]
async fn bandwidth_counters_move_and_rate_limits_persist() {
    let dir_a = TempDir::new().unwrap();
    let (a, _) = started_gateway(&dir_a).await;
    let dir_b = TempDir::new().unwrap();
    let (_b, addr_b) = started_gateway(&dir_b).await;

    a.connect(&addr_b).await.expect("connect");
    let (down, up) = a.bandwidth_counters();
    assert!(up > 0, "handshake bytes counted: up={up}");
    assert!(down > 0, "handshake bytes counted: down={down}");

    a.set_rate_limits(1 << 20, 1 << 19);
    a.shutdown().await;

    // A fresh gateway over the same datadir sees the saved limits.
    let reloaded = Gateway::new(test_config(&dir_a)).expect("reload");
    assert_eq!(reloaded.rate_limit_settings(), (1 << 20, 1 << 19));
}

#[tokio::test]
async fn nodes_persist_across_restart() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let addr_b = {
        let (a, _) = started_gateway(&dir_a).await;
        let (_b, addr_b) = started_gateway(&dir_b).await;
        a.connect(&addr_b).await.expect("connect");
        a.shutdown().await;
        addr_b
    };

    let reloaded = Gateway::new(test_config(&dir_a)).expect("reload");
    assert!(reloaded.nodes().iter().any(|n| n.address == addr_b));
}
