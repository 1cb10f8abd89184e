//! Localhost mesh scenarios: link setup, routed delivery, partition healing.
use std::time::Duration;

use ron_mesh::{MeshConfig, Node};
use tokio::sync::mpsc;

async fn start(name: &str) -> Node {
    let config = MeshConfig::new(name)
        .degree(0) // no auto-solicitation in tests
        .msa_period(Duration::from_millis(250))
        .send_timeout(Duration::from_secs(5));
    Node::start(config).await.unwrap()
}

/// Poll until `check` passes or the deadline lapses.
async fn wait_for<F: FnMut() -> bool>(mut check: F, what: &str) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn two_nodes_link_and_deliver() {
    let alpha = start("alpha").await;
    let beta = start("beta").await;
    let mut beta_rx = beta.listen("test");

    beta.dial(alpha.mesh_addr(), false).await.unwrap();
    wait_for(|| alpha.peers().contains(&"beta".to_string()), "link up").await;

    alpha
        .send(&["beta".to_string()], "test", b"ping".to_vec())
        .await
        .unwrap();

    let delivery = beta_rx.recv().await.unwrap();
    assert_eq!(delivery.source, "alpha");
    assert_eq!(delivery.body, b"ping");

    alpha.destroy().await;
    beta.destroy().await;
}

#[tokio::test]
async fn duplicate_dial_is_rejected() {
    let alpha = start("alpha").await;
    let beta = start("beta").await;

    beta.dial(alpha.mesh_addr(), false).await.unwrap();
    wait_for(|| beta.peers().contains(&"alpha".to_string()), "link up").await;
    assert!(beta.dial(alpha.mesh_addr(), false).await.is_err());

    alpha.destroy().await;
    beta.destroy().await;
}

#[tokio::test]
async fn line_topology_routes_through_middle() {
    let alpha = start("alpha").await;
    let beta = start("beta").await;
    let gamma = start("gamma").await;
    let mut gamma_rx = gamma.listen("test");

    alpha.dial(beta.mesh_addr(), false).await.unwrap();
    gamma.dial(beta.mesh_addr(), false).await.unwrap();

    wait_for(
        || alpha.routes().get("gamma").map(String::as_str) == Some("beta"),
        "route alpha→gamma via beta",
    )
    .await;

    alpha
        .send(&["gamma".to_string()], "test", b"relayed".to_vec())
        .await
        .unwrap();
    let delivery = gamma_rx.recv().await.unwrap();
    assert_eq!(delivery.source, "alpha");
    assert_eq!(delivery.body, b"relayed");

    alpha.destroy().await;
    beta.destroy().await;
    gamma.destroy().await;
}

#[tokio::test]
async fn broadcast_reaches_every_effective_node() {
    let alpha = start("alpha").await;
    let beta = start("beta").await;
    let gamma = start("gamma").await;
    let mut beta_rx = beta.listen("test");
    let mut gamma_rx = gamma.listen("test");

    alpha.dial(beta.mesh_addr(), false).await.unwrap();
    gamma.dial(beta.mesh_addr(), false).await.unwrap();
    wait_for(|| alpha.routes().contains_key("gamma"), "full mesh view").await;

    alpha.broadcast("test", b"all hands".to_vec()).await.unwrap();

    assert_eq!(beta_rx.recv().await.unwrap().body, b"all hands");
    assert_eq!(gamma_rx.recv().await.unwrap().body, b"all hands");

    alpha.destroy().await;
    beta.destroy().await;
    gamma.destroy().await;
}

#[tokio::test]
async fn partition_shrinks_routes_then_heals() {
    let alpha = start("alpha").await;
    let beta = start("beta").await;
    let gamma = start("gamma").await;

    alpha.dial(beta.mesh_addr(), false).await.unwrap();
    gamma.dial(beta.mesh_addr(), false).await.unwrap();
    wait_for(|| alpha.routes().contains_key("gamma"), "initial route").await;

    // Cut beta-gamma.
    beta.hangup("gamma").await;
    gamma.hangup("beta").await;
    wait_for(|| !alpha.routes().contains_key("gamma"), "route withdrawn").await;

    // Restore the link; one MSA cycle heals the view.
    gamma.dial(beta.mesh_addr(), false).await.unwrap();
    wait_for(
        || alpha.routes().get("gamma").map(String::as_str) == Some("beta"),
        "route restored",
    )
    .await;

    alpha.destroy().await;
    beta.destroy().await;
    gamma.destroy().await;
}

#[tokio::test]
async fn relay_hook_sees_forwarded_bodies() {
    let alpha = start("alpha").await;
    let beta = start("beta").await;
    let gamma = start("gamma").await;
    let mut gamma_rx = gamma.listen("test");

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    beta.set_relay_hook(std::sync::Arc::new(
        move |source: &str, channel: &str, body: &[u8]| {
            let _ = seen_tx.send((source.to_string(), channel.to_string(), body.to_vec()));
        },
    ));

    alpha.dial(beta.mesh_addr(), false).await.unwrap();
    gamma.dial(beta.mesh_addr(), false).await.unwrap();
    wait_for(|| alpha.routes().contains_key("gamma"), "route up").await;

    alpha
        .send(&["gamma".to_string()], "test", b"observed".to_vec())
        .await
        .unwrap();
    assert_eq!(gamma_rx.recv().await.unwrap().body, b"observed");

    let (source, channel, body) = seen_rx.recv().await.unwrap();
    assert_eq!(source, "alpha");
    assert_eq!(channel, "test");
    assert_eq!(body, b"observed");

    alpha.destroy().await;
    beta.destroy().await;
    gamma.destroy().await;
}
