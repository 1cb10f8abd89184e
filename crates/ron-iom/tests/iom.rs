//! File fabric scenarios over a localhost mesh.
use std::sync::Arc;
use std::time::Duration;

use ron_iom::{hash_file, Iom, IomConfig};
use ron_mesh::{MeshConfig, Node};
use tempfile::TempDir;

struct Peer {
    node: Node,
    iom: Arc<Iom>,
    base: TempDir,
}

async fn start(name: &str) -> Peer {
    let config = MeshConfig::new(name)
        .degree(0)
        .msa_period(Duration::from_millis(250))
        .send_timeout(Duration::from_secs(5));
    let node = Node::start(config).await.unwrap();
    let base = TempDir::new().unwrap();
    let iom_config = IomConfig::new(base.path()).rpc_timeout(Duration::from_secs(5));
    let iom = Iom::start(node.clone(), iom_config).unwrap();
    Peer { node, iom, base }
}

async fn link(a: &Peer, b: &Peer) {
    b.node.dial(a.node.mesh_addr(), false).await.unwrap();
    // Wait for the mutual edge, not just the socket: broadcasts only
    // reach effective nodes.
    for _ in 0..200 {
        let a_sees = a.node.effective_nodes().contains(&b.node.name().to_string());
        let b_sees = b.node.effective_nodes().contains(&a.node.name().to_string());
        if a_sees && b_sees {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("link never became effective");
}

fn plant(peer: &Peer, rel: &str, contents: &[u8], perm: u32) {
    use std::os::unix::fs::PermissionsExt;
    let path = peer.base.path().join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, contents).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(perm)).unwrap();
}

#[tokio::test]
async fn get_fetches_file_with_matching_hash_and_perm() {
    let alpha = start("alpha").await;
    let beta = start("beta").await;
    link(&alpha, &beta).await;

    let contents: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    plant(&beta, "images/disk.img", &contents, 0o640);

    alpha.iom.get("images/disk.img").await.unwrap();

    let fetched = alpha.base.path().join("images/disk.img");
    assert_eq!(std::fs::read(&fetched).unwrap(), contents);
    assert_eq!(
        hash_file(&fetched).unwrap(),
        hash_file(&beta.base.path().join("images/disk.img")).unwrap()
    );
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&fetched).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o640);
    }

    alpha.node.destroy().await;
    beta.node.destroy().await;
}

#[tokio::test]
async fn get_empty_file_touches_zero_bytes() {
    let alpha = start("alpha").await;
    let beta = start("beta").await;
    link(&alpha, &beta).await;

    plant(&beta, "marker", b"", 0o600);
    alpha.iom.get("marker").await.unwrap();

    let fetched = alpha.base.path().join("marker");
    assert_eq!(std::fs::metadata(&fetched).unwrap().len(), 0);
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&fetched).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    alpha.node.destroy().await;
    beta.node.destroy().await;
}

#[tokio::test]
async fn glob_fetches_every_match() {
    let alpha = start("alpha").await;
    let beta = start("beta").await;
    link(&alpha, &beta).await;

    plant(&beta, "logs/a.log", b"first", 0o644);
    plant(&beta, "logs/b.log", b"second", 0o644);
    plant(&beta, "logs/skip.txt", b"not a log", 0o644);

    alpha.iom.get("logs/*.log").await.unwrap();

    assert_eq!(
        std::fs::read(alpha.base.path().join("logs/a.log")).unwrap(),
        b"first"
    );
    assert_eq!(
        std::fs::read(alpha.base.path().join("logs/b.log")).unwrap(),
        b"second"
    );
    assert!(!alpha.base.path().join("logs/skip.txt").exists());

    alpha.node.destroy().await;
    beta.node.destroy().await;
}

#[tokio::test]
async fn zero_match_glob_is_not_found() {
    let alpha = start("alpha").await;
    let beta = start("beta").await;
    link(&alpha, &beta).await;

    let result = alpha.iom.get("nothing/*.qcow2").await;
    assert!(matches!(result, Err(ron_iom::IomError::NotFound(_))));

    alpha.node.destroy().await;
    beta.node.destroy().await;
}

#[tokio::test]
async fn head_node_version_wins() {
    let getter_mesh = MeshConfig::new("getter")
        .degree(0)
        .msa_period(Duration::from_millis(250))
        .send_timeout(Duration::from_secs(5));
    let getter_node = Node::start(getter_mesh).await.unwrap();
    let getter_base = TempDir::new().unwrap();
    let getter_iom = Iom::start(
        getter_node.clone(),
        IomConfig::new(getter_base.path())
            .rpc_timeout(Duration::from_secs(5))
            .head_node("head"),
    )
    .unwrap();

    let other = start("other").await;
    let head = start("head").await;

    other.node.dial(getter_node.mesh_addr(), false).await.unwrap();
    head.node.dial(getter_node.mesh_addr(), false).await.unwrap();
    for _ in 0..200 {
        if getter_node.effective_nodes().len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    plant(&other, "shared.txt", b"stale copy", 0o644);
    plant(&head, "shared.txt", b"head copy", 0o644);

    getter_iom.get("shared.txt").await.unwrap();
    assert_eq!(
        std::fs::read(getter_base.path().join("shared.txt")).unwrap(),
        b"head copy"
    );

    getter_node.destroy().await;
    other.node.destroy().await;
    head.node.destroy().await;
}

#[tokio::test]
async fn stream_yields_content_in_order() {
    let alpha = start("alpha").await;
    let beta = start("beta").await;
    link(&alpha, &beta).await;

    plant(&beta, "feed.bin", b"streamed bytes", 0o644);

    let mut rx = alpha.iom.stream("feed.bin").await.unwrap();
    let mut collected = Vec::new();
    while let Some(chunk) = rx.recv().await {
        collected.extend(chunk);
    }
    assert_eq!(collected, b"streamed bytes");
    // Streaming never materializes the file locally.
    assert!(!alpha.base.path().join("feed.bin").exists());

    alpha.node.destroy().await;
    beta.node.destroy().await;
}

#[tokio::test]
async fn delete_of_base_empties_but_keeps_root() {
    let alpha = start("alpha").await;
    plant(&alpha, "a.txt", b"a", 0o644);
    plant(&alpha, "sub/b.txt", b"b", 0o644);

    alpha.iom.delete("/").await.unwrap();

    assert!(alpha.base.path().exists());
    assert!(!alpha.base.path().join("a.txt").exists());
    assert!(!alpha.base.path().join("sub").exists());

    alpha.node.destroy().await;
}
