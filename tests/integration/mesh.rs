use anyhow::Result;

use crate::*;

/// Three fully connected forwarding nodes. Every node relays everything it
/// accepts, so each message circulates; the dedup window must stop it after
/// one delivery per node.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_mesh_relay_terminates() -> Result<()> {
    let a = TestNode::spawn("a").await?;
    let b = TestNode::spawn("b").await?;
    let c = TestNode::spawn("c").await?;

    a.connect(&b).await?;
    b.connect(&c).await?;
    c.connect(&a).await?;
    wait_for_mesh(&[&a, &b, &c]).await?;

    a.node.broadcast_user_text("round and round").await?;
    wait_until("b and c receive", || {
        b.received().len() == 1 && c.received().len() == 1
    })
    .await?;
    settle().await;

    assert_eq!(b.received(), vec!["round and round"]);
    assert_eq!(c.received(), vec!["round and round"]);
    assert!(a.received().is_empty(), "sender saw its own message: {:?}", a.received());

    for node in [&a, &b, &c] {
        node.node.shutdown().await;
    }
    Ok(())
}

/// Many messages from every node in parallel: each node shows each foreign
/// message exactly once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mesh_concurrent_senders() -> Result<()> {
    let nodes = [
        TestNode::spawn("a").await?,
        TestNode::spawn("b").await?,
        TestNode::spawn("c").await?,
    ];
    nodes[0].connect(&nodes[1]).await?;
    nodes[1].connect(&nodes[2]).await?;
    nodes[2].connect(&nodes[0]).await?;
    wait_for_mesh(&[&nodes[0], &nodes[1], &nodes[2]]).await?;

    const PER_NODE: usize = 20;
    let mut sends = Vec::new();
    for (i, n) in nodes.iter().enumerate() {
        let node = n.node.clone();
        sends.push(tokio::spawn(async move {
            for k in 0..PER_NODE {
                node.broadcast_user_text(&format!("{i}-{k}")).await?;
            }
            anyhow::Ok(())
        }));
    }
    for send in sends {
        send.await??;
    }

    let expected = PER_NODE * (nodes.len() - 1);
    wait_until("all messages delivered", || {
        nodes.iter().all(|n| n.received().len() >= expected)
    })
    .await?;
    settle().await;

    for (i, n) in nodes.iter().enumerate() {
        let mut got = n.received();
        assert_eq!(got.len(), expected, "node {i} got duplicates");
        got.sort();
        got.dedup();
        assert_eq!(got.len(), expected, "node {i} got duplicates");
        assert!(got.iter().all(|t| !t.starts_with(&format!("{i}-"))));
    }

    for n in &nodes {
        n.node.shutdown().await;
    }
    Ok(())
}
