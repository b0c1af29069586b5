use anyhow::Result;

use crate::*;

/// A newcomer that only knows the hub learns about the hub's other peer
/// from PEERS_RES and dials it.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_peer_exchange_auto_connects() -> Result<()> {
    let hub = TestNode::spawn("hub").await?;
    let bob = TestNode::spawn("bob").await?;
    let alice = TestNode::spawn("alice").await?;

    bob.connect(&hub).await?;
    wait_for_mesh(&[&bob, &hub]).await?;

    alice.connect(&hub).await?;
    wait_for_mesh(&[&alice, &bob, &hub]).await?;

    assert!(alice.node.known_peers().contains(&bob.address()));
    // Racing dials may open a second link to a peer; one of them is dropped.
    wait_until("one link per pair", || {
        [&alice, &bob, &hub]
            .iter()
            .all(|n| n.node.connection_count() == 2)
    })
    .await?;

    // Nobody records itself, and the hub's "localhost" entry was rewritten.
    for n in [&hub, &bob, &alice] {
        assert!(!n.node.known_peers().contains(&n.address()));
        assert!(n.node.known_peers().iter().all(|p| p.host() != "localhost"));
    }

    // Direct path plus relay through the hub, still shown once.
    alice.node.broadcast_user_text("found you").await?;
    wait_until("bob receives", || bob.received().len() == 1).await?;
    settle().await;
    assert_eq!(bob.received(), vec!["found you"]);
    assert_eq!(hub.received(), vec!["found you"]);

    for n in [&hub, &bob, &alice] {
        n.node.shutdown().await;
    }
    Ok(())
}
