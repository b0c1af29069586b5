use anyhow::Result;

use crate::*;

/// A departing node says BYE; the survivor drops the connection and keeps
/// running.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_notifies_peers() -> Result<()> {
    let alice = TestNode::spawn("alice").await?;
    let bob = TestNode::spawn("bob").await?;
    alice.connect(&bob).await?;
    wait_for_mesh(&[&alice, &bob]).await?;

    alice.node.shutdown().await;
    alice.node.shutdown().await;
    assert!(!alice.node.is_running());
    assert_eq!(alice.node.connection_count(), 0);

    wait_until("bob drops alice", || bob.node.connection_count() == 0).await?;
    wait_until("bob notes the goodbye", || {
        bob.notices().iter().any(|n| n == "alice left")
    })
    .await?;
    assert!(bob.node.is_running());

    // Alice is gone: dialing her again only leaves a notice.
    bob.node.connect_to("127.0.0.1", alice.port()).await?;
    assert_eq!(bob.node.connection_count(), 0);
    assert!(bob.notices().iter().any(|n| n.starts_with("could not connect")));

    // Chat with nobody connected is still recorded locally.
    bob.node.broadcast_user_text("anyone?").await?;
    assert_eq!(bob.node.history().entries_in(parley_services::Direction::Outbound).len(), 1);

    bob.node.shutdown().await;
    Ok(())
}

/// Shutting down one node of three leaves the other two connected.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_survivors_keep_chatting() -> Result<()> {
    let a = TestNode::spawn("a").await?;
    let b = TestNode::spawn("b").await?;
    let c = TestNode::spawn("c").await?;
    a.connect(&b).await?;
    b.connect(&c).await?;
    c.connect(&a).await?;
    wait_for_mesh(&[&a, &b, &c]).await?;

    b.node.shutdown().await;
    wait_until("b gone from both", || {
        !a.is_connected_to(&b) && !c.is_connected_to(&b)
    })
    .await?;
    assert!(a.is_connected_to(&c) && c.is_connected_to(&a));

    a.node.broadcast_user_text("still here").await?;
    wait_until("c receives", || c.received() == vec!["still here"]).await?;

    a.node.shutdown().await;
    c.node.shutdown().await;
    Ok(())
}
