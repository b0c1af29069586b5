use anyhow::Result;

use crate::*;

/// Two nodes, one connection, chat in both directions.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_two_node_chat() -> Result<()> {
    let alice = TestNode::spawn("alice").await?;
    let bob = TestNode::spawn("bob").await?;

    alice.connect(&bob).await?;
    wait_for_mesh(&[&alice, &bob]).await?;
    assert_eq!(alice.node.connection_count(), 1);
    assert_eq!(bob.node.connection_count(), 1);

    alice.node.broadcast_user_text("hello bob").await?;
    bob.node.broadcast_user_text("hi alice").await?;

    wait_until("bob hears alice", || bob.received() == vec!["hello bob"]).await?;
    wait_until("alice hears bob", || alice.received() == vec!["hi alice"]).await?;

    assert!(bob.shown()[0].ends_with("alice: hello bob"), "{:?}", bob.shown());
    assert!(alice.shown()[0].ends_with("bob: hi alice"), "{:?}", alice.shown());

    let dump = alice.node.history().dump();
    assert!(dump.contains("alice (you): hello bob"), "{dump}");
    assert!(dump.contains("bob: hi alice"), "{dump}");

    alice.node.shutdown().await;
    bob.node.shutdown().await;
    Ok(())
}

/// Separator and escape characters survive the trip.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_special_characters_round_trip() -> Result<()> {
    let alice = TestNode::spawn("al|ice").await?;
    let bob = TestNode::spawn("bob").await?;
    alice.connect(&bob).await?;
    wait_for_mesh(&[&alice, &bob]).await?;

    let text = r"pipes | and \ backslashes \| mixed";
    alice.node.broadcast_user_text(text).await?;
    wait_until("bob receives", || bob.received().len() == 1).await?;

    let entry = &bob.node.history().entries_in(parley_services::Direction::Inbound)[0];
    assert_eq!(entry.text, text);
    assert_eq!(entry.from, "al|ice");

    alice.node.shutdown().await;
    bob.node.shutdown().await;
    Ok(())
}

/// Both nodes dial each other at once. Each ends up with a single link and
/// both keep the same one.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_crossed_dials_leave_one_link() -> Result<()> {
    let alice = TestNode::spawn("alice").await?;
    let bob = TestNode::spawn("bob").await?;

    let (a, b) = tokio::join!(alice.connect(&bob), bob.connect(&alice));
    a?;
    b?;
    wait_until("one link each way", || {
        alice.node.connection_count() == 1 && bob.node.connection_count() == 1
    })
    .await?;
    settle().await;
    assert!(alice.is_connected_to(&bob) && bob.is_connected_to(&alice));

    alice.node.broadcast_user_text("one copy").await?;
    wait_until("bob receives", || bob.received().len() == 1).await?;
    settle().await;
    assert_eq!(bob.received(), vec!["one copy"]);

    alice.node.shutdown().await;
    bob.node.shutdown().await;
    Ok(())
}
