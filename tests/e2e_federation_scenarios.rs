//! Federation scenarios against a mock fediverse peer
//!
//! Follow, post lifecycle fanout and retirement of dead inboxes.

mod common;

use std::time::Duration;

use common::{MockPeer, OLD_HOST, TestServer, test_post, wait_for};
use goblog::posts::PostEventKind;
use reqwest::StatusCode;

async fn followed_by_alice() -> (TestServer, MockPeer) {
    let server = TestServer::new().await;
    let peer = MockPeer::start().await;

    let status = peer
        .follow("alice", &server.actor(OLD_HOST), &server.inbox(OLD_HOST))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let accepts = peer.wait_for_activity("alice", "Accept", 1).await;
    assert_eq!(accepts.len(), 1);
    (server, peer)
}

#[tokio::test]
async fn test_follow_is_accepted_and_post_is_delivered() {
    let (server, peer) = followed_by_alice().await;

    assert_eq!(server.follower_iris().await, vec![peer.actor("alice")]);

    let accept = &peer.received_by("alice", "Accept")[0];
    assert!(accept.verified, "Accept must carry a valid signature");
    assert_eq!(accept.activity["actor"], server.actor(OLD_HOST).as_str());
    assert_eq!(accept.activity["object"]["type"], "Follow");

    server
        .publish(PostEventKind::Published, test_post("/hello", "<p>Hello</p>"))
        .await;

    let creates = peer.wait_for_activity("alice", "Create", 1).await;
    assert_eq!(creates.len(), 1);
    let create = &creates[0];
    assert!(create.verified);
    assert_eq!(create.activity["actor"], server.actor(OLD_HOST).as_str());
    assert_eq!(
        create.activity["object"]["id"],
        server.url(OLD_HOST, "/hello").as_str()
    );
    assert_eq!(create.activity["object"]["type"], "Note");
    assert!(
        create.activity["id"]
            .as_str()
            .unwrap()
            .starts_with(&format!("{}#", server.actor(OLD_HOST)))
    );
    assert!(peer.visible_statuses().contains(&server.url(OLD_HOST, "/hello")));
}

#[tokio::test]
async fn test_update_keeps_object_id_with_fresh_activity_id() {
    let (server, peer) = followed_by_alice().await;
    let post = test_post("/hello", "<p>Hello</p>");

    server.publish(PostEventKind::Published, post.clone()).await;
    peer.wait_for_activity("alice", "Create", 1).await;

    let mut edited = post.clone();
    edited.rendered_html = "<p>Hello again</p>".to_string();
    server.publish(PostEventKind::Updated, edited.clone()).await;
    server.publish(PostEventKind::Updated, edited).await;

    let updates = peer.wait_for_activity("alice", "Update", 2).await;
    assert_eq!(updates.len(), 2);

    let object_id = server.url(OLD_HOST, "/hello");
    for update in &updates {
        assert!(update.verified);
        assert_eq!(update.activity["object"]["id"], object_id.as_str());
        assert!(update.activity["object"]["content"]
            .as_str()
            .unwrap()
            .contains("Hello again"));
        let id = update.activity["id"].as_str().unwrap();
        assert!(id.starts_with(&format!("{}?activitypubversion=", object_id)));
    }
    assert_ne!(updates[0].activity["id"], updates[1].activity["id"]);
}

#[tokio::test]
async fn test_delete_sends_tombstone() {
    let (server, peer) = followed_by_alice().await;
    let post = test_post("/hello", "<p>Hello</p>");

    server.publish(PostEventKind::Published, post.clone()).await;
    peer.wait_for_activity("alice", "Create", 1).await;
    assert_eq!(peer.visible_statuses().len(), 1);

    server.publish(PostEventKind::Deleted, post).await;

    let deletes = peer.wait_for_activity("alice", "Delete", 1).await;
    assert_eq!(deletes.len(), 1);
    let delete = &deletes[0];
    assert!(delete.verified);
    assert_eq!(delete.activity["object"]["type"], "Tombstone");
    assert_eq!(
        delete.activity["object"]["id"],
        server.url(OLD_HOST, "/hello").as_str()
    );
    assert!(peer.visible_statuses().is_empty());
}

#[tokio::test]
async fn test_undeleted_post_is_recreated_under_new_version() {
    let (server, peer) = followed_by_alice().await;
    let post = test_post("/hello", "<p>Hello</p>");

    server.publish(PostEventKind::Published, post.clone()).await;
    peer.wait_for_activity("alice", "Create", 1).await;
    server.publish(PostEventKind::Deleted, post.clone()).await;
    peer.wait_for_activity("alice", "Delete", 1).await;
    server.publish(PostEventKind::Undeleted, post).await;

    let creates = peer.wait_for_activity("alice", "Create", 2).await;
    assert_eq!(creates.len(), 2);
    let recreated = creates[1].activity["object"]["id"].as_str().unwrap();
    assert!(recreated.starts_with(&format!(
        "{}?activitypubversion=",
        server.url(OLD_HOST, "/hello")
    )));
    assert!(peer.visible_statuses().contains(recreated));
}

#[tokio::test]
async fn test_private_post_is_not_federated() {
    let (server, peer) = followed_by_alice().await;

    let mut private = test_post("/secret", "<p>Secret</p>");
    private.visibility = goblog::posts::Visibility::Private;
    server.publish(PostEventKind::Published, private).await;
    server
        .publish(PostEventKind::Published, test_post("/public", "<p>Public</p>"))
        .await;

    let creates = peer.wait_for_activity("alice", "Create", 1).await;
    assert_eq!(creates.len(), 1);
    assert_eq!(
        creates[0].activity["object"]["id"],
        server.url(OLD_HOST, "/public").as_str()
    );
}

#[tokio::test]
async fn test_dead_inbox_is_retired_after_retry_budget() {
    let server = TestServer::new().await;
    let peer = MockPeer::start().await;

    peer.fail_inbox("bob");
    for user in ["alice", "bob"] {
        let status = peer
            .follow(user, &server.actor(OLD_HOST), &server.inbox(OLD_HOST))
            .await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }
    assert_eq!(server.follower_iris().await.len(), 2);

    let bob = peer.actor("bob");
    let server_ref = &server;
    let retired = wait_for(Duration::from_secs(30), move || {
        let bob = bob.clone();
        async move { !server_ref.follower_iris().await.contains(&bob) }
    })
    .await;
    assert!(retired, "bob was never retired");

    // Every attempt of the Accept reached bob's inbox, and no more
    assert_eq!(peer.received_by("bob", "Accept").len(), 20);
    assert_eq!(server.follower_iris().await, vec![peer.actor("alice")]);

    server
        .publish(PostEventKind::Published, test_post("/after", "<p>After</p>"))
        .await;
    let creates = peer.wait_for_activity("alice", "Create", 1).await;
    assert_eq!(creates.len(), 1);
    assert!(peer.received_by("bob", "Create").is_empty());

    let drained = wait_for(Duration::from_secs(5), || {
        let db = server.state.db.clone();
        async move { db.queue_len(goblog::federation::DELIVERY_TOPIC).await.unwrap() == 0 }
    })
    .await;
    assert!(drained);
    assert_eq!(peer.received_by("bob", "Accept").len(), 20);
}
