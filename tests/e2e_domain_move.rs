//! E2E tests for moving a blog from a retired host to the canonical host

mod common;

use common::{ADMIN_TOKEN, MockPeer, NEW_HOST, OLD_HOST, TestOptions, TestServer, wait_for};
use reqwest::StatusCode;
use serde_json::{Value, json};
use std::time::Duration;

async fn moved_server() -> TestServer {
    TestServer::with_options(TestOptions {
        canonical: NEW_HOST,
        alternates: vec![OLD_HOST],
    })
    .await
}

async fn domain_move(server: &TestServer, token: Option<&str>, body: Value) -> reqwest::Response {
    let mut request = server
        .client
        .post(server.url(NEW_HOST, "/admin/activitypub/domain-move"))
        .json(&body);
    if let Some(token) = token {
        request = request.bearer_auth(token);
    }
    request.send().await.unwrap()
}

fn aliases(actor: &Value) -> Vec<String> {
    actor["alsoKnownAs"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[tokio::test]
async fn test_domain_move_migrates_followers() {
    let server = moved_server().await;
    let peer = MockPeer::start().await;
    let old_actor = server.actor(OLD_HOST);
    let new_actor = server.actor(NEW_HOST);

    // alice knows the blog under its old domain
    let status = peer
        .follow("alice", &old_actor, &server.inbox(OLD_HOST))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let accepts = peer.wait_for_activity("alice", "Accept", 1).await;
    assert_eq!(accepts[0].activity["actor"], old_actor.as_str());

    let response = domain_move(
        &server,
        Some(ADMIN_TOKEN),
        json!({ "old": server.host(OLD_HOST), "new": server.host(NEW_HOST) }),
    )
    .await;
    assert_eq!(response.status(), 200);
    let reports: Value = response.json().await.unwrap();
    assert_eq!(reports[0]["actor"], old_actor.as_str());
    assert_eq!(reports[0]["moved_to"], new_actor.as_str());
    assert_eq!(reports[0]["deliveries"], 1);

    let moves = peer.wait_for_activity("alice", "Move", 1).await;
    assert_eq!(moves.len(), 1);
    let activity = &moves[0];
    assert!(activity.verified, "Move must verify against the old actor key");
    assert_eq!(activity.activity["actor"], old_actor.as_str());
    assert_eq!(activity.activity["object"], old_actor.as_str());
    assert_eq!(activity.activity["target"], new_actor.as_str());

    let refollowed = wait_for(Duration::from_secs(10), || {
        let peer = peer.clone();
        async move { !peer.refollows().is_empty() }
    })
    .await;
    assert!(refollowed, "peer never followed the new actor");
    assert_eq!(
        peer.refollows(),
        vec![("alice".to_string(), new_actor.clone())]
    );
    let accepts = peer.wait_for_activity("alice", "Accept", 2).await;
    assert_eq!(accepts[1].activity["actor"], new_actor.as_str());

    // Old identity points at the new one
    let old_doc: Value = server
        .get_activity_json(&old_actor)
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(old_doc["id"], old_actor.as_str());
    assert_eq!(old_doc["movedTo"], new_actor.as_str());
    assert!(aliases(&old_doc).contains(&new_actor));

    // New identity claims the old one and is not moved itself
    let new_doc: Value = server
        .get_activity_json(&new_actor)
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(new_doc["id"], new_actor.as_str());
    assert_eq!(aliases(&new_doc), vec![old_actor.clone()]);
    assert!(new_doc.get("movedTo").is_none());
    assert_eq!(new_doc["publicKey"]["publicKeyPem"], old_doc["publicKey"]["publicKeyPem"]);

    // Both handles still resolve
    for host in [OLD_HOST, NEW_HOST] {
        let response = server
            .client
            .get(server.url(host, "/.well-known/webfinger"))
            .query(&[("resource", format!("acct:default@{}", server.host(host)))])
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200, "webfinger on {}", host);
    }

    let state: Value = server
        .client
        .get(server.url(NEW_HOST, "/admin/activitypub/default/state"))
        .bearer_auth(ADMIN_TOKEN)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(state["state"], "moving");
    assert_eq!(state["moved_to"], new_actor.as_str());
    assert_eq!(state["followers"], 1);
}

#[tokio::test]
async fn test_old_actor_keeps_moved_to() {
    let server = moved_server().await;
    let old_actor = server.actor(OLD_HOST);

    let response = domain_move(
        &server,
        Some(ADMIN_TOKEN),
        json!({ "old": server.host(OLD_HOST), "new": server.host(NEW_HOST) }),
    )
    .await;
    assert_eq!(response.status(), 200);

    for _ in 0..3 {
        let doc: Value = server
            .get_activity_json(&old_actor)
            .await
            .json()
            .await
            .unwrap();
        assert_eq!(doc["movedTo"], server.actor(NEW_HOST).as_str());
    }

    // No follower left: the old identity is retired
    let state: Value = server
        .client
        .get(server.url(NEW_HOST, "/admin/activitypub/default/state"))
        .bearer_auth(ADMIN_TOKEN)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(state["state"], "retired");
}

#[tokio::test]
async fn test_old_host_redirects_browsers() {
    let server = moved_server().await;

    let response = server
        .client
        .get(server.url(OLD_HOST, "/2024/01/hello?page=2"))
        .header("Accept", "text/html")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::PERMANENT_REDIRECT);
    assert_eq!(
        response.headers()["location"].to_str().unwrap(),
        server.url(NEW_HOST, "/2024/01/hello?page=2")
    );

    let webfinger = server
        .client
        .get(server.url(OLD_HOST, "/.well-known/webfinger"))
        .query(&[("resource", format!("acct:default@{}", server.host(OLD_HOST)))])
        .send()
        .await
        .unwrap();
    assert_eq!(webfinger.status(), 200);

    let actor = server.get_activity_json(&server.actor(OLD_HOST)).await;
    assert_eq!(actor.status(), 200);

    // Operator endpoints answer on the old host instead of redirecting
    let state = server
        .client
        .get(server.url(OLD_HOST, "/admin/activitypub/default/state"))
        .bearer_auth(ADMIN_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(state.status(), 200);
}

#[tokio::test]
async fn test_domain_move_requires_admin_token() {
    let server = moved_server().await;
    let body = json!({ "old": server.host(OLD_HOST), "new": server.host(NEW_HOST) });

    let missing = domain_move(&server, None, body.clone()).await;
    assert_eq!(missing.status(), 401);

    let wrong = domain_move(&server, Some("not-the-token"), body).await;
    assert_eq!(wrong.status(), 401);

    let state = server
        .get_activity_json(&server.actor(OLD_HOST))
        .await
        .json::<Value>()
        .await
        .unwrap();
    assert!(state.get("movedTo").is_none());
}

#[tokio::test]
async fn test_domain_move_rejects_unconfigured_hosts() {
    let server = moved_server().await;

    // The old host must be an alternate
    let unknown = domain_move(
        &server,
        Some(ADMIN_TOKEN),
        json!({ "old": "elsewhere.example", "new": server.host(NEW_HOST) }),
    )
    .await;
    assert_eq!(unknown.status(), 400);

    // The new host must be canonical
    let reversed = domain_move(
        &server,
        Some(ADMIN_TOKEN),
        json!({ "old": server.host(NEW_HOST), "new": server.host(OLD_HOST) }),
    )
    .await;
    assert_eq!(reversed.status(), 400);
}
