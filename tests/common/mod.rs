//! Common test utilities for E2E tests
//!
//! `TestServer` runs the real router and background tasks on a random port.
//! Its hosts (`goblog.example`, `newgoblog.example`) resolve to that port
//! through client-side overrides. `MockPeer` is a remote server that serves
//! actors, verifies our HTTP signatures and records what it receives.

#![allow(dead_code)]

pub mod schema_validator;

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Router,
    body::Bytes,
    extract::{OriginalUri, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use goblog::federation::{
    ACTIVITY_JSON, InstanceKey, extract_signature_key_id, key_owner, sign_request,
    verify_signature,
};
use goblog::posts::{Post, PostEvent, PostEventKind, PostStatus, Visibility};
use goblog::sinks::{InteractionKind, InteractionSink, NotificationSink};
use goblog::{AppState, config};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub const OLD_HOST: &str = "goblog.example";
pub const NEW_HOST: &str = "newgoblog.example";
pub const ADMIN_TOKEN: &str = "test-admin-token";

/// Poll `check` until it holds or `timeout` passes
pub async fn wait_for<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// HTTP client resolving the test hostnames to 127.0.0.1
pub fn test_client() -> reqwest::Client {
    let loopback: SocketAddr = "127.0.0.1:0".parse().unwrap();
    reqwest::Client::builder()
        .resolve(OLD_HOST, loopback)
        .resolve(NEW_HOST, loopback)
        .redirect(reqwest::redirect::Policy::none())
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}

/// Records everything the inbox hands to its sinks
#[derive(Default)]
pub struct RecordingSink {
    pub notifications: Mutex<Vec<String>>,
    pub interactions: Mutex<Vec<(InteractionKind, String, String)>>,
}

impl RecordingSink {
    pub fn notifications(&self) -> Vec<String> {
        self.notifications.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn emit(&self, text: &str) {
        self.notifications.lock().unwrap().push(text.to_string());
    }
}

#[async_trait]
impl InteractionSink for RecordingSink {
    async fn on_inbound(
        &self,
        kind: InteractionKind,
        source: &str,
        target: &str,
        _author: &str,
        _content: &str,
    ) {
        self.interactions
            .lock()
            .unwrap()
            .push((kind, source.to_string(), target.to_string()));
    }
}

/// How the test server is configured
pub struct TestOptions {
    pub canonical: &'static str,
    pub alternates: Vec<&'static str>,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            canonical: OLD_HOST,
            alternates: Vec::new(),
        }
    }
}

/// Test server instance
pub struct TestServer {
    pub port: u16,
    pub state: AppState,
    pub sink: Arc<RecordingSink>,
    pub client: reqwest::Client,
    pub _temp_dir: TempDir,
    shutdown: CancellationToken,
}

impl TestServer {
    /// Create a new test server on `goblog.example`
    pub async fn new() -> Self {
        Self::with_options(TestOptions::default()).await
    }

    pub async fn with_options(options: TestOptions) -> Self {
        goblog::metrics::init_metrics();

        // Create temporary directory for test database
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        // Bind first; the port is part of every IRI
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut blogs = BTreeMap::new();
        blogs.insert(
            "default".to_string(),
            config::BlogConfig {
                path: "/".to_string(),
                title: "Test Blog".to_string(),
                description: "Federation test blog".to_string(),
                lang: "en".to_string(),
                icon: None,
            },
        );

        let config = config::AppConfig {
            server: config::ServerConfig {
                host: "127.0.0.1".to_string(),
                port,
                public_address: format!("http://{}:{}", options.canonical, port),
                alternate_domains: options
                    .alternates
                    .iter()
                    .map(|host| format!("{}:{}", host, port))
                    .collect(),
                short_public_address: None,
                media_address: None,
            },
            database: config::DatabaseConfig { path: db_path },
            blogs,
            default_blog: "default".to_string(),
            activitypub: config::ActivityPubConfig {
                key_bits: 1024,
                allow_private_addresses: true,
                send_profile_updates: false,
                ..Default::default()
            },
            delivery: config::DeliveryConfig {
                poll_interval_ms: 20,
                pacing_ms: 0,
                max_attempts: 20,
                retry_step_ms: 1,
                request_timeout_secs: 5,
            },
            tls: config::TlsConfig::default(),
            admin: config::AdminConfig {
                token: Some(ADMIN_TOKEN.to_string()),
            },
            logging: config::LoggingConfig::default(),
        };
        config.validate().unwrap();

        // Initialize app state
        let sink = Arc::new(RecordingSink::default());
        let state = AppState::with_sinks(config, sink.clone(), sink.clone())
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        goblog::spawn_background_tasks(&state, shutdown.clone());

        // Build router and spawn server in background
        let app = goblog::build_router(state.clone());
        let token = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
                .unwrap();
        });

        let server = Self {
            port,
            state,
            sink,
            client: test_client(),
            _temp_dir: temp_dir,
            shutdown,
        };

        // Wait for the listener
        let client = server.client.clone();
        let health = server.url(options.canonical, "/health");
        assert!(
            wait_for(Duration::from_secs(5), || {
                let client = client.clone();
                let health = health.clone();
                async move { client.get(health).send().await.is_ok() }
            })
            .await
        );
        server
    }

    /// `host:port` of a test hostname
    pub fn host(&self, name: &str) -> String {
        format!("{}:{}", name, self.port)
    }

    pub fn url(&self, host: &str, path: &str) -> String {
        format!("http://{}:{}{}", host, self.port, path)
    }

    /// Actor IRI of the default blog on a host
    pub fn actor(&self, host: &str) -> String {
        self.url(host, "/")
    }

    pub fn inbox(&self, host: &str) -> String {
        self.url(host, "/activitypub/inbox/default")
    }

    /// GET an ActivityStreams document
    pub async fn get_activity_json(&self, url: &str) -> reqwest::Response {
        self.client
            .get(url)
            .header("Accept", ACTIVITY_JSON)
            .send()
            .await
            .unwrap()
    }

    pub async fn follower_iris(&self) -> Vec<String> {
        self.state
            .db
            .list_followers("default")
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.follower)
            .collect()
    }

    /// Publish a post event once the outbox listener is subscribed
    pub async fn publish(&self, kind: PostEventKind, post: Post) {
        let event = PostEvent { kind, post };
        for _ in 0..200 {
            if self.state.posts.publish(event.clone()) > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("post listener never subscribed");
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// A public post of the default blog
pub fn test_post(path: &str, html: &str) -> Post {
    Post {
        path: path.to_string(),
        blog: "default".to_string(),
        visibility: Visibility::Public,
        status: PostStatus::Published,
        title: None,
        rendered_html: html.to_string(),
        published_at: chrono::Utc::now(),
        updated_at: None,
        attachments: Vec::new(),
        tags: Vec::new(),
        reply_to: None,
        mentions: Vec::new(),
    }
}

// =============================================================================
// Mock peer
// =============================================================================

/// An activity POSTed to one of the peer's inboxes
#[derive(Debug, Clone)]
pub struct Received {
    pub user: String,
    pub activity: Value,
    /// Signature verified against the key published by the signer
    pub verified: bool,
}

impl Received {
    pub fn kind(&self) -> &str {
        self.activity["type"].as_str().unwrap_or_default()
    }
}

struct PeerState {
    base: String,
    key: InstanceKey,
    client: reqwest::Client,
    received: Mutex<Vec<Received>>,
    /// Users whose inbox answers 500
    failing: Mutex<HashSet<String>>,
    /// Users whose actor document is gone (410)
    gone: Mutex<HashSet<String>>,
    statuses: Mutex<BTreeSet<String>>,
    /// Follows this peer sent after processing a Move: (user, new actor)
    refollows: Mutex<Vec<(String, String)>>,
}

/// Fediverse server double
#[derive(Clone)]
pub struct MockPeer {
    pub base: String,
    state: Arc<PeerState>,
}

impl MockPeer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());

        let private_key = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
        let state = Arc::new(PeerState {
            base: base.clone(),
            key: InstanceKey::from_private_key(private_key).unwrap(),
            client: test_client(),
            received: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            gone: Mutex::new(HashSet::new()),
            statuses: Mutex::new(BTreeSet::new()),
            refollows: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .route("/users/:name", get(peer_actor))
            .route("/users/:name/inbox", post(peer_inbox))
            .with_state(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base, state }
    }

    pub fn actor(&self, user: &str) -> String {
        format!("{}/users/{}", self.base, user)
    }

    pub fn inbox(&self, user: &str) -> String {
        format!("{}/users/{}/inbox", self.base, user)
    }

    pub fn fail_inbox(&self, user: &str) {
        self.state.failing.lock().unwrap().insert(user.to_string());
    }

    pub fn received(&self) -> Vec<Received> {
        self.state.received.lock().unwrap().clone()
    }

    pub fn received_by(&self, user: &str, kind: &str) -> Vec<Received> {
        self.received()
            .into_iter()
            .filter(|r| r.user == user && r.kind() == kind)
            .collect()
    }

    /// Wait until `user` received at least `count` activities of `kind`
    pub async fn wait_for_activity(&self, user: &str, kind: &str, count: usize) -> Vec<Received> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
        loop {
            let received = self.received_by(user, kind);
            if received.len() >= count || tokio::time::Instant::now() >= deadline {
                return received;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    pub fn visible_statuses(&self) -> BTreeSet<String> {
        self.state.statuses.lock().unwrap().clone()
    }

    pub fn refollows(&self) -> Vec<(String, String)> {
        self.state.refollows.lock().unwrap().clone()
    }

    /// Sign and POST an activity as `user`; returns the response status
    pub async fn send(&self, user: &str, inbox: &str, activity: &Value) -> StatusCode {
        send_signed(&self.state, user, inbox, activity).await
    }

    /// Sign and POST raw bytes as `user`
    pub async fn send_bytes(&self, user: &str, inbox: &str, body: Vec<u8>) -> StatusCode {
        send_signed_bytes(&self.state, user, inbox, body).await
    }

    /// `user` follows `object` through `inbox`
    pub async fn follow(&self, user: &str, object: &str, inbox: &str) -> StatusCode {
        let activity = json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": format!("{}#follow-{}", self.actor(user), ulid::Ulid::new()),
            "type": "Follow",
            "actor": self.actor(user),
            "object": object,
        });
        self.send(user, inbox, &activity).await
    }
}

async fn send_signed(state: &PeerState, user: &str, inbox: &str, activity: &Value) -> StatusCode {
    send_signed_bytes(state, user, inbox, serde_json::to_vec(activity).unwrap()).await
}

async fn send_signed_bytes(state: &PeerState, user: &str, inbox: &str, body: Vec<u8>) -> StatusCode {
    let actor = format!("{}/users/{}", state.base, user);
    let signed = sign_request(
        "POST",
        inbox,
        Some(&body),
        &state.key,
        &format!("{}#main-key", actor),
    )
    .unwrap();

    let mut request = state
        .client
        .post(inbox)
        .header("Content-Type", ACTIVITY_JSON)
        .header("Date", signed.date)
        .header("Signature", signed.signature);
    if let Some(digest) = signed.digest {
        request = request.header("Digest", digest);
    }
    let status = request.body(body).send().await.unwrap().status();
    StatusCode::from_u16(status.as_u16()).unwrap()
}

async fn peer_actor(State(state): State<Arc<PeerState>>, Path(name): Path<String>) -> Response {
    if state.gone.lock().unwrap().contains(&name) {
        return StatusCode::GONE.into_response();
    }
    let actor = format!("{}/users/{}", state.base, name);
    let document = json!({
        "@context": ["https://www.w3.org/ns/activitystreams", "https://w3id.org/security/v1"],
        "id": actor,
        "type": "Person",
        "preferredUsername": name,
        "inbox": format!("{}/inbox", actor),
        "publicKey": {
            "id": format!("{}#main-key", actor),
            "owner": actor,
            "publicKeyPem": state.key.public_key_pem(),
        },
    });
    ([("Content-Type", ACTIVITY_JSON)], document.to_string()).into_response()
}

/// Fetch the signer's actor and check the request signature
async fn verify_inbound(
    state: &PeerState,
    path_and_query: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> bool {
    let Ok(key_id) = extract_signature_key_id(headers) else {
        return false;
    };
    let Ok(response) = state
        .client
        .get(key_owner(&key_id))
        .header("Accept", ACTIVITY_JSON)
        .send()
        .await
    else {
        return false;
    };
    let Ok(document) = response.json::<Value>().await else {
        return false;
    };
    let Some(pem) = document["publicKey"]["publicKeyPem"].as_str() else {
        return false;
    };
    verify_signature("POST", path_and_query, headers, Some(body), pem).is_ok()
}

async fn peer_inbox(
    State(state): State<Arc<PeerState>>,
    Path(name): Path<String>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let activity: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);

    if state.failing.lock().unwrap().contains(&name) {
        state.received.lock().unwrap().push(Received {
            user: name,
            activity,
            verified: false,
        });
        return StatusCode::INTERNAL_SERVER_ERROR;
    }

    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let verified = verify_inbound(&state, path_and_query, &headers, &body).await;

    match activity["type"].as_str() {
        Some("Create") => {
            if let Some(id) = activity["object"]["id"].as_str() {
                state.statuses.lock().unwrap().insert(id.to_string());
            }
        }
        Some("Delete") => {
            let id = activity["object"]["id"]
                .as_str()
                .or_else(|| activity["object"].as_str());
            if let Some(id) = id {
                state.statuses.lock().unwrap().remove(id);
            }
        }
        Some("Move") if verified => {
            let state = state.clone();
            let user = name.clone();
            let activity = activity.clone();
            tokio::spawn(async move { follow_move_target(state, user, activity).await });
        }
        _ => {}
    }

    state.received.lock().unwrap().push(Received {
        user: name,
        activity,
        verified,
    });
    StatusCode::ACCEPTED
}

/// Re-follow the Move target when it lists the old actor as an alias
async fn follow_move_target(state: Arc<PeerState>, user: String, activity: Value) {
    let (Some(old), Some(target)) = (activity["object"].as_str(), activity["target"].as_str())
    else {
        return;
    };
    let Ok(response) = state
        .client
        .get(target)
        .header("Accept", ACTIVITY_JSON)
        .send()
        .await
    else {
        return;
    };
    let Ok(document) = response.json::<Value>().await else {
        return;
    };

    let aliases: Vec<&str> = document["alsoKnownAs"]
        .as_array()
        .map(|items| items.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    if !aliases.contains(&old) {
        return;
    }
    let Some(inbox) = document["inbox"].as_str() else {
        return;
    };

    let follow = json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": format!("{}/users/{}#follow-{}", state.base, user, ulid::Ulid::new()),
        "type": "Follow",
        "actor": format!("{}/users/{}", state.base, user),
        "object": target,
    });
    if send_signed(&state, &user, inbox, &follow).await.is_success() {
        state
            .refollows
            .lock()
            .unwrap()
            .push((user, target.to_string()));
    }
}
