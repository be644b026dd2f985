//! Post lifecycle events consumed by the outbox
//!
//! Posts are owned by an external store. The core only sees the fields it
//! needs to render ActivityStreams objects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Public,
    Unlisted,
    Private,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PostStatus {
    #[default]
    Published,
    Draft,
    Scheduled,
}

/// Media attached to a post
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostAttachment {
    pub url: String,
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    /// Path on the canonical host, e.g. "/hello"
    pub path: String,
    pub blog: String,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub status: PostStatus,
    #[serde(default)]
    pub title: Option<String>,
    pub rendered_html: String,
    pub published_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attachments: Vec<PostAttachment>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// URL of the object this post replies to
    #[serde(default)]
    pub reply_to: Option<String>,
    /// Mentioned actors, as IRIs or `@user@host` handles
    #[serde(default)]
    pub mentions: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostEventKind {
    Published,
    Updated,
    Deleted,
    Undeleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostEvent {
    pub kind: PostEventKind,
    pub post: Post,
}

/// Source of post lifecycle events
pub trait PostSource: Send + Sync {
    /// A receiver seeing every event published after this call
    fn subscribe(&self) -> broadcast::Receiver<PostEvent>;
}

/// In-process [`PostSource`] backed by a broadcast channel
#[derive(Debug, Clone)]
pub struct BroadcastPostSource {
    sender: broadcast::Sender<PostEvent>,
}

impl BroadcastPostSource {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event; returns how many listeners received it
    pub fn publish(&self, event: PostEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }
}

impl Default for BroadcastPostSource {
    fn default() -> Self {
        Self::new(256)
    }
}

impl PostSource for BroadcastPostSource {
    fn subscribe(&self) -> broadcast::Receiver<PostEvent> {
        self.sender.subscribe()
    }
}
