//! Outbound collaborator interfaces for inbox side effects

use async_trait::async_trait;

/// Operator-visible notifications ("alice started following")
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn emit(&self, text: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractionKind {
    Like,
    Announce,
    Reply,
    /// The remote object behind an earlier interaction was deleted
    Delete,
}

impl InteractionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionKind::Like => "like",
            InteractionKind::Announce => "announce",
            InteractionKind::Reply => "reply",
            InteractionKind::Delete => "delete",
        }
    }
}

/// Receives interactions with local posts, e.g. to store them as comments
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InteractionSink: Send + Sync {
    /// `source` is the remote object, `target` the local URL
    async fn on_inbound(
        &self,
        kind: InteractionKind,
        source: &str,
        target: &str,
        author: &str,
        content: &str,
    );
}

/// Writes notifications to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotificationSink;

#[async_trait]
impl NotificationSink for TracingNotificationSink {
    async fn emit(&self, text: &str) {
        tracing::info!(notification = %text, "Notification");
    }
}

/// Writes interactions to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingInteractionSink;

#[async_trait]
impl InteractionSink for TracingInteractionSink {
    async fn on_inbound(
        &self,
        kind: InteractionKind,
        source: &str,
        target: &str,
        author: &str,
        _content: &str,
    ) {
        tracing::info!(
            kind = kind.as_str(),
            %source,
            %target,
            %author,
            "Inbound interaction"
        );
    }
}
