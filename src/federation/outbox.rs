//! Outbox fanout
//!
//! Turns post lifecycle events and profile changes into activities and
//! enqueues them for every distinct recipient inbox.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use super::actor::{AS_CONTEXT, AS_PUBLIC, ActorState, BlogIris, actor_document, is_local_url};
use super::delivery::DeliveryQueue;
use super::remote::{RemoteActor, RemoteActors, iri_list};
use super::signature::InstanceKey;
use super::webfinger::{parse_handle, resolve_webfinger};
use crate::config::AppConfig;
use crate::data::{Database, moved_to_key, post_version_key};
use crate::error::AppError;
use crate::posts::{Post, PostEvent, PostEventKind, PostSource, PostStatus, Visibility};

/// New activity id under a blog actor
pub fn new_activity_id(actor: &str) -> String {
    format!("{}#{}", actor, ulid::Ulid::new().to_string().to_lowercase())
}

fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

fn with_version(url: &str, version: &str) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{}{}activitypubversion={}", url, separator, version)
}

/// `(to, cc)` for a post; `None` when the post does not federate
pub fn audience(iris: &BlogIris, visibility: Visibility) -> Option<(Vec<String>, Vec<String>)> {
    match visibility {
        Visibility::Public => Some((vec![AS_PUBLIC.to_string()], vec![iris.followers.clone()])),
        Visibility::Unlisted => Some((vec![iris.followers.clone()], vec![AS_PUBLIC.to_string()])),
        Visibility::Private => None,
    }
}

/// Post fanout and profile updates
pub struct Outbox {
    config: Arc<AppConfig>,
    db: Arc<Database>,
    queue: DeliveryQueue,
    remote: Arc<RemoteActors>,
    key: Arc<InstanceKey>,
}

impl Outbox {
    pub fn new(
        config: Arc<AppConfig>,
        db: Arc<Database>,
        queue: DeliveryQueue,
        remote: Arc<RemoteActors>,
        key: Arc<InstanceKey>,
    ) -> Self {
        Self {
            config,
            db,
            queue,
            remote,
            key,
        }
    }

    fn blog_iris(&self, blog: &str) -> Result<BlogIris, AppError> {
        BlogIris::canonical(&self.config, blog)
            .ok_or_else(|| AppError::Validation(format!("Unknown blog: {}", blog)))
    }

    /// Public URL of a post on the canonical host
    pub fn post_url(&self, post: &Post) -> String {
        format!("{}{}", self.config.server.base_url(), post.path)
    }

    /// Object id: the post URL, versioned once a version was recorded
    pub async fn object_id(&self, post: &Post) -> Result<String, AppError> {
        let url = self.post_url(post);
        Ok(match self.db.get_setting(&post_version_key(&post.path)).await? {
            Some(version) => with_version(&url, &version),
            None => url,
        })
    }

    /// Dispatch one lifecycle event; returns the number of queued deliveries
    pub async fn handle_event(&self, event: &PostEvent) -> Result<usize, AppError> {
        match event.kind {
            PostEventKind::Published => self.send_create(&event.post).await,
            PostEventKind::Updated => self.send_update(&event.post).await,
            PostEventKind::Deleted => self.send_delete(&event.post).await,
            PostEventKind::Undeleted => {
                self.db
                    .set_setting(&post_version_key(&event.post.path), &now_nanos().to_string())
                    .await?;
                self.send_create(&event.post).await
            }
        }
    }

    fn federates(post: &Post) -> bool {
        post.status == PostStatus::Published && post.visibility != Visibility::Private
    }

    pub async fn send_create(&self, post: &Post) -> Result<usize, AppError> {
        if !Self::federates(post) {
            return Ok(0);
        }
        let iris = self.blog_iris(&post.blog)?;
        let mentions = self.resolve_mentions(post).await;
        let object = self.post_object(&iris, post, &mentions).await?;

        let activity = json!({
            "@context": [AS_CONTEXT],
            "id": new_activity_id(&iris.actor),
            "type": "Create",
            "actor": iris.actor,
            "published": object["published"],
            "to": object["to"],
            "cc": object["cc"],
            "object": object,
        });

        let inboxes = self.recipients(&iris, post, &mentions).await?;
        self.queue
            .enqueue(&iris.blog, &iris.actor, inboxes, &activity)
            .await
    }

    pub async fn send_update(&self, post: &Post) -> Result<usize, AppError> {
        if !Self::federates(post) {
            return Ok(0);
        }
        let iris = self.blog_iris(&post.blog)?;
        let mentions = self.resolve_mentions(post).await;
        let mut object = self.post_object(&iris, post, &mentions).await?;
        let now = Utc::now();
        object["updated"] = json!(now.to_rfc3339_opts(SecondsFormat::Secs, true));

        let activity = json!({
            "@context": [AS_CONTEXT],
            "id": with_version(&self.post_url(post), &now_nanos().to_string()),
            "type": "Update",
            "actor": iris.actor,
            "published": object["updated"],
            "to": object["to"],
            "cc": object["cc"],
            "object": object,
        });

        let inboxes = self.recipients(&iris, post, &mentions).await?;
        self.queue
            .enqueue(&iris.blog, &iris.actor, inboxes, &activity)
            .await
    }

    pub async fn send_delete(&self, post: &Post) -> Result<usize, AppError> {
        if post.visibility == Visibility::Private {
            return Ok(0);
        }
        let iris = self.blog_iris(&post.blog)?;
        let (to, cc) = audience(&iris, post.visibility).unwrap_or_default();

        let activity = json!({
            "@context": [AS_CONTEXT],
            "id": new_activity_id(&iris.actor),
            "type": "Delete",
            "actor": iris.actor,
            "to": to,
            "cc": cc,
            "object": {
                "id": self.object_id(post).await?,
                "type": "Tombstone",
            },
        });

        let mentions = self.resolve_mentions(post).await;
        let inboxes = self.recipients(&iris, post, &mentions).await?;
        self.queue
            .enqueue(&iris.blog, &iris.actor, inboxes, &activity)
            .await
    }

    /// The Note/Article representing a post
    pub async fn post_object(
        &self,
        iris: &BlogIris,
        post: &Post,
        mentions: &[RemoteActor],
    ) -> Result<serde_json::Value, AppError> {
        let (to, mut cc) = audience(iris, post.visibility).unwrap_or_default();
        cc.extend(mentions.iter().map(|actor| actor.id.clone()));

        let object_type = if post.title.as_deref().is_some_and(|t| !t.is_empty()) {
            "Article"
        } else {
            "Note"
        };

        let blog_base = iris.actor.trim_end_matches('/');
        let mut tags: Vec<serde_json::Value> = post
            .tags
            .iter()
            .map(|tag| {
                json!({
                    "type": "Hashtag",
                    "name": format!("#{}", tag.trim_start_matches('#')),
                    "href": format!("{}/tags/{}", blog_base, urlencoding::encode(tag.trim_start_matches('#'))),
                })
            })
            .collect();
        tags.extend(mentions.iter().map(|actor| {
            json!({
                "type": "Mention",
                "href": actor.id,
                "name": actor.handle(),
            })
        }));

        let attachments: Vec<serde_json::Value> = post
            .attachments
            .iter()
            .map(|attachment| {
                let mut value = json!({
                    "type": "Document",
                    "url": attachment.url,
                    "mediaType": attachment.media_type.as_deref().unwrap_or("image/jpeg"),
                });
                if let Some(description) = &attachment.description {
                    value["name"] = json!(description);
                }
                if attachment
                    .media_type
                    .as_deref()
                    .is_none_or(|t| t.starts_with("image/"))
                {
                    value["type"] = json!("Image");
                }
                value
            })
            .collect();

        let mut object = json!({
            "id": self.object_id(post).await?,
            "type": object_type,
            "attributedTo": iris.actor,
            "content": post.rendered_html,
            "mediaType": "text/html",
            "url": self.post_url(post),
            "published": post.published_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            "to": to,
            "cc": cc,
            "tag": tags,
            "attachment": attachments,
        });

        if object_type == "Article" {
            object["name"] = json!(post.title);
        }
        if let Some(updated) = post.updated_at {
            object["updated"] = json!(updated.to_rfc3339_opts(SecondsFormat::Secs, true));
        }
        if let Some(reply_to) = &post.reply_to {
            object["inReplyTo"] = json!(reply_to);
        }

        Ok(object)
    }

    /// Resolve mentions to actors; unresolvable ones are skipped
    async fn resolve_mentions(&self, post: &Post) -> Vec<RemoteActor> {
        let mut actors = Vec::new();
        for mention in &post.mentions {
            let iri = if parse_handle(mention).is_some() {
                match resolve_webfinger(mention, self.remote.http_client()).await {
                    Ok(iri) => iri,
                    Err(error) => {
                        tracing::warn!(%mention, %error, "Failed to resolve mention");
                        continue;
                    }
                }
            } else {
                mention.clone()
            };

            if is_local_url(&self.config, &iri) {
                continue;
            }
            match self.remote.get(&iri).await {
                Ok(actor) => actors.push(actor),
                Err(error) => tracing::warn!(%mention, %error, "Failed to fetch mentioned actor"),
            }
        }
        actors
    }

    /// Author of a remote object this post replies to
    async fn reply_to_actor(&self, reply_to: &str) -> Option<RemoteActor> {
        if is_local_url(&self.config, reply_to) {
            return None;
        }
        let object = match self.remote.fetch_object(reply_to).await {
            Ok(object) => object,
            Err(error) => {
                tracing::debug!(%reply_to, %error, "Failed to fetch replied-to object");
                return None;
            }
        };
        let author = iri_list(object.get("attributedTo"))
            .into_iter()
            .next()
            .or_else(|| object.get("actor").and_then(|a| a.as_str()).map(str::to_string))?;
        self.remote.get(&author).await.ok()
    }

    /// Follower inboxes plus mentioned and replied-to actors, deduplicated downstream
    async fn recipients(
        &self,
        iris: &BlogIris,
        post: &Post,
        mentions: &[RemoteActor],
    ) -> Result<Vec<String>, AppError> {
        let mut inboxes = self.db.follower_inboxes(&iris.blog).await?;
        inboxes.extend(mentions.iter().map(|actor| actor.delivery_inbox().to_string()));
        if let Some(reply_to) = &post.reply_to {
            if let Some(actor) = self.reply_to_actor(reply_to).await {
                inboxes.push(actor.delivery_inbox().to_string());
            }
        }
        Ok(inboxes)
    }

    /// Send `Update{Person}` for one blog to all of its followers
    pub async fn send_profile_update(&self, blog: &str) -> Result<usize, AppError> {
        let iris = self.blog_iris(blog)?;
        let moved_to = self.db.get_setting(&moved_to_key(blog)).await?;
        let actor = actor_document(
            &self.config,
            &iris,
            &ActorState {
                public_key_pem: self.key.public_key_pem(),
                moved_to: moved_to.as_deref(),
            },
        );

        let activity = json!({
            "@context": [AS_CONTEXT],
            "id": new_activity_id(&iris.actor),
            "type": "Update",
            "actor": iris.actor,
            "published": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            "to": [AS_PUBLIC, iris.followers],
            "object": actor,
        });

        let inboxes = self.db.follower_inboxes(blog).await?;
        self.queue
            .enqueue(&iris.blog, &iris.actor, inboxes, &activity)
            .await
    }

    /// Profile updates for every blog
    pub async fn send_profile_updates(&self) -> Result<usize, AppError> {
        let mut total = 0;
        for blog in self.config.blogs.keys() {
            total += self.send_profile_update(blog).await?;
        }
        tracing::info!(deliveries = total, "Queued profile updates");
        Ok(total)
    }
}

/// Feed post lifecycle events into the outbox until shutdown
pub async fn run_post_listener(
    outbox: Arc<Outbox>,
    source: Arc<dyn PostSource>,
    shutdown: CancellationToken,
) {
    let mut receiver = source.subscribe();
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = receiver.recv() => event,
        };

        match event {
            Ok(event) => match outbox.handle_event(&event).await {
                Ok(queued) => tracing::info!(
                    path = %event.post.path,
                    kind = ?event.kind,
                    queued,
                    "Post fanout queued"
                ),
                Err(error) => tracing::error!(
                    path = %event.post.path,
                    kind = ?event.kind,
                    %error,
                    "Post fanout failed"
                ),
            },
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Post listener lagged behind");
            }
            Err(RecvError::Closed) => break,
        }
    }
    tracing::info!("Post listener stopped");
}
