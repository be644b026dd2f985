//! Activity processing
//!
//! Handles activities POSTed to a blog inbox. The signer is authenticated
//! first; everything that needs to go back out is enqueued, never sent inline.

use std::sync::Arc;

use serde_json::json;

use super::actor::{AS_CONTEXT, BlogIris, find_local_actor, is_blog_iri, is_local_url};
use super::delivery::DeliveryQueue;
use super::outbox::new_activity_id;
use super::remote::{RemoteActor, RemoteActors, iri_list};
use super::signature::{extract_signature_key_id, key_owner, verify_signature};
use crate::config::AppConfig;
use crate::data::{Database, Follower, moved_to_key};
use crate::error::AppError;
use crate::metrics::{ACTIVITYPUB_ACTIVITIES_RECEIVED, FOLLOWERS_TOTAL};
use crate::sinks::{InteractionKind, InteractionSink, NotificationSink};

/// ActivityPub Activity types handled by the inbox
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityType {
    Create,
    Update,
    Delete,
    Follow,
    Undo,
    Like,
    Announce,
    Block,
    Move,
}

impl ActivityType {
    /// Parse activity type from string
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Create" => Some(Self::Create),
            "Update" => Some(Self::Update),
            "Delete" => Some(Self::Delete),
            "Follow" => Some(Self::Follow),
            "Undo" => Some(Self::Undo),
            "Like" => Some(Self::Like),
            "Announce" => Some(Self::Announce),
            "Block" => Some(Self::Block),
            "Move" => Some(Self::Move),
            _ => None,
        }
    }
}

const ACTOR_TYPES: [&str; 5] = ["Person", "Service", "Application", "Group", "Organization"];

/// `id` of a value that is either a link or an object
fn link_of(value: Option<&serde_json::Value>) -> Option<String> {
    let value = value?;
    value
        .as_str()
        .or_else(|| value.get("id").and_then(|id| id.as_str()))
        .map(str::to_string)
}

fn type_of(value: &serde_json::Value) -> Option<&str> {
    value.get("type").and_then(|t| t.as_str())
}

fn is_public_address(iri: &str) -> bool {
    matches!(
        iri,
        super::actor::AS_PUBLIC | "as:Public" | "Public"
    )
}

/// Plain text of remote HTML
pub fn clean_html_text(html: &str) -> String {
    let stripped = ammonia::Builder::empty().clean(html).to_string();
    html_escape::decode_html_entities(&stripped).trim().to_string()
}

/// A request to a blog inbox, as received
pub struct InboxRequest<'a> {
    pub blog: &'a str,
    pub method: &'a str,
    pub path_and_query: &'a str,
    pub headers: &'a http::HeaderMap,
    pub body: &'a [u8],
}

/// Activity processor
///
/// Processes incoming ActivityPub activities from inbox.
pub struct ActivityProcessor {
    config: Arc<AppConfig>,
    db: Arc<Database>,
    remote: Arc<RemoteActors>,
    queue: DeliveryQueue,
    notifications: Arc<dyn NotificationSink>,
    interactions: Arc<dyn InteractionSink>,
}

impl ActivityProcessor {
    pub fn new(
        config: Arc<AppConfig>,
        db: Arc<Database>,
        remote: Arc<RemoteActors>,
        queue: DeliveryQueue,
        notifications: Arc<dyn NotificationSink>,
        interactions: Arc<dyn InteractionSink>,
    ) -> Self {
        Self {
            config,
            db,
            remote,
            queue,
            notifications,
            interactions,
        }
    }

    /// Authenticate, parse and process one inbox request
    ///
    /// # Errors
    /// - `NotFound` for an unknown blog
    /// - `InvalidSignature` when the signature does not verify
    /// - `Validation` for a malformed activity
    /// - `Forbidden` when the signer is not the activity actor
    pub async fn handle_inbox(&self, request: InboxRequest<'_>) -> Result<(), AppError> {
        if self.config.blog(request.blog).is_none() {
            return Err(AppError::NotFound);
        }

        let signer = match self.verify_signer(&request).await {
            Ok(signer) => signer,
            Err(AppError::Permanent(reason)) => {
                return self.handle_gone_signer(&request, &reason).await;
            }
            Err(error) => return Err(error),
        };

        let activity: serde_json::Value = serde_json::from_slice(request.body)?;
        self.process(request.blog, activity, &signer).await
    }

    /// Verify the HTTP signature and return the signing actor.
    ///
    /// A failed verification is retried once with a freshly fetched key.
    pub async fn verify_signer(&self, request: &InboxRequest<'_>) -> Result<RemoteActor, AppError> {
        let key_id = extract_signature_key_id(request.headers)?;

        let mut fresh = false;
        loop {
            let (actor, pem) = match self.remote.public_key(&key_id, fresh).await {
                Ok(found) => found,
                Err(error @ (AppError::Permanent(_) | AppError::InvalidSignature(_))) => {
                    return Err(error);
                }
                Err(error) => {
                    return Err(AppError::InvalidSignature(format!(
                        "Failed to fetch signer key: {}",
                        error
                    )));
                }
            };

            match verify_signature(
                request.method,
                request.path_and_query,
                request.headers,
                Some(request.body),
                &pem,
            ) {
                Ok(()) => return Ok(actor),
                Err(error) if fresh => return Err(error),
                Err(error) => {
                    tracing::debug!(%key_id, %error, "Signature failed with cached key, refetching");
                    fresh = true;
                }
            }
        }
    }

    /// The signer's actor document is gone (404/410).
    ///
    /// Only a self-Delete can be honoured: the actor no longer exists, so its
    /// follower rows are dropped without verifying.
    async fn handle_gone_signer(&self, request: &InboxRequest<'_>, reason: &str) -> Result<(), AppError> {
        let key_id = extract_signature_key_id(request.headers)?;
        let owner = key_owner(&key_id);
        let activity: serde_json::Value = serde_json::from_slice(request.body)
            .map_err(|_| AppError::InvalidSignature(reason.to_string()))?;

        let actor = link_of(activity.get("actor"));
        let object = link_of(activity.get("object"));
        if type_of(&activity) == Some("Delete")
            && actor.as_deref() == Some(owner)
            && object.as_deref() == Some(owner)
        {
            let removed = self.db.remove_follower_everywhere(owner).await?;
            tracing::info!(actor = %owner, removed, "Removed deleted actor");
            self.refresh_follower_gauge().await;
            return Ok(());
        }

        Err(AppError::InvalidSignature(reason.to_string()))
    }

    /// Process an activity from an authenticated signer
    pub async fn process(
        &self,
        blog: &str,
        activity: serde_json::Value,
        signer: &RemoteActor,
    ) -> Result<(), AppError> {
        let type_name = type_of(&activity)
            .ok_or_else(|| AppError::Validation("Missing activity type".to_string()))?
            .to_string();
        let actor = link_of(activity.get("actor"))
            .ok_or_else(|| AppError::Validation("Missing activity actor".to_string()))?;

        if actor != signer.id {
            return Err(AppError::Forbidden);
        }

        ACTIVITYPUB_ACTIVITIES_RECEIVED
            .with_label_values(&[type_name.as_str()])
            .inc();

        let Some(activity_type) = ActivityType::parse(&type_name) else {
            tracing::debug!(%blog, activity_type = %type_name, "Ignoring unsupported activity");
            return Ok(());
        };

        match activity_type {
            ActivityType::Follow => self.handle_follow(blog, &activity, signer).await,
            ActivityType::Undo => self.handle_undo(blog, &activity, signer).await,
            ActivityType::Create | ActivityType::Update => {
                self.handle_create_update(blog, activity_type, &activity, signer)
                    .await
            }
            ActivityType::Delete | ActivityType::Block => {
                self.handle_delete_block(blog, activity_type, &activity, signer)
                    .await
            }
            ActivityType::Like => {
                self.handle_like_announce(InteractionKind::Like, &activity, signer)
                    .await
            }
            ActivityType::Announce => {
                self.handle_like_announce(InteractionKind::Announce, &activity, signer)
                    .await
            }
            ActivityType::Move => self.handle_move(blog, &activity, signer).await,
        }
    }

    async fn refresh_follower_gauge(&self) {
        if let Ok(total) = self.db.count_all_followers().await {
            FOLLOWERS_TOTAL.set(total);
        }
    }

    /// Emit a notification once per `(actor, kind, object)`
    async fn notify_once(&self, actor: &str, kind: &str, object: &str, text: &str) -> Result<bool, AppError> {
        if self.db.record_notification(actor, kind, object).await? {
            self.notifications.emit(text).await;
            return Ok(true);
        }
        Ok(false)
    }

    /// Handle Follow activity
    async fn handle_follow(
        &self,
        blog: &str,
        activity: &serde_json::Value,
        signer: &RemoteActor,
    ) -> Result<(), AppError> {
        let target = link_of(activity.get("object"))
            .ok_or_else(|| AppError::Validation("Missing object in Follow".to_string()))?;
        if !is_blog_iri(&self.config, blog, &target) {
            return Err(AppError::Validation(
                "Follow target is not this blog".to_string(),
            ));
        }
        // The followed identity decides which actor answers (old host after a move).
        let followed = find_local_actor(&self.config, &target)
            .filter(|iris| iris.blog == blog)
            .ok_or_else(|| AppError::Validation("Follow target is not this blog".to_string()))?;

        let inbox = signer.delivery_inbox().to_string();
        let username = signer.handle();
        self.db
            .add_follower(&Follower {
                blog: blog.to_string(),
                follower: signer.id.clone(),
                inbox: inbox.clone(),
                username: username.clone(),
            })
            .await?;
        self.refresh_follower_gauge().await;
        tracing::info!(%blog, actor = %signer.id, %inbox, "New follower");

        let accept = json!({
            "@context": [AS_CONTEXT],
            "id": new_activity_id(&followed.actor),
            "type": "Accept",
            "actor": followed.actor,
            "to": [signer.id],
            "object": activity,
        });
        self.queue
            .enqueue(blog, &followed.actor, vec![inbox.clone()], &accept)
            .await?;

        if let Some(moved_to) = self.db.get_setting(&moved_to_key(blog)).await? {
            if moved_to.trim_end_matches('/') != followed.actor.trim_end_matches('/') {
                let moved = build_move(&followed, &moved_to, vec![signer.id.clone()]);
                self.queue
                    .enqueue(blog, &followed.actor, vec![inbox], &moved)
                    .await?;
            }
        }

        let link = signer.url.as_deref().unwrap_or(&signer.id);
        self.notify_once(
            &signer.id,
            "Follow",
            &followed.actor,
            &format!("{} ({}) started following {}", username, link, followed.actor),
        )
        .await?;
        Ok(())
    }

    /// Handle Undo activity; only Undo{Follow} changes state
    async fn handle_undo(
        &self,
        blog: &str,
        activity: &serde_json::Value,
        signer: &RemoteActor,
    ) -> Result<(), AppError> {
        let Some(object) = activity.get("object").filter(|o| o.is_object()) else {
            return Ok(());
        };
        if type_of(object) != Some("Follow") {
            return Ok(());
        }
        if link_of(object.get("actor")).as_deref() != Some(signer.id.as_str()) {
            return Ok(());
        }
        if let Some(target) = link_of(object.get("object")) {
            if !is_blog_iri(&self.config, blog, &target) {
                return Ok(());
            }
        }

        if self.db.remove_follower(blog, &signer.id).await? {
            tracing::info!(%blog, actor = %signer.id, "Follower unfollowed");
            self.refresh_follower_gauge().await;
        }
        Ok(())
    }

    async fn handle_delete_block(
        &self,
        blog: &str,
        activity_type: ActivityType,
        activity: &serde_json::Value,
        signer: &RemoteActor,
    ) -> Result<(), AppError> {
        let Some(object) = link_of(activity.get("object")) else {
            return Err(AppError::Validation("Missing object".to_string()));
        };

        let self_delete = activity_type == ActivityType::Delete && object == signer.id;
        let blocks_blog = activity_type == ActivityType::Block && is_blog_iri(&self.config, blog, &object);

        if self_delete || blocks_blog {
            let retired = self.db.retire_inbox(&signer.inbox).await?;
            let removed = if self_delete {
                self.db.remove_follower_everywhere(&signer.id).await?
            } else {
                u64::from(self.db.remove_follower(blog, &signer.id).await?)
            };
            tracing::info!(
                %blog,
                actor = %signer.id,
                activity_type = ?activity_type,
                retired,
                removed,
                "Follower got deleted or blocked"
            );
            self.refresh_follower_gauge().await;
            return Ok(());
        }

        if activity_type == ActivityType::Delete {
            self.interactions
                .on_inbound(InteractionKind::Delete, &object, "", &signer.id, "")
                .await;
        }
        Ok(())
    }

    async fn handle_like_announce(
        &self,
        kind: InteractionKind,
        activity: &serde_json::Value,
        signer: &RemoteActor,
    ) -> Result<(), AppError> {
        let Some(target) = link_of(activity.get("object")) else {
            return Ok(());
        };
        if !is_local_url(&self.config, &target) {
            return Ok(());
        }

        let verb = match kind {
            InteractionKind::Like => "liked",
            _ => "announced",
        };
        let kind_name = match kind {
            InteractionKind::Like => "Like",
            _ => "Announce",
        };
        let text = format!("{} {} {}", signer.handle(), verb, target);
        if self.notify_once(&signer.id, kind_name, &target, &text).await? {
            let source = link_of(activity.get("id")).unwrap_or_else(|| signer.id.clone());
            self.interactions
                .on_inbound(kind, &source, &target, &signer.id, "")
                .await;
        }
        Ok(())
    }

    async fn handle_create_update(
        &self,
        blog: &str,
        activity_type: ActivityType,
        activity: &serde_json::Value,
        signer: &RemoteActor,
    ) -> Result<(), AppError> {
        let Some(object) = activity.get("object").filter(|o| o.is_object()) else {
            return Ok(());
        };

        match type_of(object) {
            Some("Note") | Some("Article") => {}
            Some(t) if activity_type == ActivityType::Update && ACTOR_TYPES.contains(&t) => {
                self.remote.invalidate(&signer.id).await;
                return Ok(());
            }
            _ => return Ok(()),
        }

        let note_id = link_of(Some(object)).unwrap_or_default();
        let author = signer
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| signer.handle());
        let author_link = signer.url.clone().unwrap_or_else(|| signer.id.clone());
        let content = object
            .get("content")
            .and_then(|c| c.as_str())
            .map(clean_html_text)
            .unwrap_or_default();

        let mut audience = iri_list(object.get("to"));
        audience.extend(iri_list(object.get("cc")));

        if let Some(reply_target) = link_of(object.get("inReplyTo")) {
            if is_local_url(&self.config, &reply_target) {
                if audience.iter().any(|iri| is_public_address(iri)) {
                    self.interactions
                        .on_inbound(
                            InteractionKind::Reply,
                            &note_id,
                            &reply_target,
                            &author,
                            &content,
                        )
                        .await;
                } else {
                    let text = format!(
                        "New private ActivityPub reply to {} from {}\nAuthor: {} ({})\n\n{}",
                        reply_target, note_id, author, author_link, content
                    );
                    self.notify_once(&signer.id, "PrivateReply", &note_id, &text)
                        .await?;
                }
                return Ok(());
            }
        }

        let mut mentioned = audience;
        if let Some(tags) = object.get("tag").and_then(|t| t.as_array()) {
            mentioned.extend(
                tags.iter()
                    .filter(|tag| type_of(tag) == Some("Mention"))
                    .filter_map(|tag| tag.get("href").and_then(|h| h.as_str()))
                    .map(str::to_string),
            );
        }
        if mentioned.iter().any(|iri| is_blog_iri(&self.config, blog, iri)) {
            let text = format!(
                "New ActivityPub mention on {}\nAuthor: {} ({})\n\n{}",
                note_id, author, author_link, content
            );
            self.notify_once(&signer.id, "Mention", &note_id, &text)
                .await?;
        }
        Ok(())
    }

    /// Move of a follower to a new account
    async fn handle_move(
        &self,
        blog: &str,
        activity: &serde_json::Value,
        signer: &RemoteActor,
    ) -> Result<(), AppError> {
        let object = link_of(activity.get("object"));
        if object.as_deref().is_some_and(|o| o != signer.id) {
            return Err(AppError::Forbidden);
        }
        let target = link_of(activity.get("target"))
            .ok_or_else(|| AppError::Validation("Move without target".to_string()))?;

        let Some(existing) = self.db.get_follower(blog, &signer.id).await? else {
            tracing::debug!(%blog, actor = %signer.id, "Ignoring Move from non-follower");
            return Ok(());
        };

        let new_actor = self.remote.refresh(&target).await?;
        if !new_actor.knows_alias(&signer.id) {
            tracing::warn!(
                %blog,
                actor = %signer.id,
                target = %target,
                "Ignoring Move: target does not list the old actor in alsoKnownAs"
            );
            return Ok(());
        }

        let replacement = Follower {
            blog: blog.to_string(),
            follower: new_actor.id.clone(),
            inbox: new_actor.delivery_inbox().to_string(),
            username: new_actor.handle(),
        };
        self.db
            .replace_follower(blog, &existing.follower, &replacement)
            .await?;
        tracing::info!(%blog, from = %signer.id, to = %new_actor.id, "Follower moved");

        self.notify_once(
            &signer.id,
            "Move",
            &new_actor.id,
            &format!("{} moved to {}", existing.username, replacement.username),
        )
        .await?;
        Ok(())
    }
}

/// `Move` of a local identity to `target`
pub fn build_move(from: &BlogIris, target: &str, to: Vec<String>) -> serde_json::Value {
    json!({
        "@context": [AS_CONTEXT],
        "id": format!(
            "{}#move-{}-{}",
            from.actor,
            from.blog,
            chrono::Utc::now().format("%Y%m%d%H%M%S")
        ),
        "type": "Move",
        "actor": from.actor,
        "object": from.actor,
        "target": target,
        "to": to,
        "published": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
    })
}
