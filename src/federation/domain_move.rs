//! Identity moves and follower maintenance
//!
//! `move_domain` migrates every blog from a retired host to the canonical
//! host; `move_followers` points one blog at another account. Both persist
//! `movedTo` before the Move activities are queued, so verifiers fetching
//! the old actor always see the pointer.

use std::sync::Arc;

use serde::Serialize;

use super::activity::build_move;
use super::actor::BlogIris;
use super::delivery::DeliveryQueue;
use super::remote::RemoteActors;
use super::webfinger::resolve_webfinger;
use crate::config::{AppConfig, authority_of};
use crate::data::{Database, Follower, moved_to_key};
use crate::error::AppError;
use crate::metrics::FOLLOWERS_TOTAL;

/// Lifecycle of a blog identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum IdentityState {
    Active,
    /// `movedTo` is set and followers are still recorded
    Moving { moved_to: String, followers: i64 },
    /// `movedTo` is set and no follower is left
    Retired { moved_to: String },
}

/// Result of looking up one follower again
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum FollowerStatus {
    Ok,
    Gone,
    Moved { target: String },
    /// Fetch failed for a reason that may go away
    Unreachable { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FollowerCheck {
    pub follower: String,
    pub username: String,
    #[serde(flatten)]
    pub status: FollowerStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MoveReport {
    pub blog: String,
    pub actor: String,
    pub moved_to: String,
    pub deliveries: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RefetchReport {
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
}

/// Operator-side identity management for all blogs
pub struct MoveEngine {
    config: Arc<AppConfig>,
    db: Arc<Database>,
    remote: Arc<RemoteActors>,
    queue: DeliveryQueue,
}

impl MoveEngine {
    pub fn new(
        config: Arc<AppConfig>,
        db: Arc<Database>,
        remote: Arc<RemoteActors>,
        queue: DeliveryQueue,
    ) -> Self {
        Self {
            config,
            db,
            remote,
            queue,
        }
    }

    fn canonical_iris(&self, blog: &str) -> Result<BlogIris, AppError> {
        BlogIris::canonical(&self.config, blog)
            .ok_or_else(|| AppError::InvalidArgument(format!("Unknown blog: {}", blog)))
    }

    /// Move every blog from `old_host` to `new_host`.
    ///
    /// `new_host` must already be the canonical host and `old_host` one of
    /// the alternates, so the old actor stays reachable for verifiers.
    pub async fn move_domain(&self, old_host: &str, new_host: &str) -> Result<Vec<MoveReport>, AppError> {
        let old_host = authority_of(old_host)
            .ok_or_else(|| AppError::InvalidArgument(format!("Invalid host: {}", old_host)))?;
        let new_host = authority_of(new_host)
            .ok_or_else(|| AppError::InvalidArgument(format!("Invalid host: {}", new_host)))?;

        if new_host != self.config.server.canonical_host() {
            return Err(AppError::InvalidArgument(format!(
                "{} is not the canonical host",
                new_host
            )));
        }
        if !self.config.server.is_alternate_host(&old_host) {
            return Err(AppError::InvalidArgument(format!(
                "{} is not configured as an alternate domain",
                old_host
            )));
        }

        let mut reports = Vec::with_capacity(self.config.blogs.len());
        for blog in self.config.blogs.keys() {
            let old = BlogIris::new(&self.config, blog, &old_host)
                .ok_or_else(|| AppError::InvalidArgument(format!("Unknown blog: {}", blog)))?;
            let new = self.canonical_iris(blog)?;
            let deliveries = self.announce_move(&old, &new.actor).await?;
            reports.push(MoveReport {
                blog: blog.clone(),
                actor: old.actor,
                moved_to: new.actor,
                deliveries,
            });
        }

        tracing::info!(from = %old_host, to = %new_host, blogs = reports.len(), "Domain move queued");
        Ok(reports)
    }

    /// Move a blog's followers to another account.
    ///
    /// The target must already list the blog in its `alsoKnownAs`.
    pub async fn move_followers(&self, blog: &str, target: &str) -> Result<MoveReport, AppError> {
        let iris = self.canonical_iris(blog)?;
        let target_actor = self.remote.refresh(target).await?;
        if !target_actor.knows_alias(&iris.actor) {
            return Err(AppError::Unprocessable(format!(
                "{} does not list {} in alsoKnownAs",
                target_actor.id, iris.actor
            )));
        }

        let deliveries = self.announce_move(&iris, &target_actor.id).await?;
        tracing::info!(%blog, target = %target_actor.id, deliveries, "Account move queued");
        Ok(MoveReport {
            blog: blog.to_string(),
            actor: iris.actor,
            moved_to: target_actor.id,
            deliveries,
        })
    }

    /// Persist `movedTo`, then queue the Move for every follower inbox
    async fn announce_move(&self, from: &BlogIris, target: &str) -> Result<usize, AppError> {
        self.db
            .set_setting(&moved_to_key(&from.blog), target)
            .await?;

        let activity = build_move(from, target, vec![from.followers.clone()]);
        let inboxes = self.db.follower_inboxes(&from.blog).await?;
        self.queue
            .enqueue(&from.blog, &from.actor, inboxes, &activity)
            .await
    }

    pub async fn identity_state(&self, blog: &str) -> Result<IdentityState, AppError> {
        self.canonical_iris(blog)?;
        let Some(moved_to) = self.db.get_setting(&moved_to_key(blog)).await? else {
            return Ok(IdentityState::Active);
        };
        let followers = self.db.count_followers(blog).await?;
        Ok(if followers > 0 {
            IdentityState::Moving {
                moved_to,
                followers,
            }
        } else {
            IdentityState::Retired { moved_to }
        })
    }

    /// Add a follower without a Follow activity (e.g. imported from elsewhere)
    pub async fn add_follower_manually(&self, blog: &str, handle_or_iri: &str) -> Result<Follower, AppError> {
        self.canonical_iris(blog)?;
        let handle_or_iri = handle_or_iri.trim();
        let iri = if handle_or_iri.starts_with("https://") || handle_or_iri.starts_with("http://") {
            handle_or_iri.to_string()
        } else {
            resolve_webfinger(handle_or_iri, self.remote.http_client()).await?
        };

        let actor = self.remote.refresh(&iri).await?;
        let follower = Follower {
            blog: blog.to_string(),
            follower: actor.id.clone(),
            inbox: actor.delivery_inbox().to_string(),
            username: actor.handle(),
        };
        self.db.add_follower(&follower).await?;
        self.refresh_follower_gauge().await;
        tracing::info!(%blog, actor = %follower.follower, "Follower added manually");
        Ok(follower)
    }

    /// Refetch every follower and store its current inbox and handle
    pub async fn refetch_followers(&self, blog: &str) -> Result<RefetchReport, AppError> {
        self.canonical_iris(blog)?;
        let mut report = RefetchReport::default();
        for follower in self.db.list_followers(blog).await? {
            let actor = match self.remote.refresh(&follower.follower).await {
                Ok(actor) => actor,
                Err(error) => {
                    tracing::warn!(%blog, follower = %follower.follower, %error, "Follower refetch failed");
                    report.failed += 1;
                    continue;
                }
            };

            let updated = Follower {
                blog: blog.to_string(),
                follower: follower.follower.clone(),
                inbox: actor.delivery_inbox().to_string(),
                username: actor.handle(),
            };
            if updated == follower {
                report.unchanged += 1;
            } else {
                self.db.add_follower(&updated).await?;
                report.updated += 1;
            }
        }

        tracing::info!(%blog, updated = report.updated, failed = report.failed, "Followers refetched");
        Ok(report)
    }

    /// Classify every follower as ok, gone or moved
    pub async fn check_followers(&self, blog: &str) -> Result<Vec<FollowerCheck>, AppError> {
        self.canonical_iris(blog)?;
        let mut checks = Vec::new();
        for follower in self.db.list_followers(blog).await? {
            let status = match self.remote.refresh(&follower.follower).await {
                Ok(actor) => match actor.moved_to {
                    Some(target) => FollowerStatus::Moved { target },
                    None => FollowerStatus::Ok,
                },
                Err(AppError::Permanent(_)) => FollowerStatus::Gone,
                Err(error) => FollowerStatus::Unreachable {
                    error: error.to_string(),
                },
            };
            checks.push(FollowerCheck {
                follower: follower.follower,
                username: follower.username,
                status,
            });
        }
        Ok(checks)
    }

    async fn refresh_follower_gauge(&self) {
        if let Ok(total) = self.db.count_all_followers().await {
            FOLLOWERS_TOTAL.set(total);
        }
    }
}
