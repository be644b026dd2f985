//! Activity delivery
//!
//! Outbound activities are never POSTed inline. They are serialized once,
//! enqueued per target inbox on the `ap-out` topic, and sent by
//! [`DeliveryWorker`] with the attempt counter carried in the payload.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::actor::{ACTIVITY_JSON, key_id_for};
use super::signature::{InstanceKey, sign_request};
use crate::config::DeliveryConfig;
use crate::data::{Database, QueueItem};
use crate::error::AppError;
use crate::metrics::{
    ACTIVITYPUB_ACTIVITIES_QUEUED, ACTIVITYPUB_DELIVERIES_TOTAL, FEDERATION_REQUEST_DURATION_SECONDS,
    FOLLOWERS_TOTAL,
};
use crate::queue::{QueueOutcome, QueueProcessor};

/// Queue topic of outbound ActivityPub deliveries
pub const DELIVERY_TOPIC: &str = "ap-out";

/// Payload of an `ap-out` queue item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRequest {
    pub blog: String,
    /// Actor IRI whose `#main-key` signs the request
    pub key_owner: String,
    pub inbox: String,
    /// Exact bytes to POST
    pub activity: String,
    /// 1 for the first try
    pub attempt: u32,
}

impl DeliveryRequest {
    pub fn encode(&self) -> Result<Vec<u8>, AppError> {
        serde_json::to_vec(self).map_err(|e| AppError::Internal(e.into()))
    }

    pub fn decode(payload: &[u8]) -> Result<Self, AppError> {
        serde_json::from_slice(payload).map_err(AppError::from)
    }
}

/// Deduplicate identical inbox IRIs, keeping first-seen order
pub fn unique_inbox_targets<I>(inboxes: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut seen = HashSet::new();
    inboxes
        .into_iter()
        .filter(|inbox| !inbox.is_empty() && seen.insert(inbox.clone()))
        .collect()
}

/// Enqueues serialized activities for delivery
#[derive(Clone)]
pub struct DeliveryQueue {
    db: Arc<Database>,
}

impl DeliveryQueue {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Enqueue one activity for a set of inboxes; duplicates are dropped.
    ///
    /// Returns the number of queue items created.
    pub async fn enqueue(
        &self,
        blog: &str,
        key_owner: &str,
        inboxes: Vec<String>,
        activity: &serde_json::Value,
    ) -> Result<usize, AppError> {
        let body = serde_json::to_string(activity).map_err(|e| AppError::Internal(e.into()))?;
        let activity_type = activity
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or("Unknown");

        let targets = unique_inbox_targets(inboxes);
        let now = Utc::now();
        for inbox in &targets {
            let request = DeliveryRequest {
                blog: blog.to_string(),
                key_owner: key_owner.to_string(),
                inbox: inbox.clone(),
                activity: body.clone(),
                attempt: 1,
            };
            self.db
                .enqueue(DELIVERY_TOPIC, &request.encode()?, now)
                .await?;
        }

        ACTIVITYPUB_ACTIVITIES_QUEUED
            .with_label_values(&[activity_type])
            .inc_by(targets.len() as u64);
        tracing::debug!(
            %blog,
            activity_type,
            recipients = targets.len(),
            "Queued activity for delivery"
        );
        Ok(targets.len())
    }
}

/// How a delivery attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryClass {
    Delivered,
    /// Transport error, 408, 429 or 5xx
    Transient,
    /// Any other non-2xx status
    Rejected,
}

/// Classify an HTTP status; `None` stands for a transport error
pub fn classify_status(status: Option<reqwest::StatusCode>) -> DeliveryClass {
    match status {
        None => DeliveryClass::Transient,
        Some(status) if status.is_success() => DeliveryClass::Delivered,
        Some(status)
            if status == reqwest::StatusCode::REQUEST_TIMEOUT
                || status == reqwest::StatusCode::TOO_MANY_REQUESTS
                || status.is_server_error() =>
        {
            DeliveryClass::Transient
        }
        Some(_) => DeliveryClass::Rejected,
    }
}

/// Sends `ap-out` items
pub struct DeliveryWorker {
    db: Arc<Database>,
    http_client: reqwest::Client,
    key: Arc<InstanceKey>,
    max_attempts: u32,
    retry_step: chrono::Duration,
    request_timeout: Duration,
}

impl DeliveryWorker {
    pub fn new(
        db: Arc<Database>,
        http_client: reqwest::Client,
        key: Arc<InstanceKey>,
        config: &DeliveryConfig,
    ) -> Self {
        Self {
            db,
            http_client,
            key,
            max_attempts: config.max_attempts,
            retry_step: chrono::Duration::milliseconds(config.retry_step_ms as i64),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        }
    }

    /// Sign and POST one request
    async fn send(&self, request: &DeliveryRequest) -> Result<reqwest::StatusCode, AppError> {
        let body = request.activity.as_bytes();
        let signed = sign_request(
            "POST",
            &request.inbox,
            Some(body),
            &self.key,
            &key_id_for(&request.key_owner),
        )?;

        let mut builder = self
            .http_client
            .post(&request.inbox)
            .timeout(self.request_timeout)
            .header("Content-Type", ACTIVITY_JSON)
            .header("Accept", ACTIVITY_JSON)
            .header("Date", signed.date)
            .header("Signature", signed.signature);
        if let Some(digest) = signed.digest {
            builder = builder.header("Digest", digest);
        }

        let timer = FEDERATION_REQUEST_DURATION_SECONDS
            .with_label_values(&["delivery"])
            .start_timer();
        let response = builder.body(request.activity.clone()).send().await;
        timer.observe_duration();

        Ok(response?.status())
    }

    async fn retire(&self, request: &DeliveryRequest, reason: &str) {
        match self.db.retire_inbox(&request.inbox).await {
            Ok(removed) => {
                tracing::warn!(
                    inbox = %request.inbox,
                    attempt = request.attempt,
                    removed,
                    reason,
                    "Retired inbox"
                );
                if let Ok(total) = self.db.count_all_followers().await {
                    FOLLOWERS_TOTAL.set(total);
                }
            }
            Err(error) => {
                tracing::error!(inbox = %request.inbox, %error, "Failed to retire inbox");
            }
        }
        ACTIVITYPUB_DELIVERIES_TOTAL
            .with_label_values(&["retired"])
            .inc();
    }
}

#[async_trait]
impl QueueProcessor for DeliveryWorker {
    async fn process(&self, item: &QueueItem) -> QueueOutcome {
        let request = match DeliveryRequest::decode(&item.payload) {
            Ok(request) => request,
            Err(error) => {
                tracing::error!(item = item.id, %error, "Dropping undecodable delivery");
                return QueueOutcome::Done;
            }
        };

        let status = match self.send(&request).await {
            Ok(status) => Some(status),
            Err(AppError::HttpClient(error)) => {
                tracing::debug!(inbox = %request.inbox, %error, "Delivery transport error");
                None
            }
            Err(error) => {
                // Signing failures do not get better by retrying.
                tracing::error!(inbox = %request.inbox, %error, "Failed to prepare delivery");
                return QueueOutcome::Done;
            }
        };

        match classify_status(status) {
            DeliveryClass::Delivered => {
                tracing::info!(
                    blog = %request.blog,
                    inbox = %request.inbox,
                    attempt = request.attempt,
                    "Delivered activity"
                );
                ACTIVITYPUB_DELIVERIES_TOTAL
                    .with_label_values(&["delivered"])
                    .inc();
                QueueOutcome::Done
            }
            DeliveryClass::Rejected => {
                let reason = status
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "rejected".to_string());
                self.retire(&request, &reason).await;
                QueueOutcome::Done
            }
            DeliveryClass::Transient => {
                let next_attempt = request.attempt + 1;
                if next_attempt > self.max_attempts {
                    self.retire(&request, "retry budget exhausted").await;
                    return QueueOutcome::Done;
                }

                let delay = self.retry_step * request.attempt as i32;
                let next = DeliveryRequest {
                    attempt: next_attempt,
                    ..request
                };
                let payload = match next.encode() {
                    Ok(payload) => payload,
                    Err(error) => {
                        tracing::error!(%error, "Failed to encode delivery retry");
                        return QueueOutcome::Done;
                    }
                };
                tracing::info!(
                    inbox = %next.inbox,
                    attempt = next.attempt,
                    status = ?status,
                    "Delivery failed, rescheduled"
                );
                ACTIVITYPUB_DELIVERIES_TOTAL
                    .with_label_values(&["rescheduled"])
                    .inc();
                QueueOutcome::Retry {
                    delay,
                    payload: Some(payload),
                }
            }
        }
    }
}
