//! Inbound webhook events from the remote directory.
//!
//! # Envelope
//!
//! ```json
//! {
//!   "event_type": "contact_updated",
//!   "organization_id": "20071234",
//!   "contact_id": "460000000026049",
//!   "event_id": "evt-1",
//!   "data": { "contact": { "contact_id": "460000000026049", ... } }
//! }
//! ```
//!
//! `event_type` accepts `created`, `updated`, `deleted`, with or without a
//! `contact_` prefix. `contact_id` may instead sit at `data.contact.contact_id`
//! or `data.contact_id`. A missing `event_id` is derived from a hash of the
//! whole envelope, so redelivery of an identical body is still recognized.
//!
//! # Delivery
//!
//! [`SyncEngine::enqueue_webhook`] hands events to one worker task per
//! organization. Workers apply events in the order received, retry transient
//! failures a bounded number of times, and drop the event with a warning
//! after that; the next full sync re-pulls the authoritative state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use contact_mirror_core::{Contact, UpsertOutcome};
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::remote::RemoteError;
use crate::sync::SyncEngine;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex HMAC-SHA256 of the raw body.
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookKind {
    Created,
    Updated,
    Deleted,
}

impl WebhookKind {
    fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim().to_ascii_lowercase();
        match raw.strip_prefix("contact_").unwrap_or(&raw) {
            "created" | "create" => Some(WebhookKind::Created),
            "updated" | "update" => Some(WebhookKind::Updated),
            "deleted" | "delete" => Some(WebhookKind::Deleted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub kind: WebhookKind,
    pub organization_id: String,
    pub contact_id: String,
    pub event_id: String,
    pub data: Value,
    pub received_at: DateTime<Utc>,
}

impl WebhookEvent {
    pub fn parse(raw: &Value) -> Result<Self, SyncError> {
        let obj = raw
            .as_object()
            .ok_or_else(|| SyncError::invalid_webhook("body is not a JSON object"))?;

        let kind_raw = text(obj.get("event_type"))
            .ok_or_else(|| SyncError::invalid_webhook("missing event_type"))?;
        let kind = WebhookKind::parse(&kind_raw).ok_or_else(|| {
            SyncError::invalid_webhook(format!("unsupported event_type '{}'", kind_raw))
        })?;

        let organization_id = text(obj.get("organization_id"))
            .ok_or_else(|| SyncError::invalid_webhook("missing organization_id"))?;

        let data = obj.get("data").cloned().unwrap_or(Value::Null);
        let contact_id = text(obj.get("contact_id"))
            .or_else(|| text(data.get("contact").and_then(|c| c.get("contact_id"))))
            .or_else(|| text(data.get("contact_id")))
            .ok_or_else(|| SyncError::invalid_webhook("missing contact_id"))?;

        let event_id = text(obj.get("event_id")).unwrap_or_else(|| derive_event_id(raw));

        Ok(Self {
            kind,
            organization_id,
            contact_id,
            event_id,
            data,
            received_at: Utc::now(),
        })
    }

    /// Full contact record carried by the event, if any.
    pub fn embedded_contact(&self) -> Option<&Value> {
        let candidate = match self.data.get("contact") {
            Some(c) => c,
            None => &self.data,
        };
        let id = candidate.get("contact_id").and_then(|v| v.as_str())?;
        (candidate.is_object() && id == self.contact_id).then_some(candidate)
    }
}

fn text(v: Option<&Value>) -> Option<String> {
    match v? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn derive_event_id(raw: &Value) -> String {
    let digest = Sha256::digest(raw.to_string().as_bytes());
    format!("body:{}", hex::encode(&digest[..16]))
}

/// Check the hex HMAC-SHA256 of `body` under `secret`.
pub fn verify_signature(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    let Ok(expected) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Hex HMAC-SHA256 of `body`, as a sender would compute it.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Upserted { outcome: UpsertOutcome },
    Removed { existed: bool },
    /// `(contact_id, event_id)` was applied before.
    Duplicate,
}

/// Per-organization FIFO queues and the count of events not yet finished.
#[derive(Debug, Default)]
pub(crate) struct WebhookQueues {
    senders: Mutex<HashMap<String, mpsc::UnboundedSender<WebhookEvent>>>,
    pending: AtomicUsize,
    idle: Notify,
}

impl WebhookQueues {
    pub fn close(&self) {
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn finish_one(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

impl SyncEngine {
    /// Parse and queue a webhook for its organization's worker.
    ///
    /// Returns the parsed event once queued; application happens
    /// asynchronously.
    pub fn enqueue_webhook(self: &Arc<Self>, raw: &Value) -> Result<WebhookEvent, SyncError> {
        self.ensure_running()?;
        let event = WebhookEvent::parse(raw)?;
        let queues = &self.webhooks;

        let org = event.organization_id.clone();
        let mut senders = queues
            .senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let sender = senders
            .entry(org.clone())
            .or_insert_with(|| self.spawn_webhook_worker(&org));

        queues.pending.fetch_add(1, Ordering::AcqRel);
        if let Err(mpsc::error::SendError(returned)) = sender.send(event.clone()) {
            // The worker exited; replace it and retry once.
            let fresh = self.spawn_webhook_worker(&org);
            let resend = fresh.send(returned);
            senders.insert(org, fresh);
            if resend.is_err() {
                queues.finish_one();
                return Err(SyncError::ShuttingDown);
            }
        }
        debug!(
            organization_id = %event.organization_id,
            contact_id = %event.contact_id,
            event_id = %event.event_id,
            "webhook queued"
        );
        Ok(event)
    }

    /// Resolves once every queued webhook has been applied or dropped.
    pub async fn wait_webhooks_idle(&self) {
        loop {
            let notified = self.webhooks.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.webhooks.pending.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn pending_webhooks(&self) -> usize {
        self.webhooks.pending.load(Ordering::Acquire)
    }

    /// Parse and apply one webhook immediately, in the caller's task.
    pub async fn apply_webhook(&self, raw: &Value) -> Result<WebhookOutcome, SyncError> {
        let event = WebhookEvent::parse(raw)?;
        self.apply_webhook_event(&event).await
    }

    /// Apply a parsed event. Idempotent per `(contact_id, event_id)`; an
    /// event older than the cached revision leaves the cache unchanged.
    pub async fn apply_webhook_event(
        &self,
        event: &WebhookEvent,
    ) -> Result<WebhookOutcome, SyncError> {
        let org = event.organization_id.as_str();
        let lane = self.lanes.get(org);
        if lane.has_applied(&event.contact_id, &event.event_id) {
            return Ok(WebhookOutcome::Duplicate);
        }
        self.cache.register_organization(org);

        // Fetched outside the writer lane; only the write is serialized.
        let fetched = match event.kind {
            WebhookKind::Deleted => None,
            WebhookKind::Created | WebhookKind::Updated => match event.embedded_contact() {
                Some(record) => Some((record.clone(), event.received_at, event.received_at)),
                None => {
                    let requested_at = Utc::now();
                    let result = self
                        .retry
                        .run("get_contact", || self.client.get_contact(org, &event.contact_id))
                        .await;
                    match result {
                        Ok(record) => Some((record, requested_at, Utc::now())),
                        // Gone remotely by the time we asked.
                        Err(RemoteError::NotFound(_)) => None,
                        Err(e) => return Err(e.into()),
                    }
                }
            },
        };

        let contact = match &fetched {
            Some((record, read_at, observed_at)) => {
                let contact =
                    Contact::from_remote_record(org, record)?.with_last_synced_at(*observed_at);
                if contact.contact_id() != event.contact_id {
                    return Err(SyncError::invalid_webhook(format!(
                        "event for {} carries contact {}",
                        event.contact_id,
                        contact.contact_id()
                    )));
                }
                Some((contact, *read_at))
            }
            None => None,
        };

        let _writer = lane.writer.lock().await;
        if lane.has_applied(&event.contact_id, &event.event_id) {
            return Ok(WebhookOutcome::Duplicate);
        }
        let outcome = match contact {
            Some((_, read_at)) if lane.removed_since(&event.contact_id, read_at) => {
                WebhookOutcome::Upserted {
                    outcome: UpsertOutcome::Stale,
                }
            }
            Some((contact, _)) => WebhookOutcome::Upserted {
                outcome: self.cache.upsert_if_newer(contact)?,
            },
            None => {
                let existed = self.cache.remove(org, &event.contact_id);
                lane.record_removal(&event.contact_id, Utc::now());
                WebhookOutcome::Removed { existed }
            }
        };
        lane.mark_applied(&event.contact_id, &event.event_id);
        self.cache.update_cursor(org, |c| {
            c.last_webhook_at = Some(event.received_at);
            c.last_webhook_event_id = Some(event.event_id.clone());
        });

        info!(
            organization_id = org,
            contact_id = %event.contact_id,
            event_id = %event.event_id,
            kind = ?event.kind,
            outcome = ?outcome,
            "webhook applied"
        );
        Ok(outcome)
    }

    fn spawn_webhook_worker(
        self: &Arc<Self>,
        organization_id: &str,
    ) -> mpsc::UnboundedSender<WebhookEvent> {
        let (tx, mut rx) = mpsc::unbounded_channel::<WebhookEvent>();
        let engine = Arc::clone(self);
        let org = organization_id.to_string();
        tokio::spawn(async move {
            debug!(organization_id = %org, "webhook worker started");
            while let Some(event) = rx.recv().await {
                engine.process_with_retries(&event).await;
                engine.webhooks.finish_one();
            }
            debug!(organization_id = %org, "webhook worker stopped");
        });
        tx
    }

    async fn process_with_retries(&self, event: &WebhookEvent) {
        let max_attempts = self.options.webhook_max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.apply_webhook_event(event).await {
                Ok(_) => return,
                Err(SyncError::Remote(e)) if e.is_transient() && attempt < max_attempts => {
                    // Each apply already retried its own fetch; this spaces
                    // out whole-event redelivery.
                    let delay = self.retry.delay_for(attempt, &e);
                    debug!(
                        organization_id = %event.organization_id,
                        contact_id = %event.contact_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "webhook apply failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(
                        organization_id = %event.organization_id,
                        contact_id = %event.contact_id,
                        event_id = %event.event_id,
                        attempts = attempt,
                        error = %e,
                        "dropping webhook; next full sync will reconcile"
                    );
                    return;
                }
            }
        }
    }
}
