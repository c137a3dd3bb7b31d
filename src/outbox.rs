use std::collections::{HashMap, HashSet};
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::config::OutboxConfig;
use crate::error::DeliveryError;
use crate::types::now_ts;
use crate::{log_debug, log_info, log_warn};

/// Persisted outbox document name inside the data directory.
pub const OUTBOX_FILE: &str = "outbox.json";

pub const OUTBOX_SCHEMA_VERSION: u32 = 1;

/// Fixed requeue delay while a by-key target identifier is unknown.
/// Resolution waits on an external event (the original send landing),
/// so exponential backoff would only add latency.
const UNRESOLVED_KEY_RETRY_SECONDS: f64 = 5.0;

const MIN_BACKOFF_SECONDS: f64 = 0.5;
const BACKOFF_JITTER_FRACTION: f64 = 0.15;
const COALESCE_KEY_MAX_CHARS: usize = 64;
const LAST_ERROR_MAX_CHARS: usize = 400;

// --- Operations and parameters ---

/// The closed set of deferred operations.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutboxOp {
    SendMessage,
    EditMessage,
    DeleteMessage,
    EditMessageByKey,
    DeleteMessageByKey,
}

impl OutboxOp {
    /// Send-class ops re-deliver content to the user; only their
    /// recovery warrants a restore notice.
    fn is_send(&self) -> bool {
        matches!(self, OutboxOp::SendMessage)
    }

    fn is_edit(&self) -> bool {
        matches!(self, OutboxOp::EditMessage | OutboxOp::EditMessageByKey)
    }

    fn is_delete(&self) -> bool {
        matches!(self, OutboxOp::DeleteMessage | OutboxOp::DeleteMessageByKey)
    }
}

impl std::fmt::Display for OutboxOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OutboxOp::SendMessage => "send_message",
            OutboxOp::EditMessage => "edit_message",
            OutboxOp::DeleteMessage => "delete_message",
            OutboxOp::EditMessageByKey => "edit_message_by_key",
            OutboxOp::DeleteMessageByKey => "delete_message_by_key",
        };
        write!(f, "{}", s)
    }
}

/// Parameters of one outbound operation, persisted as-is.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct MessageParams {
    pub chat_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_message_id: Option<i64>,
    /// For by-key ops: the coalesce key to resolve into a message id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coalesce_key: Option<String>,
}

impl MessageParams {
    pub fn text_to(chat_id: i64, text: impl Into<String>) -> Self {
        Self {
            chat_id,
            text: Some(text.into()),
            ..Default::default()
        }
    }
}

/// Provider acknowledgement of a successful send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sent {
    pub message_id: i64,
}

/// Outcome of an immediate operation: delivered now, or persisted for
/// replay. Callers can tell the end user "queued" instead of "done".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent { message_id: i64 },
    Deferred,
}

impl SendOutcome {
    pub fn is_deferred(&self) -> bool {
        matches!(self, SendOutcome::Deferred)
    }
}

// --- Side effects ---

/// Named, serializable post-delivery effects.
///
/// Closures cannot survive a restart; these variants can. They are
/// dispatched by a match in the flush loop once the entry resolves.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SideEffect {
    /// Mark an external record as delivered.
    MarkSent { record_id: String },
    /// Remove a transient acknowledgement message once the real
    /// content has landed.
    ClearAck { chat_id: i64, coalesce_key: String },
}

/// Receiver for side effects that touch state outside the outbox.
pub trait SideEffectHandler: Send + Sync {
    fn mark_sent(&self, record_id: &str);
}

impl<T: SideEffectHandler + ?Sized> SideEffectHandler for Arc<T> {
    fn mark_sent(&self, record_id: &str) {
        (**self).mark_sent(record_id)
    }
}

// --- Transport seam ---

/// Seam to the messaging provider. Enables mocking in tests.
pub trait Transport: Send + Sync {
    fn send_message(
        &self,
        params: &MessageParams,
    ) -> impl Future<Output = Result<Sent, DeliveryError>> + Send;

    fn edit_message(
        &self,
        params: &MessageParams,
    ) -> impl Future<Output = Result<(), DeliveryError>> + Send;

    fn delete_message(
        &self,
        chat_id: i64,
        message_id: i64,
    ) -> impl Future<Output = Result<(), DeliveryError>> + Send;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn send_message(
        &self,
        params: &MessageParams,
    ) -> impl Future<Output = Result<Sent, DeliveryError>> + Send {
        (**self).send_message(params)
    }

    fn edit_message(
        &self,
        params: &MessageParams,
    ) -> impl Future<Output = Result<(), DeliveryError>> + Send {
        (**self).edit_message(params)
    }

    fn delete_message(
        &self,
        chat_id: i64,
        message_id: i64,
    ) -> impl Future<Output = Result<(), DeliveryError>> + Send {
        (**self).delete_message(chat_id, message_id)
    }
}

// --- Persisted state ---

/// One deferred outbound operation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct OutboxEntry {
    pub id: String,
    pub op: OutboxOp,
    pub chat_id: i64,
    pub params: MessageParams,
    pub created_ts: f64,
    pub attempts: u32,
    pub next_attempt_ts: f64,
    #[serde(default)]
    pub last_error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coalesce_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<SideEffect>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CoalesceBinding {
    pub chat_id: i64,
    pub key: String,
    pub message_id: i64,
}

#[derive(Serialize, Deserialize, Default)]
struct OutboxDocument {
    version: u32,
    #[serde(default)]
    entries: Vec<OutboxEntry>,
    #[serde(default)]
    bindings: Vec<CoalesceBinding>,
}

#[derive(Default)]
struct OutboxState {
    entries: Vec<OutboxEntry>,
    bindings: HashMap<(i64, String), i64>,
    /// Destination -> first failure of the current outage epoch.
    offline_since: HashMap<i64, f64>,
    /// Destination -> when the restore notice went out (once per epoch).
    notice_sent_ts: HashMap<i64, f64>,
}

/// Result of one flush attempt against one entry.
enum Attempt {
    Delivered(Option<Sent>),
    /// By-key target identifier still unknown.
    Unresolved,
    Failed(DeliveryError),
    /// Entry is malformed and can never succeed.
    DropInvalid(&'static str),
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn clean_coalesce_key(key: &str) -> String {
    truncate_chars(key.trim(), COALESCE_KEY_MAX_CHARS)
}

/// Compact age string for user-facing notices.
fn format_age(seconds: f64) -> String {
    let seconds = seconds.max(0.0);
    if seconds < 60.0 {
        return format!("{}s", seconds as u64);
    }
    let minutes = seconds / 60.0;
    if minutes < 60.0 {
        return format!("{}m", minutes as u64);
    }
    let hours = minutes / 60.0;
    if hours < 48.0 {
        return format!("{:.1}h", hours);
    }
    format!("{:.1}d", hours / 24.0)
}

// --- Outbox ---

/// Retrying delivery queue for outbound operations.
///
/// Operations are attempted immediately; transient failures persist an
/// entry that `flush` replays with exponential backoff. Late-bound
/// provider identifiers resolve through the coalesce-key index once
/// the originating send lands.
pub struct Outbox<T: Transport> {
    api: T,
    path: PathBuf,
    backoff_base_seconds: f64,
    backoff_max_seconds: f64,
    max_items: usize,
    state: Mutex<OutboxState>,
    /// Non-reentrant flush: a second caller returns immediately.
    flush_gate: tokio::sync::Mutex<()>,
    side_effects: Option<Box<dyn SideEffectHandler>>,
}

impl<T: Transport> Outbox<T> {
    pub fn new(api: T, data_dir: &Path, config: &OutboxConfig) -> Self {
        let path = data_dir.join(OUTBOX_FILE);
        let state = load_state(&path, config.max_items);
        Self {
            api,
            path,
            backoff_base_seconds: config.backoff_base_seconds.max(0.1),
            backoff_max_seconds: config.backoff_max_seconds.max(1.0),
            max_items: config.max_items.max(1),
            state: Mutex::new(state),
            flush_gate: tokio::sync::Mutex::new(()),
            side_effects: None,
        }
    }

    pub fn with_side_effects(mut self, handler: Box<dyn SideEffectHandler>) -> Self {
        self.side_effects = Some(handler);
        self
    }

    fn locked(&self) -> MutexGuard<'_, OutboxState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // --- Backoff ---

    /// Capped exponential delay without jitter: 2, 4, 8, ... seconds
    /// up to the cap. Exposed separately so the curve is testable.
    pub fn backoff_delay(&self, attempts: u32) -> f64 {
        let a = attempts.max(1);
        let base = self.backoff_base_seconds * 2.0_f64.powi(a as i32 - 1);
        base.min(self.backoff_max_seconds).max(MIN_BACKOFF_SECONDS)
    }

    /// Backoff with uniform jitter in [0, delay * 0.15) so retries
    /// from many destinations do not synchronize.
    fn backoff_with_jitter(&self, attempts: u32) -> f64 {
        let delay = self.backoff_delay(attempts);
        let jitter = if delay > 0.0 {
            rand::thread_rng().gen_range(0.0..delay * BACKOFF_JITTER_FRACTION)
        } else {
            0.0
        };
        delay + jitter
    }

    // --- Coalesce bindings ---

    pub fn message_id_for_key(&self, chat_id: i64, key: &str) -> Option<i64> {
        let key = clean_coalesce_key(key);
        if key.is_empty() {
            return None;
        }
        self.locked().bindings.get(&(chat_id, key)).copied()
    }

    fn bind_key(&self, chat_id: i64, key: &str, message_id: i64) {
        let key = clean_coalesce_key(key);
        if key.is_empty() || message_id <= 0 {
            return;
        }
        let mut st = self.locked();
        st.bindings.insert((chat_id, key), message_id);
        self.persist_locked(&st);
    }

    // --- Offline tracking ---

    pub fn offline_since(&self, chat_id: i64) -> Option<f64> {
        self.locked().offline_since.get(&chat_id).copied()
    }

    fn mark_offline(&self, chat_id: i64, now: f64) {
        let mut st = self.locked();
        if !st.offline_since.contains_key(&chat_id) {
            st.offline_since.insert(chat_id, now);
            // New outage epoch: allow a fresh restore notice later.
            st.notice_sent_ts.remove(&chat_id);
        }
    }

    // --- Entry management ---

    fn enqueue_entry(&self, entry: OutboxEntry) {
        let mut st = self.locked();
        if let Some(key) = entry.coalesce_key.as_deref() {
            // Same logical operation already queued: newest wins.
            let chat_id = entry.chat_id;
            st.entries
                .retain(|e| !(e.chat_id == chat_id && e.coalesce_key.as_deref() == Some(key)));
        }
        st.entries.push(entry);
        let overflow = st.entries.len().saturating_sub(self.max_items);
        if overflow > 0 {
            st.entries.drain(..overflow);
        }
        self.persist_locked(&st);
    }

    /// Persisted entries, for observability and tests. Never mutates.
    pub fn snapshot(&self) -> Vec<OutboxEntry> {
        self.locked().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.locked().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locked().entries.is_empty()
    }

    /// Operator retry-now: make every entry due immediately.
    pub fn force_all_due(&self) {
        let mut st = self.locked();
        for entry in &mut st.entries {
            entry.next_attempt_ts = 0.0;
        }
        self.persist_locked(&st);
    }

    fn persist_locked(&self, st: &OutboxState) {
        let mut bindings: Vec<CoalesceBinding> = st
            .bindings
            .iter()
            .map(|((chat_id, key), message_id)| CoalesceBinding {
                chat_id: *chat_id,
                key: key.clone(),
                message_id: *message_id,
            })
            .collect();
        bindings.sort_by(|a, b| (a.chat_id, &a.key).cmp(&(b.chat_id, &b.key)));

        let doc = OutboxDocument {
            version: OUTBOX_SCHEMA_VERSION,
            entries: st.entries.clone(),
            bindings,
        };
        if let Err(e) = write_document(&self.path, &doc) {
            log_warn!("Failed to persist outbox: {}", e);
        }
    }

    fn deferred_entry(
        &self,
        op: OutboxOp,
        params: MessageParams,
        error: &DeliveryError,
        coalesce_key: Option<String>,
        meta: Option<SideEffect>,
        now: f64,
    ) -> OutboxEntry {
        OutboxEntry {
            id: uuid::Uuid::new_v4().simple().to_string(),
            op,
            chat_id: params.chat_id,
            params,
            created_ts: now,
            attempts: 1,
            next_attempt_ts: now + self.backoff_with_jitter(1),
            last_error: truncate_chars(&error.to_string(), LAST_ERROR_MAX_CHARS),
            coalesce_key: coalesce_key.map(|k| clean_coalesce_key(&k)).filter(|k| !k.is_empty()),
            meta,
        }
    }

    fn defer(
        &self,
        op: OutboxOp,
        params: MessageParams,
        error: &DeliveryError,
        coalesce_key: Option<String>,
        meta: Option<SideEffect>,
    ) -> SendOutcome {
        let now = now_ts();
        let chat_id = params.chat_id;
        let entry = self.deferred_entry(op, params, error, coalesce_key, meta, now);
        log_info!(
            "[outbox] defer chat_id={} op={} err={}",
            chat_id,
            entry.op,
            truncate_chars(&entry.last_error, 200)
        );
        self.enqueue_entry(entry);
        self.mark_offline(chat_id, now);
        SendOutcome::Deferred
    }

    // --- Immediate operations ---

    /// Attempt a send now. Retryable failures persist an entry and
    /// return `Deferred`; permanent failures are raised to the caller.
    pub async fn send(
        &self,
        params: MessageParams,
        coalesce_key: Option<String>,
        meta: Option<SideEffect>,
    ) -> Result<SendOutcome, DeliveryError> {
        if params.chat_id == 0 {
            return Err(DeliveryError::Invalid("chat_id must be non-zero".into()));
        }
        match self.api.send_message(&params).await {
            Ok(sent) => {
                if let Some(key) = coalesce_key.as_deref() {
                    self.bind_key(params.chat_id, key, sent.message_id);
                }
                if let Some(effect) = &meta {
                    self.apply_side_effect(effect);
                }
                Ok(SendOutcome::Sent {
                    message_id: sent.message_id,
                })
            }
            Err(e) if e.is_retryable() => {
                Ok(self.defer(OutboxOp::SendMessage, params, &e, coalesce_key, meta))
            }
            Err(e) => Err(e),
        }
    }

    /// Attempt an edit now. `params.message_id` is required. Repeated
    /// edits of one message coalesce so only the newest content is
    /// replayed after an outage.
    pub async fn edit(&self, params: MessageParams) -> Result<SendOutcome, DeliveryError> {
        let message_id = params
            .message_id
            .ok_or_else(|| DeliveryError::Invalid("edit requires message_id".into()))?;
        match self.api.edit_message(&params).await {
            Ok(()) => Ok(SendOutcome::Sent { message_id }),
            Err(e) if e.is_retryable() => {
                let key = format!("edit:{}", message_id);
                Ok(self.defer(OutboxOp::EditMessage, params, &e, Some(key), None))
            }
            Err(e) => Err(e),
        }
    }

    /// Attempt a delete now; defers on transient failure.
    pub async fn delete(
        &self,
        chat_id: i64,
        message_id: i64,
    ) -> Result<SendOutcome, DeliveryError> {
        match self.api.delete_message(chat_id, message_id).await {
            Ok(()) => Ok(SendOutcome::Sent { message_id }),
            Err(e) if e.is_retryable() => {
                let params = MessageParams {
                    chat_id,
                    message_id: Some(message_id),
                    ..Default::default()
                };
                let key = format!("delete:{}", message_id);
                Ok(self.defer(OutboxOp::DeleteMessage, params, &e, Some(key), None))
            }
            Err(e) => Err(e),
        }
    }

    /// Edit a message whose provider id is not known yet (the original
    /// send may itself still be deferred), identified by coalesce key.
    ///
    /// With a known binding this is an ordinary edit; otherwise an
    /// apply-when-identifier-known entry is persisted instead of
    /// failing.
    pub async fn edit_by_coalesce_key(
        &self,
        chat_id: i64,
        coalesce_key: &str,
        new_params: MessageParams,
    ) -> Result<SendOutcome, DeliveryError> {
        let key = clean_coalesce_key(coalesce_key);
        if key.is_empty() {
            return Err(DeliveryError::Invalid("empty coalesce_key".into()));
        }

        if let Some(message_id) = self.message_id_for_key(chat_id, &key) {
            let params = MessageParams {
                chat_id,
                message_id: Some(message_id),
                coalesce_key: None,
                ..new_params
            };
            return self.edit(params).await;
        }

        let now = now_ts();
        let entry = OutboxEntry {
            id: uuid::Uuid::new_v4().simple().to_string(),
            op: OutboxOp::EditMessageByKey,
            chat_id,
            params: MessageParams {
                chat_id,
                message_id: None,
                coalesce_key: Some(key.clone()),
                ..new_params
            },
            created_ts: now,
            attempts: 0,
            next_attempt_ts: now,
            last_error: String::new(),
            coalesce_key: Some(format!("edit_key:{}", key)),
            meta: None,
        };
        self.enqueue_entry(entry);
        Ok(SendOutcome::Deferred)
    }

    /// Schedule deletion of a coalesce-keyed message after `delay`
    /// seconds. Persisted, so it survives restarts and outages.
    pub fn schedule_delete_by_coalesce_key(
        &self,
        chat_id: i64,
        coalesce_key: &str,
        delay_seconds: f64,
    ) -> Result<SendOutcome, DeliveryError> {
        let key = clean_coalesce_key(coalesce_key);
        if key.is_empty() {
            return Err(DeliveryError::Invalid("empty coalesce_key".into()));
        }
        let now = now_ts();
        let entry = OutboxEntry {
            id: uuid::Uuid::new_v4().simple().to_string(),
            op: OutboxOp::DeleteMessageByKey,
            chat_id,
            params: MessageParams {
                chat_id,
                coalesce_key: Some(key.clone()),
                ..Default::default()
            },
            created_ts: now,
            attempts: 0,
            next_attempt_ts: now + delay_seconds.max(0.0),
            last_error: String::new(),
            coalesce_key: Some(format!("delete_key:{}", key)),
            meta: None,
        };
        self.enqueue_entry(entry);
        Ok(SendOutcome::Deferred)
    }

    // --- Flush ---

    /// Replay due entries, oldest due first, attempting at most
    /// `max_ops`. Non-reentrant: a concurrent call returns 0
    /// immediately, so flush frequency is self-limiting.
    ///
    /// Returns the number of entries delivered (or settled).
    pub async fn flush(&self, max_ops: usize) -> usize {
        let Ok(_gate) = self.flush_gate.try_lock() else {
            return 0;
        };

        let now = now_ts();
        let mut due: Vec<OutboxEntry> = self.locked().entries.clone();
        if due.is_empty() {
            return 0;
        }
        let snapshot_ids: HashSet<String> = due.iter().map(|e| e.id.clone()).collect();
        due.sort_by(|a, b| {
            a.next_attempt_ts
                .total_cmp(&b.next_attempt_ts)
                .then(a.created_ts.total_cmp(&b.created_ts))
        });

        // Restore notices accompany re-sent messages; an outbox of
        // edits/deletes alone would make the notice noise.
        let chats_with_due_sends: HashSet<i64> = due
            .iter()
            .filter(|e| e.chat_id != 0 && e.next_attempt_ts <= now && e.op.is_send())
            .map(|e| e.chat_id)
            .collect();

        let mut delivered = 0usize;
        let mut changed = false;
        let mut remaining: Vec<OutboxEntry> = Vec::new();
        let mut notice_attempted: HashSet<i64> = HashSet::new();

        for mut entry in due {
            if delivered >= max_ops {
                remaining.push(entry);
                continue;
            }
            if entry.chat_id == 0 {
                // Unaddressable; can never succeed.
                changed = true;
                continue;
            }
            if entry.next_attempt_ts > now {
                remaining.push(entry);
                continue;
            }

            if self.should_send_restore_notice(entry.chat_id, &chats_with_due_sends, &notice_attempted)
            {
                notice_attempted.insert(entry.chat_id);
                if let Err(e) = self.send_restore_notice(entry.chat_id, now).await {
                    entry.attempts += 1;
                    entry.next_attempt_ts = now + self.backoff_with_jitter(entry.attempts);
                    entry.last_error = truncate_chars(&e.to_string(), LAST_ERROR_MAX_CHARS);
                    remaining.push(entry);
                    changed = true;
                    continue;
                }
            }

            match self.attempt_entry(&entry).await {
                Attempt::Delivered(sent) => {
                    if entry.op.is_send() {
                        if let (Some(sent), Some(key)) = (sent, entry.coalesce_key.as_deref()) {
                            self.bind_key(entry.chat_id, key, sent.message_id);
                        }
                    }
                    if let Some(effect) = &entry.meta {
                        self.apply_flush_side_effect(effect, &mut remaining, now);
                    }
                    delivered += 1;
                    changed = true;
                }
                Attempt::Unresolved => {
                    entry.attempts += 1;
                    entry.next_attempt_ts = now + UNRESOLVED_KEY_RETRY_SECONDS;
                    entry.last_error = "waiting for message identifier".to_string();
                    remaining.push(entry);
                    changed = true;
                }
                Attempt::Failed(e)
                    if (entry.op.is_edit() && (e.is_noop_edit() || e.is_target_gone()))
                        || (entry.op.is_delete() && e.is_target_gone()) =>
                {
                    // The stale content is already gone or already
                    // current; the goal is met.
                    log_info!(
                        "[outbox] settle chat_id={} op={} ({})",
                        entry.chat_id,
                        entry.op,
                        truncate_chars(&e.to_string(), 200)
                    );
                    if let Some(effect) = &entry.meta {
                        self.apply_flush_side_effect(effect, &mut remaining, now);
                    }
                    delivered += 1;
                    changed = true;
                }
                Attempt::Failed(e) if e.is_retryable() => {
                    entry.attempts += 1;
                    entry.next_attempt_ts = now + self.backoff_with_jitter(entry.attempts);
                    entry.last_error = truncate_chars(&e.to_string(), LAST_ERROR_MAX_CHARS);
                    self.mark_offline(entry.chat_id, now);
                    log_info!(
                        "[outbox] retry chat_id={} op={} attempts={} err={}",
                        entry.chat_id,
                        entry.op,
                        entry.attempts,
                        truncate_chars(&entry.last_error, 200)
                    );
                    remaining.push(entry);
                    changed = true;
                }
                Attempt::Failed(e) => {
                    log_warn!(
                        "[outbox] drop chat_id={} op={} err={}",
                        entry.chat_id,
                        entry.op,
                        truncate_chars(&e.to_string(), 250)
                    );
                    changed = true;
                }
                Attempt::DropInvalid(reason) => {
                    log_warn!(
                        "[outbox] drop invalid entry chat_id={} op={}: {}",
                        entry.chat_id,
                        entry.op,
                        reason
                    );
                    changed = true;
                }
            }
        }

        if changed {
            let mut st = self.locked();
            // Entries enqueued while this flush ran are not in the
            // snapshot; keep them.
            let new_arrivals: Vec<OutboxEntry> = st
                .entries
                .iter()
                .filter(|e| !snapshot_ids.contains(&e.id))
                .cloned()
                .collect();
            st.entries = remaining;
            st.entries.extend(new_arrivals);
            let overflow = st.entries.len().saturating_sub(self.max_items);
            if overflow > 0 {
                st.entries
                    .sort_by(|a, b| a.created_ts.total_cmp(&b.created_ts));
                st.entries.drain(..overflow);
            }

            // A destination with nothing pending is back online; reset
            // its epoch so the next outage gets a fresh notice.
            let still_pending: HashSet<i64> = st.entries.iter().map(|e| e.chat_id).collect();
            st.offline_since.retain(|cid, _| still_pending.contains(cid));
            st.notice_sent_ts.retain(|cid, _| still_pending.contains(cid));

            self.persist_locked(&st);
        }

        delivered
    }

    async fn attempt_entry(&self, entry: &OutboxEntry) -> Attempt {
        match entry.op {
            OutboxOp::SendMessage => match self.api.send_message(&entry.params).await {
                Ok(sent) => Attempt::Delivered(Some(sent)),
                Err(e) => Attempt::Failed(e),
            },
            OutboxOp::EditMessage => {
                if entry.params.message_id.is_none() {
                    return Attempt::DropInvalid("missing message_id");
                }
                match self.api.edit_message(&entry.params).await {
                    Ok(()) => Attempt::Delivered(None),
                    Err(e) => Attempt::Failed(e),
                }
            }
            OutboxOp::DeleteMessage => {
                let Some(message_id) = entry.params.message_id else {
                    return Attempt::DropInvalid("missing message_id");
                };
                match self.api.delete_message(entry.chat_id, message_id).await {
                    Ok(()) => Attempt::Delivered(None),
                    Err(e) => Attempt::Failed(e),
                }
            }
            OutboxOp::EditMessageByKey => {
                let Some(key) = entry.params.coalesce_key.as_deref() else {
                    return Attempt::DropInvalid("missing coalesce_key");
                };
                let Some(message_id) = self.message_id_for_key(entry.chat_id, key) else {
                    return Attempt::Unresolved;
                };
                let mut params = entry.params.clone();
                params.message_id = Some(message_id);
                params.coalesce_key = None;
                match self.api.edit_message(&params).await {
                    Ok(()) => Attempt::Delivered(None),
                    Err(e) => Attempt::Failed(e),
                }
            }
            OutboxOp::DeleteMessageByKey => {
                let Some(key) = entry.params.coalesce_key.as_deref() else {
                    return Attempt::DropInvalid("missing coalesce_key");
                };
                let Some(message_id) = self.message_id_for_key(entry.chat_id, key) else {
                    return Attempt::Unresolved;
                };
                match self.api.delete_message(entry.chat_id, message_id).await {
                    Ok(()) => Attempt::Delivered(None),
                    Err(e) => Attempt::Failed(e),
                }
            }
        }
    }

    fn should_send_restore_notice(
        &self,
        chat_id: i64,
        chats_with_due_sends: &HashSet<i64>,
        notice_attempted: &HashSet<i64>,
    ) -> bool {
        if notice_attempted.contains(&chat_id) || !chats_with_due_sends.contains(&chat_id) {
            return false;
        }
        let st = self.locked();
        st.offline_since.contains_key(&chat_id) && !st.notice_sent_ts.contains_key(&chat_id)
    }

    async fn send_restore_notice(&self, chat_id: i64, now: f64) -> Result<(), DeliveryError> {
        let offline_since = self.offline_since(chat_id).unwrap_or(now);
        let age = format_age(now - offline_since);
        let notice = MessageParams::text_to(
            chat_id,
            format!(
                "Connection was down for {}. Delivering queued messages now.",
                age
            ),
        );
        self.api.send_message(&notice).await?;
        let mut st = self.locked();
        st.notice_sent_ts.insert(chat_id, now);
        drop(st);
        log_info!("[outbox] restore-notice chat_id={} offline={}", chat_id, age);
        Ok(())
    }

    /// Side effect application for the flush loop. `ClearAck` feeds a
    /// follow-up delete into `remaining` (the entry list is replaced
    /// wholesale after the loop, so enqueueing directly would be lost).
    fn apply_flush_side_effect(
        &self,
        effect: &SideEffect,
        remaining: &mut Vec<OutboxEntry>,
        now: f64,
    ) {
        match effect {
            SideEffect::MarkSent { .. } => self.apply_side_effect(effect),
            SideEffect::ClearAck {
                chat_id,
                coalesce_key,
            } => {
                let key = clean_coalesce_key(coalesce_key);
                if key.is_empty() {
                    return;
                }
                remaining.push(OutboxEntry {
                    id: uuid::Uuid::new_v4().simple().to_string(),
                    op: OutboxOp::DeleteMessageByKey,
                    chat_id: *chat_id,
                    params: MessageParams {
                        chat_id: *chat_id,
                        coalesce_key: Some(key.clone()),
                        ..Default::default()
                    },
                    created_ts: now,
                    attempts: 0,
                    next_attempt_ts: now,
                    last_error: String::new(),
                    coalesce_key: Some(format!("delete_key:{}", key)),
                    meta: None,
                });
            }
        }
    }

    /// Side effect application outside the flush loop (immediate
    /// successes).
    fn apply_side_effect(&self, effect: &SideEffect) {
        match effect {
            SideEffect::MarkSent { record_id } => match &self.side_effects {
                Some(handler) => handler.mark_sent(record_id),
                None => log_debug!("No side-effect handler for mark_sent {}", record_id),
            },
            SideEffect::ClearAck {
                chat_id,
                coalesce_key,
            } => {
                let _ = self.schedule_delete_by_coalesce_key(*chat_id, coalesce_key, 0.0);
            }
        }
    }
}

// --- Persistence helpers ---

fn write_document(path: &Path, doc: &OutboxDocument) -> Result<(), String> {
    let parent = path
        .parent()
        .ok_or_else(|| format!("Cannot determine parent directory of {}", path.display()))?;

    fs::create_dir_all(parent)
        .map_err(|e| format!("Failed to create directory {}: {}", parent.display(), e))?;

    let json = serde_json::to_string_pretty(doc)
        .map_err(|e| format!("Failed to serialize outbox: {}", e))?;

    let temp_file = NamedTempFile::new_in(parent)
        .map_err(|e| format!("Failed to create temp file in {}: {}", parent.display(), e))?;

    fs::write(temp_file.path(), &json).map_err(|e| format!("Failed to write temp file: {}", e))?;

    temp_file
        .as_file()
        .sync_all()
        .map_err(|e| format!("Failed to sync temp file: {}", e))?;

    temp_file
        .persist(path)
        .map_err(|e| format!("Failed to rename temp file to {}: {}", path.display(), e))?;

    Ok(())
}

/// Load persisted entries and bindings. A corrupt document starts
/// empty with a warning; individual invalid entries are dropped.
fn load_state(path: &Path, max_items: usize) -> OutboxState {
    let mut state = OutboxState::default();
    if !path.exists() {
        return state;
    }
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            log_warn!("Failed to read outbox {}: {}", path.display(), e);
            return state;
        }
    };
    let doc: OutboxDocument = match serde_json::from_str(&raw) {
        Ok(doc) => doc,
        Err(e) => {
            log_warn!("Corrupt outbox {}: {}; starting empty", path.display(), e);
            return state;
        }
    };

    let mut entries: Vec<OutboxEntry> = doc
        .entries
        .into_iter()
        .filter(|e| e.chat_id != 0 && !e.id.is_empty())
        .collect();
    let overflow = entries.len().saturating_sub(max_items.max(1));
    if overflow > 0 {
        entries.drain(..overflow);
    }
    state.entries = entries;

    for binding in doc.bindings {
        let key = clean_coalesce_key(&binding.key);
        if binding.chat_id != 0 && !key.is_empty() && binding.message_id > 0 {
            state
                .bindings
                .insert((binding.chat_id, key), binding.message_id);
        }
    }
    state
}
