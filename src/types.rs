use serde::{Deserialize, Serialize};

/// Current wall-clock time as fractional unix seconds.
pub fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

// --- Scope ---

/// The serialization unit: a (chat, thread) pair.
///
/// At most one work item per scope runs at any time. Items with a
/// missing or invalid address collapse to the degenerate scope (0, 0),
/// which still serializes with itself.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct Scope {
    pub chat_id: i64,
    pub thread_id: i64,
}

impl Scope {
    pub fn new(chat_id: i64, thread_id: i64) -> Self {
        Self { chat_id, thread_id }
    }

    /// A scope with no usable destination. Group/channel ids are
    /// negative, so only a zero chat id is degenerate.
    pub fn is_degenerate(&self) -> bool {
        self.chat_id == 0
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.chat_id, self.thread_id)
    }
}

// --- Payload ---

/// The closed set of work item payloads.
///
/// Opaque to the scheduler; the handler layer matches on the variant.
/// On the wire this serializes as a `kind` discriminator plus a
/// `payload` object.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum Payload {
    Text(TextPayload),
    Callback(CallbackPayload),
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct TextPayload {
    pub text: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct CallbackPayload {
    pub callback_id: String,
    #[serde(default)]
    pub data: String,
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Text(_) => "text",
            Payload::Callback(_) => "callback",
        }
    }

    /// The user-visible text of the payload, if any.
    pub fn text(&self) -> Option<&str> {
        match self {
            Payload::Text(p) => Some(&p.text),
            Payload::Callback(_) => None,
        }
    }
}

// --- WorkItem ---

/// The unit of dispatch.
///
/// Immutable once created. `source_token` is runtime-only bookkeeping:
/// the drain file the item was loaded from, or empty if it arrived
/// live. It is never serialized.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct WorkItem {
    #[serde(flatten)]
    pub payload: Payload,
    pub chat_id: i64,
    #[serde(default)]
    pub thread_id: i64,
    #[serde(default)]
    pub received_ts: f64,
    #[serde(default)]
    pub ack_id: i64,
    #[serde(default)]
    pub synthetic: bool,
    #[serde(skip)]
    pub source_token: String,
}

impl WorkItem {
    /// Create a live text item received now.
    pub fn text(chat_id: i64, thread_id: i64, text: impl Into<String>) -> Self {
        Self {
            payload: Payload::Text(TextPayload { text: text.into() }),
            chat_id,
            thread_id,
            received_ts: now_ts(),
            ack_id: 0,
            synthetic: false,
            source_token: String::new(),
        }
    }

    /// Create a live callback item received now.
    pub fn callback(
        chat_id: i64,
        thread_id: i64,
        callback_id: impl Into<String>,
        data: impl Into<String>,
    ) -> Self {
        Self {
            payload: Payload::Callback(CallbackPayload {
                callback_id: callback_id.into(),
                data: data.into(),
            }),
            chat_id,
            thread_id,
            received_ts: now_ts(),
            ack_id: 0,
            synthetic: false,
            source_token: String::new(),
        }
    }

    pub fn with_received_ts(mut self, ts: f64) -> Self {
        self.received_ts = ts;
        self
    }

    pub fn scope(&self) -> Scope {
        Scope::new(self.chat_id, self.thread_id)
    }
}

// --- SpoolRecord ---

pub const SPOOL_SCHEMA_VERSION: u32 = 1;

/// One journaled line: the serialized work item plus arrival time.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SpoolRecord {
    pub version: u32,
    #[serde(flatten)]
    pub item: WorkItem,
    pub ts: f64,
}

impl SpoolRecord {
    pub fn new(item: WorkItem) -> Self {
        Self {
            version: SPOOL_SCHEMA_VERSION,
            item,
            ts: now_ts(),
        }
    }
}
