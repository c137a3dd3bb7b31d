#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use scope_relay::error::DeliveryError;
use scope_relay::outbox::{MessageParams, Sent, SideEffectHandler, Transport};
use scope_relay::types::WorkItem;

/// Creates a text `WorkItem` with an explicit effective timestamp.
pub fn text_item(chat_id: i64, ts: f64, text: &str) -> WorkItem {
    WorkItem::text(chat_id, 0, text).with_received_ts(ts)
}

/// Creates a text `WorkItem` addressed to a specific thread.
pub fn threaded_item(chat_id: i64, thread_id: i64, ts: f64, text: &str) -> WorkItem {
    WorkItem::text(chat_id, thread_id, text).with_received_ts(ts)
}

/// A retryable transport failure, as a refused connection.
pub fn net_err() -> DeliveryError {
    DeliveryError::Network("connection refused".to_string())
}

/// A permanent request failure.
pub fn bad_request(body: &str) -> DeliveryError {
    DeliveryError::Http {
        status: 400,
        body: body.to_string(),
    }
}

// --- Mock transport ---

/// One recorded provider call.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub op: String,
    pub chat_id: i64,
    pub text: String,
    pub message_id: i64,
}

struct MockState {
    fail_ops: HashMap<String, DeliveryError>,
    calls: Vec<Call>,
    next_message_id: i64,
}

/// Scripted provider double: per-op failure injection plus call
/// recording. Successful sends return sequential message ids.
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState {
                fail_ops: HashMap::new(),
                calls: Vec::new(),
                next_message_id: 100,
            }),
        })
    }

    /// Make every future call to `op` fail with `error`.
    pub fn fail_op(&self, op: &str, error: DeliveryError) {
        self.state
            .lock()
            .unwrap()
            .fail_ops
            .insert(op.to_string(), error);
    }

    /// Let `op` succeed again.
    pub fn succeed_op(&self, op: &str) {
        self.state.lock().unwrap().fail_ops.remove(op);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn calls_for(&self, op: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.op == op)
            .count()
    }

    fn record(&self, op: &str, chat_id: i64, text: &str, message_id: i64) -> Option<DeliveryError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call {
            op: op.to_string(),
            chat_id,
            text: text.to_string(),
            message_id,
        });
        state.fail_ops.get(op).cloned()
    }

    fn next_message_id(&self) -> i64 {
        let mut state = self.state.lock().unwrap();
        state.next_message_id += 1;
        state.next_message_id
    }
}

impl Transport for MockTransport {
    async fn send_message(&self, params: &MessageParams) -> Result<Sent, DeliveryError> {
        let text = params.text.clone().unwrap_or_default();
        if let Some(err) = self.record("send_message", params.chat_id, &text, 0) {
            return Err(err);
        }
        Ok(Sent {
            message_id: self.next_message_id(),
        })
    }

    async fn edit_message(&self, params: &MessageParams) -> Result<(), DeliveryError> {
        let text = params.text.clone().unwrap_or_default();
        let message_id = params.message_id.unwrap_or(0);
        if let Some(err) = self.record("edit_message", params.chat_id, &text, message_id) {
            return Err(err);
        }
        Ok(())
    }

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<(), DeliveryError> {
        if let Some(err) = self.record("delete_message", chat_id, "", message_id) {
            return Err(err);
        }
        Ok(())
    }
}

// --- Recording side-effect handler ---

#[derive(Default)]
pub struct RecordingSideEffects {
    marked: Mutex<Vec<String>>,
}

impl RecordingSideEffects {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn marked(&self) -> Vec<String> {
        self.marked.lock().unwrap().clone()
    }
}

impl SideEffectHandler for RecordingSideEffects {
    fn mark_sent(&self, record_id: &str) {
        self.marked.lock().unwrap().push(record_id.to_string());
    }
}
