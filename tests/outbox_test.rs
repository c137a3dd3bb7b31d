mod common;

use std::sync::Arc;

use scope_relay::config::OutboxConfig;
use scope_relay::outbox::{
    MessageParams, Outbox, OutboxOp, SendOutcome, SideEffect,
};

use common::{bad_request, net_err, MockTransport, RecordingSideEffects};

fn outbox_in(dir: &std::path::Path, api: Arc<MockTransport>) -> Outbox<Arc<MockTransport>> {
    Outbox::new(api, dir, &OutboxConfig::default())
}

// =========================================================================
// Immediate operations
// =========================================================================

#[tokio::test]
async fn send_success_binds_coalesce_key() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let api = MockTransport::new();
    let outbox = outbox_in(dir.path(), Arc::clone(&api));

    let outcome = outbox
        .send(
            MessageParams::text_to(42, "hello"),
            Some("ack:42:1".to_string()),
            None,
        )
        .await
        .unwrap();

    let SendOutcome::Sent { message_id } = outcome else {
        panic!("expected immediate send");
    };
    assert!(message_id > 0);
    assert_eq!(outbox.message_id_for_key(42, "ack:42:1"), Some(message_id));
    assert!(outbox.is_empty());
    assert_eq!(api.calls_for("send_message"), 1);
}

#[tokio::test]
async fn retryable_send_failure_defers() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let api = MockTransport::new();
    api.fail_op("send_message", net_err());
    let outbox = outbox_in(dir.path(), Arc::clone(&api));

    let outcome = outbox
        .send(MessageParams::text_to(42, "queued"), None, None)
        .await
        .unwrap();
    assert!(outcome.is_deferred());

    let entries = outbox.snapshot();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].op, OutboxOp::SendMessage);
    assert_eq!(entries[0].attempts, 1);
    assert!(entries[0].next_attempt_ts > 0.0);
    assert!(entries[0].last_error.contains("connection refused"));
    assert!(outbox.offline_since(42).is_some());
}

#[tokio::test]
async fn permanent_send_failure_raises() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let api = MockTransport::new();
    api.fail_op("send_message", bad_request("chat not found"));
    let outbox = outbox_in(dir.path(), Arc::clone(&api));

    let err = outbox
        .send(MessageParams::text_to(42, "nope"), None, None)
        .await
        .unwrap_err();
    assert!(!err.is_retryable());
    assert!(outbox.is_empty(), "permanent failures are never deferred");
}

// =========================================================================
// Flush
// =========================================================================

#[tokio::test]
async fn flush_delivers_and_fires_side_effect_once() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let api = MockTransport::new();
    let effects = RecordingSideEffects::new();
    let outbox = outbox_in(dir.path(), Arc::clone(&api))
        .with_side_effects(Box::new(Arc::clone(&effects)));

    api.fail_op("send_message", net_err());
    let outcome = outbox
        .send(
            MessageParams::text_to(42, "payload"),
            None,
            Some(SideEffect::MarkSent {
                record_id: "rec-1".to_string(),
            }),
        )
        .await
        .unwrap();
    assert!(outcome.is_deferred());

    // Destination recovers
    api.succeed_op("send_message");
    outbox.force_all_due();
    let delivered = outbox.flush(10).await;

    assert_eq!(delivered, 1);
    assert!(outbox.is_empty());
    assert_eq!(effects.marked(), vec!["rec-1"]);

    // A second flush has nothing to do and must not re-fire
    assert_eq!(outbox.flush(10).await, 0);
    assert_eq!(effects.marked(), vec!["rec-1"]);
}

#[tokio::test]
async fn flush_respects_max_ops() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let api = MockTransport::new();
    api.fail_op("send_message", net_err());
    let outbox = outbox_in(dir.path(), Arc::clone(&api));

    for i in 0..3 {
        outbox
            .send(MessageParams::text_to(42, format!("m{}", i)), None, None)
            .await
            .unwrap();
    }
    assert_eq!(outbox.len(), 3);

    api.succeed_op("send_message");
    outbox.force_all_due();
    let delivered = outbox.flush(2).await;
    assert_eq!(delivered, 2);
    assert_eq!(outbox.len(), 1);
}

#[tokio::test]
async fn repeated_failure_backs_off_with_growing_attempts() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let api = MockTransport::new();
    api.fail_op("send_message", net_err());
    let outbox = outbox_in(dir.path(), Arc::clone(&api));

    outbox
        .send(MessageParams::text_to(42, "stuck"), None, None)
        .await
        .unwrap();

    outbox.force_all_due();
    assert_eq!(outbox.flush(10).await, 0);

    let entries = outbox.snapshot();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].attempts, 2);
    let now = scope_relay::types::now_ts();
    assert!(entries[0].next_attempt_ts > now, "pushed into the future");
}

#[tokio::test]
async fn edit_target_gone_is_treated_as_success() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let api = MockTransport::new();
    api.fail_op("edit_message", net_err());
    let outbox = outbox_in(dir.path(), Arc::clone(&api));

    let params = MessageParams {
        chat_id: 42,
        message_id: Some(7),
        text: Some("new content".to_string()),
        ..Default::default()
    };
    assert!(outbox.edit(params).await.unwrap().is_deferred());

    // On replay the message has been deleted by the user
    api.fail_op("edit_message", bad_request("message to edit not found"));
    outbox.force_all_due();
    let delivered = outbox.flush(10).await;

    assert_eq!(delivered, 1, "gone target counts as settled");
    assert!(outbox.is_empty());
}

#[tokio::test]
async fn noop_edit_is_treated_as_success() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let api = MockTransport::new();
    api.fail_op("edit_message", net_err());
    let outbox = outbox_in(dir.path(), Arc::clone(&api));

    let params = MessageParams {
        chat_id: 42,
        message_id: Some(7),
        text: Some("same content".to_string()),
        ..Default::default()
    };
    assert!(outbox.edit(params).await.unwrap().is_deferred());

    api.fail_op("edit_message", bad_request("message is not modified"));
    outbox.force_all_due();
    assert_eq!(outbox.flush(10).await, 1);
    assert!(outbox.is_empty());
}

#[tokio::test]
async fn delete_target_gone_is_treated_as_success() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let api = MockTransport::new();
    api.fail_op("delete_message", net_err());
    let outbox = outbox_in(dir.path(), Arc::clone(&api));

    assert!(outbox.delete(42, 7).await.unwrap().is_deferred());

    api.fail_op("delete_message", bad_request("message to delete not found"));
    outbox.force_all_due();
    assert_eq!(outbox.flush(10).await, 1);
    assert!(outbox.is_empty());
}

// =========================================================================
// Coalesce-key resolution
// =========================================================================

#[tokio::test]
async fn edit_by_key_queues_until_identifier_resolves() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let api = MockTransport::new();
    let outbox = outbox_in(dir.path(), Arc::clone(&api));

    // The edit arrives before any send has bound the key
    let outcome = outbox
        .edit_by_coalesce_key(42, "ack:42:9", MessageParams::text_to(42, "updated"))
        .await
        .unwrap();
    assert!(outcome.is_deferred());

    let entries = outbox.snapshot();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].op, OutboxOp::EditMessageByKey);

    // Identifier still unknown: requeued, not failed
    assert_eq!(outbox.flush(10).await, 0);
    let entries = outbox.snapshot();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].last_error, "waiting for message identifier");
    assert!(entries[0].next_attempt_ts > 0.0);

    // The originating send finally lands and binds the key
    let sent = outbox
        .send(
            MessageParams::text_to(42, "original"),
            Some("ack:42:9".to_string()),
            None,
        )
        .await
        .unwrap();
    let SendOutcome::Sent { message_id } = sent else {
        panic!("expected send to succeed");
    };

    outbox.force_all_due();
    assert_eq!(outbox.flush(10).await, 1);
    assert!(outbox.is_empty());

    let edits: Vec<_> = api
        .calls()
        .into_iter()
        .filter(|c| c.op == "edit_message")
        .collect();
    assert_eq!(edits.len(), 1);
    assert_eq!(edits[0].message_id, message_id);
    assert_eq!(edits[0].text, "updated");
}

#[tokio::test]
async fn edit_by_key_with_existing_binding_edits_immediately() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let api = MockTransport::new();
    let outbox = outbox_in(dir.path(), Arc::clone(&api));

    let SendOutcome::Sent { message_id } = outbox
        .send(
            MessageParams::text_to(42, "original"),
            Some("status".to_string()),
            None,
        )
        .await
        .unwrap()
    else {
        panic!("expected send to succeed");
    };

    let outcome = outbox
        .edit_by_coalesce_key(42, "status", MessageParams::text_to(42, "updated"))
        .await
        .unwrap();
    assert_eq!(outcome, SendOutcome::Sent { message_id });
    assert!(outbox.is_empty());
    assert_eq!(api.calls_for("edit_message"), 1);
}

#[tokio::test]
async fn scheduled_delete_resolves_by_key_when_due() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let api = MockTransport::new();
    let outbox = outbox_in(dir.path(), Arc::clone(&api));

    let SendOutcome::Sent { message_id } = outbox
        .send(
            MessageParams::text_to(42, "transient ack"),
            Some("ack:42:3".to_string()),
            None,
        )
        .await
        .unwrap()
    else {
        panic!("expected send to succeed");
    };

    outbox
        .schedule_delete_by_coalesce_key(42, "ack:42:3", 3600.0)
        .unwrap();

    // Not yet due
    assert_eq!(outbox.flush(10).await, 0);
    assert_eq!(outbox.len(), 1);

    outbox.force_all_due();
    assert_eq!(outbox.flush(10).await, 1);
    assert!(outbox.is_empty());

    let deletes: Vec<_> = api
        .calls()
        .into_iter()
        .filter(|c| c.op == "delete_message")
        .collect();
    assert_eq!(deletes.len(), 1);
    assert_eq!(deletes[0].message_id, message_id);
}

// =========================================================================
// Restore notices
// =========================================================================

#[tokio::test]
async fn restore_notice_sent_once_per_outage() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let api = MockTransport::new();
    api.fail_op("send_message", net_err());
    let outbox = outbox_in(dir.path(), Arc::clone(&api));

    outbox
        .send(MessageParams::text_to(42, "m1"), None, None)
        .await
        .unwrap();
    outbox
        .send(MessageParams::text_to(42, "m2"), None, None)
        .await
        .unwrap();

    api.succeed_op("send_message");
    outbox.force_all_due();
    assert_eq!(outbox.flush(10).await, 2);
    assert!(outbox.is_empty());

    let notices: Vec<_> = api
        .calls()
        .into_iter()
        .filter(|c| c.op == "send_message" && c.text.contains("Connection was down"))
        .collect();
    assert_eq!(notices.len(), 1, "one notice per outage, per destination");
    assert_eq!(notices[0].chat_id, 42);

    // Destination fully drained: offline epoch is over
    assert!(outbox.offline_since(42).is_none());
}

#[tokio::test]
async fn no_restore_notice_for_edit_only_backlog() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let api = MockTransport::new();
    api.fail_op("edit_message", net_err());
    let outbox = outbox_in(dir.path(), Arc::clone(&api));

    let params = MessageParams {
        chat_id: 42,
        message_id: Some(7),
        text: Some("progress 50%".to_string()),
        ..Default::default()
    };
    assert!(outbox.edit(params).await.unwrap().is_deferred());

    api.succeed_op("edit_message");
    outbox.force_all_due();
    assert_eq!(outbox.flush(10).await, 1);

    // The edit replayed, but nothing was re-sent, so no notice
    assert_eq!(api.calls_for("send_message"), 0);
}

// =========================================================================
// ClearAck side effect
// =========================================================================

#[tokio::test]
async fn clear_ack_schedules_deletion_after_delivery() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let api = MockTransport::new();
    let outbox = outbox_in(dir.path(), Arc::clone(&api));

    // The ack message exists and is bound
    let SendOutcome::Sent { message_id } = outbox
        .send(
            MessageParams::text_to(42, "working on it"),
            Some("ack:42:5".to_string()),
            None,
        )
        .await
        .unwrap()
    else {
        panic!("expected send to succeed");
    };

    // The real payload is deferred, carrying a ClearAck effect
    api.fail_op("send_message", net_err());
    outbox
        .send(
            MessageParams::text_to(42, "final result"),
            None,
            Some(SideEffect::ClearAck {
                chat_id: 42,
                coalesce_key: "ack:42:5".to_string(),
            }),
        )
        .await
        .unwrap();

    api.succeed_op("send_message");
    outbox.force_all_due();
    // First flush delivers the payload and queues the ack deletion
    assert!(outbox.flush(10).await >= 1);
    outbox.force_all_due();
    outbox.flush(10).await;

    let deletes: Vec<_> = api
        .calls()
        .into_iter()
        .filter(|c| c.op == "delete_message")
        .collect();
    assert_eq!(deletes.len(), 1);
    assert_eq!(deletes[0].message_id, message_id);
    assert!(outbox.is_empty());
}

// =========================================================================
// Persistence across restarts
// =========================================================================

#[tokio::test]
async fn deferred_entries_and_bindings_survive_restart() {
    let dir = tempfile::tempdir().expect("create tempdir");
    {
        let api = MockTransport::new();
        let outbox = outbox_in(dir.path(), Arc::clone(&api));
        outbox
            .send(
                MessageParams::text_to(42, "bound"),
                Some("status".to_string()),
                None,
            )
            .await
            .unwrap();
        api.fail_op("send_message", net_err());
        outbox
            .send(MessageParams::text_to(42, "pending"), None, None)
            .await
            .unwrap();
    }

    // A fresh process reads the same document
    let api = MockTransport::new();
    let outbox = outbox_in(dir.path(), Arc::clone(&api));
    assert_eq!(outbox.len(), 1);
    assert!(outbox.message_id_for_key(42, "status").is_some());

    outbox.force_all_due();
    assert_eq!(outbox.flush(10).await, 1);
    assert!(outbox.is_empty());
}
