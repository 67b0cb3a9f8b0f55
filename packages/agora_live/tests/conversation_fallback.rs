mod common;

use std::time::Duration;

use agora_live::{
    ConnectionState, ConversationChannel, ConversationEvent, ConversationId, ConversationSnapshot,
    EntryId, ImageUpload, SessionError,
};
use common::{alice, bob, harness, message};
use serde_json::json;
use tokio::sync::watch;

async fn wait_snapshot(
    rx: &mut watch::Receiver<ConversationSnapshot>,
    pred: impl FnMut(&ConversationSnapshot) -> bool,
) -> ConversationSnapshot {
    rx.wait_for(pred).await.unwrap().clone()
}

/// Let the initial history load finish.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn offline_send_falls_back_to_rest_and_reloads() {
    let h = harness();
    h.connector.set_refuse(true);
    let channel = ConversationChannel::open(ConversationId::from(42), alice(), &h.deps);
    let mut rx = channel.subscribe();
    wait_snapshot(&mut rx, |s| s.status.state == ConnectionState::Closed).await;

    let temp_id = channel.send("hello").await.unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;

    let snapshot = channel.snapshot();
    assert_eq!(snapshot.messages.len(), 1);
    let entry = &snapshot.messages[0];
    assert!(matches!(entry.id, EntryId::Server(_)));
    assert_ne!(entry.id, EntryId::Temp(temp_id));
    assert!(!entry.optimistic);
    assert!(!entry.failed);
    assert_eq!(entry.text(), "hello");

    let state = h.api.state.lock();
    assert_eq!(state.sends, vec!["hello".to_string()]);
    // Initial load plus the reload after the fallback send.
    assert!(state.list_calls >= 2);
    assert!(state.mark_read_calls >= 2);
}

#[tokio::test(start_paused = true)]
async fn live_send_is_confirmed_by_echo() {
    let mut h = harness();
    let channel = ConversationChannel::open(ConversationId::from(42), alice(), &h.deps);
    let mut peer = h.peers.recv().await.unwrap();
    let mut rx = channel.subscribe();
    wait_snapshot(&mut rx, |s| s.status.is_open()).await;
    settle().await;

    channel.send("hi there").await.unwrap();
    let frame = peer.recv_json().await.unwrap();
    assert_eq!(frame, json!({"type": "message", "message": {"content": "hi there"}}));

    let snapshot = wait_snapshot(&mut rx, |s| s.messages.len() == 1).await;
    assert!(snapshot.messages[0].optimistic);

    let echo = message(500, alice().as_sender(), "hi there");
    peer.send_json(&json!({"type": "message", "message": echo})).await;
    let snapshot = wait_snapshot(&mut rx, |s| {
        s.messages.first().is_some_and(|m| m.id == EntryId::Server(500))
    })
    .await;
    assert_eq!(snapshot.messages.len(), 1);
    assert!(h.api.state.lock().sends.is_empty());
}

#[tokio::test(start_paused = true)]
async fn unconfirmed_live_send_is_flagged_after_ten_seconds() {
    let mut h = harness();
    let channel = ConversationChannel::open(ConversationId::from(42), alice(), &h.deps);
    let _peer = h.peers.recv().await.unwrap();
    let mut rx = channel.subscribe();
    wait_snapshot(&mut rx, |s| s.status.is_open()).await;
    settle().await;
    let mut events = channel.events();

    let temp_id = channel.send("into the void").await.unwrap();
    tokio::time::sleep(Duration::from_millis(9_900)).await;
    assert!(!channel.snapshot().messages[0].failed);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let entry = channel.snapshot().messages[0].clone();
    assert!(entry.failed);
    assert!(!entry.optimistic);

    let mut saw_failed = false;
    while let Ok(event) = events.try_recv() {
        if event == (ConversationEvent::Failed { temp_id }) {
            saw_failed = true;
        }
    }
    assert!(saw_failed);
}

#[tokio::test(start_paused = true)]
async fn rest_failure_is_returned_and_flagged() {
    let h = harness();
    h.connector.set_refuse(true);
    h.api.state.lock().fail_sends = true;
    let channel = ConversationChannel::open(ConversationId::from(42), alice(), &h.deps);
    let mut rx = channel.subscribe();
    wait_snapshot(&mut rx, |s| s.status.state == ConnectionState::Closed).await;
    settle().await;

    let err = channel.send("nope").await.unwrap_err();
    assert!(matches!(err, SessionError::Api(_)));

    let snapshot = channel.snapshot();
    assert!(snapshot.messages[0].failed);
    assert!(
        snapshot
            .last_error
            .as_deref()
            .is_some_and(|e| e.starts_with("Failed to send message"))
    );
}

#[tokio::test(start_paused = true)]
async fn failed_message_can_be_resent() {
    let h = harness();
    h.connector.set_refuse(true);
    h.api.state.lock().fail_sends = true;
    let channel = ConversationChannel::open(ConversationId::from(42), alice(), &h.deps);
    let mut rx = channel.subscribe();
    wait_snapshot(&mut rx, |s| s.status.state == ConnectionState::Closed).await;
    settle().await;

    let failed = channel.send("again").await.unwrap_err();
    assert!(matches!(failed, SessionError::Api(_)));
    let temp_id = match channel.snapshot().messages[0].id {
        EntryId::Temp(id) => id,
        other => panic!("expected temp entry, got {other:?}"),
    };

    h.api.state.lock().fail_sends = false;
    channel.resend(temp_id).await.unwrap();
    let snapshot = channel.snapshot();
    assert_eq!(snapshot.messages.len(), 1);
    assert!(!snapshot.messages[0].failed);
    assert!(matches!(
        channel.resend(temp_id).await,
        Err(SessionError::NotFailed { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn failed_message_survives_offline_polling() {
    let h = harness();
    h.connector.set_refuse(true);
    h.api.state.lock().fail_sends = true;
    let channel = ConversationChannel::open(ConversationId::from(42), alice(), &h.deps);
    let mut rx = channel.subscribe();
    wait_snapshot(&mut rx, |s| s.status.state == ConnectionState::Closed).await;
    settle().await;

    channel.send("keep me").await.unwrap_err();
    let temp_id = match channel.snapshot().messages[0].id {
        EntryId::Temp(id) => id,
        other => panic!("expected temp entry, got {other:?}"),
    };
    let lists_before = h.api.state.lock().list_calls;

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(h.api.state.lock().list_calls > lists_before);
    let snapshot = channel.snapshot();
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(snapshot.messages[0].id, EntryId::Temp(temp_id));
    assert!(snapshot.messages[0].failed);

    h.api.state.lock().fail_sends = false;
    channel.resend(temp_id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;
    let snapshot = channel.snapshot();
    assert_eq!(snapshot.messages.len(), 1);
    assert!(matches!(snapshot.messages[0].id, EntryId::Server(_)));
    assert_eq!(snapshot.messages[0].text(), "keep me");
}

#[tokio::test(start_paused = true)]
async fn refused_live_frame_falls_back_to_rest_and_reloads() {
    let mut h = harness();
    let channel = ConversationChannel::open(ConversationId::from(42), alice(), &h.deps);
    let mut peer = h.peers.recv().await.unwrap();
    let mut rx = channel.subscribe();
    wait_snapshot(&mut rx, |s| s.status.is_open()).await;
    settle().await;
    let lists_before = h.api.state.lock().list_calls;

    peer.stop_reading();
    channel.send("over rest").await.unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert!(channel.snapshot().status.is_open());
    {
        let state = h.api.state.lock();
        assert_eq!(state.sends, vec!["over rest".to_string()]);
        assert!(state.list_calls > lists_before);
    }
    let snapshot = channel.snapshot();
    assert_eq!(snapshot.messages.len(), 1);
    assert!(matches!(snapshot.messages[0].id, EntryId::Server(_)));
}

#[tokio::test(start_paused = true)]
async fn sent_content_is_trimmed_before_matching_the_echo() {
    let mut h = harness();
    let channel = ConversationChannel::open(ConversationId::from(42), alice(), &h.deps);
    let mut peer = h.peers.recv().await.unwrap();
    let mut rx = channel.subscribe();
    wait_snapshot(&mut rx, |s| s.status.is_open()).await;
    settle().await;

    channel.send("  padded  ").await.unwrap();
    let frame = peer.recv_json().await.unwrap();
    assert_eq!(frame, json!({"type": "message", "message": {"content": "padded"}}));
    assert_eq!(channel.snapshot().messages[0].text(), "padded");

    let echo = message(600, alice().as_sender(), "padded");
    peer.send_json(&json!({"type": "message", "message": echo})).await;
    let snapshot = wait_snapshot(&mut rx, |s| {
        s.messages.first().is_some_and(|m| m.id == EntryId::Server(600))
    })
    .await;
    assert_eq!(snapshot.messages.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn images_always_use_rest() {
    let mut h = harness();
    let channel = ConversationChannel::open(ConversationId::from(42), alice(), &h.deps);
    let mut peer = h.peers.recv().await.unwrap();
    let mut rx = channel.subscribe();
    wait_snapshot(&mut rx, |s| s.status.is_open()).await;
    settle().await;

    let image = ImageUpload {
        file_name: "cat.png".into(),
        mime: "image/png".into(),
        bytes: vec![1, 2, 3],
    };
    channel.send_with_image("", image).await.unwrap();

    assert_eq!(h.api.state.lock().images, vec!["cat.png".to_string()]);
    assert!(peer.try_recv().is_none());
    let snapshot = channel.snapshot();
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(snapshot.messages[0].text(), "[image]");
}

#[tokio::test(start_paused = true)]
async fn typing_indicator_expires_and_clears_on_disconnect() {
    let mut h = harness();
    let channel = ConversationChannel::open(ConversationId::from(42), alice(), &h.deps);
    let peer = h.peers.recv().await.unwrap();
    let mut rx = channel.subscribe();
    wait_snapshot(&mut rx, |s| s.status.is_open()).await;

    peer.send_json(&json!({"type": "typing", "user_id": 2, "username": "bob", "is_typing": true}))
        .await;
    let snapshot = wait_snapshot(&mut rx, |s| !s.typing.is_empty()).await;
    assert_eq!(snapshot.typing_summary.as_deref(), Some("bob is typing…"));

    tokio::time::sleep(Duration::from_millis(3_100)).await;
    assert!(channel.snapshot().typing.is_empty());

    peer.send_json(&json!({"type": "typing", "user_id": 2, "username": "bob", "is_typing": true}))
        .await;
    wait_snapshot(&mut rx, |s| !s.typing.is_empty()).await;
    channel.disconnect();
    wait_snapshot(&mut rx, |s| s.typing.is_empty()).await;
}

#[tokio::test(start_paused = true)]
async fn own_typing_frames_are_ignored() {
    let mut h = harness();
    let channel = ConversationChannel::open(ConversationId::from(42), alice(), &h.deps);
    let peer = h.peers.recv().await.unwrap();
    let mut rx = channel.subscribe();
    wait_snapshot(&mut rx, |s| s.status.is_open()).await;

    peer.send_json(&json!({"type": "typing", "user_id": 1, "username": "alice", "is_typing": true}))
        .await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(channel.snapshot().typing.is_empty());
}

#[tokio::test(start_paused = true)]
async fn keystrokes_send_typing_then_stop_after_idle() {
    let mut h = harness();
    let channel = ConversationChannel::open(ConversationId::from(42), alice(), &h.deps);
    let mut peer = h.peers.recv().await.unwrap();
    let mut rx = channel.subscribe();
    wait_snapshot(&mut rx, |s| s.status.is_open()).await;

    channel.keystroke();
    let frame = peer.recv_json().await.unwrap();
    assert_eq!(frame, json!({"type": "typing", "is_typing": true}));

    let start = tokio::time::Instant::now();
    let frame = peer.recv_json().await.unwrap();
    assert_eq!(frame, json!({"type": "typing", "is_typing": false}));
    assert!(start.elapsed() >= Duration::from_millis(1_900));
}

#[tokio::test(start_paused = true)]
async fn polls_while_disconnected() {
    let h = harness();
    h.connector.set_refuse(true);
    let channel = ConversationChannel::open(ConversationId::from(42), alice(), &h.deps);
    let mut rx = channel.subscribe();
    wait_snapshot(&mut rx, |s| s.status.state == ConnectionState::Closed).await;
    let before = h.api.state.lock().list_calls;

    h.api
        .state
        .lock()
        .messages
        .push(message(7, bob(), "sent while you were away"));
    tokio::time::sleep(Duration::from_millis(10_100)).await;

    assert!(h.api.state.lock().list_calls >= before + 2);
    let snapshot = channel.snapshot();
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(snapshot.messages[0].text(), "sent while you were away");
}

#[tokio::test(start_paused = true)]
async fn edits_and_deletes_apply_locally() {
    let mut h = harness();
    h.api.state.lock().messages.push(message(9, alice().as_sender(), "typo"));
    let channel = ConversationChannel::open(ConversationId::from(42), alice(), &h.deps);
    let peer = h.peers.recv().await.unwrap();
    let mut rx = channel.subscribe();
    wait_snapshot(&mut rx, |s| s.messages.len() == 1).await;

    channel.edit(9, "fixed").await.unwrap();
    let snapshot = channel.snapshot();
    assert_eq!(snapshot.messages[0].text(), "fixed");
    assert!(snapshot.messages[0].edited);

    peer.send_json(&json!({"type": "message_deleted", "message_id": 9})).await;
    wait_snapshot(&mut rx, |s| s.messages.is_empty()).await;
}

#[tokio::test(start_paused = true)]
async fn failed_reload_keeps_existing_messages() {
    let mut h = harness();
    h.api.state.lock().messages.push(message(1, bob(), "first"));
    let channel = ConversationChannel::open(ConversationId::from(42), alice(), &h.deps);
    let _peer = h.peers.recv().await.unwrap();
    let mut rx = channel.subscribe();
    wait_snapshot(&mut rx, |s| s.messages.len() == 1).await;

    h.api.state.lock().fail_lists = true;
    channel.reload();
    let snapshot = wait_snapshot(&mut rx, |s| s.last_error.is_some()).await;
    assert_eq!(snapshot.messages.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn empty_message_is_rejected() {
    let h = harness();
    let channel = ConversationChannel::open(ConversationId::from(42), alice(), &h.deps);
    assert!(matches!(
        channel.send("   ").await,
        Err(SessionError::EmptyMessage)
    ));
}
