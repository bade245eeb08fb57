use super::*;
use shared::domain::ConversationId;
use storage::UserRecord;

use crate::{
    clock::ManualClock,
    raw::{DiffBatch, RawConversation, RawMessage, RawPeer},
    remote::{PeerRef, RemoteError},
    test_support::{
        history, manual_clock, memory_storage, raw_channel, raw_chat, raw_user, text_message,
        FakeRemote,
    },
};

const USER: UserId = UserId(1);

async fn engine() -> (SyncEngine, ManualClock) {
    let storage = memory_storage().await;
    storage
        .upsert_user(&UserRecord {
            id: USER,
            first_name: "Owner".into(),
            last_name: String::new(),
            username: "owner".into(),
            phone: String::new(),
            is_active: true,
            last_sync_time: None,
        })
        .await
        .expect("owner");
    let clock = manual_clock();
    (SyncEngine::new(storage, Arc::new(clock.clone())), clock)
}

fn cursor(pts: i64, qts: i64, date: i64, seq: i64) -> SyncCursor {
    SyncCursor { pts, qts, date, seq }
}

/// A direct chat, a basic group and a broadcast channel with a few messages each.
fn populated_remote() -> FakeRemote {
    let remote = FakeRemote::live();
    remote.with(|s| {
        s.conversations = vec![
            RawConversation::User(raw_user(10, "Dana")),
            RawConversation::Chat(raw_chat(20)),
            RawConversation::Channel(raw_channel(30, 333, true)),
            RawConversation::Unsupported,
        ];
        s.histories
            .insert(10, history(RawPeer::User { user_id: 10 }, &[1, 2, 3]));
        s.histories
            .insert(20, history(RawPeer::Chat { chat_id: 20 }, &[5, 6]));
        s.histories
            .insert(30, history(RawPeer::Channel { channel_id: 30 }, &[40, 41]));
        s.state = cursor(120, 4, 1_700_000_500, 9);
    });
    remote
}

async fn message_count(engine: &SyncEngine, conversation_id: i64) -> i64 {
    engine
        .storage()
        .count_messages(USER, ConversationId(conversation_id))
        .await
        .expect("count")
}

#[tokio::test]
async fn bootstrap_mirrors_listing_history_and_state() {
    let (engine, clock) = engine().await;
    let remote = populated_remote();

    let report = engine
        .run_pass(&remote, &CancellationToken::new(), USER, PassMode::Scheduled)
        .await
        .expect("bootstrap");

    assert_eq!(report.kind, PassKind::Bootstrap);
    assert_eq!(report.conversations, 3);
    assert_eq!(report.messages, 7);
    assert_eq!(report.errors, 0);
    assert_eq!(report.cursor, Some(cursor(120, 4, 1_700_000_500, 9)));
    assert_eq!(message_count(&engine, 10).await, 3);
    assert_eq!(message_count(&engine, 20).await, 2);
    assert_eq!(message_count(&engine, 30).await, 2);

    let stored_cursor = engine.storage().get_sync_cursor(USER).await.expect("cursor");
    assert_eq!(stored_cursor, cursor(120, 4, 1_700_000_500, 9));

    // One delay between each pair of history fetches, none before the first.
    assert_eq!(clock.sleeps(), vec![DEFAULT_HISTORY_DELAY; 2]);

    let direct = engine
        .storage()
        .get_conversation(USER, ConversationId(10))
        .await
        .expect("get")
        .expect("direct chat stored");
    assert_eq!(direct.title, "Dana");
    assert_eq!(direct.last_message, "message 3");

    let owner = engine
        .storage()
        .get_user(USER)
        .await
        .expect("get")
        .expect("owner");
    assert!(owner.last_sync_time.is_some());
}

#[tokio::test]
async fn bootstrap_addresses_each_kind_with_its_peer_style() {
    let (engine, _) = engine().await;
    let remote = populated_remote();

    engine
        .run_pass(&remote, &CancellationToken::new(), USER, PassMode::Scheduled)
        .await
        .expect("bootstrap");

    let calls = remote.history_calls();
    assert_eq!(
        calls[..3],
        [
            (
                PeerRef::User {
                    id: 10,
                    access_hash: Some(100)
                },
                SCHEDULED_HISTORY_LIMIT
            ),
            (PeerRef::Chat { id: 20 }, SCHEDULED_HISTORY_LIMIT),
            (
                PeerRef::Channel {
                    id: 30,
                    access_hash: 333
                },
                SCHEDULED_HISTORY_LIMIT
            ),
        ]
    );
    // The channel is revisited by the watermark pass.
    assert_eq!(calls.len(), 4);
}

#[tokio::test]
async fn repeated_bootstrap_creates_no_duplicates() {
    let (engine, _) = engine().await;
    let remote = populated_remote();
    let cancel = CancellationToken::new();

    engine
        .run_pass(&remote, &cancel, USER, PassMode::OnDemand)
        .await
        .expect("first pass");
    let before = [
        message_count(&engine, 10).await,
        message_count(&engine, 20).await,
        message_count(&engine, 30).await,
    ];
    engine
        .run_pass(&remote, &cancel, USER, PassMode::OnDemand)
        .await
        .expect("second pass");
    let after = [
        message_count(&engine, 10).await,
        message_count(&engine, 20).await,
        message_count(&engine, 30).await,
    ];

    assert_eq!(before, [3, 2, 2]);
    assert_eq!(before, after);
}

#[tokio::test]
async fn on_demand_pass_uses_the_deeper_window_even_with_a_cursor() {
    let (engine, _) = engine().await;
    engine
        .storage()
        .set_sync_cursor(USER, &cursor(5, 0, 1_700_000_000, 1))
        .await
        .expect("seed cursor");
    let remote = populated_remote();

    let report = engine
        .run_pass(&remote, &CancellationToken::new(), USER, PassMode::OnDemand)
        .await
        .expect("on-demand pass");

    assert_eq!(report.kind, PassKind::Bootstrap);
    assert_eq!(remote.history_calls()[0].1, ON_DEMAND_HISTORY_LIMIT);
}

#[tokio::test]
async fn incremental_pass_stores_diff_and_advances_cursor() {
    let (engine, _) = engine().await;
    let start = cursor(100, 1, 1_700_000_000, 5);
    engine
        .storage()
        .set_sync_cursor(USER, &start)
        .await
        .expect("seed");
    let remote = FakeRemote::live();
    remote.with(|s| {
        s.diffs.push_back(Ok(DiffBatch {
            messages: vec![
                text_message(8, RawPeer::User { user_id: 10 }, "new one"),
                text_message(9, RawPeer::Channel { channel_id: 30 }, "news"),
            ],
            users: vec![raw_user(7, "Sender")],
            state: cursor(104, 1, 1_700_000_090, 6),
        }));
    });

    let report = engine
        .run_pass(&remote, &CancellationToken::new(), USER, PassMode::Scheduled)
        .await
        .expect("incremental");

    assert_eq!(report.kind, PassKind::Incremental);
    assert_eq!(report.messages, 2);
    assert_eq!(remote.with(|s| s.diff_calls.clone()), vec![start]);
    assert_eq!(
        engine.storage().get_sync_cursor(USER).await.expect("cursor"),
        cursor(104, 1, 1_700_000_090, 6)
    );
    let stored = engine
        .storage()
        .list_messages(USER, ConversationId(10), 10, 0)
        .await
        .expect("list");
    assert_eq!(stored[0].record.sender_display_name, "Sender");
}

#[tokio::test]
async fn empty_state_leaves_cursor_unchanged() {
    let (engine, _) = engine().await;
    let start = cursor(100, 1, 1_700_000_000, 5);
    engine
        .storage()
        .set_sync_cursor(USER, &start)
        .await
        .expect("seed");
    let remote = FakeRemote::live();
    remote.with(|s| {
        s.diffs.push_back(Ok(DiffBatch {
            state: SyncCursor::ZERO,
            ..DiffBatch::default()
        }))
    });

    engine
        .run_pass(&remote, &CancellationToken::new(), USER, PassMode::Scheduled)
        .await
        .expect("incremental");

    assert_eq!(
        engine.storage().get_sync_cursor(USER).await.expect("cursor"),
        start
    );
}

#[tokio::test]
async fn cursor_never_moves_backwards_across_passes() {
    let (engine, _) = engine().await;
    engine
        .storage()
        .set_sync_cursor(USER, &cursor(100, 3, 1_700_000_000, 5))
        .await
        .expect("seed");
    let remote = FakeRemote::live();
    remote.with(|s| {
        // An empty difference only reports the date.
        s.diffs.push_back(Ok(DiffBatch {
            state: cursor(0, 0, 1_700_000_060, 0),
            ..DiffBatch::default()
        }));
        s.diffs.push_back(Ok(DiffBatch {
            state: cursor(99, 2, 1_700_000_030, 4),
            ..DiffBatch::default()
        }));
        s.diffs.push_back(Ok(DiffBatch {
            state: cursor(130, 3, 1_700_000_120, 7),
            ..DiffBatch::default()
        }));
    });

    let mut previous = engine.storage().get_sync_cursor(USER).await.expect("cursor");
    for _ in 0..3 {
        engine
            .run_pass(&remote, &CancellationToken::new(), USER, PassMode::Scheduled)
            .await
            .expect("incremental");
        let current = engine.storage().get_sync_cursor(USER).await.expect("cursor");
        assert!(current.pts >= previous.pts);
        assert!(current.date >= previous.date);
        previous = current;
    }
    assert_eq!(previous, cursor(130, 3, 1_700_000_120, 7));
}

#[tokio::test]
async fn malformed_diff_entries_are_skipped() {
    let (engine, _) = engine().await;
    engine
        .storage()
        .set_sync_cursor(USER, &cursor(1, 0, 1, 0))
        .await
        .expect("seed");
    let orphan = RawMessage {
        peer: None,
        ..text_message(3, RawPeer::User { user_id: 10 }, "lost")
    };
    let remote = FakeRemote::live();
    remote.with(|s| {
        s.diffs.push_back(Ok(DiffBatch {
            messages: vec![orphan, text_message(4, RawPeer::User { user_id: 10 }, "kept")],
            users: Vec::new(),
            state: cursor(2, 0, 2, 0),
        }))
    });

    let report = engine
        .run_pass(&remote, &CancellationToken::new(), USER, PassMode::Scheduled)
        .await
        .expect("incremental");

    assert_eq!(report.messages, 1);
    assert_eq!(report.errors, 1);
    assert_eq!(message_count(&engine, 10).await, 1);
    assert_eq!(
        engine.storage().get_sync_cursor(USER).await.expect("cursor"),
        cursor(2, 0, 2, 0)
    );
}

#[tokio::test]
async fn transient_diff_failure_keeps_cursor_and_still_resyncs_channels() {
    let (engine, _) = engine().await;
    let start = cursor(50, 0, 1_700_000_000, 1);
    engine
        .storage()
        .set_sync_cursor(USER, &start)
        .await
        .expect("seed");
    let remote = populated_remote();
    // Conversations must already be known for the watermark pass.
    engine
        .run_pass(&remote, &CancellationToken::new(), USER, PassMode::OnDemand)
        .await
        .expect("seed conversations");
    engine
        .storage()
        .set_sync_cursor(USER, &start)
        .await
        .expect("restore cursor");
    remote.with(|s| {
        s.diffs
            .push_back(Err(RemoteError::Transient("timeout".into())));
        s.histories.insert(
            30,
            history(RawPeer::Channel { channel_id: 30 }, &[40, 41, 42]),
        );
    });

    let report = engine
        .run_pass(&remote, &CancellationToken::new(), USER, PassMode::Scheduled)
        .await
        .expect("pass survives diff failure");

    assert_eq!(report.errors, 1);
    assert_eq!(report.watermark.stored, 1);
    assert_eq!(message_count(&engine, 30).await, 3);
    assert_eq!(
        engine.storage().get_sync_cursor(USER).await.expect("cursor"),
        start
    );
}

#[tokio::test]
async fn unauthorized_aborts_pass_without_touching_cursor() {
    let (engine, _) = engine().await;
    let remote = populated_remote();
    remote.with(|s| s.unauthorized = true);

    let err = engine
        .run_pass(&remote, &CancellationToken::new(), USER, PassMode::Scheduled)
        .await
        .expect_err("unauthorized");

    assert!(err.is_unauthorized());
    assert!(engine
        .storage()
        .get_sync_cursor(USER)
        .await
        .expect("cursor")
        .is_zero());
}

#[tokio::test]
async fn failing_conversation_does_not_abort_bootstrap() {
    let (engine, _) = engine().await;
    let remote = populated_remote();
    remote.with(|s| {
        s.failing_history
            .insert(20, RemoteError::Transient("flood wait".into()));
    });

    let report = engine
        .run_pass(&remote, &CancellationToken::new(), USER, PassMode::Scheduled)
        .await
        .expect("bootstrap");

    assert_eq!(report.errors, 1);
    assert_eq!(report.messages, 5);
    assert!(!engine
        .storage()
        .get_sync_cursor(USER)
        .await
        .expect("cursor")
        .is_zero());
}

#[tokio::test]
async fn cancellation_between_conversations_writes_no_cursor() {
    let (engine, _) = engine().await;
    let remote = populated_remote();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = engine
        .run_pass(&remote, &cancel, USER, PassMode::Scheduled)
        .await
        .expect_err("cancelled");

    assert!(matches!(err, SyncError::Cancelled(USER)));
    assert!(remote.history_calls().is_empty());
    assert!(engine
        .storage()
        .get_sync_cursor(USER)
        .await
        .expect("cursor")
        .is_zero());
}

#[tokio::test]
async fn unavailable_state_snapshot_keeps_ingested_history() {
    let (engine, _) = engine().await;
    let remote = populated_remote();
    remote.with(|s| s.state_error = Some(RemoteError::Transient("timeout".into())));

    let report = engine
        .run_pass(&remote, &CancellationToken::new(), USER, PassMode::Scheduled)
        .await
        .expect("pass survives a missing snapshot");

    assert_eq!(report.kind, PassKind::Bootstrap);
    assert_eq!(report.errors, 1);
    assert_eq!(report.messages, 7);
    assert_eq!(report.cursor, Some(SyncCursor::ZERO));
    assert!(engine
        .storage()
        .get_sync_cursor(USER)
        .await
        .expect("cursor")
        .is_zero());
    let owner = engine
        .storage()
        .get_user(USER)
        .await
        .expect("get")
        .expect("owner");
    assert!(owner.last_sync_time.is_some());
}

#[tokio::test]
async fn unauthorized_state_snapshot_aborts_bootstrap() {
    let (engine, _) = engine().await;
    let remote = populated_remote();
    remote.with(|s| {
        s.state_error = Some(RemoteError::Unauthorized("SESSION_REVOKED".into()))
    });

    let err = engine
        .run_pass(&remote, &CancellationToken::new(), USER, PassMode::Scheduled)
        .await
        .expect_err("unauthorized");
    assert!(err.is_unauthorized());
}

#[tokio::test]
async fn on_demand_snapshot_never_rewinds_an_existing_cursor() {
    let (engine, _) = engine().await;
    let stored = cursor(500, 6, 1_700_000_900, 20);
    engine
        .storage()
        .set_sync_cursor(USER, &stored)
        .await
        .expect("seed cursor");
    let remote = populated_remote();

    engine
        .run_pass(&remote, &CancellationToken::new(), USER, PassMode::OnDemand)
        .await
        .expect("lower snapshot");
    assert_eq!(
        engine.storage().get_sync_cursor(USER).await.expect("cursor"),
        stored
    );

    remote.with(|s| s.state = SyncCursor::ZERO);
    engine
        .run_pass(&remote, &CancellationToken::new(), USER, PassMode::OnDemand)
        .await
        .expect("empty snapshot");
    assert_eq!(
        engine.storage().get_sync_cursor(USER).await.expect("cursor"),
        stored
    );

    remote.with(|s| s.state = cursor(510, 6, 1_700_000_950, 21));
    engine
        .run_pass(&remote, &CancellationToken::new(), USER, PassMode::OnDemand)
        .await
        .expect("newer snapshot");
    assert_eq!(
        engine.storage().get_sync_cursor(USER).await.expect("cursor"),
        cursor(510, 6, 1_700_000_950, 21)
    );
}
