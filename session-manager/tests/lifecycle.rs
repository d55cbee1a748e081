use std::sync::Arc;

use common_infra::telemetry;
use session_manager::{
    ChatChannel, CoordinatorConfig, HostLeavePolicy, SessionCoordinator, SessionError,
};
use session_store::{MemoryStore, ParticipantRef, SessionKind, SessionStatus};

fn coordinator(store: &Arc<MemoryStore>) -> SessionCoordinator {
    SessionCoordinator::new(store.clone(), CoordinatorConfig::default())
}

#[tokio::test]
async fn session_activates_at_threshold_and_enforces_capacity() {
    telemetry::init_for_tests();
    let store = Arc::new(MemoryStore::new());
    let coordinator = coordinator(&store);

    let session = coordinator
        .create(ParticipantRef::new("host", "Host"), SessionKind::Voice, 2)
        .await
        .unwrap();
    assert_eq!(session.status, SessionStatus::Waiting);
    assert_eq!(session.participants.len(), 1);

    let session = coordinator
        .join(&session.id, ParticipantRef::new("guest", "Guest"))
        .await
        .unwrap();
    assert_eq!(session.status, SessionStatus::Active);
    assert_eq!(session.participants.len(), 2);

    let rejected = coordinator
        .join(&session.id, ParticipantRef::new("late", "Late"))
        .await;
    assert_eq!(rejected.unwrap_err(), SessionError::SessionFull);
}

#[tokio::test]
async fn concurrent_joins_never_exceed_capacity() {
    telemetry::init_for_tests();
    let store = Arc::new(MemoryStore::new());
    let coordinator = coordinator(&store);

    let session = coordinator
        .create(ParticipantRef::new("host", "Host"), SessionKind::Voice, 3)
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for n in 0..8 {
        let coordinator = coordinator.clone();
        let session_id = session.id.clone();
        tasks.push(tokio::spawn(async move {
            coordinator
                .join(&session_id, ParticipantRef::new(format!("u{n}"), "User"))
                .await
        }));
    }

    let mut admitted = 0;
    let mut full = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => admitted += 1,
            Err(SessionError::SessionFull) => full += 1,
            Err(other) => panic!("unexpected join error: {other}"),
        }
    }
    assert_eq!(admitted, 2);
    assert_eq!(full, 6);

    let snapshot = coordinator.get(&session.id).await.unwrap();
    assert_eq!(snapshot.participants.len(), 3);
}

#[tokio::test]
async fn rejoining_is_idempotent() {
    let store = Arc::new(MemoryStore::new());
    let coordinator = coordinator(&store);

    let session = coordinator
        .create(ParticipantRef::new("host", "Host"), SessionKind::Voice, 4)
        .await
        .unwrap();
    coordinator
        .join(&session.id, ParticipantRef::new("guest", "Guest"))
        .await
        .unwrap();
    let again = coordinator
        .join(&session.id, ParticipantRef::new("guest", "Guest"))
        .await
        .unwrap();
    assert_eq!(again.participants.len(), 2);
}

#[tokio::test]
async fn leaving_and_rejoining_an_active_session() {
    let store = Arc::new(MemoryStore::new());
    let coordinator = coordinator(&store);

    let session = coordinator
        .create(ParticipantRef::new("host", "Host"), SessionKind::Voice, 4)
        .await
        .unwrap();
    coordinator
        .join(&session.id, ParticipantRef::new("guest", "Guest"))
        .await
        .unwrap();

    let after_leave = coordinator.leave(&session.id, "guest").await.unwrap();
    // Once active, a session does not fall back to waiting.
    assert_eq!(after_leave.status, SessionStatus::Active);
    assert_eq!(after_leave.participants.len(), 1);

    let rejoined = coordinator
        .join(&session.id, ParticipantRef::new("guest", "Guest"))
        .await
        .unwrap();
    assert_eq!(rejoined.participants.len(), 2);
}

#[tokio::test]
async fn host_departure_transfers_to_earliest_joiner() {
    let store = Arc::new(MemoryStore::new());
    let coordinator = coordinator(&store);

    let session = coordinator
        .create(ParticipantRef::new("host", "Host"), SessionKind::Voice, 4)
        .await
        .unwrap();
    coordinator
        .join(&session.id, ParticipantRef::new("a_first", "First"))
        .await
        .unwrap();
    coordinator
        .join(&session.id, ParticipantRef::new("b_second", "Second"))
        .await
        .unwrap();

    let after = coordinator.leave(&session.id, "host").await.unwrap();
    assert_eq!(after.host_id, "a_first");
    assert_eq!(after.status, SessionStatus::Active);
}

#[tokio::test]
async fn host_departure_can_end_the_session_for_everyone() {
    let store = Arc::new(MemoryStore::new());
    let coordinator = SessionCoordinator::new(
        store.clone(),
        CoordinatorConfig {
            host_leave_policy: HostLeavePolicy::EndForAll,
            ..CoordinatorConfig::default()
        },
    );

    let session = coordinator
        .create(ParticipantRef::new("host", "Host"), SessionKind::Voice, 4)
        .await
        .unwrap();
    coordinator
        .join(&session.id, ParticipantRef::new("guest", "Guest"))
        .await
        .unwrap();

    let after = coordinator.leave(&session.id, "host").await.unwrap();
    assert_eq!(after.status, SessionStatus::Ended);

    let rejoin = coordinator
        .join(&session.id, ParticipantRef::new("guest", "Guest"))
        .await;
    assert_eq!(rejoin.unwrap_err(), SessionError::NotJoinable);
}

#[tokio::test]
async fn abandoned_waiting_session_is_cancelled() {
    let store = Arc::new(MemoryStore::new());
    let coordinator = coordinator(&store);

    let session = coordinator
        .create(ParticipantRef::new("host", "Host"), SessionKind::Voice, 4)
        .await
        .unwrap();
    let after = coordinator.leave(&session.id, "host").await.unwrap();
    assert_eq!(after.status, SessionStatus::Cancelled);
    assert!(after.participants.is_empty());
}

#[tokio::test]
async fn only_the_host_ends_for_all() {
    let store = Arc::new(MemoryStore::new());
    let coordinator = coordinator(&store);

    let session = coordinator
        .create(ParticipantRef::new("host", "Host"), SessionKind::Voice, 4)
        .await
        .unwrap();
    coordinator
        .join(&session.id, ParticipantRef::new("guest", "Guest"))
        .await
        .unwrap();

    let denied = coordinator.end(&session.id, "guest", true).await;
    assert_eq!(denied.unwrap_err(), SessionError::NotHost);

    let ended = coordinator.end(&session.id, "host", true).await.unwrap();
    assert_eq!(ended.status, SessionStatus::Ended);

    // Terminal sessions reject everything but reads.
    let again = coordinator.end(&session.id, "host", true).await;
    assert_eq!(again.unwrap_err(), SessionError::NotJoinable);
}

#[tokio::test]
async fn ending_without_for_all_is_a_leave() {
    let store = Arc::new(MemoryStore::new());
    let coordinator = coordinator(&store);

    let session = coordinator
        .create(ParticipantRef::new("host", "Host"), SessionKind::Voice, 4)
        .await
        .unwrap();
    coordinator
        .join(&session.id, ParticipantRef::new("guest", "Guest"))
        .await
        .unwrap();

    let after = coordinator.end(&session.id, "guest", false).await.unwrap();
    assert_eq!(after.status, SessionStatus::Active);
    assert!(after.participant("guest").is_none());
}

#[tokio::test]
async fn chat_is_gated_on_session_kind_and_membership() {
    let store = Arc::new(MemoryStore::new());
    let coordinator = coordinator(&store);

    let voice = coordinator
        .create(ParticipantRef::new("host", "Host"), SessionKind::Voice, 4)
        .await
        .unwrap();
    let voice_chat = ChatChannel::new(store.clone(), store.clone(), &voice.id);
    assert_eq!(
        voice_chat.send("host", "hello").await.unwrap_err(),
        SessionError::ChatDisabled
    );

    let chat = coordinator
        .create(ParticipantRef::new("host", "Host"), SessionKind::Chat, 4)
        .await
        .unwrap();
    let channel = ChatChannel::new(store.clone(), store.clone(), &chat.id);

    assert_eq!(
        channel.send("stranger", "hi").await.unwrap_err(),
        SessionError::NotJoinable
    );

    let mut inbox = channel.subscribe().await.unwrap();
    let sent = channel.send("host", "hello").await.unwrap();
    let received = inbox.recv().await.unwrap();
    assert_eq!(received.id, sent.id);
    assert_eq!(received.display_name, "Host");

    coordinator.end(&chat.id, "host", true).await.unwrap();
    assert_eq!(
        channel.send("host", "too late").await.unwrap_err(),
        SessionError::NotJoinable
    );
}
