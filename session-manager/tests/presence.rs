use std::sync::Arc;
use std::time::Duration;

use common_infra::{shutdown, telemetry};
use session_manager::{
    CoordinatorConfig, PresenceConfig, PresenceEvent, PresenceTracker, SessionCoordinator,
};
use session_store::{MemoryStore, ParticipantRef, SessionKind, SessionStatus};
use tokio::sync::broadcast;

fn fast_config() -> PresenceConfig {
    PresenceConfig {
        heartbeat_interval: Duration::from_millis(100),
        stale_multiplier: 3,
        sweep_interval: Duration::from_millis(50),
    }
}

async fn wait_for_event(
    events: &mut broadcast::Receiver<PresenceEvent>,
    want: PresenceEvent,
    deadline: Duration,
) {
    tokio::time::timeout(deadline, async {
        loop {
            match events.recv().await {
                Ok(event) if event == want => break,
                Ok(_) => continue,
                Err(err) => panic!("presence event stream ended early: {err}"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {want:?}"));
}

#[tokio::test]
async fn silent_participant_is_evicted_after_the_staleness_window() {
    telemetry::init_for_tests();
    let store = Arc::new(MemoryStore::new());
    let coordinator = SessionCoordinator::new(store.clone(), CoordinatorConfig::default());

    let session = coordinator
        .create(ParticipantRef::new("host", "Host"), SessionKind::Voice, 4)
        .await
        .unwrap();
    coordinator
        .join(&session.id, ParticipantRef::new("ghost", "Ghost"))
        .await
        .unwrap();

    // Only the host heartbeats; the ghost goes silent immediately.
    let tracker = PresenceTracker::new(coordinator.clone(), &session.id, "host", fast_config());
    let mut events = tracker.subscribe();
    let (handle, signal) = shutdown::channel();
    let task = tokio::spawn(tracker.run(signal));

    wait_for_event(
        &mut events,
        PresenceEvent::Evicted("ghost".into()),
        Duration::from_secs(5),
    )
    .await;

    let snapshot = coordinator.get(&session.id).await.unwrap();
    assert!(snapshot.participant("ghost").is_none());
    assert!(snapshot.participant("host").is_some());

    handle.trigger();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn no_eviction_before_twice_the_heartbeat_interval() {
    telemetry::init_for_tests();
    let store = Arc::new(MemoryStore::new());
    let coordinator = SessionCoordinator::new(store.clone(), CoordinatorConfig::default());

    let session = coordinator
        .create(ParticipantRef::new("host", "Host"), SessionKind::Voice, 4)
        .await
        .unwrap();
    coordinator
        .join(&session.id, ParticipantRef::new("ghost", "Ghost"))
        .await
        .unwrap();

    // A one-second interval leaves plenty of margin on a loaded machine:
    // the sweep fires every 100ms but the cutoff sits at three seconds.
    let config = PresenceConfig {
        heartbeat_interval: Duration::from_secs(1),
        stale_multiplier: 3,
        sweep_interval: Duration::from_millis(100),
    };
    let tracker = PresenceTracker::new(coordinator.clone(), &session.id, "host", config);
    let mut events = tracker.subscribe();
    let (handle, signal) = shutdown::channel();
    let task = tokio::spawn(tracker.run(signal));

    // Well inside twice the interval the silent ghost must still be there,
    // even though many sweeps have already run.
    tokio::time::sleep(Duration::from_millis(1800)).await;
    let snapshot = coordinator.get(&session.id).await.unwrap();
    assert!(snapshot.participant("ghost").is_some());

    // The same silence is punished once the staleness window passes.
    wait_for_event(
        &mut events,
        PresenceEvent::Evicted("ghost".into()),
        Duration::from_secs(10),
    )
    .await;

    handle.trigger();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn heartbeating_participants_survive_the_sweep() {
    telemetry::init_for_tests();
    let store = Arc::new(MemoryStore::new());
    let coordinator = SessionCoordinator::new(store.clone(), CoordinatorConfig::default());

    let session = coordinator
        .create(ParticipantRef::new("host", "Host"), SessionKind::Voice, 4)
        .await
        .unwrap();
    coordinator
        .join(&session.id, ParticipantRef::new("peer", "Peer"))
        .await
        .unwrap();

    let host_tracker =
        PresenceTracker::new(coordinator.clone(), &session.id, "host", fast_config());
    let peer_tracker =
        PresenceTracker::new(coordinator.clone(), &session.id, "peer", fast_config());
    let (handle, signal) = shutdown::channel();
    let host_task = tokio::spawn(host_tracker.run(signal.clone()));
    let peer_task = tokio::spawn(peer_tracker.run(signal));

    // Several staleness windows pass with both sides heartbeating.
    tokio::time::sleep(Duration::from_millis(700)).await;

    let snapshot = coordinator.get(&session.id).await.unwrap();
    assert_eq!(snapshot.participants.len(), 2);
    assert_eq!(snapshot.status, SessionStatus::Active);

    handle.trigger();
    host_task.await.unwrap().unwrap();
    peer_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn membership_and_status_changes_become_events() {
    telemetry::init_for_tests();
    let store = Arc::new(MemoryStore::new());
    let coordinator = SessionCoordinator::new(store.clone(), CoordinatorConfig::default());

    let session = coordinator
        .create(ParticipantRef::new("host", "Host"), SessionKind::Voice, 4)
        .await
        .unwrap();

    // Generous staleness window so the sweep never races the explicit
    // leave below.
    let config = PresenceConfig {
        heartbeat_interval: Duration::from_millis(100),
        stale_multiplier: 100,
        sweep_interval: Duration::from_millis(50),
    };
    let tracker = PresenceTracker::new(coordinator.clone(), &session.id, "host", config);
    let mut events = tracker.subscribe();
    let (_handle, signal) = shutdown::channel();
    let task = tokio::spawn(tracker.run(signal));

    let guest = ParticipantRef::new("guest", "Guest");
    coordinator.join(&session.id, guest.clone()).await.unwrap();
    wait_for_event(
        &mut events,
        PresenceEvent::StatusChanged(SessionStatus::Active),
        Duration::from_secs(5),
    )
    .await;

    coordinator.leave(&session.id, "guest").await.unwrap();
    wait_for_event(
        &mut events,
        PresenceEvent::Left("guest".into()),
        Duration::from_secs(5),
    )
    .await;

    coordinator.end(&session.id, "host", true).await.unwrap();
    wait_for_event(
        &mut events,
        PresenceEvent::StatusChanged(SessionStatus::Ended),
        Duration::from_secs(5),
    )
    .await;

    // A terminal status ends the run loop on its own.
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
