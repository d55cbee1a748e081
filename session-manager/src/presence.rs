use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use common_infra::{metrics::presence_metrics, shutdown::ShutdownSignal};
use serde::{Deserialize, Serialize};
use session_store::{ParticipantRef, Session, SessionStatus, TxAbort, UpdateError, UserId};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{SessionCoordinator, SessionError};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_STALE_MULTIPLIER: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// How often this client refreshes its own heartbeat stamp.
    pub heartbeat_interval: Duration,
    /// A participant is stale once its stamp is older than
    /// `stale_multiplier * heartbeat_interval`.
    pub stale_multiplier: u32,
    /// How often the stale sweep runs.
    pub sweep_interval: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            stale_multiplier: DEFAULT_STALE_MULTIPLIER,
            sweep_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }
}

impl PresenceConfig {
    pub fn staleness_cutoff(&self) -> Duration {
        self.heartbeat_interval * self.stale_multiplier
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    Joined(ParticipantRef),
    Left(UserId),
    /// Removed by the stale sweep rather than an explicit leave.
    Evicted(UserId),
    StatusChanged(SessionStatus),
}

/// Keeps one participant's membership alive and removes participants whose
/// heartbeats stopped. Every client runs a tracker; evictions go through the
/// same transactional leave as a voluntary departure, so concurrent sweeps
/// collapse into one removal and host transfer still applies.
#[derive(Clone)]
pub struct PresenceTracker {
    coordinator: SessionCoordinator,
    session_id: String,
    local_user: UserId,
    config: PresenceConfig,
    events: broadcast::Sender<PresenceEvent>,
}

impl PresenceTracker {
    pub fn new(
        coordinator: SessionCoordinator,
        session_id: impl Into<String>,
        local_user: impl Into<UserId>,
        config: PresenceConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            coordinator,
            session_id: session_id.into(),
            local_user: local_user.into(),
            config,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PresenceEvent> {
        self.events.subscribe()
    }

    /// Drive heartbeats, the stale sweep, and membership diffing until the
    /// session reaches a terminal status or shutdown is requested.
    pub async fn run(self, mut shutdown: ShutdownSignal) -> Result<(), SessionError> {
        let mut watch = self.coordinator.subscribe(&self.session_id).await?;
        let mut known = watch.borrow().clone();
        let mut evicted_by_us: HashSet<UserId> = HashSet::new();

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.wait() => {
                    debug!(session = %self.session_id, "presence tracker shutting down");
                    return Ok(());
                }
                changed = watch.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    let snapshot = watch.borrow_and_update().clone();
                    self.diff(&known, &snapshot, &mut evicted_by_us);
                    let terminal = snapshot.status.is_terminal();
                    known = snapshot;
                    if terminal {
                        return Ok(());
                    }
                }
                _ = heartbeat.tick() => {
                    if !self.beat().await {
                        return Ok(());
                    }
                }
                _ = sweep.tick() => {
                    self.sweep(&known, &mut evicted_by_us).await;
                }
            }
        }
    }

    fn diff(&self, old: &Session, new: &Session, evicted_by_us: &mut HashSet<UserId>) {
        emit_membership(&self.events, &old.participants, &new.participants, evicted_by_us);
        if old.status != new.status {
            let _ = self.events.send(PresenceEvent::StatusChanged(new.status));
        }
    }

    /// Refresh our own heartbeat stamp. Returns false once the session no
    /// longer carries us, which ends the run loop.
    async fn beat(&self) -> bool {
        let user = self.local_user.clone();
        let result = self
            .coordinator
            .store()
            .transactional_update(&self.session_id, &mut |session| {
                match session.participants.get_mut(&user) {
                    Some(me) => {
                        me.last_heartbeat_at = Utc::now();
                        Ok(())
                    }
                    None => Err(TxAbort::NotParticipant),
                }
            })
            .await;
        match result {
            Ok(_) => {
                presence_metrics().inc_heartbeats();
                true
            }
            Err(UpdateError::Aborted(TxAbort::NotParticipant | TxAbort::Terminal)) => {
                debug!(session = %self.session_id, user = %self.local_user, "heartbeat after departure");
                false
            }
            Err(err) => {
                warn!(session = %self.session_id, error = %err, "heartbeat write failed");
                true
            }
        }
    }

    async fn sweep(&self, known: &Session, evicted_by_us: &mut HashSet<UserId>) {
        let cutoff = match ChronoDuration::from_std(self.config.staleness_cutoff()) {
            Ok(cutoff) => cutoff,
            Err(_) => return,
        };
        let now = Utc::now();
        let stale: Vec<UserId> = known
            .participants
            .values()
            .filter(|p| now - p.last_heartbeat_at > cutoff)
            .map(|p| p.user_id.clone())
            .collect();

        for user_id in stale {
            evicted_by_us.insert(user_id.clone());
            match self.coordinator.leave(&self.session_id, &user_id).await {
                Ok(_) => {
                    presence_metrics().inc_evictions();
                    info!(session = %self.session_id, user = %user_id, "evicted stale participant");
                }
                Err(err) => {
                    evicted_by_us.remove(&user_id);
                    debug!(session = %self.session_id, user = %user_id, error = %err, "eviction skipped");
                }
            }
        }
    }
}

fn emit_membership(
    events: &broadcast::Sender<PresenceEvent>,
    old: &BTreeMap<UserId, ParticipantRef>,
    new: &BTreeMap<UserId, ParticipantRef>,
    evicted_by_us: &mut HashSet<UserId>,
) {
    for (user_id, participant) in new {
        if !old.contains_key(user_id) {
            let _ = events.send(PresenceEvent::Joined(participant.clone()));
        }
    }
    for user_id in old.keys() {
        if !new.contains_key(user_id) {
            let event = if evicted_by_us.remove(user_id) {
                PresenceEvent::Evicted(user_id.clone())
            } else {
                PresenceEvent::Left(user_id.clone())
            };
            let _ = events.send(event);
        }
    }
}
