use once_cell::sync::OnceCell;
use prometheus::{
    register_int_counter, register_int_gauge, Encoder, IntCounter, IntGauge, TextEncoder,
};

/// Metric set for session lifecycle (create/join/leave).
pub struct SessionMetrics {
    pub sessions_created_total: IntCounter,
    pub joins_rejected_total: IntCounter,
    pub active_participants: IntGauge,
}

impl SessionMetrics {
    pub fn on_startup(&self) {
        self.sessions_created_total.inc_by(0);
        self.joins_rejected_total.inc_by(0);
        self.active_participants.set(0);
    }

    pub fn inc_sessions_created(&self) {
        self.sessions_created_total.inc();
    }

    pub fn inc_joins_rejected(&self) {
        self.joins_rejected_total.inc();
    }

    pub fn set_active_participants(&self, count: i64) {
        self.active_participants.set(count);
    }
}

/// Metric set for the signaling relay and peer connection management.
pub struct SignalingMetrics {
    pub messages_relayed_total: IntCounter,
    pub renegotiations_total: IntCounter,
    pub peers_unreachable_total: IntCounter,
}

impl SignalingMetrics {
    pub fn inc_messages_relayed(&self) {
        self.messages_relayed_total.inc();
    }

    pub fn inc_renegotiations(&self) {
        self.renegotiations_total.inc();
    }

    pub fn inc_peers_unreachable(&self) {
        self.peers_unreachable_total.inc();
    }
}

/// Metric set for heartbeat presence tracking.
pub struct PresenceMetrics {
    pub heartbeats_total: IntCounter,
    pub evictions_total: IntCounter,
}

impl PresenceMetrics {
    pub fn inc_heartbeats(&self) {
        self.heartbeats_total.inc();
    }

    pub fn inc_evictions(&self) {
        self.evictions_total.inc();
    }
}

static SESSION_METRICS: OnceCell<SessionMetrics> = OnceCell::new();
static SIGNALING_METRICS: OnceCell<SignalingMetrics> = OnceCell::new();
static PRESENCE_METRICS: OnceCell<PresenceMetrics> = OnceCell::new();

pub fn session_metrics() -> &'static SessionMetrics {
    SESSION_METRICS.get_or_init(|| SessionMetrics {
        sessions_created_total: register_int_counter!(
            "session_created_total",
            "Total support sessions created"
        )
        .expect("register session_created_total"),
        joins_rejected_total: register_int_counter!(
            "session_joins_rejected_total",
            "Join attempts rejected (full or not joinable)"
        )
        .expect("register session_joins_rejected_total"),
        active_participants: register_int_gauge!(
            "session_active_participants",
            "Participants currently tracked by this client"
        )
        .expect("register session_active_participants"),
    })
}

pub fn signaling_metrics() -> &'static SignalingMetrics {
    SIGNALING_METRICS.get_or_init(|| SignalingMetrics {
        messages_relayed_total: register_int_counter!(
            "signaling_messages_relayed_total",
            "Signaling messages appended to the mailbox"
        )
        .expect("register signaling_messages_relayed_total"),
        renegotiations_total: register_int_counter!(
            "signaling_renegotiations_total",
            "Fresh offers issued after a transport failure"
        )
        .expect("register signaling_renegotiations_total"),
        peers_unreachable_total: register_int_counter!(
            "signaling_peers_unreachable_total",
            "Peers given up on after the renegotiation budget"
        )
        .expect("register signaling_peers_unreachable_total"),
    })
}

pub fn presence_metrics() -> &'static PresenceMetrics {
    PRESENCE_METRICS.get_or_init(|| PresenceMetrics {
        heartbeats_total: register_int_counter!(
            "presence_heartbeats_total",
            "Heartbeat writes issued by this client"
        )
        .expect("register presence_heartbeats_total"),
        evictions_total: register_int_counter!(
            "presence_evictions_total",
            "Stale participants evicted by the sweep"
        )
        .expect("register presence_evictions_total"),
    })
}

/// Render every registered metric in the prometheus text format. The
/// embedding process decides where (or whether) to expose it.
pub fn render() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if encoder
        .encode(&prometheus::gather(), &mut buffer)
        .is_err()
    {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_registered_sets() {
        session_metrics().on_startup();
        session_metrics().inc_sessions_created();
        signaling_metrics().inc_messages_relayed();
        presence_metrics().inc_heartbeats();

        let text = render();
        assert!(text.contains("session_created_total"));
        assert!(text.contains("signaling_messages_relayed_total"));
        assert!(text.contains("presence_heartbeats_total"));
    }
}
