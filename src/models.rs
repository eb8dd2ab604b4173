//! Data models of the coordination protocol's wire envelope and leadership state.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A message envelope as it travels over the peer bus.
///
/// Every message carries a correlation ID — fresh for fire-and-forget publishes, echoed from the
/// originating request for replies — along with the sender's identity. The bus delivers every
/// message to every connected peer, including the sender, so consumers must always filter by
/// topic and discard what they do not care about.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PeerMessage {
    /// The correlation ID of this message, echoed in any replies.
    pub id: Uuid,
    /// The identity of the sending instance.
    pub from: String,
    /// The topic-specific payload of this message.
    #[serde(flatten)]
    pub payload: Payload,
}

/// The set of topics understood by the coordination protocol.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub enum Topic {
    WhoIsLeader,
    WhoIsLeaderResponse,
    Heartbeat,
    HeartbeatResponse,
    RequestVote,
    Ballot,
    Leaving,
    StreamSubscribe,
    StreamUnsubscribe,
    StreamValue,
}

/// A topic-specific message payload.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "topic", content = "payload")]
pub enum Payload {
    /// A startup query for the current leader. Only a leader answers.
    WhoIsLeader,
    /// The leader's answer to a `WhoIsLeader` query, prescribing the asker's state.
    WhoIsLeaderResponse {
        status: LeadershipStatus,
        leader_id: String,
    },
    /// A follower's liveness probe of the leader, carrying the sender's wall-clock timestamp.
    Heartbeat { timestamp_ms: u64 },
    /// The leader's reply to a heartbeat, echoing the probe's timestamp.
    HeartbeatResponse { timestamp_ms: u64 },
    /// A candidate's request that peers vote for it this round.
    RequestVote {
        candidate: String,
        term: u64,
        /// The wall-clock instant at which the candidate's round completes. Receivers size
        /// their own round timer to the remaining time so peers converge on a shared
        /// completion moment.
        round_deadline_ms: u64,
    },
    /// A single voter's choice of candidate within the current round.
    Ballot { candidate: String, term: u64 },
    /// A best-effort notice that the sending instance is terminating.
    Leaving,
    /// A peer has gained a consumer for the named stream.
    StreamSubscribe {
        requester_id: String,
        stream_name: String,
    },
    /// A peer has lost a consumer for the named stream.
    StreamUnsubscribe {
        requester_id: String,
        stream_name: String,
    },
    /// A value produced for the named stream, republished to all peers.
    StreamValue {
        stream_name: String,
        value: serde_json::Value,
    },
}

impl Payload {
    /// The topic of this payload, used for subscription filtering.
    pub fn topic(&self) -> Topic {
        match self {
            Payload::WhoIsLeader => Topic::WhoIsLeader,
            Payload::WhoIsLeaderResponse { .. } => Topic::WhoIsLeaderResponse,
            Payload::Heartbeat { .. } => Topic::Heartbeat,
            Payload::HeartbeatResponse { .. } => Topic::HeartbeatResponse,
            Payload::RequestVote { .. } => Topic::RequestVote,
            Payload::Ballot { .. } => Topic::Ballot,
            Payload::Leaving => Topic::Leaving,
            Payload::StreamSubscribe { .. } => Topic::StreamSubscribe,
            Payload::StreamUnsubscribe { .. } => Topic::StreamUnsubscribe,
            Payload::StreamValue { .. } => Topic::StreamValue,
        }
    }
}

/// The phases of an instance's leadership lifecycle.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum LeadershipStatus {
    /// The instance has not yet completed its startup handshake.
    Initializing,
    /// An election is underway and the instance does not know the leader.
    Electing,
    /// This instance is the leader.
    Leader,
    /// A different instance is the leader.
    Follower,
}

/// The current leadership state of one instance, published on its live state feed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaderState {
    /// The lifecycle status of this instance.
    pub status: LeadershipStatus,
    /// The identity of this instance.
    pub id: String,
    /// The identity of the tracked leader, meaningful only in `Leader`/`Follower` status.
    pub leader: Option<String>,
}

impl LeaderState {
    /// Create the initial state for a new instance.
    pub fn new(id: String) -> Self {
        Self {
            status: LeadershipStatus::Initializing,
            id,
            leader: None,
        }
    }

    /// Whether this instance currently holds leadership.
    pub fn is_leader(&self) -> bool {
        matches!(self.status, LeadershipStatus::Leader)
    }
}
