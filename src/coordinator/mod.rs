//! Leadership coordinator.
//!
//! Owns the long-lived leadership state of one instance and publishes it on a watch channel for
//! collaborators. Startup races a `WhoIsLeader` query against a short randomized timeout: an
//! answer makes this instance a follower of the responder, silence moves it into an election.
//! From then on the coordinator reacts to bus traffic and timers only — answering leader queries
//! and heartbeats while leading, probing the leader's liveness while following, and re-invoking
//! the election engine whenever the leader is lost, departs, or a round ends in a tie.
//!
//! State transitions: Initializing → Electing → {Leader | Follower}; a tied round loops
//! Electing → Electing. Every timeout in this module recovers locally through one of these
//! transitions; none of them is surfaced as a fatal error.


use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};

use crate::config::Config;
use crate::election::{ElectionCtl, ElectionCtlMsg, ElectionOutcome, ElectionResult};
use crate::models::{LeaderState, LeadershipStatus, Payload, PeerMessage, Topic};
use crate::transport::{MessageStream, PeerChannel};
use crate::utils;

/// The size of the coordinator's internal event channel.
const EVENTS_CHANNEL_CAPACITY: usize = 100;

/// A message bound for the leadership coordinator from one of its spawned tasks.
pub enum CoordinatorMsg {
    /// An in-flight heartbeat probe has resolved; `rtt_ms` is absent on timeout.
    HeartbeatResult { rtt_ms: Option<u64> },
}

/// A controller encapsulating all logic for tracking and holding leadership.
pub struct LeadershipCtl {
    /// The application's runtime config.
    config: Arc<Config>,
    /// The peer bus channel of this instance.
    channel: PeerChannel,

    /// The current leadership state of this instance.
    state: LeaderState,
    /// The live feed over which leadership state is published.
    state_tx: watch::Sender<LeaderState>,

    /// The command channel of the spawned election controller.
    election_tx: mpsc::Sender<ElectionCtlMsg>,
    /// Election round outcomes.
    outcomes_rx: ReceiverStream<ElectionOutcome>,
    /// The join handle of the election controller.
    election_handle: JoinHandle<Result<()>>,

    /// Leader queries observed on the bus.
    leader_queries: MessageStream,
    /// Heartbeat probes observed on the bus.
    heartbeats: MessageStream,
    /// Departure notices observed on the bus.
    departures: MessageStream,

    /// A channel of events from this coordinator's spawned tasks.
    events_tx: mpsc::Sender<CoordinatorMsg>,
    /// A channel of events from this coordinator's spawned tasks.
    events_rx: ReceiverStream<CoordinatorMsg>,
    /// The in-flight heartbeat probe task, if any.
    heartbeat_probe: Option<JoinHandle<()>>,

    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
    /// A bool indicating that this controller needs to shutdown.
    descheduled: bool,
}

impl LeadershipCtl {
    /// Create a new instance, spawning its election controller.
    pub fn new(config: Arc<Config>, channel: PeerChannel, shutdown_tx: &broadcast::Sender<()>) -> (Self, watch::Receiver<LeaderState>) {
        let (election_tx, election_rx) = mpsc::channel(EVENTS_CHANNEL_CAPACITY);
        let (outcomes_tx, outcomes_rx) = mpsc::channel(EVENTS_CHANNEL_CAPACITY);
        let election = ElectionCtl::new(config.clone(), channel.clone(), shutdown_tx.clone(), election_rx, outcomes_tx);
        let election_handle = election.spawn();

        let (events_tx, events_rx) = mpsc::channel(EVENTS_CHANNEL_CAPACITY);
        let state = LeaderState::new(channel.instance_id().to_string());
        let (state_tx, state_rx) = watch::channel(state.clone());
        (
            Self {
                leader_queries: channel.subscribe(Topic::WhoIsLeader),
                heartbeats: channel.subscribe(Topic::Heartbeat),
                departures: channel.subscribe(Topic::Leaving),
                config,
                channel,
                state,
                state_tx,
                election_tx,
                outcomes_rx: ReceiverStream::new(outcomes_rx),
                election_handle,
                events_tx,
                events_rx: ReceiverStream::new(events_rx),
                heartbeat_probe: None,
                shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
                descheduled: false,
            },
            state_rx,
        )
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!(instance = %self.channel.instance_id(), "leadership coordinator has started");

        self.startup().await;

        let heartbeat_period = Duration::from_millis(self.config.heartbeat_interval_ms);
        let mut heartbeat_ticks = tokio::time::interval_at(tokio::time::Instant::now() + heartbeat_period, heartbeat_period);

        loop {
            if self.descheduled {
                break;
            }
            tokio::select! {
                Some(msg) = self.leader_queries.next() => self.handle_leader_query(msg),
                Some(msg) = self.heartbeats.next() => self.handle_heartbeat(msg),
                Some(msg) = self.departures.next() => self.handle_departure(msg).await,
                Some(outcome) = self.outcomes_rx.next() => self.handle_election_outcome(outcome).await,
                Some(msg) = self.events_rx.next() => self.handle_event(msg).await,
                _ = heartbeat_ticks.tick() => self.maybe_spawn_heartbeat_probe(),
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine. Best-effort departure notice so tracking followers re-elect
        // immediately instead of waiting out a heartbeat timeout.
        self.channel.publish(Payload::Leaving);
        if let Some(probe) = self.heartbeat_probe.take() {
            probe.abort();
        }
        if let Err(err) = self.election_handle.await.context("error joining election controller handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down election controller");
        }
        tracing::debug!(instance = %self.channel.instance_id(), "leadership coordinator has shutdown");
        Ok(())
    }

    /// Run the startup handshake: ask for the current leader, racing the answer against a short
    /// randomized timeout.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn startup(&mut self) {
        let wait = utils::jittered_ms(10, self.config.startup_timeout_ms);
        tracing::debug!(timeout = ?wait, "asking for leader");
        let (_sent, reply) = self.channel.request(Payload::WhoIsLeader);
        tokio::select! {
            reply = reply => self.handle_leader_reply(reply).await,
            _ = tokio::time::sleep(wait) => {
                tracing::debug!("no leader answered startup query, starting election");
                self.set_state(LeadershipStatus::Electing, None);
                self.start_election().await;
            }
            _ = self.shutdown_rx.next() => self.descheduled = true,
        }
    }

    async fn handle_leader_reply(&mut self, reply: PeerMessage) {
        match reply.payload {
            Payload::WhoIsLeaderResponse { status, leader_id } => {
                tracing::info!(leader = %leader_id, "leader answered startup query");
                self.set_state(status, Some(leader_id));
            }
            _ => {
                // A correlated reply of any other shape is a protocol violation; treat it the
                // same as silence and move to an election.
                tracing::warn!(topic = ?reply.payload.topic(), "unexpected reply to leader query");
                self.set_state(LeadershipStatus::Electing, None);
                self.start_election().await;
            }
        }
    }

    /// Answer a `WhoIsLeader` query. Only the leader answers, prescribing follower state with
    /// its own identity as leader.
    fn handle_leader_query(&mut self, msg: PeerMessage) {
        if !self.state.is_leader() {
            return;
        }
        self.channel.reply(
            &msg,
            Payload::WhoIsLeaderResponse {
                status: LeadershipStatus::Follower,
                leader_id: self.channel.instance_id().to_string(),
            },
        );
    }

    /// Answer a heartbeat probe, echoing its timestamp. Only the leader answers.
    fn handle_heartbeat(&mut self, msg: PeerMessage) {
        if !self.state.is_leader() {
            return;
        }
        if let Payload::Heartbeat { timestamp_ms } = msg.payload {
            self.channel.reply(&msg, Payload::HeartbeatResponse { timestamp_ms });
        }
    }

    /// Handle a departure notice. Only peers tracking the departed identity as their leader
    /// start a new election; everyone else ignores the notice.
    #[tracing::instrument(level = "debug", skip(self, msg), fields(from = %msg.from))]
    async fn handle_departure(&mut self, msg: PeerMessage) {
        let tracking_departed = matches!(self.state.status, LeadershipStatus::Leader | LeadershipStatus::Follower)
            && self.state.leader.as_deref() == Some(msg.from.as_str());
        if !tracking_departed {
            return;
        }
        tracing::info!(leader = %msg.from, "leader has left");
        self.set_state(LeadershipStatus::Electing, None);
        self.start_election().await;
    }

    /// Handle the outcome of an election round.
    #[tracing::instrument(level = "debug", skip(self, outcome), fields(result = ?outcome.result))]
    async fn handle_election_outcome(&mut self, outcome: ElectionOutcome) {
        match outcome.result {
            ElectionResult::Tied => {
                tracing::info!(winner_votes = outcome.winner_votes, "tied election, retrying");
                self.start_election().await;
            }
            ElectionResult::Won => {
                tracing::info!("i am the leader");
                let leader = self.channel.instance_id().to_string();
                self.set_state(LeadershipStatus::Leader, Some(leader));
            }
            ElectionResult::Lost => {
                tracing::info!(winner = ?outcome.winner, "i am a follower");
                self.set_state(LeadershipStatus::Follower, outcome.winner);
            }
        }
    }

    async fn handle_event(&mut self, msg: CoordinatorMsg) {
        match msg {
            CoordinatorMsg::HeartbeatResult { rtt_ms } => self.handle_heartbeat_result(rtt_ms).await,
        }
    }

    /// Handle the resolution of a heartbeat probe. A timeout is a leader loss; a timely reply
    /// only measures round-trip latency.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn handle_heartbeat_result(&mut self, rtt_ms: Option<u64>) {
        self.heartbeat_probe = None;
        match rtt_ms {
            Some(rtt_ms) => tracing::debug!(rtt_ms, "heartbeat reply received"),
            None => {
                if !matches!(self.state.status, LeadershipStatus::Follower) {
                    return;
                }
                tracing::info!("leader is dead, starting election");
                self.set_state(LeadershipStatus::Electing, None);
                self.start_election().await;
            }
        }
    }

    /// Spawn a heartbeat probe of the leader if this instance is a follower and no probe is
    /// already in flight.
    fn maybe_spawn_heartbeat_probe(&mut self) {
        if !matches!(self.state.status, LeadershipStatus::Follower) || self.heartbeat_probe.is_some() {
            return;
        }
        let channel = self.channel.clone();
        let timeout = Duration::from_millis(self.config.heartbeat_timeout_ms);
        let events_tx = self.events_tx.clone();
        self.heartbeat_probe = Some(tokio::spawn(async move {
            let sent_at = utils::now_ms();
            let (_sent, reply) = channel.request(Payload::Heartbeat { timestamp_ms: sent_at });
            let rtt_ms = tokio::select! {
                _reply = reply => Some(utils::now_ms().saturating_sub(sent_at)),
                _ = tokio::time::sleep(timeout) => None,
            };
            let _res = events_tx.send(CoordinatorMsg::HeartbeatResult { rtt_ms }).await;
        }));
    }

    /// Invoke the election engine for a new round.
    async fn start_election(&mut self) {
        if self.election_tx.send(ElectionCtlMsg::Start).await.is_err() {
            tracing::error!("election controller command channel closed");
        }
    }

    /// Transition leadership state & publish the update on the state feed.
    ///
    /// Any transition out of `Follower` cancels an in-flight heartbeat wait.
    fn set_state(&mut self, status: LeadershipStatus, leader: Option<String>) {
        self.state.status = status;
        self.state.leader = leader;
        if !matches!(status, LeadershipStatus::Follower) {
            if let Some(probe) = self.heartbeat_probe.take() {
                probe.abort();
            }
        }
        let _res = self.state_tx.send(self.state.clone());
    }
}
