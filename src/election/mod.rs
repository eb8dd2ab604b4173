//! Election engine.
//!
//! Runs one randomized election round per invocation, producing exactly one terminal outcome per
//! round. A round is bounded by a fixed total window of `min_delay + delay_range` milliseconds.
//! Each instance schedules its own self-vote at `min_delay + uniform(0, delay_range)` within that
//! window: the fastest instance to fire broadcasts a vote request carrying the round's wall-clock
//! completion deadline, and every other peer cancels its own pending self-vote and votes for the
//! requester instead. The two-stage delay biases convergence toward the fastest requester while
//! still giving every peer time to broadcast and observe all ballots before anyone tallies.
//!
//! The engine tolerates the bus reordering vote and ballot messages: tally updates are idempotent
//! overwrites keyed by voter, and the "have I voted" flag is set at most once per round.

#[cfg(test)]
mod mod_test;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use futures::stream::StreamExt;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};

use crate::config::Config;
use crate::error::ERR_OUTCOME_CHANNEL_CLOSED;
use crate::models::{Payload, PeerMessage, Topic};
use crate::transport::{MessageStream, PeerChannel};
use crate::utils;

/// A voter's identity.
pub type VoterId = String;
/// A candidate's identity.
pub type CandidateId = String;

/// The terminal result of one election round, from the perspective of one instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElectionResult {
    /// This instance holds the unique highest vote count.
    Won,
    /// A different single instance holds the highest vote count.
    Lost,
    /// Two or more candidates share the highest vote count.
    Tied,
}

/// The full outcome of one election round.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ElectionOutcome {
    /// The terminal result of the round.
    pub result: ElectionResult,
    /// The winning candidate, absent on a tie.
    pub winner: Option<CandidateId>,
    /// The number of votes received by the winner (or by each tied leader).
    pub winner_votes: usize,
    /// The total number of ballots observed this round.
    pub total_votes: usize,
    /// How they voted: candidate → the voters who chose that candidate.
    pub tally: BTreeMap<CandidateId, Vec<VoterId>>,
    /// All voters observed this round.
    pub voters: Vec<VoterId>,
}

/// Compute the outcome of a round from the observed ballots, `votes` being voter → candidate.
pub fn count_votes(me: &str, votes: &BTreeMap<VoterId, CandidateId>) -> ElectionOutcome {
    let voters: Vec<VoterId> = votes.keys().cloned().collect();
    let mut tally: BTreeMap<CandidateId, Vec<VoterId>> = BTreeMap::new();
    for (voter, candidate) in votes {
        tally.entry(candidate.clone()).or_default().push(voter.clone());
    }
    let winner_votes = tally.values().map(Vec::len).max().unwrap_or(0);
    let winners: Vec<&CandidateId> = tally
        .iter()
        .filter(|(_, voters)| voters.len() == winner_votes)
        .map(|(candidate, _)| candidate)
        .collect();
    match winners.as_slice() {
        [winner] => ElectionOutcome {
            result: if *winner == me { ElectionResult::Won } else { ElectionResult::Lost },
            winner: Some((*winner).clone()),
            winner_votes,
            total_votes: voters.len(),
            tally,
            voters,
        },
        // Zero or multiple winners: report a tie. An empty tally yields a retry rather than a
        // winnerless loss.
        _ => ElectionOutcome {
            result: ElectionResult::Tied,
            winner: None,
            winner_votes,
            total_votes: voters.len(),
            tally,
            voters,
        },
    }
}

/// A message bound for the election controller.
pub enum ElectionCtlMsg {
    /// Begin a new election round; a no-op while a round is already active.
    Start,
}

/// A controller encapsulating all logic for running election rounds.
pub struct ElectionCtl {
    /// The application's runtime config.
    config: Arc<Config>,
    /// The peer bus channel of this instance.
    channel: PeerChannel,

    /// The current election term, advanced once per round.
    term: u64,
    /// Whether this instance has cast its ballot this round.
    has_voted: bool,
    /// The ballots observed this round, voter → candidate.
    votes: BTreeMap<VoterId, CandidateId>,
    /// When the pending self-vote fires, if scheduled.
    self_vote_at: Option<Instant>,
    /// When the active round completes, if a round is active.
    round_ends_at: Option<Instant>,
    /// The wall-clock completion deadline advertised with this round's vote request.
    round_deadline_ms: u64,

    /// A channel of commands for this controller.
    commands_rx: ReceiverStream<ElectionCtlMsg>,
    /// Vote requests observed on the bus.
    vote_requests: MessageStream,
    /// Ballots observed on the bus.
    ballots: MessageStream,
    /// The channel over which round outcomes are reported.
    outcomes_tx: mpsc::Sender<ElectionOutcome>,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
}

impl ElectionCtl {
    /// Create a new instance.
    pub fn new(
        config: Arc<Config>, channel: PeerChannel, shutdown_tx: broadcast::Sender<()>, commands_rx: mpsc::Receiver<ElectionCtlMsg>,
        outcomes_tx: mpsc::Sender<ElectionOutcome>,
    ) -> Self {
        let vote_requests = channel.subscribe(Topic::RequestVote);
        let ballots = channel.subscribe(Topic::Ballot);
        Self {
            config,
            channel,
            term: 0,
            has_voted: false,
            votes: BTreeMap::new(),
            self_vote_at: None,
            round_ends_at: None,
            round_deadline_ms: 0,
            commands_rx: ReceiverStream::new(commands_rx),
            vote_requests,
            ballots,
            outcomes_tx,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!(instance = %self.channel.instance_id(), "election controller has started");

        loop {
            tokio::select! {
                Some(msg) = self.commands_rx.next() => self.handle_ctl_msg(msg),
                Some(msg) = self.vote_requests.next() => self.handle_vote_request(msg),
                Some(msg) = self.ballots.next() => self.handle_ballot(msg),
                _ = maybe_sleep_until(self.self_vote_at) => self.handle_self_vote(),
                _ = maybe_sleep_until(self.round_ends_at) => self.complete_round().await,
                _ = self.shutdown_rx.next() => break,
            }
        }

        tracing::debug!(instance = %self.channel.instance_id(), "election controller has shutdown");
        Ok(())
    }

    fn handle_ctl_msg(&mut self, msg: ElectionCtlMsg) {
        match msg {
            ElectionCtlMsg::Start => self.start_round(),
        }
    }

    /// Begin a new election round, unless one is already active.
    #[tracing::instrument(level = "debug", skip(self))]
    fn start_round(&mut self) {
        if self.round_ends_at.is_some() {
            tracing::debug!("election already in progress");
            return;
        }
        self.term += 1;
        let now = Instant::now();
        let round_ms = self.config.election_round_ms();
        let self_vote_delay = utils::jittered_ms(self.config.election_min_delay_ms, self.config.election_delay_range_ms);
        self.self_vote_at = Some(now + self_vote_delay);
        self.round_ends_at = Some(now + std::time::Duration::from_millis(round_ms));
        self.round_deadline_ms = utils::now_ms() + round_ms;
        tracing::debug!(term = self.term, self_vote_in = ?self_vote_delay, round_ms, "election round started");
    }

    /// The self-vote timer has fired: request votes for this instance if it has not voted yet.
    #[tracing::instrument(level = "debug", skip(self))]
    fn handle_self_vote(&mut self) {
        self.self_vote_at = None;
        if self.has_voted {
            tracing::debug!("already voted, skipping self-vote");
            return;
        }
        let candidate = self.channel.instance_id().to_string();
        self.channel.publish(Payload::RequestVote {
            candidate: candidate.clone(),
            term: self.term,
            round_deadline_ms: self.round_deadline_ms,
        });
        self.record_ballot(candidate.clone(), candidate);
        self.has_voted = true;
    }

    /// Handle a vote request observed on the bus, our own included.
    ///
    /// A request from a peer adopts the requester's round deadline when no round is active
    /// locally, so all participants converge on a shared completion moment. Our own request is
    /// delivered back to us as well; the active-round and voted-flag guards make it a no-op
    /// beyond re-recording the already recorded self-ballot.
    #[tracing::instrument(level = "debug", skip(self, msg), fields(from = %msg.from))]
    fn handle_vote_request(&mut self, msg: PeerMessage) {
        let (candidate, term, round_deadline_ms) = match msg.payload {
            Payload::RequestVote { candidate, term, round_deadline_ms } => (candidate, term, round_deadline_ms),
            _ => return,
        };

        if self.round_ends_at.is_none() {
            self.votes.clear();
            self.has_voted = false;
            self.term += 1;
            let remaining = round_deadline_ms.saturating_sub(utils::now_ms());
            self.round_ends_at = Some(Instant::now() + std::time::Duration::from_millis(remaining));
            self.round_deadline_ms = round_deadline_ms;
            tracing::debug!(remaining_ms = remaining, "new election requested by peer");
        }

        self.record_ballot(msg.from, candidate.clone());

        // A pending self-vote is redundant once any requester has gone first.
        self.self_vote_at = None;

        if !self.has_voted {
            self.has_voted = true;
            self.channel.publish(Payload::Ballot { candidate: candidate.clone(), term });
            self.record_ballot(self.channel.instance_id().to_string(), candidate);
        }
    }

    /// Handle a ballot observed on the bus. Records the tally only; never marks this instance
    /// as having voted.
    fn handle_ballot(&mut self, msg: PeerMessage) {
        if let Payload::Ballot { candidate, .. } = msg.payload {
            self.record_ballot(msg.from, candidate);
        }
    }

    fn record_ballot(&mut self, voter: VoterId, candidate: CandidateId) {
        self.votes.insert(voter, candidate);
    }

    /// The round window has elapsed: tally the observed ballots and report the outcome.
    ///
    /// All round state is reset before reporting so a new round may start immediately.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn complete_round(&mut self) {
        let outcome = count_votes(self.channel.instance_id(), &self.votes);
        self.round_ends_at = None;
        self.self_vote_at = None;
        self.has_voted = false;
        self.votes.clear();
        tracing::debug!(result = ?outcome.result, winner = ?outcome.winner, total_votes = outcome.total_votes, "election round complete");
        if self.outcomes_tx.send(outcome).await.is_err() {
            tracing::error!("{}", ERR_OUTCOME_CHANNEL_CLOSED);
            let _res = self.shutdown_tx.send(());
        }
    }
}

/// Sleep until the given deadline, or forever when no deadline is set.
async fn maybe_sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}
