use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{timeout, Duration};

use super::{count_votes, CandidateId, ElectionCtl, ElectionCtlMsg, ElectionOutcome, ElectionResult, VoterId};
use crate::config::Config;
use crate::fixtures;
use crate::transport::PeerChannel;

const OUTCOME_TIMEOUT: Duration = Duration::from_millis(2_000);

fn votes(entries: &[(&str, &str)]) -> BTreeMap<VoterId, CandidateId> {
    entries.iter().map(|(voter, candidate)| (voter.to_string(), candidate.to_string())).collect()
}

#[test]
fn count_votes_unique_maximum_holder_wins() {
    let votes = votes(&[("a", "a"), ("b", "a"), ("c", "b")]);

    let output = count_votes("a", &votes);

    assert_eq!(output.result, ElectionResult::Won);
    assert_eq!(output.winner.as_deref(), Some("a"));
    assert_eq!(output.winner_votes, 2);
    assert_eq!(output.total_votes, 3);
    assert_eq!(output.voters, vec!["a".to_string(), "b".into(), "c".into()]);
    let expected_tally: BTreeMap<CandidateId, Vec<VoterId>> =
        [("a".to_string(), vec!["a".to_string(), "b".into()]), ("b".to_string(), vec!["c".to_string()])].into();
    assert_eq!(output.tally, expected_tally);
}

#[test]
fn count_votes_other_maximum_holder_loses() {
    let votes = votes(&[("a", "a"), ("b", "a"), ("c", "b")]);

    let output = count_votes("b", &votes);

    assert_eq!(output.result, ElectionResult::Lost);
    assert_eq!(output.winner.as_deref(), Some("a"), "expected the same winner regardless of the counting instance");
    assert_eq!(output.winner_votes, 2);
    assert_eq!(output.total_votes, 3);
}

#[test]
fn count_votes_shared_maximum_is_tied() {
    let votes = votes(&[("a", "a"), ("b", "b"), ("c", "a"), ("d", "b"), ("e", "c")]);

    for me in ["a", "b", "e"] {
        let output = count_votes(me, &votes);
        assert_eq!(output.result, ElectionResult::Tied, "expected a tie regardless of the counting instance");
        assert!(output.winner.is_none(), "expected no winner on a tie, got {:?}", output.winner);
        assert_eq!(output.winner_votes, 2);
        assert_eq!(output.total_votes, 5);
    }
}

#[test]
fn count_votes_empty_tally_is_tied() {
    let output = count_votes("a", &BTreeMap::new());

    assert_eq!(output.result, ElectionResult::Tied, "expected an empty tally to report a tie for retry");
    assert!(output.winner.is_none());
    assert_eq!(output.winner_votes, 0);
    assert_eq!(output.total_votes, 0);
}

/// Spawn an election controller on the given namespace with the given self-vote delay window.
fn spawn_election(
    namespace: &str, instance_id: &str, min_delay_ms: u64, delay_range_ms: u64,
) -> (mpsc::Sender<ElectionCtlMsg>, mpsc::Receiver<ElectionOutcome>, broadcast::Sender<()>) {
    let config = Arc::new(Config {
        election_min_delay_ms: min_delay_ms,
        election_delay_range_ms: delay_range_ms,
        ..(*fixtures::test_config(namespace, instance_id)).clone()
    });
    let channel = PeerChannel::connect(namespace, instance_id);
    let (shutdown_tx, _) = broadcast::channel(10);
    let (commands_tx, commands_rx) = mpsc::channel(10);
    let (outcomes_tx, outcomes_rx) = mpsc::channel(10);
    ElectionCtl::new(config, channel, shutdown_tx.clone(), commands_rx, outcomes_tx).spawn();
    (commands_tx, outcomes_rx, shutdown_tx)
}

#[tokio::test]
async fn solo_round_self_vote_wins() -> Result<()> {
    let namespace = fixtures::test_namespace();
    let (commands_tx, mut outcomes_rx, _shutdown_tx) = spawn_election(&namespace, "solo", 10, 20);

    commands_tx.send(ElectionCtlMsg::Start).await?;

    let outcome = timeout(OUTCOME_TIMEOUT, outcomes_rx.recv()).await.context("timeout awaiting outcome")?.context("outcome channel closed")?;
    assert_eq!(outcome.result, ElectionResult::Won);
    assert_eq!(outcome.winner.as_deref(), Some("solo"));
    assert_eq!(outcome.winner_votes, 1);
    assert_eq!(outcome.total_votes, 1);
    Ok(())
}

#[tokio::test]
async fn faster_self_voter_wins_two_peer_round() -> Result<()> {
    let namespace = fixtures::test_namespace();
    let (fast_tx, mut fast_outcomes, _fast_shutdown) = spawn_election(&namespace, "fast", 10, 40);
    let (slow_tx, mut slow_outcomes, _slow_shutdown) = spawn_election(&namespace, "slow", 100, 40);

    fast_tx.send(ElectionCtlMsg::Start).await?;
    slow_tx.send(ElectionCtlMsg::Start).await?;

    let fast = timeout(OUTCOME_TIMEOUT, fast_outcomes.recv()).await.context("timeout awaiting fast outcome")?.context("outcome channel closed")?;
    let slow = timeout(OUTCOME_TIMEOUT, slow_outcomes.recv()).await.context("timeout awaiting slow outcome")?.context("outcome channel closed")?;

    assert_eq!(fast.result, ElectionResult::Won, "expected the faster self-voter to win, got {:?}", fast);
    assert_eq!((fast.winner_votes, fast.total_votes), (2, 2));
    assert_eq!(slow.result, ElectionResult::Lost, "expected the slower self-voter to lose, got {:?}", slow);
    assert_eq!((slow.winner_votes, slow.total_votes), (2, 2));
    assert_eq!(slow.winner.as_deref(), Some("fast"));
    Ok(())
}

#[tokio::test]
async fn start_is_noop_while_round_active() -> Result<()> {
    let namespace = fixtures::test_namespace();
    let (commands_tx, mut outcomes_rx, _shutdown_tx) = spawn_election(&namespace, "solo", 10, 20);

    commands_tx.send(ElectionCtlMsg::Start).await?;
    commands_tx.send(ElectionCtlMsg::Start).await?;

    let first = timeout(OUTCOME_TIMEOUT, outcomes_rx.recv()).await.context("timeout awaiting outcome")?.context("outcome channel closed")?;
    assert_eq!(first.result, ElectionResult::Won);
    let second = timeout(Duration::from_millis(150), outcomes_rx.recv()).await;
    assert!(second.is_err(), "expected no second outcome from a start issued mid-round, got {:?}", second);
    Ok(())
}

#[tokio::test]
async fn round_state_resets_for_immediate_restart() -> Result<()> {
    let namespace = fixtures::test_namespace();
    let (commands_tx, mut outcomes_rx, _shutdown_tx) = spawn_election(&namespace, "solo", 10, 20);

    commands_tx.send(ElectionCtlMsg::Start).await?;
    let first = timeout(OUTCOME_TIMEOUT, outcomes_rx.recv()).await.context("timeout awaiting first outcome")?.context("outcome channel closed")?;
    commands_tx.send(ElectionCtlMsg::Start).await?;
    let second = timeout(OUTCOME_TIMEOUT, outcomes_rx.recv()).await.context("timeout awaiting second outcome")?.context("outcome channel closed")?;

    assert_eq!(first.result, ElectionResult::Won);
    assert_eq!(second.result, ElectionResult::Won);
    assert_eq!(second.total_votes, 1, "expected the second round's tally to start from a clean slate");
    Ok(())
}
