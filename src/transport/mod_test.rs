use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::time::{timeout, Duration};

use super::PeerChannel;
use crate::fixtures;
use crate::models::{LeadershipStatus, Payload, Topic};

const RECV_TIMEOUT: Duration = Duration::from_millis(500);

#[tokio::test]
async fn publish_is_visible_to_own_subscriptions() -> Result<()> {
    let namespace = fixtures::test_namespace();
    let chan = PeerChannel::connect(&namespace, "a");
    let mut sub = chan.subscribe(Topic::Leaving);

    let sent = chan.publish(Payload::Leaving);

    let msg = timeout(RECV_TIMEOUT, sub.next()).await.context("timeout awaiting own publish")?.context("subscription ended")?;
    assert_eq!(msg.id, sent.id, "expected the delivered message to be the one published");
    assert_eq!(msg.from, "a", "expected sender identity to be stamped on the envelope");
    Ok(())
}

#[tokio::test]
async fn subscriptions_filter_by_topic() -> Result<()> {
    let namespace = fixtures::test_namespace();
    let a = PeerChannel::connect(&namespace, "a");
    let b = PeerChannel::connect(&namespace, "b");
    let mut ballots = a.subscribe(Topic::Ballot);

    b.publish(Payload::Leaving);
    b.publish(Payload::WhoIsLeader);
    let sent = b.publish(Payload::Ballot { candidate: "a".into(), term: 1 });

    let msg = timeout(RECV_TIMEOUT, ballots.next()).await.context("timeout awaiting ballot")?.context("subscription ended")?;
    assert_eq!(msg.id, sent.id, "expected the first delivered message to be the ballot, other topics filtered");
    Ok(())
}

#[tokio::test]
async fn request_resolves_on_first_correlated_reply() -> Result<()> {
    let namespace = fixtures::test_namespace();
    let asker = PeerChannel::connect(&namespace, "asker");
    let responder = PeerChannel::connect(&namespace, "responder");

    let mut queries = responder.subscribe(Topic::WhoIsLeader);
    tokio::spawn(async move {
        if let Some(query) = queries.next().await {
            responder.reply(
                &query,
                Payload::WhoIsLeaderResponse {
                    status: LeadershipStatus::Follower,
                    leader_id: "responder".into(),
                },
            );
        }
    });

    let (sent, reply) = asker.request(Payload::WhoIsLeader);
    let reply = timeout(RECV_TIMEOUT, reply).await.context("timeout awaiting reply")?;

    assert_eq!(reply.id, sent.id, "expected reply to echo the request's correlation id");
    assert_eq!(reply.from, "responder");
    match reply.payload {
        Payload::WhoIsLeaderResponse { leader_id, .. } => assert_eq!(leader_id, "responder"),
        other => panic!("unexpected reply payload: {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn request_stream_yields_every_correlated_reply() -> Result<()> {
    let namespace = fixtures::test_namespace();
    let asker = PeerChannel::connect(&namespace, "asker");
    for responder_id in ["r0", "r1"] {
        let responder = PeerChannel::connect(&namespace, responder_id);
        let mut probes = responder.subscribe(Topic::Heartbeat);
        tokio::spawn(async move {
            if let Some(probe) = probes.next().await {
                if let Payload::Heartbeat { timestamp_ms } = probe.payload {
                    responder.reply(&probe, Payload::HeartbeatResponse { timestamp_ms });
                }
            }
        });
    }
    let (sent, replies) = asker.request_stream(Payload::Heartbeat { timestamp_ms: 42 });
    // Uncorrelated traffic on the same namespace must not leak into the reply stream.
    let noise = PeerChannel::connect(&namespace, "noise");
    noise.publish(Payload::HeartbeatResponse { timestamp_ms: 0 });
    let replies: Vec<_> = timeout(RECV_TIMEOUT, replies.take(2).collect()).await.context("timeout collecting replies")?;

    assert_eq!(replies.len(), 2, "expected a reply from each responder");
    for reply in replies {
        assert_eq!(reply.id, sent.id, "expected reply to echo the request's correlation id");
        match reply.payload {
            Payload::HeartbeatResponse { timestamp_ms } => assert_eq!(timestamp_ms, 42, "expected echoed timestamp"),
            other => panic!("unexpected reply payload: {:?}", other),
        }
    }
    Ok(())
}
