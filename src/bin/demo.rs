//! A runnable demonstration of leadership coordination and stream fan-out.
//!
//! Spins up three instances on one bus namespace, each declaring the same ticker stream, then
//! consumes the stream from a follower, disposes the leader mid-stream, and shows the newly
//! elected leader resuming production from the replayed interest snapshot.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio_stream::wrappers::IntervalStream;
use tracing_subscriber::prelude::*;

use bellwether::{Config, Instance, LeadershipStatus};

const NAMESPACE: &str = "bellwether-demo";
const STREAM: &str = "ticker";

#[tokio::main]
async fn main() -> Result<()> {
    // Setup tracing/logging system.
    tracing_subscriber::registry()
        // Filter spans based on the RUST_LOG env var.
        .with(tracing_subscriber::EnvFilter::from_default_env())
        // Send a copy of all spans to stdout in compact form.
        .with(tracing_subscriber::fmt::layer().with_target(true).with_level(true).with_ansi(true))
        // Install this registry as the global tracing registry.
        .try_init()
        .context("error initializing logging/tracing system")?;

    let mut instances = Vec::new();
    for id in ["peer-0", "peer-1", "peer-2"] {
        let instance = Instance::new(demo_config(id));
        instance.broker().declare(STREAM, ticker).await;
        instances.push(instance);
        // Stagger arrivals so later peers find the first leader via the startup handshake.
        tokio::time::sleep(Duration::from_millis(150)).await;
    }
    tokio::time::sleep(Duration::from_millis(500)).await;
    for instance in &instances {
        let state = instance.leadership().borrow().clone();
        tracing::info!(instance = %instance.id(), status = ?state.status, leader = ?state.leader, "instance state");
    }

    let leader_pos = instances
        .iter()
        .position(|instance| instance.leadership().borrow().status == LeadershipStatus::Leader)
        .context("no instance holds leadership")?;

    // Consume the ticker from a follower; whoever leads produces it.
    let follower_pos = (leader_pos + 1) % instances.len();
    let mut subscription = instances[follower_pos].broker().subscribe(STREAM).await;
    for _ in 0..5 {
        if let Some(value) = subscription.recv().await {
            tracing::info!(%value, "ticker value");
        }
    }

    // Dispose the current leader and watch the survivors hand production over.
    let leader = instances.remove(leader_pos);
    tracing::info!(instance = %leader.id(), "disposing the current leader");
    leader.shutdown().await?;

    for _ in 0..5 {
        if let Some(value) = subscription.recv().await {
            tracing::info!(%value, "ticker value after handover");
        }
    }

    drop(subscription);
    for instance in instances {
        instance.shutdown().await?;
    }
    Ok(())
}

fn demo_config(instance_id: &str) -> Arc<Config> {
    Arc::new(Config {
        rust_log: String::new(),
        namespace: NAMESPACE.to_string(),
        instance_id: instance_id.to_string(),
        election_min_delay_ms: 250,
        election_delay_range_ms: 100,
        startup_timeout_ms: 50,
        heartbeat_interval_ms: 1_000,
        heartbeat_timeout_ms: 400,
    })
}

/// A fresh ticker stream, restarted from zero by whichever instance assumes production.
fn ticker() -> impl futures::Stream<Item = serde_json::Value> + Send {
    IntervalStream::new(tokio::time::interval(Duration::from_millis(400)))
        .enumerate()
        .map(|(tick, _)| serde_json::json!(tick))
}
