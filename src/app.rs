use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::broker::{StreamBroker, StreamBrokerCtl};
use crate::config::Config;
use crate::coordinator::LeadershipCtl;
use crate::models::LeaderState;
use crate::transport::PeerChannel;

/// One running instance of the coordination protocol.
///
/// Assembles the transport, leadership coordinator, and subscription broker for one process and
/// owns their lifecycle. Construction connects the bus and spawns the controllers — the instance
/// participates in leader elections from that point on. [`Instance::shutdown`] is the graceful
/// departure path: it broadcasts the leaving notice, stops all controllers, and joins them.
pub struct Instance {
    /// The application's runtime config.
    config: Arc<Config>,

    /// The broker handle for declaring and consuming named streams.
    broker: StreamBroker,
    /// The live leadership state feed.
    leadership: watch::Receiver<LeaderState>,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// The join handle of the leadership coordinator.
    coordinator_handle: JoinHandle<Result<()>>,
    /// The join handle of the stream broker.
    broker_handle: JoinHandle<Result<()>>,
}

impl Instance {
    /// Create a new instance and begin participating on the configured bus namespace.
    pub fn new(config: Arc<Config>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(10);
        let channel = PeerChannel::connect(&config.namespace, &config.instance_id);

        let (coordinator, leadership) = LeadershipCtl::new(config.clone(), channel.clone(), &shutdown_tx);
        let coordinator_handle = coordinator.spawn();

        let (broker_ctl, broker) = StreamBrokerCtl::new(config.clone(), channel, leadership.clone(), &shutdown_tx);
        let broker_handle = broker_ctl.spawn();

        Self {
            config,
            broker,
            leadership,
            shutdown_tx,
            coordinator_handle,
            broker_handle,
        }
    }

    /// The identity of this instance.
    pub fn id(&self) -> &str {
        &self.config.instance_id
    }

    /// The read-only live leadership state feed of this instance.
    pub fn leadership(&self) -> watch::Receiver<LeaderState> {
        self.leadership.clone()
    }

    /// The broker handle for declaring and consuming named streams.
    pub fn broker(&self) -> StreamBroker {
        self.broker.clone()
    }

    /// Gracefully shut this instance down, broadcasting its departure notice and joining all
    /// controllers.
    pub async fn shutdown(self) -> Result<()> {
        tracing::debug!(instance = %self.config.instance_id, "instance is shutting down");
        let _res = self.shutdown_tx.send(());
        self.coordinator_handle
            .await
            .context("error joining leadership coordinator handle")
            .and_then(|res| res)?;
        self.broker_handle.await.context("error joining stream broker handle").and_then(|res| res)?;
        tracing::debug!(instance = %self.config.instance_id, "instance shutdown complete");
        Ok(())
    }
}
