//! Duplex subscription broker.
//!
//! Lets any instance declare a named stream backed by a local producer, and any instance consume
//! it by name. Only the current leader runs a stream's producer; every emitted value is
//! republished on the bus so the consumers of all peers — the producer's own included — see an
//! identical sequence through one code path.
//!
//! Which streams need producing is decided from observed interest alone: every peer mirrors the
//! subscribe/unsubscribe broadcasts into its own [`InterestLedger`], and whichever instance holds
//! leadership binds a producer for each name with interest. Because every peer carries the full
//! mirror, a newly promoted leader resumes production by replaying its own snapshot — no state is
//! handed over directly.

pub mod interest;
#[cfg(test)]
mod interest_test;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::Result;
use futures::stream::{BoxStream, StreamExt};
use futures::Stream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream, WatchStream};

use crate::broker::interest::InterestLedger;
use crate::config::Config;
use crate::models::{LeaderState, Payload, PeerMessage, Topic};
use crate::transport::{MessageStream, PeerChannel};

/// The buffer size of each local subscriber's value channel.
const SUBSCRIBER_BUFFER: usize = 256;
/// The size of the broker's request channel.
const REQUESTS_CHANNEL_CAPACITY: usize = 100;

/// A factory producing a fresh instance of a declared stream, invoked each time this instance
/// assumes production responsibility for the stream's name.
pub type ProducerFn = Box<dyn Fn() -> BoxStream<'static, serde_json::Value> + Send>;

/// A message bound for the broker controller.
pub enum BrokerCtlMsg {
    /// Register a local producer for the named stream.
    Declare { stream_name: String, producer: ProducerFn },
    /// Register a local consumer of the named stream, acking once it is wired in.
    Subscribe {
        stream_name: String,
        values_tx: mpsc::Sender<serde_json::Value>,
        ack: oneshot::Sender<()>,
    },
    /// A producer binding's stream has completed on its own.
    ProducerFinished { stream_name: String },
}

/// A controller encapsulating all logic for stream production and fan-out.
pub struct StreamBrokerCtl {
    /// The application's runtime config.
    _config: Arc<Config>,
    /// The peer bus channel of this instance.
    channel: PeerChannel,

    /// A channel of requests from the broker handle and spawned producer tasks.
    requests_tx: mpsc::Sender<BrokerCtlMsg>,
    /// A channel of requests from the broker handle and spawned producer tasks.
    requests_rx: ReceiverStream<BrokerCtlMsg>,
    /// Stream subscribe broadcasts observed on the bus.
    subscribes: MessageStream,
    /// Stream unsubscribe broadcasts observed on the bus.
    unsubscribes: MessageStream,
    /// Stream values observed on the bus.
    values: MessageStream,
    /// The coordinator's live leadership feed.
    leadership: WatchStream<LeaderState>,

    /// Whether this instance currently holds production responsibility.
    is_leader: bool,
    /// The mirrored interest state of all named streams.
    ledger: InterestLedger,
    /// Locally declared producers, by stream name.
    producers: HashMap<String, ProducerFn>,
    /// Active producer bindings, by stream name. At most one per stream.
    bindings: HashMap<String, JoinHandle<()>>,
    /// Local consumers, by stream name.
    local_subs: HashMap<String, Vec<mpsc::Sender<serde_json::Value>>>,

    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
}

impl StreamBrokerCtl {
    /// Create a new instance.
    pub fn new(
        config: Arc<Config>, channel: PeerChannel, leadership: watch::Receiver<LeaderState>, shutdown_tx: &broadcast::Sender<()>,
    ) -> (Self, StreamBroker) {
        let (requests_tx, requests_rx) = mpsc::channel(REQUESTS_CHANNEL_CAPACITY);
        let handle = StreamBroker {
            channel: channel.clone(),
            requests_tx: requests_tx.clone(),
        };
        (
            Self {
                _config: config,
                subscribes: channel.subscribe(Topic::StreamSubscribe),
                unsubscribes: channel.subscribe(Topic::StreamUnsubscribe),
                values: channel.subscribe(Topic::StreamValue),
                channel,
                requests_tx,
                requests_rx: ReceiverStream::new(requests_rx),
                leadership: WatchStream::new(leadership),
                is_leader: false,
                ledger: InterestLedger::new(),
                producers: HashMap::new(),
                bindings: HashMap::new(),
                local_subs: HashMap::new(),
                shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            },
            handle,
        )
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!(instance = %self.channel.instance_id(), "stream broker has started");

        loop {
            tokio::select! {
                Some(msg) = self.requests_rx.next() => self.handle_ctl_msg(msg),
                Some(msg) = self.subscribes.next() => self.handle_interest(msg, 1),
                Some(msg) = self.unsubscribes.next() => self.handle_interest(msg, -1),
                Some(msg) = self.values.next() => self.handle_stream_value(msg),
                Some(state) = self.leadership.next() => self.handle_leadership_update(state),
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        for (name, binding) in self.bindings.drain() {
            tracing::debug!(stream = %name, "tearing down producer binding");
            binding.abort();
        }
        tracing::debug!(instance = %self.channel.instance_id(), "stream broker has shutdown");
        Ok(())
    }

    /// Handle a broker request message.
    fn handle_ctl_msg(&mut self, msg: BrokerCtlMsg) {
        match msg {
            BrokerCtlMsg::Declare { stream_name, producer } => self.handle_declare(stream_name, producer),
            BrokerCtlMsg::Subscribe { stream_name, values_tx, ack } => {
                self.local_subs.entry(stream_name).or_default().push(values_tx);
                let _res = ack.send(());
            }
            BrokerCtlMsg::ProducerFinished { stream_name } => {
                tracing::debug!(stream = %stream_name, "producer stream completed");
                self.bindings.remove(&stream_name);
            }
        }
    }

    /// Register a local producer. If this instance is already responsible for the name, bind it
    /// right away.
    #[tracing::instrument(level = "debug", skip(self, producer), fields(stream = %stream_name))]
    fn handle_declare(&mut self, stream_name: String, producer: ProducerFn) {
        if self.producers.insert(stream_name.clone(), producer).is_some() {
            tracing::warn!(stream = %stream_name, "producer for stream was already declared, replacing");
        }
        if self.is_leader && self.ledger.count(&stream_name) > 0 {
            self.ensure_binding(&stream_name);
        }
    }

    /// Mirror an observed subscribe/unsubscribe broadcast into the ledger, and adjust producer
    /// bindings when this instance is the leader.
    #[tracing::instrument(level = "debug", skip(self, msg), fields(from = %msg.from))]
    fn handle_interest(&mut self, msg: PeerMessage, delta: i64) {
        let (requester_id, stream_name) = match msg.payload {
            Payload::StreamSubscribe { requester_id, stream_name } | Payload::StreamUnsubscribe { requester_id, stream_name } => {
                (requester_id, stream_name)
            }
            _ => return,
        };
        let total = self.ledger.apply(&requester_id, &stream_name, delta);
        tracing::debug!(stream = %stream_name, total, "interest updated");
        if !self.is_leader {
            return;
        }
        if total > 0 {
            self.ensure_binding(&stream_name);
        } else {
            self.teardown_binding(&stream_name);
        }
    }

    /// Relay a value observed on the bus into this instance's local subscribers.
    fn handle_stream_value(&mut self, msg: PeerMessage) {
        let (stream_name, value) = match msg.payload {
            Payload::StreamValue { stream_name, value } => (stream_name, value),
            _ => return,
        };
        let subs = match self.local_subs.get_mut(&stream_name) {
            Some(subs) => subs,
            None => return,
        };
        subs.retain(|tx| match tx.try_send(value.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(stream = %stream_name, "local subscriber lagging, dropping value");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        if subs.is_empty() {
            self.local_subs.remove(&stream_name);
        }
    }

    /// React to a leadership change from the coordinator's feed.
    ///
    /// A genuine transition into leader replays the full mirrored interest snapshot exactly
    /// once, as if each interested name were freshly requested; a transition out of leader
    /// tears down every binding, as production responsibility has moved.
    #[tracing::instrument(level = "debug", skip(self, state), fields(status = ?state.status))]
    fn handle_leadership_update(&mut self, state: LeaderState) {
        let was_leader = self.is_leader;
        self.is_leader = state.is_leader();
        if self.is_leader && !was_leader {
            let snapshot = self.ledger.interested_streams();
            tracing::info!(streams = snapshot.len(), "assumed production responsibility, replaying interest snapshot");
            for stream_name in snapshot {
                self.ensure_binding(&stream_name);
            }
        }
        if was_leader && !self.is_leader {
            for (name, binding) in self.bindings.drain() {
                tracing::debug!(stream = %name, "leadership lost, tearing down producer binding");
                binding.abort();
            }
        }
    }

    /// Bind the declared producer for the named stream, if not already bound.
    ///
    /// Binding is keyed by name, which makes a residual duplicate replay a no-op rather than a
    /// second producer subscription.
    fn ensure_binding(&mut self, stream_name: &str) {
        if self.bindings.contains_key(stream_name) {
            return;
        }
        let producer = match self.producers.get(stream_name) {
            Some(producer) => producer,
            None => {
                tracing::warn!(stream = %stream_name, "interest in a stream with no declared producer, ignoring");
                return;
            }
        };
        tracing::debug!(stream = %stream_name, "binding producer");
        let mut source = producer();
        let channel = self.channel.clone();
        let requests_tx = self.requests_tx.clone();
        let name = stream_name.to_string();
        let handle = tokio::spawn(async move {
            while let Some(value) = source.next().await {
                channel.publish(Payload::StreamValue {
                    stream_name: name.clone(),
                    value,
                });
            }
            let _res = requests_tx.send(BrokerCtlMsg::ProducerFinished { stream_name: name }).await;
        });
        self.bindings.insert(stream_name.to_string(), handle);
    }

    /// Tear down the named stream's producer binding, if active.
    fn teardown_binding(&mut self, stream_name: &str) {
        if let Some(binding) = self.bindings.remove(stream_name) {
            tracing::debug!(stream = %stream_name, "interest reached zero, tearing down producer binding");
            binding.abort();
        }
    }
}

/// A cloneable handle for declaring and consuming named streams.
#[derive(Clone)]
pub struct StreamBroker {
    /// The peer bus channel of this instance.
    channel: PeerChannel,
    /// The broker controller's request channel.
    requests_tx: mpsc::Sender<BrokerCtlMsg>,
}

impl StreamBroker {
    /// Declare a named stream backed by a local producer.
    ///
    /// The factory is invoked to instantiate the producer each time this instance assumes
    /// production responsibility for the name, which happens only while it holds leadership and
    /// observed interest in the stream is greater than zero.
    pub async fn declare<F, S>(&self, stream_name: &str, producer: F)
    where
        F: Fn() -> S + Send + 'static,
        S: Stream<Item = serde_json::Value> + Send + 'static,
    {
        let producer: ProducerFn = Box::new(move || producer().boxed());
        let _res = self
            .requests_tx
            .send(BrokerCtlMsg::Declare {
                stream_name: stream_name.to_string(),
                producer,
            })
            .await;
    }

    /// Subscribe to the named stream, wherever it is produced.
    ///
    /// Increments this instance's interest in the stream and returns a live sequence of the
    /// values republished for it — identical on every peer, the producer's own included.
    /// Dropping the subscription broadcasts the matching interest decrement.
    pub async fn subscribe(&self, stream_name: &str) -> StreamSubscription {
        let (values_tx, values_rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let (ack_tx, ack_rx) = oneshot::channel();
        let _res = self
            .requests_tx
            .send(BrokerCtlMsg::Subscribe {
                stream_name: stream_name.to_string(),
                values_tx,
                ack: ack_tx,
            })
            .await;
        // Wait for the consumer to be wired in before broadcasting interest, else values
        // produced in response to the broadcast could slip past it.
        let _res = ack_rx.await;
        self.channel.publish(Payload::StreamSubscribe {
            requester_id: self.channel.instance_id().to_string(),
            stream_name: stream_name.to_string(),
        });
        StreamSubscription {
            values_rx,
            guard: SubscriptionGuard {
                channel: self.channel.clone(),
                stream_name: stream_name.to_string(),
            },
        }
    }
}

/// A live subscription to a named stream.
///
/// Dropping the subscription broadcasts the implicit unsubscribe for its requester.
pub struct StreamSubscription {
    values_rx: mpsc::Receiver<serde_json::Value>,
    guard: SubscriptionGuard,
}

impl StreamSubscription {
    /// The name of the subscribed stream.
    pub fn stream_name(&self) -> &str {
        &self.guard.stream_name
    }

    /// Receive the next republished value of the stream.
    pub async fn recv(&mut self) -> Option<serde_json::Value> {
        self.values_rx.recv().await
    }
}

impl Stream for StreamSubscription {
    type Item = serde_json::Value;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.values_rx.poll_recv(cx)
    }
}

struct SubscriptionGuard {
    channel: PeerChannel,
    stream_name: String,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.channel.publish(Payload::StreamUnsubscribe {
            requester_id: self.channel.instance_id().to_string(),
            stream_name: self.stream_name.clone(),
        });
    }
}
