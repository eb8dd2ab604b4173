//! Peer transport.
//!
//! Wraps the process-wide broadcast bus into typed publish/subscribe plus correlated
//! request/response. The bus is a registry of named namespaces, where every message published to
//! a namespace is delivered to every channel connected to it — including the publisher's own
//! subscriptions. There is no delivery or ordering guarantee across peers beyond what the
//! protocol layers above add themselves: a consumer which lags past the ring capacity will skip
//! messages, which the election and subscription protocols are built to tolerate.

#[cfg(test)]
mod mod_test;

use std::pin::Pin;

use futures::stream::StreamExt;
use futures::Stream;
use lazy_static::lazy_static;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::models::{Payload, PeerMessage, Topic};

/// The ring capacity of each namespace's broadcast channel.
const NAMESPACE_CAPACITY: usize = 1024;

lazy_static! {
    /// All live bus namespaces of this process, keyed by name.
    static ref NAMESPACES: dashmap::DashMap<String, broadcast::Sender<PeerMessage>> = dashmap::DashMap::new();
}

/// A live sequence of peer messages.
pub type MessageStream = Pin<Box<dyn Stream<Item = PeerMessage> + Send>>;

/// A typed handle to one bus namespace, bound to one instance identity.
#[derive(Clone)]
pub struct PeerChannel {
    /// The name of the connected bus namespace.
    namespace: String,
    /// The identity of the local instance, stamped on every outbound message.
    instance_id: String,
    /// The namespace's broadcast sender.
    bus: broadcast::Sender<PeerMessage>,
}

impl PeerChannel {
    /// Connect to the named bus namespace as the given instance.
    pub fn connect(namespace: &str, instance_id: &str) -> Self {
        let bus = NAMESPACES
            .entry(namespace.to_string())
            .or_insert_with(|| broadcast::channel(NAMESPACE_CAPACITY).0)
            .clone();
        tracing::debug!(namespace, instance_id, "connected to peer bus");
        Self {
            namespace: namespace.to_string(),
            instance_id: instance_id.to_string(),
            bus,
        }
    }

    /// The identity this channel stamps on outbound messages.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Broadcast the given payload, fire-and-forget, tagged with a fresh correlation ID.
    ///
    /// The message is visible to this channel's own subscriptions as well. Returns the envelope
    /// as sent. A send error only means no subscriber exists anywhere in the process, which is
    /// indistinguishable from all peers having missed the message — ignored by design.
    pub fn publish(&self, payload: Payload) -> PeerMessage {
        self.send(Uuid::new_v4(), payload)
    }

    /// Broadcast a reply to the given message, echoing its correlation ID.
    pub fn reply(&self, to: &PeerMessage, payload: Payload) -> PeerMessage {
        self.send(to.id, payload)
    }

    /// An unbounded, non-restartable live sequence of future messages matching the given topic.
    pub fn subscribe(&self, topic: Topic) -> MessageStream {
        let rx = BroadcastStream::new(self.bus.subscribe());
        Box::pin(rx.filter_map(move |res| async move {
            match res {
                Ok(msg) if msg.payload.topic() == topic => Some(msg),
                Ok(_) => None,
                Err(err) => {
                    tracing::warn!(error = ?err, "peer bus subscription lagged, messages skipped");
                    None
                }
            }
        }))
    }

    /// Send a tagged request and resolve with the first reply sharing its correlation ID.
    ///
    /// No timeout is imposed here; callers race the returned future against their own timers.
    pub fn request(&self, payload: Payload) -> (PeerMessage, impl std::future::Future<Output = PeerMessage>) {
        let (sent, mut replies) = self.request_stream(payload);
        (sent, async move {
            loop {
                if let Some(reply) = replies.next().await {
                    return reply;
                }
                // The bus sender can not drop while this channel holds a clone of it, so the
                // stream only ever yields gaps on lag. Park until more traffic arrives.
                futures::future::pending::<()>().await;
            }
        })
    }

    /// As `request`, but yield every reply sharing the request's correlation ID.
    pub fn request_stream(&self, payload: Payload) -> (PeerMessage, MessageStream) {
        // Subscribe before sending so the reply can not race the subscription.
        let rx = BroadcastStream::new(self.bus.subscribe());
        let sent = self.send(Uuid::new_v4(), payload);
        let (correlation_id, request_topic) = (sent.id, sent.payload.topic());
        let replies = Box::pin(rx.filter_map(move |res| async move {
            match res {
                // The request itself is delivered back to its sender and must not be mistaken
                // for a reply; replies always carry a different topic.
                Ok(msg) if msg.id == correlation_id && msg.payload.topic() != request_topic => Some(msg),
                Ok(_) => None,
                Err(err) => {
                    tracing::warn!(error = ?err, "peer bus subscription lagged, messages skipped");
                    None
                }
            }
        }));
        (sent, replies)
    }

    fn send(&self, id: Uuid, payload: Payload) -> PeerMessage {
        let msg = PeerMessage {
            id,
            from: self.instance_id.clone(),
            payload,
        };
        tracing::trace!(namespace = %self.namespace, topic = ?msg.payload.topic(), "publishing to peer bus");
        let _res = self.bus.send(msg.clone());
        msg
    }
}
