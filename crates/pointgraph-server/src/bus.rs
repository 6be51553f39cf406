//! Message bus abstraction.
//!
//! The store talks to the outside world only through subjects. A [`Bus`]
//! offers publish, wildcard subscribe and request/reply with a bounded
//! timeout. [`LocalBus`] routes in-process; `MqttBus` carries the same
//! messages over an MQTT broker.

use parking_lot::Mutex;
use pointgraph_proto::subject_matches;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Prefix of reply subjects created by [`Bus::request`].
pub const INBOX_PREFIX: &str = "_INBOX";

/// A message delivered to a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Subject the message was published on
    pub subject: String,
    /// Raw payload
    pub payload: Vec<u8>,
    /// Subject the sender waits for a reply on
    pub reply: Option<String>,
}

/// Errors for bus operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BusError {
    /// Bus or subscription has shut down
    #[error("bus closed")]
    Closed,
    /// No reply within the timeout
    #[error("request on {0} timed out")]
    Timeout(String),
    /// Publish failed
    #[error("publish error: {0}")]
    Publish(String),
    /// Subscription failed
    #[error("subscription error: {0}")]
    Subscribe(String),
    /// Invalid MQTT broker URL
    #[error("invalid MQTT broker URL: {0}")]
    InvalidBrokerUrl(String),
    /// Payload could not be encoded or decoded
    #[error("encode error: {0}")]
    Encode(String),
}

/// Publish/subscribe transport with request/reply.
pub trait Bus: Clone + Send + Sync + 'static {
    /// Publish a message, optionally naming a reply subject.
    ///
    /// # Errors
    ///
    /// Returns error if the message cannot be sent.
    fn publish_with_reply(
        &self,
        subject: &str,
        reply: Option<String>,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<(), BusError>> + Send;

    /// Subscribe to a subject pattern (`*` and `>` wildcards allowed).
    ///
    /// # Errors
    ///
    /// Returns error if the subscription cannot be registered.
    fn subscribe(&self, pattern: &str) -> impl Future<Output = Result<Subscription, BusError>> + Send;

    /// Publish a message without a reply subject.
    ///
    /// # Errors
    ///
    /// Returns error if the message cannot be sent.
    fn publish(
        &self,
        subject: &str,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<(), BusError>> + Send {
        self.publish_with_reply(subject, None, payload)
    }

    /// Send a request and wait for the first reply.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Timeout`] if nothing answers in time.
    fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> impl Future<Output = Result<Vec<u8>, BusError>> + Send {
        async move {
            let inbox = format!("{INBOX_PREFIX}.{}", Uuid::new_v4().simple());
            let mut sub = self.subscribe(&inbox).await?;
            self.publish_with_reply(subject, Some(inbox), payload)
                .await?;
            match tokio::time::timeout(timeout, sub.next()).await {
                Ok(Some(msg)) => Ok(msg.payload),
                Ok(None) => Err(BusError::Closed),
                Err(_) => Err(BusError::Timeout(subject.to_string())),
            }
        }
    }
}

type ReleaseHook = Box<dyn Fn(&str) + Send + Sync>;

/// Routes messages to matching local subscriptions.
#[derive(Default)]
pub struct Router {
    subs: Mutex<HashMap<u64, (String, mpsc::UnboundedSender<Message>)>>,
    next_id: AtomicU64,
    on_release: Option<ReleaseHook>,
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("subscriptions", &self.len())
            .field("on_release", &self.on_release.is_some())
            .finish()
    }
}

impl Router {
    /// Create a router that calls `hook` with a pattern once the last
    /// subscription on that pattern is dropped.
    #[must_use]
    pub fn with_release_hook(hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Self {
            on_release: Some(Box::new(hook)),
            ..Self::default()
        }
    }

    /// Register a subscription.
    pub fn add(self: &Arc<Self>, pattern: &str) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subs.lock().insert(id, (pattern.to_string(), tx));
        Subscription {
            id,
            pattern: pattern.to_string(),
            rx,
            router: Arc::downgrade(self),
        }
    }

    fn remove(&self, id: u64) {
        let released = {
            let mut subs = self.subs.lock();
            let Some((pattern, _)) = subs.remove(&id) else {
                return;
            };
            (!subs.values().any(|(p, _)| *p == pattern)).then_some(pattern)
        };
        if let (Some(pattern), Some(hook)) = (released, &self.on_release) {
            hook(&pattern);
        }
    }

    /// Deliver a message to every matching subscription.
    ///
    /// Returns the number of receivers.
    pub fn route(&self, msg: &Message) -> usize {
        let mut subs = self.subs.lock();
        let mut delivered = 0;
        subs.retain(|_, (pattern, tx)| {
            if !subject_matches(pattern, &msg.subject) {
                return true;
            }
            if tx.send(msg.clone()).is_ok() {
                delivered += 1;
                true
            } else {
                false
            }
        });
        delivered
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.subs.lock().len()
    }

    /// Whether there are no subscriptions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A live subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    pattern: String,
    rx: mpsc::UnboundedReceiver<Message>,
    router: Weak<Router>,
}

impl Subscription {
    /// Wait for the next message. `None` once the bus is gone.
    pub async fn next(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Pattern this subscription was created with.
    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(router) = self.router.upgrade() {
            router.remove(self.id);
        }
    }
}

/// In-process bus.
#[derive(Debug, Clone, Default)]
pub struct LocalBus {
    router: Arc<Router>,
}

impl LocalBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.router.len()
    }
}

impl Bus for LocalBus {
    async fn publish_with_reply(
        &self,
        subject: &str,
        reply: Option<String>,
        payload: Vec<u8>,
    ) -> Result<(), BusError> {
        if subject.is_empty() || subject.split('.').any(|t| t == "*" || t == ">") {
            return Err(BusError::Publish(format!("invalid subject {subject:?}")));
        }
        let msg = Message {
            subject: subject.to_string(),
            payload,
            reply,
        };
        let delivered = self.router.route(&msg);
        tracing::trace!(subject, delivered, "Published");
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<Subscription, BusError> {
        if pattern.is_empty() {
            return Err(BusError::Subscribe("empty subject".to_string()));
        }
        Ok(self.router.add(pattern))
    }
}
