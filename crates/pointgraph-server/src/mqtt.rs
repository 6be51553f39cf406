//! MQTT transport for the message bus.
//!
//! Subjects map to topics by replacing `.` with `/`, `*` with `+` and `>`
//! with `#`. MQTT 3.1.1 has no reply subjects, so every payload travels in a
//! CBOR [`Envelope`] that carries the optional reply subject alongside the
//! data.

use crate::bus::{Bus, BusError, Message, Router, Subscription};
use pointgraph_proto::Envelope;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use url::Url;

const MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Port used when a broker address names none.
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Broker host and port.
///
/// Accepts `tcp://host[:port]`, `mqtt://host[:port]` or a bare
/// `host[:port]`, which is read as `tcp`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddr {
    /// Broker host name or address
    pub host: String,
    /// Broker TCP port
    pub port: u16,
}

impl FromStr for BrokerAddr {
    type Err = BusError;

    fn from_str(input: &str) -> Result<Self, BusError> {
        let invalid = |reason: String| BusError::InvalidBrokerUrl(format!("{input}: {reason}"));
        let url = if input.contains("://") {
            Url::parse(input)
        } else {
            Url::parse(&format!("tcp://{input}"))
        }
        .map_err(|e| invalid(e.to_string()))?;

        if !matches!(url.scheme(), "tcp" | "mqtt") {
            return Err(invalid(format!("unsupported scheme {:?}", url.scheme())));
        }
        if !matches!(url.path(), "" | "/") {
            return Err(invalid(format!("unexpected path {:?}", url.path())));
        }
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing host".to_string()))?;

        Ok(Self {
            host: host.to_string(),
            port: url.port().unwrap_or(DEFAULT_MQTT_PORT),
        })
    }
}

impl fmt::Display for BrokerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Bus backed by an MQTT broker.
#[derive(Clone)]
pub struct MqttBus {
    client: AsyncClient,
    router: Arc<Router>,
}

impl MqttBus {
    /// Connect to a broker and start routing incoming publishes.
    ///
    /// The returned task polls the MQTT event loop until aborted. Broker
    /// subscriptions are released when the last local [`Subscription`] on a
    /// pattern is dropped.
    ///
    /// # Errors
    ///
    /// Returns error if the broker URL is invalid.
    pub fn connect(mqtt_broker: &str, client_id: &str) -> Result<(Self, JoinHandle<()>), BusError> {
        let broker: BrokerAddr = mqtt_broker.parse()?;

        let mut mqtt_options = MqttOptions::new(client_id, broker.host.clone(), broker.port);
        mqtt_options.set_keep_alive(Duration::from_secs(30));
        mqtt_options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);

        let (client, eventloop) = AsyncClient::new(mqtt_options, 100);
        let unsubscriber = client.clone();
        let router = Arc::new(Router::with_release_hook(move |pattern| {
            let topic = subject_to_topic(pattern);
            match unsubscriber.try_unsubscribe(topic.as_str()) {
                Ok(()) => tracing::debug!(%topic, "Unsubscribed from bus topic"),
                Err(e) => tracing::warn!(%topic, error = %e, "Failed to unsubscribe"),
            }
        }));
        let task = tokio::spawn(run_event_loop(eventloop, Arc::clone(&router)));

        tracing::info!(%broker, client_id, "MQTT bus connecting");
        Ok((Self { client, router }, task))
    }
}

async fn run_event_loop(mut eventloop: EventLoop, router: Arc<Router>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let subject = topic_to_subject(&publish.topic);
                let envelope = match Envelope::from_cbor(&publish.payload) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        tracing::warn!(topic = %publish.topic, error = %err, "Dropping malformed envelope");
                        continue;
                    }
                };
                tracing::debug!(
                    subject,
                    payload_len = envelope.data.len(),
                    "Received bus message"
                );
                router.route(&Message {
                    subject,
                    payload: envelope.data,
                    reply: envelope.reply,
                });
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                tracing::info!("MQTT bus connected");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(error = %e, "MQTT error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

impl Bus for MqttBus {
    async fn publish_with_reply(
        &self,
        subject: &str,
        reply: Option<String>,
        payload: Vec<u8>,
    ) -> Result<(), BusError> {
        let topic = subject_to_topic(subject);
        let bytes = Envelope {
            reply,
            data: payload,
        }
        .to_cbor()
        .map_err(|e| BusError::Encode(e.to_string()))?;

        tracing::debug!(topic, payload_len = bytes.len(), "Publishing");

        self.client
            .publish(&topic, QoS::AtLeastOnce, false, bytes)
            .await
            .map_err(|e| BusError::Publish(e.to_string()))
    }

    async fn subscribe(&self, pattern: &str) -> Result<Subscription, BusError> {
        let topic = subject_to_topic(pattern);
        let sub = self.router.add(pattern);

        tracing::info!(topic, "Subscribing to bus topic");

        self.client
            .subscribe(&topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;
        Ok(sub)
    }
}

/// Map a bus subject or pattern to an MQTT topic or filter.
#[must_use]
pub fn subject_to_topic(subject: &str) -> String {
    subject
        .split('.')
        .map(|t| match t {
            "*" => "+",
            ">" => "#",
            other => other,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Map an MQTT topic back to a bus subject.
#[must_use]
pub fn topic_to_subject(topic: &str) -> String {
    topic.replace('/', ".")
}
