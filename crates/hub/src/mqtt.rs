//! Outbound MQTT messaging for garden controllers.
//!
//! The hub only publishes commands; controllers subscribe to
//! `<prefix>/command/...` topics derived from their garden's `topic_prefix`
//! via the configured templates.  Publishes are bounded by a fixed timeout so
//! a wedged broker connection cannot stall a job callback indefinitely.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Placeholder substituted with a garden's topic prefix.
pub const TOPIC_PLACEHOLDER: &str = "{garden}";

const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub topics: Topics,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            client_id: default_client_id(),
            topics: Topics::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Topics {
    #[serde(default = "default_water_topic")]
    pub water: String,
    #[serde(default = "default_light_topic")]
    pub light: String,
    #[serde(default = "default_stop_topic")]
    pub stop: String,
    #[serde(default = "default_stop_all_topic")]
    pub stop_all: String,
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            water: default_water_topic(),
            light: default_light_topic(),
            stop: default_stop_topic(),
            stop_all: default_stop_all_topic(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "garden-hub".to_string()
}

fn default_water_topic() -> String {
    format!("{TOPIC_PLACEHOLDER}/command/water")
}

fn default_light_topic() -> String {
    format!("{TOPIC_PLACEHOLDER}/command/light")
}

fn default_stop_topic() -> String {
    format!("{TOPIC_PLACEHOLDER}/command/stop")
}

fn default_stop_all_topic() -> String {
    format!("{TOPIC_PLACEHOLDER}/command/stop_all")
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// A message observed through the capture transport.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Clone)]
enum Transport {
    Broker(AsyncClient),
    /// Routes publishes to an in-process channel instead of a broker.
    Capture(mpsc::UnboundedSender<PublishedMessage>),
}

#[derive(Clone)]
pub struct Client {
    transport: Transport,
    topics: Arc<Topics>,
}

impl Client {
    /// Connect to the broker.  The returned event loop must be driven (see
    /// [`run_event_loop`]) for publishes to make progress.
    pub fn connect(config: &Config) -> (Self, EventLoop) {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(30));
        let (client, event_loop) = AsyncClient::new(options, 32);
        (
            Self {
                transport: Transport::Broker(client),
                topics: Arc::new(config.topics.clone()),
            },
            event_loop,
        )
    }

    /// A broker-less client whose publishes land on the returned channel.
    /// Used by tests and dry runs to observe outbound commands.
    pub fn capture(topics: Topics) -> (Self, mpsc::UnboundedReceiver<PublishedMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self { transport: Transport::Capture(tx), topics: Arc::new(topics) },
            rx,
        )
    }

    pub fn water_topic(&self, prefix: &str) -> String {
        fill(&self.topics.water, prefix)
    }

    pub fn light_topic(&self, prefix: &str) -> String {
        fill(&self.topics.light, prefix)
    }

    pub fn stop_topic(&self, prefix: &str) -> String {
        fill(&self.topics.stop, prefix)
    }

    pub fn stop_all_topic(&self, prefix: &str) -> String {
        fill(&self.topics.stop_all, prefix)
    }

    /// Publish with QoS 1, bounded by a fixed timeout.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        match &self.transport {
            Transport::Broker(client) => {
                tokio::time::timeout(
                    PUBLISH_TIMEOUT,
                    client.publish(topic, QoS::AtLeastOnce, false, payload),
                )
                .await
                .map_err(|_| anyhow!("publish to '{topic}' timed out"))?
                .with_context(|| format!("failed to publish to '{topic}'"))
            }
            Transport::Capture(tx) => tx
                .send(PublishedMessage { topic: topic.to_string(), payload })
                .map_err(|_| anyhow!("capture channel closed")),
        }
    }
}

/// Substitute the garden placeholder in a topic template.
fn fill(template: &str, prefix: &str) -> String {
    template.replace(TOPIC_PLACEHOLDER, prefix)
}

/// Drive the broker connection, logging state changes.  Intended to be
/// `tokio::spawn`-ed from main; publishes stall without it.
pub async fn run_event_loop(mut event_loop: EventLoop) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => info!("mqtt connected"),
            Ok(Event::Incoming(Packet::Disconnect)) => warn!("mqtt disconnected"),
            Ok(_) => {}
            Err(e) => {
                warn!("mqtt error: {e}, reconnecting");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- topic templates ----------------------------------------------------

    #[test]
    fn default_templates_resolve_prefix() {
        let (client, _rx) = Client::capture(Topics::default());
        assert_eq!(client.water_topic("backyard"), "backyard/command/water");
        assert_eq!(client.light_topic("backyard"), "backyard/command/light");
        assert_eq!(client.stop_topic("backyard"), "backyard/command/stop");
        assert_eq!(client.stop_all_topic("backyard"), "backyard/command/stop_all");
    }

    #[test]
    fn custom_template_resolves() {
        let topics = Topics {
            water: "gardens/{garden}/water".to_string(),
            ..Topics::default()
        };
        let (client, _rx) = Client::capture(topics);
        assert_eq!(client.water_topic("g1"), "gardens/g1/water");
    }

    #[test]
    fn fill_replaces_every_occurrence() {
        assert_eq!(fill("{garden}/x/{garden}", "g"), "g/x/g");
    }

    // -- capture transport --------------------------------------------------

    #[tokio::test]
    async fn capture_client_records_publishes() {
        let (client, mut rx) = Client::capture(Topics::default());
        client
            .publish("backyard/command/light", br#"{"state":"ON"}"#.to_vec())
            .await
            .unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.topic, "backyard/command/light");
        assert_eq!(msg.payload, br#"{"state":"ON"}"#.to_vec());
    }

    // -- config defaults ----------------------------------------------------

    #[test]
    fn config_defaults_from_empty_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 1883);
        assert_eq!(config.client_id, "garden-hub");
        assert_eq!(config.topics.water, "{garden}/command/water");
    }
}
