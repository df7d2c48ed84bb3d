//! Mock garden controller.
//!
//! Stands in for the microcontroller in a real garden: subscribes to a
//! garden's command topics, "waters" zones by sleeping for the commanded
//! duration, tracks a simulated light, and reports what it did on the
//! garden's data topics.  Useful for exercising the hub end to end without
//! hardware.

use std::collections::VecDeque;
use std::{env, time::Duration};

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// Wire messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct WaterMessage {
    duration: i64,
    zone_id: String,
    position: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
enum LightState {
    On,
    Off,
}

#[derive(Debug, Deserialize)]
struct LightMessage {
    state: Option<LightState>,
}

#[derive(Debug, Serialize)]
struct WaterEvent<'a> {
    zone_id: &'a str,
    position: u32,
    duration: i64,
    status: &'a str,
}

// ---------------------------------------------------------------------------
// Topic & state helpers
// ---------------------------------------------------------------------------

/// Suffix after `<prefix>/command/`, if the topic belongs to this garden.
fn command_kind<'a>(topic: &'a str, prefix: &str) -> Option<&'a str> {
    topic
        .strip_prefix(prefix)?
        .strip_prefix("/command/")
        .filter(|kind| !kind.is_empty())
}

/// The state after applying a light command; `None` in the message means
/// toggle.
fn apply_light(current: LightState, requested: Option<LightState>) -> LightState {
    match requested {
        Some(state) => state,
        None => match current {
            LightState::On => LightState::Off,
            LightState::Off => LightState::On,
        },
    }
}

// ---------------------------------------------------------------------------
// Watering queue
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum WaterCommand {
    Queue(WaterMessage),
    Stop,
    StopAll,
}

/// Waters one zone at a time; new commands queue behind the current one.
/// `Stop` aborts the current zone, `StopAll` also clears the queue.
async fn water_loop(mut rx: mpsc::UnboundedReceiver<WaterCommand>, client: AsyncClient, prefix: String) {
    let data_topic = format!("{prefix}/data/water");
    let mut queue: VecDeque<WaterMessage> = VecDeque::new();
    let mut current: Option<(WaterMessage, Instant)> = None;

    loop {
        match current.take() {
            Some((msg, done_at)) => {
                tokio::select! {
                    _ = sleep_until(done_at) => {
                        info!(zone = %msg.zone_id, duration_ms = msg.duration, "watering complete");
                        report(&client, &data_topic, &msg, "complete").await;
                    }
                    cmd = rx.recv() => match cmd {
                        Some(WaterCommand::Queue(next)) => {
                            info!(zone = %next.zone_id, "watering queued");
                            queue.push_back(next);
                            current = Some((msg, done_at));
                        }
                        Some(WaterCommand::Stop) => {
                            info!(zone = %msg.zone_id, "watering stopped");
                            report(&client, &data_topic, &msg, "stopped").await;
                        }
                        Some(WaterCommand::StopAll) => {
                            info!(zone = %msg.zone_id, cleared = queue.len(), "watering stopped, queue cleared");
                            queue.clear();
                            report(&client, &data_topic, &msg, "stopped").await;
                        }
                        None => return,
                    }
                }
            }
            None => {
                if let Some(next) = queue.pop_front() {
                    info!(zone = %next.zone_id, duration_ms = next.duration, "watering started");
                    let done_at = Instant::now() + Duration::from_millis(next.duration.max(0) as u64);
                    current = Some((next, done_at));
                } else {
                    match rx.recv().await {
                        Some(WaterCommand::Queue(msg)) => queue.push_back(msg),
                        Some(WaterCommand::Stop | WaterCommand::StopAll) => {}
                        None => return,
                    }
                }
            }
        }
    }
}

async fn report(client: &AsyncClient, topic: &str, msg: &WaterMessage, status: &str) {
    let event = WaterEvent {
        zone_id: &msg.zone_id,
        position: msg.position,
        duration: msg.duration,
        status,
    };
    match serde_json::to_vec(&event) {
        Ok(payload) => {
            if let Err(e) = client.publish(topic, QoS::AtLeastOnce, false, payload).await {
                warn!("failed to report watering event: {e}");
            }
        }
        Err(e) => warn!("failed to encode watering event: {e}"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // Env config
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let prefix = env::var("GARDEN").unwrap_or_else(|_| "garden".to_string());

    let client_id = format!("garden-controller-{prefix}");
    let mut options = MqttOptions::new(client_id, broker, port);
    options.set_keep_alive(Duration::from_secs(30));
    let (client, mut event_loop) = AsyncClient::new(options, 16);

    client
        .subscribe(format!("{prefix}/command/#"), QoS::AtLeastOnce)
        .await?;
    info!(garden = %prefix, "subscribed to command topics");

    let (water_tx, water_rx) = mpsc::unbounded_channel();
    tokio::spawn(water_loop(water_rx, client.clone(), prefix.clone()));

    let light_topic = format!("{prefix}/data/light");
    let mut light = LightState::Off;

    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                let Some(kind) = command_kind(&p.topic, &prefix) else {
                    warn!(topic = %p.topic, "unhandled topic");
                    continue;
                };
                match kind {
                    "water" => match serde_json::from_slice::<WaterMessage>(&p.payload) {
                        Ok(msg) => {
                            let _ = water_tx.send(WaterCommand::Queue(msg));
                        }
                        Err(e) => warn!("bad water command: {e}"),
                    },
                    "light" => match serde_json::from_slice::<LightMessage>(&p.payload) {
                        Ok(msg) => {
                            light = apply_light(light, msg.state);
                            info!(state = ?light, "light switched");
                            let payload = serde_json::to_vec(&serde_json::json!({ "state": light }))?;
                            if let Err(e) =
                                client.publish(&light_topic, QoS::AtLeastOnce, false, payload).await
                            {
                                warn!("failed to report light state: {e}");
                            }
                        }
                        Err(e) => warn!("bad light command: {e}"),
                    },
                    "stop" => {
                        let _ = water_tx.send(WaterCommand::Stop);
                    }
                    "stop_all" => {
                        let _ = water_tx.send(WaterCommand::StopAll);
                    }
                    other => warn!(command = %other, "unknown command"),
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => info!("connected to mqtt"),
            Ok(_) => {}
            Err(e) => {
                warn!("mqtt error: {e}, retrying");
                sleep(Duration::from_secs(2)).await;
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

    // -- topic parsing -------------------------------------------------------

    #[test]
    fn command_kind_extracts_suffix() {
        assert_eq!(command_kind("backyard/command/water", "backyard"), Some("water"));
        assert_eq!(command_kind("backyard/command/stop_all", "backyard"), Some("stop_all"));
    }

    #[test]
    fn command_kind_rejects_other_gardens_and_shapes() {
        assert_eq!(command_kind("front/command/water", "backyard"), None);
        assert_eq!(command_kind("backyard/data/water", "backyard"), None);
        assert_eq!(command_kind("backyard/command/", "backyard"), None);
    }

    // -- light ---------------------------------------------------------------

    #[test]
    fn explicit_light_state_applied() {
        assert_eq!(apply_light(LightState::Off, Some(LightState::On)), LightState::On);
        assert_eq!(apply_light(LightState::On, Some(LightState::On)), LightState::On);
        assert_eq!(apply_light(LightState::On, Some(LightState::Off)), LightState::Off);
    }

    #[test]
    fn missing_state_toggles() {
        assert_eq!(apply_light(LightState::Off, None), LightState::On);
        assert_eq!(apply_light(LightState::On, None), LightState::Off);
    }

    #[test]
    fn light_message_null_state_parses_as_toggle() {
        let msg: LightMessage = serde_json::from_str(r#"{"state":null}"#).unwrap();
        assert_eq!(msg.state, None);
        let msg: LightMessage = serde_json::from_str(r#"{"state":"ON"}"#).unwrap();
        assert_eq!(msg.state, Some(LightState::On));
    }

    // -- wire formats --------------------------------------------------------

    #[test]
    fn water_message_parses_hub_payload() {
        let msg: WaterMessage =
            serde_json::from_str(r#"{"duration":10000,"zone_id":"z1","position":2}"#).unwrap();
        assert_eq!(
            msg,
            WaterMessage { duration: 10_000, zone_id: "z1".into(), position: 2 }
        );
    }

    #[test]
    fn water_event_reports_status() {
        let event = WaterEvent { zone_id: "z1", position: 2, duration: 5000, status: "complete" };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["zone_id"], "z1");
        assert_eq!(json["status"], "complete");
        assert_eq!(json.as_object().unwrap().len(), 4);
    }

    // -- watering queue ------------------------------------------------------

    #[tokio::test]
    async fn stop_all_clears_the_queue() {
        // Queue two waterings, stop everything, then confirm the loop is idle
        // by letting it run well past both durations.
        let (tx, rx) = mpsc::unbounded_channel();
        let (client, mut event_loop) = AsyncClient::new(MqttOptions::new("t", "127.0.0.1", 1883), 4);
        // Drain the event loop so publishes don't back up the client channel.
        tokio::spawn(async move { while event_loop.poll().await.is_ok() {} });
        let handle = tokio::spawn(water_loop(rx, client, "g".into()));

        let water = |zone: &str| WaterCommand::Queue(WaterMessage {
            duration: 50,
            zone_id: zone.into(),
            position: 0,
        });
        tx.send(water("z1")).unwrap();
        tx.send(water("z2")).unwrap();
        tx.send(WaterCommand::StopAll).unwrap();
        sleep(Duration::from_millis(200)).await;

        assert!(!handle.is_finished());
        drop(tx);
        let _ = handle.await;
    }
}
