//! Request-level actions and the wire messages they produce.
//!
//! Actions are closed tagged unions: one optional field per action kind, so a
//! single request body can carry several.  Execution order is fixed in the
//! worker (stop before light; water stands alone) to be intuitive for a user
//! combining actions in one request.

use serde::{Deserialize, Serialize};

use crate::schedule::LightState;

// ---------------------------------------------------------------------------
// Garden actions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GardenAction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub light: Option<LightAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopAction>,
}

/// Immediate light command.  Without a state the controller toggles.  With
/// `for_duration_ms` the command becomes an adhoc override that hands control
/// back to the recurring schedule afterwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LightAction {
    #[serde(default)]
    pub state: Option<LightState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub for_duration_ms: Option<i64>,
}

/// Stop whatever the controller is currently watering; `all` also clears its
/// queue of pending zones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StopAction {
    #[serde(default)]
    pub all: bool,
}

// ---------------------------------------------------------------------------
// Zone actions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ZoneAction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub water: Option<WaterAction>,
}

/// Directly-requested watering.  Bypasses the recurring schedule; weather
/// scaling still applies unless explicitly ignored.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WaterAction {
    pub duration_ms: i64,
    #[serde(default)]
    pub ignore_weather: bool,
}

// ---------------------------------------------------------------------------
// Wire messages
// ---------------------------------------------------------------------------

/// Published to a garden's water command topic.  `duration` is milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaterMessage {
    pub duration: i64,
    pub zone_id: String,
    pub position: u32,
}

/// Published to a garden's light command topic.  `state: null` asks the
/// controller to toggle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LightMessage {
    pub state: Option<LightState>,
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn water_message_wire_format() {
        let msg = WaterMessage { duration: 10_000, zone_id: "z1".into(), position: 0 };
        assert_eq!(
            serde_json::to_string(&msg).unwrap(),
            r#"{"duration":10000,"zone_id":"z1","position":0}"#
        );
    }

    #[test]
    fn light_message_states() {
        assert_eq!(
            serde_json::to_string(&LightMessage { state: Some(LightState::On) }).unwrap(),
            r#"{"state":"ON"}"#
        );
        assert_eq!(
            serde_json::to_string(&LightMessage { state: None }).unwrap(),
            r#"{"state":null}"#
        );
    }

    #[test]
    fn garden_action_deserializes_combined_request() {
        let action: GardenAction =
            serde_json::from_str(r#"{"stop":{"all":true},"light":{"state":"OFF"}}"#).unwrap();
        assert_eq!(action.stop, Some(StopAction { all: true }));
        assert_eq!(
            action.light,
            Some(LightAction { state: Some(LightState::Off), for_duration_ms: None })
        );
    }

    #[test]
    fn light_action_defaults_to_toggle() {
        let action: LightAction = serde_json::from_str("{}").unwrap();
        assert_eq!(action.state, None);
        assert_eq!(action.for_duration_ms, None);
    }

    #[test]
    fn zone_action_requires_nothing() {
        let action: ZoneAction = serde_json::from_str("{}").unwrap();
        assert!(action.water.is_none());
    }

    #[test]
    fn water_action_ignore_weather_defaults_false() {
        let action: WaterAction = serde_json::from_str(r#"{"duration_ms":5000}"#).unwrap();
        assert!(!action.ignore_weather);
    }
}
