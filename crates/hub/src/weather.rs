//! Weather-based scaling of watering durations.
//!
//! A watering schedule may reference a rain policy and/or a temperature
//! policy.  Each converts one measurement into a dimensionless scale factor;
//! factors multiply, and the worker applies the product to the base duration.
//! The curves live here as methods on the policy structs so a different model
//! is a local change.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::schedule::ScheduleError;

fn default_min_factor() -> f32 {
    0.0
}

fn default_max_factor() -> f32 {
    2.0
}

// ---------------------------------------------------------------------------
// Control policies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherControl {
    #[serde(default)]
    pub rain: Option<RainControl>,
    #[serde(default)]
    pub temperature: Option<TemperatureControl>,
}

impl WeatherControl {
    pub fn validate(&self) -> Result<(), ScheduleError> {
        if let Some(r) = &self.rain {
            r.validate()?;
        }
        if let Some(t) = &self.temperature {
            t.validate()?;
        }
        Ok(())
    }
}

/// Scale-down-only rain policy: no reduction at or below `baseline_mm`, skip
/// entirely at or above `threshold_mm`, linear in between.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RainControl {
    /// Which configured weather source to query.
    pub weather_client_id: String,
    pub baseline_mm: f32,
    pub threshold_mm: f32,
}

impl RainControl {
    /// Factor in `[0, 1]`, monotonically non-increasing in measured rain.
    pub fn inverted_scale_down_only(&self, measured_mm: f32) -> f32 {
        if measured_mm <= self.baseline_mm {
            return 1.0;
        }
        if measured_mm >= self.threshold_mm {
            return 0.0;
        }
        1.0 - (measured_mm - self.baseline_mm) / (self.threshold_mm - self.baseline_mm)
    }

    pub fn validate(&self) -> Result<(), ScheduleError> {
        if self.weather_client_id.trim().is_empty() {
            return Err(ScheduleError::MissingField("rain.weather_client_id"));
        }
        if self.baseline_mm < 0.0 || self.threshold_mm <= self.baseline_mm {
            return Err(ScheduleError::InvalidRainControl {
                baseline_mm: self.baseline_mm,
                threshold_mm: self.threshold_mm,
            });
        }
        Ok(())
    }
}

/// Temperature policy: `1 + factor * (t - baseline)`, clamped.  Unlike rain,
/// this may increase the duration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperatureControl {
    pub weather_client_id: String,
    pub baseline_celsius: f32,
    /// Fractional change per degree away from the baseline (0.05 = 5%/°C).
    pub factor: f32,
    #[serde(default = "default_min_factor")]
    pub min_factor: f32,
    #[serde(default = "default_max_factor")]
    pub max_factor: f32,
}

impl TemperatureControl {
    pub fn scale(&self, avg_high_celsius: f32) -> f32 {
        let f = 1.0 + self.factor * (avg_high_celsius - self.baseline_celsius);
        f.clamp(self.min_factor, self.max_factor)
    }

    pub fn validate(&self) -> Result<(), ScheduleError> {
        if self.weather_client_id.trim().is_empty() {
            return Err(ScheduleError::MissingField(
                "temperature.weather_client_id",
            ));
        }
        if self.min_factor < 0.0 || self.max_factor < self.min_factor {
            return Err(ScheduleError::InvalidTemperatureControl {
                min_factor: self.min_factor,
                max_factor: self.max_factor,
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Weather source clients
// ---------------------------------------------------------------------------

/// A weather data source queried on demand.  Measurements are transient and
/// never persisted; fetch failures degrade to "no scaling" in the worker.
#[async_trait]
pub trait WeatherClient: Send + Sync {
    /// Total rainfall in millimeters over the trailing interval.
    async fn get_total_rain(&self, since: Duration) -> Result<f32>;

    /// Average daily high temperature (°C) over the trailing interval.
    async fn get_average_high_temperature(&self, since: Duration) -> Result<f32>;
}

/// Stored configuration for a weather source, referenced from control
/// policies by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub client_type: String,
    #[serde(default)]
    pub options: HashMap<String, f32>,
}

/// Build a client from its stored config.  Only the `fixed` type ships here;
/// real vendor APIs slot in as additional arms.
pub fn new_client(config: &ClientConfig) -> Result<Box<dyn WeatherClient>> {
    match config.client_type.as_str() {
        "fixed" => Ok(Box::new(FixedClient {
            options: config.options.clone(),
        })),
        other => bail!("invalid weather client type '{other}'"),
    }
}

/// Returns configured constants.  Useful for demos and tests; a missing
/// option surfaces as a fetch error, exercising the degraded path.
struct FixedClient {
    options: HashMap<String, f32>,
}

impl FixedClient {
    fn option(&self, key: &str) -> Result<f32> {
        match self.options.get(key) {
            Some(v) => Ok(*v),
            None => bail!("fixed weather client is missing option '{key}'"),
        }
    }
}

#[async_trait]
impl WeatherClient for FixedClient {
    async fn get_total_rain(&self, _since: Duration) -> Result<f32> {
        self.option("total_rain_mm")
    }

    async fn get_average_high_temperature(&self, _since: Duration) -> Result<f32> {
        self.option("average_high_celsius")
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn rain() -> RainControl {
        RainControl {
            weather_client_id: "wc1".into(),
            baseline_mm: 0.0,
            threshold_mm: 25.0,
        }
    }

    fn temperature() -> TemperatureControl {
        TemperatureControl {
            weather_client_id: "wc1".into(),
            baseline_celsius: 30.0,
            factor: 0.05,
            min_factor: default_min_factor(),
            max_factor: default_max_factor(),
        }
    }

    // -- rain policy -------------------------------------------------------

    #[test]
    fn rain_at_baseline_no_reduction() {
        assert_eq!(rain().inverted_scale_down_only(0.0), 1.0);
    }

    #[test]
    fn rain_at_threshold_skips() {
        assert_eq!(rain().inverted_scale_down_only(25.0), 0.0);
        assert_eq!(rain().inverted_scale_down_only(100.0), 0.0);
    }

    #[test]
    fn rain_midpoint_halves() {
        // Scenario: baseline 0mm, threshold 25mm, measured 12.5mm -> 0.5.
        assert!((rain().inverted_scale_down_only(12.5) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn rain_factor_monotonic_and_bounded() {
        let rc = RainControl {
            baseline_mm: 5.0,
            threshold_mm: 30.0,
            ..rain()
        };
        let mut prev = f32::INFINITY;
        for step in 0..80 {
            let measured = step as f32 * 0.5;
            let f = rc.inverted_scale_down_only(measured);
            assert!((0.0..=1.0).contains(&f));
            assert!(f <= prev, "factor increased at {measured}mm");
            prev = f;
        }
    }

    #[test]
    fn rain_nonzero_baseline() {
        let rc = RainControl {
            baseline_mm: 10.0,
            threshold_mm: 20.0,
            ..rain()
        };
        assert_eq!(rc.inverted_scale_down_only(10.0), 1.0);
        assert!((rc.inverted_scale_down_only(15.0) - 0.5).abs() < 1e-6);
        assert_eq!(rc.inverted_scale_down_only(20.0), 0.0);
    }

    #[test]
    fn rain_threshold_must_exceed_baseline() {
        let rc = RainControl {
            baseline_mm: 10.0,
            threshold_mm: 10.0,
            ..rain()
        };
        assert!(rc.validate().is_err());
    }

    // -- temperature policy ------------------------------------------------

    #[test]
    fn temperature_at_baseline_is_identity() {
        assert_eq!(temperature().scale(30.0), 1.0);
    }

    #[test]
    fn temperature_scales_up_and_down() {
        let tc = temperature();
        // +10°C at 5%/°C -> 1.5; -10°C -> 0.5.
        assert!((tc.scale(40.0) - 1.5).abs() < 1e-6);
        assert!((tc.scale(20.0) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn temperature_clamped_to_bounds() {
        let tc = temperature();
        assert_eq!(tc.scale(1000.0), 2.0);
        assert_eq!(tc.scale(-1000.0), 0.0);
    }

    #[test]
    fn temperature_monotonic_within_bounds() {
        let tc = temperature();
        let mut prev = f32::NEG_INFINITY;
        for t in -20..80 {
            let f = tc.scale(t as f32);
            assert!(f >= prev);
            prev = f;
        }
    }

    #[test]
    fn temperature_custom_bounds() {
        let tc = TemperatureControl {
            min_factor: 0.5,
            max_factor: 1.2,
            ..temperature()
        };
        assert_eq!(tc.scale(1000.0), 1.2);
        assert_eq!(tc.scale(-1000.0), 0.5);
    }

    #[test]
    fn temperature_inverted_bounds_rejected() {
        let tc = TemperatureControl {
            min_factor: 1.5,
            max_factor: 0.5,
            ..temperature()
        };
        assert!(tc.validate().is_err());
    }

    #[test]
    fn temperature_default_bounds_deserialized() {
        let tc: TemperatureControl = serde_json::from_str(
            r#"{"weather_client_id":"wc1","baseline_celsius":30.0,"factor":0.05}"#,
        )
        .unwrap();
        assert_eq!(tc.min_factor, 0.0);
        assert_eq!(tc.max_factor, 2.0);
    }

    // -- client factory ----------------------------------------------------

    #[tokio::test]
    async fn fixed_client_returns_configured_values() {
        let cfg = ClientConfig {
            id: "wc1".into(),
            client_type: "fixed".into(),
            options: HashMap::from([
                ("total_rain_mm".to_string(), 12.5),
                ("average_high_celsius".to_string(), 35.0),
            ]),
        };
        let client = new_client(&cfg).unwrap();
        assert_eq!(
            client.get_total_rain(Duration::from_secs(86400)).await.unwrap(),
            12.5
        );
        assert_eq!(
            client
                .get_average_high_temperature(Duration::from_secs(86400))
                .await
                .unwrap(),
            35.0
        );
    }

    #[tokio::test]
    async fn fixed_client_missing_option_errors() {
        let cfg = ClientConfig {
            id: "wc1".into(),
            client_type: "fixed".into(),
            options: HashMap::new(),
        };
        let client = new_client(&cfg).unwrap();
        assert!(client.get_total_rain(Duration::from_secs(1)).await.is_err());
    }

    #[test]
    fn unknown_client_type_rejected() {
        let cfg = ClientConfig {
            id: "wc1".into(),
            client_type: "netatmo".into(),
            options: HashMap::new(),
        };
        assert!(new_client(&cfg).is_err());
    }
}
