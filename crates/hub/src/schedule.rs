//! Schedule data model and occurrence calculation.
//!
//! Everything in here is pure: given a schedule and a "now", the functions
//! compute the next future occurrence(s) without touching a clock, the
//! registry, or any I/O.  The worker owns the side effects.
//!
//! Recurrence semantics:
//! - A [`WaterSchedule`] is anchored at an absolute `start_time` (possibly far
//!   in the past) and repeats every `interval_secs`.  The next occurrence is
//!   always strictly after "now" and congruent to the anchor modulo the
//!   interval.
//! - A [`LightSchedule`] is a daily on-window: on at `start_time` (wall clock
//!   plus fixed UTC offset), off `duration_ms` later.  A pending
//!   `adhoc_on_time` supersedes natural on-transitions up to that instant.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::{Duration as TimeDuration, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};

use crate::weather::WeatherControl;

/// Upper bound for a light on-window.  A window of a full day or more would
/// make the off transition collide with the following on transition.
const MAX_LIGHT_DURATION_MS: i64 = 24 * 60 * 60 * 1000;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum ScheduleError {
    #[error("interval must be positive, got {0}s")]
    InvalidInterval(i64),
    #[error("watering duration must be positive, got {0}ms")]
    InvalidDuration(i64),
    #[error("light duration must be positive and under 24h, got {0}ms")]
    InvalidLightDuration(i64),
    #[error("invalid light start time '{0}': expected HH:MM:SS±HH:MM")]
    InvalidLightStartTime(String),
    #[error("rain threshold ({threshold_mm}mm) must exceed baseline ({baseline_mm}mm)")]
    InvalidRainControl { baseline_mm: f32, threshold_mm: f32 },
    #[error("temperature factor bounds [{min_factor}, {max_factor}] are invalid")]
    InvalidTemperatureControl { min_factor: f32, max_factor: f32 },
    #[error("{0} is empty")]
    MissingField(&'static str),
}

// ---------------------------------------------------------------------------
// Light state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LightState {
    On,
    Off,
}

impl LightState {
    pub fn opposite(self) -> Self {
        match self {
            LightState::On => LightState::Off,
            LightState::Off => LightState::On,
        }
    }
}

impl fmt::Display for LightState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LightState::On => f.write_str("ON"),
            LightState::Off => f.write_str("OFF"),
        }
    }
}

// ---------------------------------------------------------------------------
// Light start time ("22:00:00-07:00")
// ---------------------------------------------------------------------------

/// A wall-clock time of day with a fixed UTC offset.  This is *not* a
/// recurrence anchor: only the time-of-day and offset matter, the date the
/// schedule was created on does not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LightTime {
    pub time: Time,
    pub offset: UtcOffset,
}

impl FromStr for LightTime {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let format = time::macros::format_description!(
            "[hour]:[minute]:[second][offset_hour sign:mandatory]:[offset_minute]"
        );
        let time = Time::parse(s, format)
            .map_err(|_| ScheduleError::InvalidLightStartTime(s.to_string()))?;
        let offset = UtcOffset::parse(s, format)
            .map_err(|_| ScheduleError::InvalidLightStartTime(s.to_string()))?;
        Ok(Self { time, offset })
    }
}

impl fmt::Display for LightTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let time = self
            .time
            .format(time::macros::format_description!(
                "[hour]:[minute]:[second]"
            ))
            .map_err(|_| fmt::Error)?;
        let offset = self
            .offset
            .format(time::macros::format_description!(
                "[offset_hour sign:mandatory]:[offset_minute]"
            ))
            .map_err(|_| fmt::Error)?;
        write!(f, "{time}{offset}")
    }
}

impl Serialize for LightTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for LightTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Water schedule
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaterSchedule {
    pub id: String,
    pub name: String,
    /// Recurrence period in seconds (e.g. 86400 for daily).
    pub interval_secs: i64,
    /// Base watering length in milliseconds, before weather scaling.
    pub duration_ms: i64,
    /// Absolute timestamp anchoring the recurrence; may be in the past.
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    #[serde(default)]
    pub weather_control: Option<WeatherControl>,
    /// Marks the schedule historical.  End-dated schedules keep their record
    /// but have no registered job.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub end_date: Option<OffsetDateTime>,
}

impl WaterSchedule {
    pub fn interval(&self) -> TimeDuration {
        TimeDuration::seconds(self.interval_secs)
    }

    pub fn is_end_dated(&self) -> bool {
        self.end_date.is_some()
    }

    /// Next occurrence strictly after `now`, congruent to the anchor modulo
    /// the interval.
    pub fn next_water_time(&self, now: OffsetDateTime) -> Result<OffsetDateTime, ScheduleError> {
        next_interval_time(self.start_time, self.interval(), now)
            .ok_or(ScheduleError::InvalidInterval(self.interval_secs))
    }

    pub fn validate(&self) -> Result<(), ScheduleError> {
        if self.id.trim().is_empty() {
            return Err(ScheduleError::MissingField("id"));
        }
        if self.interval_secs <= 0 {
            return Err(ScheduleError::InvalidInterval(self.interval_secs));
        }
        if self.duration_ms <= 0 {
            return Err(ScheduleError::InvalidDuration(self.duration_ms));
        }
        if let Some(wc) = &self.weather_control {
            wc.validate()?;
        }
        Ok(())
    }
}

/// Next multiple of `every` after `anchor` that is strictly after `now`.
/// Returns `None` for a non-positive interval.
pub fn next_interval_time(
    anchor: OffsetDateTime,
    every: TimeDuration,
    now: OffsetDateTime,
) -> Option<OffsetDateTime> {
    let every_ms = every.whole_milliseconds() as i64;
    if every_ms <= 0 {
        return None;
    }
    let elapsed_ms = (now - anchor).whole_milliseconds() as i64;
    if elapsed_ms < 0 {
        // Anchor is still in the future.
        return Some(anchor);
    }
    // floor + 1 lands strictly after `now` whether or not `now` falls exactly
    // on an occurrence.
    let k = elapsed_ms.div_euclid(every_ms) + 1;
    Some(anchor + TimeDuration::milliseconds(k * every_ms))
}

// ---------------------------------------------------------------------------
// Light schedule
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightSchedule {
    /// Daily on-time as wall clock plus fixed offset.
    pub start_time: LightTime,
    /// On-window length in milliseconds.  Must be under 24h.
    pub duration_ms: i64,
    /// Pending adhoc override: the instant at which the light should turn on,
    /// superseding natural on-transitions up to that point.  Cleared when the
    /// override fires.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub adhoc_on_time: Option<OffsetDateTime>,
}

impl LightSchedule {
    pub fn duration(&self) -> TimeDuration {
        TimeDuration::milliseconds(self.duration_ms)
    }

    pub fn validate(&self) -> Result<(), ScheduleError> {
        if self.duration_ms <= 0 || self.duration_ms >= MAX_LIGHT_DURATION_MS {
            return Err(ScheduleError::InvalidLightDuration(self.duration_ms));
        }
        Ok(())
    }

    /// The on-transition of today's cycle (in the schedule's offset), advanced
    /// a day if it is not strictly after `now`.  Ignores any adhoc override.
    pub fn next_natural_on(&self, now: OffsetDateTime) -> OffsetDateTime {
        let local_now = now.to_offset(self.start_time.offset);
        let today_on = PrimitiveDateTime::new(local_now.date(), self.start_time.time)
            .assume_offset(self.start_time.offset);
        if today_on > now {
            today_on
        } else {
            today_on + TimeDuration::days(1)
        }
    }

    /// Logical light state at `t`, judged purely from the natural daily
    /// window.  The literal device state is unknown to the hub.
    pub fn light_state_at(&self, t: OffsetDateTime) -> LightState {
        let local = t.to_offset(self.start_time.offset);
        let today_on = PrimitiveDateTime::new(local.date(), self.start_time.time)
            .assume_offset(self.start_time.offset);
        let cycle_on = if today_on <= t {
            today_on
        } else {
            today_on - TimeDuration::days(1)
        };
        if t >= cycle_on && t < cycle_on + self.duration() {
            LightState::On
        } else {
            LightState::Off
        }
    }

    /// Next off-transition: the end of the current on-window when the light
    /// is logically on, otherwise the end of the next window.
    pub fn next_off(&self, now: OffsetDateTime) -> OffsetDateTime {
        let next_on = self.next_natural_on(now);
        let prev_on = next_on - TimeDuration::days(1);
        if now >= prev_on && now < prev_on + self.duration() {
            prev_on + self.duration()
        } else {
            next_on + self.duration()
        }
    }

    /// The nearer of the next on/off transition, for the recurring light job.
    /// A tie reports **off** (off precedes the subsequent on in any
    /// non-overlapping schedule).  Natural on-transitions at or before a
    /// pending adhoc override are suppressed; the override job owns that
    /// transition.
    pub fn next_light_transition(&self, now: OffsetDateTime) -> (OffsetDateTime, LightState) {
        let floor = match self.adhoc_on_time {
            Some(t) if t > now => t,
            _ => now,
        };
        let next_on = self.next_natural_on(floor);
        let next_off = self.next_off(now);
        if next_off <= next_on {
            (next_off, LightState::Off)
        } else {
            (next_on, LightState::On)
        }
    }

    /// Next time the light reaches `state`, as reported to callers.  A pending
    /// adhoc override *is* the next on-transition.
    pub fn next_light_time(&self, now: OffsetDateTime, state: LightState) -> OffsetDateTime {
        match state {
            LightState::On => match self.adhoc_on_time {
                Some(t) if t > now => t,
                _ => self.next_natural_on(now),
            },
            LightState::Off => self.next_off(now),
        }
    }
}

// ---------------------------------------------------------------------------
// Garden & zones
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Garden {
    pub id: String,
    pub name: String,
    /// MQTT routing key: command topics are derived from this prefix.
    pub topic_prefix: String,
    #[serde(default)]
    pub light_schedule: Option<LightSchedule>,
    #[serde(default)]
    pub zones: BTreeMap<String, Zone>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub end_date: Option<OffsetDateTime>,
}

impl Garden {
    pub fn is_end_dated(&self) -> bool {
        self.end_date.is_some()
    }

    pub fn validate(&self) -> Result<(), ScheduleError> {
        if self.id.trim().is_empty() {
            return Err(ScheduleError::MissingField("id"));
        }
        if self.topic_prefix.trim().is_empty() {
            return Err(ScheduleError::MissingField("topic_prefix"));
        }
        if let Some(ls) = &self.light_schedule {
            ls.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub id: String,
    pub name: String,
    /// Valve index on the garden controller.
    pub position: u32,
    #[serde(default)]
    pub water_schedule_id: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub end_date: Option<OffsetDateTime>,
}

impl Zone {
    pub fn is_end_dated(&self) -> bool {
        self.end_date.is_some()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
