//! The worker ties schedules, jobs, weather, and MQTT together.
//!
//! It owns the side effects the pure modules avoid: registering jobs for
//! stored schedules, reacting to fired jobs by publishing commands, scaling
//! watering durations from weather data, and handling adhoc light overrides.
//! Publishing and scheduling are decoupled: a failed publish is logged but
//! never cancels or corrupts a job's next occurrence.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration as StdDuration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use time::{Duration as TimeDuration, OffsetDateTime};
use tracing::{error, info, warn};

use crate::actions::{GardenAction, LightAction, LightMessage, StopAction, WaterAction, WaterMessage, ZoneAction};
use crate::mqtt;
use crate::registry::{JobFn, JobKey, Recurrence, Scheduler};
use crate::schedule::{Garden, LightSchedule, LightState, WaterSchedule, Zone};
use crate::storage::StorageClient;
use crate::weather::{self, WeatherControl};

const WEATHER_CACHE_TTL: StdDuration = StdDuration::from_secs(15 * 60);

// ---------------------------------------------------------------------------
// Weather measurement cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Measurement {
    TotalRain,
    AverageHighTemperature,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    client_id: String,
    measurement: Measurement,
    since_secs: u64,
}

/// TTL cache for weather measurements, invalidated when a source's config is
/// saved.  Keeps a burst of watering jobs from hammering the vendor API.
#[derive(Default)]
struct WeatherCache {
    entries: HashMap<CacheKey, (f32, Instant)>,
}

impl WeatherCache {
    fn get(&self, key: &CacheKey) -> Option<f32> {
        let (value, fetched_at) = self.entries.get(key)?;
        (fetched_at.elapsed() < WEATHER_CACHE_TTL).then_some(*value)
    }

    fn insert(&mut self, key: CacheKey, value: f32) {
        self.entries.insert(key, (value, Instant::now()));
    }

    fn invalidate(&mut self, client_id: &str) {
        self.entries.retain(|k, _| k.client_id != client_id);
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Worker {
    storage: Arc<dyn StorageClient>,
    mqtt: mqtt::Client,
    scheduler: Arc<Scheduler>,
    weather_cache: Arc<Mutex<WeatherCache>>,
}

impl Worker {
    pub fn new(storage: Arc<dyn StorageClient>, mqtt: mqtt::Client, scheduler: Arc<Scheduler>) -> Self {
        Self {
            storage,
            mqtt,
            scheduler,
            weather_cache: Arc::new(Mutex::new(WeatherCache::default())),
        }
    }

    /// Spawn the scheduler runtime.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        self.scheduler.start()
    }

    pub fn stop(&self) {
        self.scheduler.stop();
    }

    /// Whether a live job exists for `key`.
    pub fn is_scheduled(&self, key: &JobKey) -> bool {
        self.scheduler.is_scheduled(key)
    }

    /// Register jobs for every active stored schedule.  Job state is not
    /// persisted across restarts; this runs once at startup.
    pub fn rebuild(&self) -> Result<()> {
        for ws in self.storage.get_water_schedules(false)? {
            if let Err(e) = self.scheduler.add(
                JobKey::water(&ws.id),
                Recurrence::Interval { anchor: ws.start_time, every: ws.interval() },
                self.water_job(ws.id.clone()),
            ) {
                warn!(schedule = %ws.id, "skipping stored water schedule: {e}");
            }
        }
        for garden in self.storage.get_gardens(false)? {
            if garden.light_schedule.is_none() {
                continue;
            }
            if let Err(e) = self.register_light_jobs(&garden) {
                warn!(garden = %garden.id, "skipping stored light schedule: {e}");
            }
        }
        info!(jobs = self.scheduler.job_count(), "jobs rebuilt from storage");
        Ok(())
    }

    // -- water schedules ----------------------------------------------------

    /// Validate and store a new schedule, registering its job unless it is
    /// already end-dated.
    pub fn add_water_schedule(&self, ws: &WaterSchedule) -> Result<()> {
        ws.validate()?;
        self.storage.save_water_schedule(ws)?;
        if !ws.is_end_dated() {
            self.scheduler.add(
                JobKey::water(&ws.id),
                Recurrence::Interval { anchor: ws.start_time, every: ws.interval() },
                self.water_job(ws.id.clone()),
            )?;
        }
        info!(schedule = %ws.id, "water schedule added");
        Ok(())
    }

    /// Store an edited schedule and atomically replace its job, so the old
    /// parameters can never fire after the edit.
    pub fn reset_water_schedule(&self, ws: &WaterSchedule) -> Result<()> {
        ws.validate()?;
        self.storage.save_water_schedule(ws)?;
        let key = JobKey::water(&ws.id);
        if ws.is_end_dated() {
            self.scheduler.cancel(&key);
        } else {
            self.scheduler.reset(
                key,
                Recurrence::Interval { anchor: ws.start_time, every: ws.interval() },
                self.water_job(ws.id.clone()),
            )?;
        }
        info!(schedule = %ws.id, "water schedule reset");
        Ok(())
    }

    /// End-date a schedule: the record stays as history, the job is canceled.
    pub fn remove_water_schedule(&self, id: &str) -> Result<WaterSchedule> {
        let mut ws = self
            .storage
            .get_water_schedule(id)?
            .ok_or_else(|| anyhow!("water schedule '{id}' not found"))?;
        ws.end_date = Some(OffsetDateTime::now_utc());
        self.storage.save_water_schedule(&ws)?;
        self.scheduler.cancel(&JobKey::water(id));
        info!(schedule = %id, "water schedule end-dated");
        Ok(ws)
    }

    /// Next fire time: the live job's if one is registered, otherwise
    /// computed from the schedule.
    pub fn get_next_water_time(&self, ws: &WaterSchedule) -> Option<OffsetDateTime> {
        self.scheduler
            .next_fire(&JobKey::water(&ws.id))
            .or_else(|| ws.next_water_time(OffsetDateTime::now_utc()).ok())
    }

    // -- light schedules ----------------------------------------------------

    /// Validate and snapshot the garden's light schedule, scrubbing a stale
    /// override left over from before a restart.
    fn light_snapshot(&self, garden: &Garden) -> Result<LightSchedule> {
        let ls = garden
            .light_schedule
            .as_ref()
            .ok_or_else(|| anyhow!("garden '{}' has no light schedule", garden.id))?;
        ls.validate()?;
        let mut ls = ls.clone();
        if let Some(at) = ls.adhoc_on_time {
            if at <= OffsetDateTime::now_utc() {
                ls.adhoc_on_time = None;
                let mut updated = garden.clone();
                updated.light_schedule = Some(ls.clone());
                self.storage.save_garden(&updated)?;
            }
        }
        Ok(ls)
    }

    fn register_adhoc_job(&self, garden_id: &str, ls: &LightSchedule) -> Result<()> {
        if let Some(at) = ls.adhoc_on_time {
            self.scheduler.reset(
                JobKey::adhoc_light(garden_id),
                Recurrence::OneShot { at },
                self.adhoc_job(garden_id.to_string()),
            )?;
        }
        Ok(())
    }

    fn register_light_jobs(&self, garden: &Garden) -> Result<()> {
        let ls = self.light_snapshot(garden)?;
        self.register_adhoc_job(&garden.id, &ls)?;
        self.scheduler.reset(
            JobKey::light(&garden.id),
            Recurrence::LightCycle(ls),
            self.light_job(garden.id.clone()),
        )?;
        Ok(())
    }

    /// Validate a garden's light schedule and register its jobs.  The registry
    /// rejects a second add for the same garden; edits go through
    /// `reset_light_schedule`.
    pub fn add_light_schedule(&self, garden: &Garden) -> Result<()> {
        let ls = self.light_snapshot(garden)?;
        self.scheduler.add(
            JobKey::light(&garden.id),
            Recurrence::LightCycle(ls.clone()),
            self.light_job(garden.id.clone()),
        )?;
        self.register_adhoc_job(&garden.id, &ls)?;
        info!(garden = %garden.id, "light schedule added");
        Ok(())
    }

    /// Replace the garden's recurring light job with a fresh snapshot of its
    /// schedule, dropping any pending override.
    pub fn reset_light_schedule(&self, garden: &Garden) -> Result<()> {
        self.scheduler.cancel(&JobKey::adhoc_light(&garden.id));
        self.register_light_jobs(garden)?;
        info!(garden = %garden.id, "light schedule reset");
        Ok(())
    }

    pub fn remove_light_schedule(&self, garden_id: &str) {
        self.scheduler.cancel(&JobKey::light(garden_id));
        self.scheduler.cancel(&JobKey::adhoc_light(garden_id));
        info!(garden = %garden_id, "light schedule removed");
    }

    /// Next time the garden's light reaches `state`; a pending adhoc override
    /// is the next on-transition.
    pub fn get_next_light_time(&self, garden: &Garden, state: LightState) -> Option<OffsetDateTime> {
        let ls = garden.light_schedule.as_ref()?;
        Some(ls.next_light_time(OffsetDateTime::now_utc(), state))
    }

    // -- weather ------------------------------------------------------------

    /// Store a weather source config and drop its cached measurements.
    pub fn save_weather_client_config(&self, config: &weather::ClientConfig) -> Result<()> {
        self.storage.save_weather_client_config(config)?;
        self.cache_lock().invalidate(&config.id);
        Ok(())
    }

    /// Scaled watering duration in milliseconds plus whether weather data was
    /// unavailable.  Fetch failures degrade to no scaling so watering still
    /// proceeds.
    pub async fn scale_watering_duration(&self, ws: &WaterSchedule) -> (i64, bool) {
        match &ws.weather_control {
            Some(wc) => self.scaled_duration(ws.duration_ms, wc, ws.interval()).await,
            None => (ws.duration_ms, false),
        }
    }

    async fn scaled_duration(
        &self,
        base_ms: i64,
        control: &WeatherControl,
        since: TimeDuration,
    ) -> (i64, bool) {
        let since = since.unsigned_abs();
        let mut factor = 1.0_f32;
        let mut warned = false;
        if let Some(rc) = &control.rain {
            match self
                .weather_measurement(&rc.weather_client_id, Measurement::TotalRain, since)
                .await
            {
                Ok(rain_mm) => factor *= rc.inverted_scale_down_only(rain_mm),
                Err(e) => {
                    warn!(client = %rc.weather_client_id, "rain data unavailable, not scaling: {e}");
                    warned = true;
                }
            }
        }
        if let Some(tc) = &control.temperature {
            match self
                .weather_measurement(
                    &tc.weather_client_id,
                    Measurement::AverageHighTemperature,
                    since,
                )
                .await
            {
                Ok(avg_high) => factor *= tc.scale(avg_high),
                Err(e) => {
                    warn!(client = %tc.weather_client_id, "temperature data unavailable, not scaling: {e}");
                    warned = true;
                }
            }
        }
        // Hand-edited documents can hold bounds validation would reject;
        // never publish a negative duration.
        let factor = f64::from(factor.max(0.0));
        ((base_ms as f64 * factor).round() as i64, warned)
    }

    async fn weather_measurement(
        &self,
        client_id: &str,
        measurement: Measurement,
        since: StdDuration,
    ) -> Result<f32> {
        let key = CacheKey {
            client_id: client_id.to_string(),
            measurement,
            since_secs: since.as_secs(),
        };
        if let Some(value) = self.cache_lock().get(&key) {
            return Ok(value);
        }
        let config = self
            .storage
            .get_weather_client_config(client_id)?
            .ok_or_else(|| anyhow!("weather client '{client_id}' is not configured"))?;
        let client = weather::new_client(&config)?;
        let value = match measurement {
            Measurement::TotalRain => client.get_total_rain(since).await?,
            Measurement::AverageHighTemperature => {
                client.get_average_high_temperature(since).await?
            }
        };
        self.cache_lock().insert(key, value);
        Ok(value)
    }

    fn cache_lock(&self) -> std::sync::MutexGuard<'_, WeatherCache> {
        self.weather_cache.lock().expect("weather cache lock poisoned")
    }

    // -- actions ------------------------------------------------------------

    /// Execute a garden-level request.  Order is fixed: stop before light, so
    /// "stop watering and turn the light off" behaves intuitively.
    pub async fn execute_garden_action(&self, garden: &Garden, action: &GardenAction) -> Result<()> {
        if let Some(stop) = &action.stop {
            self.execute_stop_action(garden, stop).await?;
        }
        if let Some(light) = &action.light {
            self.execute_light_action(garden, light).await?;
        }
        Ok(())
    }

    pub async fn execute_zone_action(
        &self,
        garden: &Garden,
        zone: &Zone,
        action: &ZoneAction,
    ) -> Result<()> {
        if let Some(water) = &action.water {
            self.execute_water_action(garden, zone, water).await?;
        }
        Ok(())
    }

    async fn execute_stop_action(&self, garden: &Garden, action: &StopAction) -> Result<()> {
        let topic = if action.all {
            self.mqtt.stop_all_topic(&garden.topic_prefix)
        } else {
            self.mqtt.stop_topic(&garden.topic_prefix)
        };
        self.mqtt.publish(&topic, Vec::new()).await
    }

    /// Directly-requested watering.  Weather scaling from the zone's schedule
    /// still applies unless explicitly ignored.
    pub async fn execute_water_action(
        &self,
        garden: &Garden,
        zone: &Zone,
        action: &WaterAction,
    ) -> Result<()> {
        if action.duration_ms <= 0 {
            bail!("watering duration must be positive, got {}ms", action.duration_ms);
        }
        let mut duration = action.duration_ms;
        if !action.ignore_weather {
            if let Some(ws_id) = &zone.water_schedule_id {
                let ws = self
                    .storage
                    .get_water_schedule(ws_id)?
                    .ok_or_else(|| anyhow!("water schedule '{ws_id}' not found"))?;
                if let Some(wc) = &ws.weather_control {
                    (duration, _) = self.scaled_duration(duration, wc, ws.interval()).await;
                }
            }
        }
        if duration == 0 {
            info!(garden = %garden.id, zone = %zone.id, "watering skipped by weather scaling");
            return Ok(());
        }
        let message = WaterMessage {
            duration,
            zone_id: zone.id.clone(),
            position: zone.position,
        };
        self.publish_json(&self.mqtt.water_topic(&garden.topic_prefix), &message)
            .await
    }

    /// Immediate light command.  Without a duration this is a plain publish
    /// (no state means toggle).  With a duration it becomes an adhoc override
    /// that hands control back to the recurring schedule afterwards.
    pub async fn execute_light_action(&self, garden: &Garden, action: &LightAction) -> Result<()> {
        match action.for_duration_ms {
            None => {
                self.publish_json(
                    &self.mqtt.light_topic(&garden.topic_prefix),
                    &LightMessage { state: action.state },
                )
                .await
            }
            Some(duration_ms) => self.schedule_light_delay(garden, action.state, duration_ms).await,
        }
    }

    /// Turn the light off for a while, then return to the natural schedule.
    ///
    /// The revert instant depends on the *logical* state right now (the hub
    /// does not know the literal device state):
    /// - logically on: the light goes back on `duration` from now;
    /// - logically off: the command is redundant until the next natural
    ///   on-transition, which it delays by `duration`.
    ///
    /// The revert is the garden's single pending override; a new request
    /// replaces it.  The recurring job is re-registered with the override as
    /// a floor so the suppressed natural on-transition cannot double-fire.
    async fn schedule_light_delay(
        &self,
        garden: &Garden,
        state: Option<LightState>,
        duration_ms: i64,
    ) -> Result<()> {
        if duration_ms <= 0 {
            bail!("override duration must be positive, got {duration_ms}ms");
        }
        let state = state.ok_or_else(|| anyhow!("a toggle cannot carry a duration"))?;
        if state != LightState::Off {
            bail!("only OFF supports a duration; the override reverts to ON by itself");
        }
        let mut ls = garden
            .light_schedule
            .clone()
            .ok_or_else(|| anyhow!("garden '{}' has no light schedule", garden.id))?;

        let now = OffsetDateTime::now_utc();
        let on_at = match ls.light_state_at(now) {
            LightState::On => now + TimeDuration::milliseconds(duration_ms),
            LightState::Off => ls.next_natural_on(now) + TimeDuration::milliseconds(duration_ms),
        };

        self.publish_json(
            &self.mqtt.light_topic(&garden.topic_prefix),
            &LightMessage { state: Some(LightState::Off) },
        )
        .await?;

        ls.adhoc_on_time = Some(on_at);
        let mut updated = garden.clone();
        updated.light_schedule = Some(ls.clone());
        self.storage.save_garden(&updated)?;

        self.scheduler.reset(
            JobKey::adhoc_light(&garden.id),
            Recurrence::OneShot { at: on_at },
            self.adhoc_job(garden.id.clone()),
        )?;
        self.scheduler.reset(
            JobKey::light(&garden.id),
            Recurrence::LightCycle(ls),
            self.light_job(garden.id.clone()),
        )?;
        info!(garden = %garden.id, on_at = %on_at, "light override scheduled");
        Ok(())
    }

    async fn publish_json<T: Serialize>(&self, topic: &str, message: &T) -> Result<()> {
        let payload = serde_json::to_vec(message).context("failed to encode message")?;
        self.mqtt.publish(topic, payload).await
    }

    // -- job callbacks ------------------------------------------------------

    fn water_job(&self, schedule_id: String) -> JobFn {
        let worker = self.clone();
        Arc::new(move |fired_at| {
            let worker = worker.clone();
            let id = schedule_id.clone();
            Box::pin(async move { worker.water_job_fired(&id, fired_at).await })
        })
    }

    fn light_job(&self, garden_id: String) -> JobFn {
        let worker = self.clone();
        Arc::new(move |fired_at| {
            let worker = worker.clone();
            let id = garden_id.clone();
            Box::pin(async move { worker.light_job_fired(&id, fired_at).await })
        })
    }

    fn adhoc_job(&self, garden_id: String) -> JobFn {
        let worker = self.clone();
        Arc::new(move |_fired_at| {
            let worker = worker.clone();
            let id = garden_id.clone();
            Box::pin(async move { worker.adhoc_job_fired(&id).await })
        })
    }

    /// Recurring watering fire: reload the schedule, scale its duration, and
    /// publish one water command per zone still using it.
    async fn water_job_fired(&self, schedule_id: &str, fired_at: OffsetDateTime) {
        let ws = match self.storage.get_water_schedule(schedule_id) {
            Ok(Some(ws)) if !ws.is_end_dated() => ws,
            Ok(_) => {
                warn!(schedule = %schedule_id, "watering fired for a missing or end-dated schedule, canceling job");
                self.scheduler.cancel(&JobKey::water(schedule_id));
                return;
            }
            Err(e) => {
                error!(schedule = %schedule_id, "failed to load water schedule: {e}");
                return;
            }
        };
        let (duration, _) = self.scale_watering_duration(&ws).await;
        if duration == 0 {
            info!(schedule = %ws.id, due = %fired_at, "watering skipped by weather scaling");
            return;
        }
        let pairs = match self.storage.zones_using_schedule(&ws.id) {
            Ok(pairs) => pairs,
            Err(e) => {
                error!(schedule = %ws.id, "failed to resolve zones: {e}");
                return;
            }
        };
        for (garden, zone) in &pairs {
            let message = WaterMessage {
                duration,
                zone_id: zone.id.clone(),
                position: zone.position,
            };
            if let Err(e) = self
                .publish_json(&self.mqtt.water_topic(&garden.topic_prefix), &message)
                .await
            {
                error!(garden = %garden.id, zone = %zone.id, "failed to publish water command: {e}");
            }
        }
        info!(schedule = %ws.id, zones = pairs.len(), duration_ms = duration, due = %fired_at, "watering commands published");
    }

    /// Recurring light transition: the state to publish is the logical state
    /// *at* the due time, so a late fire still lands on the right side of the
    /// transition.
    async fn light_job_fired(&self, garden_id: &str, fired_at: OffsetDateTime) {
        let garden = match self.storage.get_garden(garden_id) {
            Ok(Some(g)) if !g.is_end_dated() && g.light_schedule.is_some() => g,
            Ok(_) => {
                warn!(garden = %garden_id, "light fired for a missing, ended, or lightless garden, canceling job");
                self.scheduler.cancel(&JobKey::light(garden_id));
                self.scheduler.cancel(&JobKey::adhoc_light(garden_id));
                return;
            }
            Err(e) => {
                error!(garden = %garden_id, "failed to load garden: {e}");
                return;
            }
        };
        let state = match &garden.light_schedule {
            Some(ls) => ls.light_state_at(fired_at),
            None => return,
        };
        if let Err(e) = self
            .publish_json(
                &self.mqtt.light_topic(&garden.topic_prefix),
                &LightMessage { state: Some(state) },
            )
            .await
        {
            error!(garden = %garden.id, "failed to publish light command: {e}");
        }
        info!(garden = %garden.id, %state, due = %fired_at, "light command published");
    }

    /// Adhoc override revert: publish ON, clear the override, and hand the
    /// recurring job a snapshot without the floor.
    async fn adhoc_job_fired(&self, garden_id: &str) {
        let garden = match self.storage.get_garden(garden_id) {
            Ok(Some(g)) => g,
            Ok(None) => {
                warn!(garden = %garden_id, "override fired for a missing garden");
                return;
            }
            Err(e) => {
                error!(garden = %garden_id, "failed to load garden: {e}");
                return;
            }
        };
        let Some(mut ls) = garden.light_schedule.clone() else {
            return;
        };
        if let Err(e) = self
            .publish_json(
                &self.mqtt.light_topic(&garden.topic_prefix),
                &LightMessage { state: Some(LightState::On) },
            )
            .await
        {
            error!(garden = %garden.id, "failed to publish override revert: {e}");
        }
        ls.adhoc_on_time = None;
        let mut updated = garden.clone();
        updated.light_schedule = Some(ls.clone());
        if let Err(e) = self.storage.save_garden(&updated) {
            error!(garden = %garden.id, "failed to clear override: {e}");
        }
        if let Err(e) = self.scheduler.reset(
            JobKey::light(garden_id),
            Recurrence::LightCycle(ls),
            self.light_job(garden_id.to_string()),
        ) {
            error!(garden = %garden.id, "failed to restore recurring light job: {e}");
        }
        info!(garden = %garden.id, "light override reverted");
    }
}

// ===========================================================================
// Tests
// ===========================================================================
