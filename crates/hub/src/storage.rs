//! Schedule definition storage.
//!
//! The hub never persists job state; it persists *definitions* (gardens,
//! water schedules, weather source configs) and rebuilds jobs from them at
//! startup.  [`YamlClient`] keeps the whole document in memory behind a
//! read/write lock and writes it back through to disk on every save, which is
//! plenty for the tens of entities a garden deployment has.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::schedule::{Garden, WaterSchedule, Zone};
use crate::weather;

// ---------------------------------------------------------------------------
// Client interface
// ---------------------------------------------------------------------------

/// Storage backend for schedule definitions.  End-dated entities stay in the
/// store as history; `include_end_dated` controls whether list calls return
/// them.
pub trait StorageClient: Send + Sync {
    fn get_gardens(&self, include_end_dated: bool) -> Result<Vec<Garden>>;
    fn get_garden(&self, id: &str) -> Result<Option<Garden>>;
    fn save_garden(&self, garden: &Garden) -> Result<()>;

    fn get_water_schedules(&self, include_end_dated: bool) -> Result<Vec<WaterSchedule>>;
    fn get_water_schedule(&self, id: &str) -> Result<Option<WaterSchedule>>;
    fn save_water_schedule(&self, schedule: &WaterSchedule) -> Result<()>;

    /// Active (garden, zone) pairs watered by the given schedule.
    fn zones_using_schedule(&self, schedule_id: &str) -> Result<Vec<(Garden, Zone)>>;

    fn get_weather_client_config(&self, id: &str) -> Result<Option<weather::ClientConfig>>;
    fn save_weather_client_config(&self, config: &weather::ClientConfig) -> Result<()>;
}

// ---------------------------------------------------------------------------
// YAML document client
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
struct Document {
    #[serde(default)]
    gardens: BTreeMap<String, Garden>,
    #[serde(default)]
    water_schedules: BTreeMap<String, WaterSchedule>,
    #[serde(default)]
    weather_clients: BTreeMap<String, weather::ClientConfig>,
}

pub struct YamlClient {
    path: PathBuf,
    doc: RwLock<Document>,
}

impl YamlClient {
    /// Load the document at `path`, or start empty if the file does not exist
    /// yet (it is created on first save).
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let doc = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read storage file {}", path.display()))?;
            serde_yaml::from_str(&contents)
                .with_context(|| format!("failed to parse storage file {}", path.display()))?
        } else {
            Document::default()
        };
        Ok(Self { path, doc: RwLock::new(doc) })
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Document> {
        self.doc.read().expect("storage lock poisoned")
    }

    /// Mutate the document and write it back through to disk.
    fn update(&self, mutate: impl FnOnce(&mut Document)) -> Result<()> {
        let mut doc = self.doc.write().expect("storage lock poisoned");
        mutate(&mut doc);
        let contents = serde_yaml::to_string(&*doc).context("failed to serialize storage")?;
        std::fs::write(&self.path, contents)
            .with_context(|| format!("failed to write storage file {}", self.path.display()))
    }
}

impl StorageClient for YamlClient {
    fn get_gardens(&self, include_end_dated: bool) -> Result<Vec<Garden>> {
        Ok(self
            .read()
            .gardens
            .values()
            .filter(|g| include_end_dated || !g.is_end_dated())
            .cloned()
            .collect())
    }

    fn get_garden(&self, id: &str) -> Result<Option<Garden>> {
        Ok(self.read().gardens.get(id).cloned())
    }

    fn save_garden(&self, garden: &Garden) -> Result<()> {
        self.update(|doc| {
            doc.gardens.insert(garden.id.clone(), garden.clone());
        })
    }

    fn get_water_schedules(&self, include_end_dated: bool) -> Result<Vec<WaterSchedule>> {
        Ok(self
            .read()
            .water_schedules
            .values()
            .filter(|ws| include_end_dated || !ws.is_end_dated())
            .cloned()
            .collect())
    }

    fn get_water_schedule(&self, id: &str) -> Result<Option<WaterSchedule>> {
        Ok(self.read().water_schedules.get(id).cloned())
    }

    fn save_water_schedule(&self, schedule: &WaterSchedule) -> Result<()> {
        self.update(|doc| {
            doc.water_schedules.insert(schedule.id.clone(), schedule.clone());
        })
    }

    fn zones_using_schedule(&self, schedule_id: &str) -> Result<Vec<(Garden, Zone)>> {
        let doc = self.read();
        let mut result = Vec::new();
        for garden in doc.gardens.values() {
            if garden.is_end_dated() {
                continue;
            }
            for zone in garden.zones.values() {
                if zone.is_end_dated() {
                    continue;
                }
                if zone.water_schedule_id.as_deref() == Some(schedule_id) {
                    result.push((garden.clone(), zone.clone()));
                }
            }
        }
        Ok(result)
    }

    fn get_weather_client_config(&self, id: &str) -> Result<Option<weather::ClientConfig>> {
        Ok(self.read().weather_clients.get(id).cloned())
    }

    fn save_weather_client_config(&self, config: &weather::ClientConfig) -> Result<()> {
        self.update(|doc| {
            doc.weather_clients.insert(config.id.clone(), config.clone());
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
