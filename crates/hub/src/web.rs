//! HTTP API for gardens, schedules, and actions.
//!
//! Thin adapter over the worker: handlers validate and marshal, the worker
//! owns jobs and side effects.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use serde_json::json;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tracing::info;

use crate::actions::{GardenAction, ZoneAction};
use crate::schedule::{Garden, LightState, WaterSchedule};
use crate::storage::StorageClient;
use crate::worker::Worker;

#[derive(Clone)]
pub struct AppState {
    pub worker: Worker,
    pub storage: Arc<dyn StorageClient>,
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// An error with the HTTP status it should surface as.  Handler `?` on
/// storage/worker failures defaults to 500.
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(what: impl Into<String>) -> Self {
        Self { status: StatusCode::NOT_FOUND, message: what.into() }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, message: message.into() }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self { status: StatusCode::INTERNAL_SERVER_ERROR, message: format!("{e:#}") }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

// ---------------------------------------------------------------------------
// Response bodies
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct GardenResponse {
    #[serde(flatten)]
    garden: Garden,
    #[serde(with = "time::serde::rfc3339::option")]
    next_light_on: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    next_light_off: Option<OffsetDateTime>,
}

#[derive(Serialize)]
struct WaterScheduleResponse {
    #[serde(flatten)]
    schedule: WaterSchedule,
    #[serde(with = "time::serde::rfc3339::option")]
    next_water_time: Option<OffsetDateTime>,
}

impl AppState {
    fn garden_response(&self, garden: Garden) -> GardenResponse {
        let next_light_on = self.worker.get_next_light_time(&garden, LightState::On);
        let next_light_off = self.worker.get_next_light_time(&garden, LightState::Off);
        GardenResponse { garden, next_light_on, next_light_off }
    }

    fn schedule_response(&self, schedule: WaterSchedule) -> WaterScheduleResponse {
        let next_water_time = if schedule.is_end_dated() {
            None
        } else {
            self.worker.get_next_water_time(&schedule)
        };
        WaterScheduleResponse { schedule, next_water_time }
    }

    fn load_garden(&self, id: &str) -> Result<Garden, ApiError> {
        self.storage
            .get_garden(id)?
            .ok_or_else(|| ApiError::not_found(format!("garden '{id}' not found")))
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/gardens", get(list_gardens))
        .route("/api/gardens/{id}", get(get_garden))
        .route("/api/gardens/{id}/action", axum::routing::post(garden_action))
        .route(
            "/api/gardens/{id}/zones/{zone_id}/action",
            axum::routing::post(zone_action),
        )
        .route(
            "/api/water_schedules",
            get(list_water_schedules).post(create_water_schedule),
        )
        .route(
            "/api/water_schedules/{id}",
            get(get_water_schedule)
                .patch(update_water_schedule)
                .delete(delete_water_schedule),
        )
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

// -- gardens -----------------------------------------------------------------

async fn list_gardens(State(state): State<AppState>) -> Result<Response, ApiError> {
    let gardens: Vec<GardenResponse> = state
        .storage
        .get_gardens(false)?
        .into_iter()
        .map(|g| state.garden_response(g))
        .collect();
    Ok(Json(gardens).into_response())
}

async fn get_garden(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let garden = state.load_garden(&id)?;
    Ok(Json(state.garden_response(garden)).into_response())
}

async fn garden_action(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(action): Json<GardenAction>,
) -> Result<Response, ApiError> {
    let garden = state.load_garden(&id)?;
    state
        .worker
        .execute_garden_action(&garden, &action)
        .await
        .map_err(|e| ApiError::bad_request(format!("{e:#}")))?;
    Ok(StatusCode::ACCEPTED.into_response())
}

async fn zone_action(
    State(state): State<AppState>,
    Path((id, zone_id)): Path<(String, String)>,
    Json(action): Json<ZoneAction>,
) -> Result<Response, ApiError> {
    let garden = state.load_garden(&id)?;
    let zone = garden
        .zones
        .get(&zone_id)
        .filter(|z| !z.is_end_dated())
        .ok_or_else(|| ApiError::not_found(format!("zone '{zone_id}' not found in garden '{id}'")))?;
    state
        .worker
        .execute_zone_action(&garden, zone, &action)
        .await
        .map_err(|e| ApiError::bad_request(format!("{e:#}")))?;
    Ok(StatusCode::ACCEPTED.into_response())
}

// -- water schedules ----------------------------------------------------------

async fn list_water_schedules(State(state): State<AppState>) -> Result<Response, ApiError> {
    let schedules: Vec<WaterScheduleResponse> = state
        .storage
        .get_water_schedules(false)?
        .into_iter()
        .map(|ws| state.schedule_response(ws))
        .collect();
    Ok(Json(schedules).into_response())
}

async fn get_water_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let ws = state
        .storage
        .get_water_schedule(&id)?
        .ok_or_else(|| ApiError::not_found(format!("water schedule '{id}' not found")))?;
    Ok(Json(state.schedule_response(ws)).into_response())
}

async fn create_water_schedule(
    State(state): State<AppState>,
    Json(ws): Json<WaterSchedule>,
) -> Result<Response, ApiError> {
    if state.storage.get_water_schedule(&ws.id)?.is_some() {
        return Err(ApiError {
            status: StatusCode::CONFLICT,
            message: format!("water schedule '{}' already exists", ws.id),
        });
    }
    state
        .worker
        .add_water_schedule(&ws)
        .map_err(|e| ApiError::bad_request(format!("{e:#}")))?;
    let body = state.schedule_response(ws);
    Ok((StatusCode::CREATED, Json(body)).into_response())
}

async fn update_water_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(ws): Json<WaterSchedule>,
) -> Result<Response, ApiError> {
    if ws.id != id {
        return Err(ApiError::bad_request(format!(
            "schedule id '{}' does not match path '{id}'",
            ws.id
        )));
    }
    if state.storage.get_water_schedule(&id)?.is_none() {
        return Err(ApiError::not_found(format!("water schedule '{id}' not found")));
    }
    state
        .worker
        .reset_water_schedule(&ws)
        .map_err(|e| ApiError::bad_request(format!("{e:#}")))?;
    Ok(Json(state.schedule_response(ws)).into_response())
}

async fn delete_water_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    if state.storage.get_water_schedule(&id)?.is_none() {
        return Err(ApiError::not_found(format!("water schedule '{id}' not found")));
    }
    let ws = state.worker.remove_water_schedule(&id)?;
    Ok(Json(state.schedule_response(ws)).into_response())
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("api listening on http://{addr}");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::{self, PublishedMessage, Topics};
    use crate::registry::{JobKey, Scheduler};
    use crate::schedule::Zone;
    use crate::storage::YamlClient;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use time::macros::datetime;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tower::ServiceExt;

    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn temp_path() -> PathBuf {
        let n = COUNTER.fetch_add(1, Ordering::SeqCst);
        std::env::temp_dir().join(format!("garden-hub-web-{}-{n}.yaml", std::process::id()))
    }

    fn test_state() -> (AppState, UnboundedReceiver<PublishedMessage>) {
        let storage = Arc::new(YamlClient::new(temp_path()).unwrap());
        let (client, rx) = mqtt::Client::capture(Topics::default());
        let worker = Worker::new(
            Arc::clone(&storage) as Arc<dyn StorageClient>,
            client,
            Scheduler::new(),
        );
        (
            AppState { worker, storage: storage as Arc<dyn StorageClient> },
            rx,
        )
    }

    fn seeded_garden() -> Garden {
        Garden {
            id: "g1".into(),
            name: "Backyard".into(),
            topic_prefix: "backyard".into(),
            light_schedule: None,
            zones: BTreeMap::from([(
                "z1".to_string(),
                Zone {
                    id: "z1".into(),
                    name: "Front bed".into(),
                    position: 0,
                    water_schedule_id: None,
                    end_date: None,
                },
            )]),
            created_at: datetime!(2023-01-01 00:00:00 UTC),
            end_date: None,
        }
    }

    fn schedule_json(id: &str) -> serde_json::Value {
        json!({
            "id": id,
            "name": "Daily",
            "interval_secs": 86400,
            "duration_ms": 10000,
            "start_time": "2022-04-23T08:00:00-07:00",
        })
    }

    async fn request(
        state: &AppState,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(v) => builder
                .header("content-type", "application/json")
                .body(Body::from(v.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    // -- health & gardens ---------------------------------------------------

    #[tokio::test]
    async fn health_reports_ok() {
        let (state, _rx) = test_state();
        let (status, body) = request(&state, "GET", "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn gardens_listed_with_light_times() {
        let (state, _rx) = test_state();
        let mut garden = seeded_garden();
        garden.light_schedule = Some(crate::schedule::LightSchedule {
            start_time: "22:00:00+00:00".parse().unwrap(),
            duration_ms: 4 * 3600 * 1000,
            adhoc_on_time: None,
        });
        state.storage.save_garden(&garden).unwrap();

        let (status, body) = request(&state, "GET", "/api/gardens", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["id"], "g1");
        assert!(body[0]["next_light_on"].is_string());
        assert!(body[0]["next_light_off"].is_string());
    }

    #[tokio::test]
    async fn missing_garden_is_404() {
        let (state, _rx) = test_state();
        let (status, body) = request(&state, "GET", "/api/gardens/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("nope"));
    }

    // -- actions ------------------------------------------------------------

    #[tokio::test]
    async fn garden_action_publishes_command() {
        let (state, mut rx) = test_state();
        state.storage.save_garden(&seeded_garden()).unwrap();

        let (status, _) = request(
            &state,
            "POST",
            "/api/gardens/g1/action",
            Some(json!({ "stop": { "all": true } })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(rx.recv().await.unwrap().topic, "backyard/command/stop_all");
    }

    #[tokio::test]
    async fn zone_action_waters_the_zone() {
        let (state, mut rx) = test_state();
        state.storage.save_garden(&seeded_garden()).unwrap();

        let (status, _) = request(
            &state,
            "POST",
            "/api/gardens/g1/zones/z1/action",
            Some(json!({ "water": { "duration_ms": 3000 } })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.topic, "backyard/command/water");
        let water: crate::actions::WaterMessage = serde_json::from_slice(&msg.payload).unwrap();
        assert_eq!(water.duration, 3000);
        assert_eq!(water.zone_id, "z1");
    }

    #[tokio::test]
    async fn unknown_zone_is_404() {
        let (state, _rx) = test_state();
        state.storage.save_garden(&seeded_garden()).unwrap();
        let (status, _) = request(
            &state,
            "POST",
            "/api/gardens/g1/zones/zz/action",
            Some(json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_light_action_is_400() {
        let (state, _rx) = test_state();
        state.storage.save_garden(&seeded_garden()).unwrap();
        // Toggle with a duration is rejected by the worker.
        let (status, body) = request(
            &state,
            "POST",
            "/api/gardens/g1/action",
            Some(json!({ "light": { "for_duration_ms": 1000 } })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("toggle"));
    }

    // -- water schedule CRUD ------------------------------------------------

    #[tokio::test]
    async fn create_schedules_job_and_reports_next_time() {
        let (state, _rx) = test_state();
        let (status, body) = request(
            &state,
            "POST",
            "/api/water_schedules",
            Some(schedule_json("ws1")),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert!(body["next_water_time"].is_string());
        assert!(state.worker.is_scheduled(&JobKey::water("ws1")));

        let (status, body) = request(&state, "GET", "/api/water_schedules", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn create_duplicate_is_409() {
        let (state, _rx) = test_state();
        let (status, _) =
            request(&state, "POST", "/api/water_schedules", Some(schedule_json("ws1"))).await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, _) =
            request(&state, "POST", "/api/water_schedules", Some(schedule_json("ws1"))).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn create_invalid_is_400_and_not_stored() {
        let (state, _rx) = test_state();
        let mut body = schedule_json("ws1");
        body["interval_secs"] = json!(0);
        let (status, _) = request(&state, "POST", "/api/water_schedules", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(state.storage.get_water_schedule("ws1").unwrap().is_none());
    }

    #[tokio::test]
    async fn patch_resets_the_job() {
        let (state, _rx) = test_state();
        request(&state, "POST", "/api/water_schedules", Some(schedule_json("ws1"))).await;

        let mut edited = schedule_json("ws1");
        edited["start_time"] = json!("2030-01-01T08:00:00Z");
        let (status, body) =
            request(&state, "PATCH", "/api/water_schedules/ws1", Some(edited)).await;
        assert_eq!(status, StatusCode::OK);
        // The future anchor is now the next fire time.
        assert_eq!(body["next_water_time"], "2030-01-01T08:00:00Z");
    }

    #[tokio::test]
    async fn patch_id_mismatch_is_400() {
        let (state, _rx) = test_state();
        request(&state, "POST", "/api/water_schedules", Some(schedule_json("ws1"))).await;
        let (status, _) =
            request(&state, "PATCH", "/api/water_schedules/ws1", Some(schedule_json("other"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn delete_end_dates_and_stops_reporting_next_time() {
        let (state, _rx) = test_state();
        request(&state, "POST", "/api/water_schedules", Some(schedule_json("ws1"))).await;

        let (status, body) = request(&state, "DELETE", "/api/water_schedules/ws1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["end_date"].is_string());
        assert!(body["next_water_time"].is_null());
        assert!(!state.worker.is_scheduled(&JobKey::water("ws1")));

        // Gone from the active listing, still fetchable by id.
        let (_, listed) = request(&state, "GET", "/api/water_schedules", None).await;
        assert!(listed.as_array().unwrap().is_empty());
        let (status, _) = request(&state, "GET", "/api/water_schedules/ws1", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn delete_missing_is_404() {
        let (state, _rx) = test_state();
        let (status, _) = request(&state, "DELETE", "/api/water_schedules/ws1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
