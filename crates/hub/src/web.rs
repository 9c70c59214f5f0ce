use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use sysinfo::System;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::autopilot::{Autopilot, ControlError};
use crate::db::{now_unix, Db};
use crate::state::{SharedState, TelemetrySnapshot};

const INDEX_HTML: &str = r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>hydro-hub</title></head>
<body>
<h1>hydro-hub</h1>
<p>Hydroponic growth hub. Live snapshot at <a href="/api/status">/api/status</a>,
health at <a href="/api/health">/api/health</a>.</p>
</body>
</html>
"#;

// ---------------------------------------------------------------------------
// Shared handler state
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub controller: Arc<Autopilot>,
    pub shared: SharedState,
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Wire shape for every failure: `{"error": "<kind>"}` with a stable kind.
struct ApiError(ControlError);

impl From<ControlError> for ApiError {
    fn from(err: ControlError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn internal(err: anyhow::Error) -> Self {
        Self(ControlError::Internal(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self.0 {
            ControlError::InvalidPhase(_) => (StatusCode::BAD_REQUEST, "invalid_phase"),
            ControlError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
            ControlError::NoActiveCycle => (StatusCode::NOT_FOUND, "no_active_cycle"),
            ControlError::Internal(e) => {
                error!("request failed: {e:#}");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
        };
        (status, Json(json!({ "error": kind }))).into_response()
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(app: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/status", get(api_status))
        .route("/api/health", get(api_health))
        .route("/api/cycle/phase", post(set_phase))
        .route("/api/cycle/current", get(current_cycle))
        .route("/api/cycle/history", get(cycle_history))
        .route("/api/autopilot/start", post(autopilot_start))
        .route("/api/autopilot/stop", post(autopilot_stop))
        .route("/api/sensors/data", post(ingest_reading))
        .route("/api/sensors/history", get(sensor_history))
        .route("/api/logs", get(recent_logs))
        .with_state(app)
}

async fn index() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], INDEX_HTML)
}

async fn api_status(State(app): State<AppState>) -> impl IntoResponse {
    let st = app.shared.read().await;
    Json(st.to_status())
}

async fn api_health(State(app): State<AppState>) -> Response {
    if let Err(e) = sqlx::query("SELECT 1").execute(app.db.pool()).await {
        error!("db health probe failed: {e}");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "status": "error", "error": "database_unreachable" })),
        )
            .into_response();
    }

    let mut sys = System::new();
    sys.refresh_memory();
    Json(json!({
        "status": "ok",
        "database": "connected",
        "usedMemoryBytes": sys.used_memory(),
        "totalMemoryBytes": sys.total_memory(),
    }))
    .into_response()
}

// -- Growth cycle -----------------------------------------------------------

#[derive(Deserialize)]
struct PhaseBody {
    phase: String,
}

async fn set_phase(
    State(app): State<AppState>,
    Json(body): Json<PhaseBody>,
) -> Result<Response, ApiError> {
    let cycle = app.controller.set_phase(&body.phase).await?;
    Ok(Json(json!({ "success": true, "cycle": cycle })).into_response())
}

async fn current_cycle(State(app): State<AppState>) -> Result<Response, ApiError> {
    let cycle = app.db.current_cycle().await.map_err(ApiError::internal)?;
    // serializes as the row object, or JSON null before the first phase-set
    Ok(Json(cycle).into_response())
}

async fn cycle_history(State(app): State<AppState>) -> Result<Response, ApiError> {
    let history = app.db.phase_history().await.map_err(ApiError::internal)?;
    Ok(Json(history).into_response())
}

// -- Autopilot ---------------------------------------------------------------

#[derive(Deserialize)]
struct PasswordBody {
    password: String,
}

async fn autopilot_start(
    State(app): State<AppState>,
    Json(body): Json<PasswordBody>,
) -> Result<Response, ApiError> {
    app.controller.start(&body.password).await?;
    Ok(Json(json!({ "success": true })).into_response())
}

async fn autopilot_stop(
    State(app): State<AppState>,
    Json(body): Json<PasswordBody>,
) -> Result<Response, ApiError> {
    app.controller.stop(&body.password).await?;
    Ok(Json(json!({ "success": true })).into_response())
}

// -- Telemetry + logs --------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadingBody {
    /// Defaults to arrival time, for nodes without a clock.
    ts: Option<i64>,
    ph: f64,
    tds: f64,
    water_temp: f64,
    air_temp: f64,
    humidity: f64,
}

async fn ingest_reading(
    State(app): State<AppState>,
    Json(body): Json<ReadingBody>,
) -> Result<Response, ApiError> {
    let ts = body.ts.unwrap_or_else(now_unix);
    let row = app
        .db
        .insert_reading(ts, body.ph, body.tds, body.water_temp, body.air_temp, body.humidity)
        .await
        .map_err(ApiError::internal)?;

    {
        let mut st = app.shared.write().await;
        st.record_telemetry(
            "http",
            TelemetrySnapshot {
                ts,
                ph: body.ph,
                tds: body.tds,
                water_temp: body.water_temp,
                air_temp: body.air_temp,
                humidity: body.humidity,
            },
        );
    }

    Ok(Json(row).into_response())
}

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<i64>,
}

async fn sensor_history(
    State(app): State<AppState>,
    Query(q): Query<LimitQuery>,
) -> Result<Response, ApiError> {
    let limit = q.limit.unwrap_or(100).clamp(1, 1000);
    let rows = app.db.recent_readings(limit).await.map_err(ApiError::internal)?;
    Ok(Json(rows).into_response())
}

async fn recent_logs(
    State(app): State<AppState>,
    Query(q): Query<LimitQuery>,
) -> Result<Response, ApiError> {
    let limit = q.limit.unwrap_or(50).clamp(1, 1000);
    let logs = app.db.recent_logs(limit).await.map_err(ApiError::internal)?;
    Ok(Json(logs).into_response())
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(app: AppState, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!("web api listening on http://{addr}");

    axum::serve(listener, router(app))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Authorizer;
    use crate::broadcast::{Broadcaster, OutboundEvent};
    use crate::phase::PhaseTable;
    use crate::state::HubState;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tokio::sync::RwLock;
    use tower::util::ServiceExt;

    const PASSWORD: &str = "duffy";

    async fn test_app() -> (Router, Broadcaster, Db) {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();

        let hash = bcrypt::hash(PASSWORD, 4).unwrap();
        db.upsert_user("jack", &hash, "admin").await.unwrap();

        let events = Broadcaster::new(16);
        let shared: SharedState = Arc::new(RwLock::new(HubState::new()));
        let controller = Arc::new(Autopilot::new(
            db.clone(),
            Arc::new(PhaseTable::defaults()),
            Authorizer::new(db.clone(), "jack"),
            events.clone(),
            Arc::clone(&shared),
        ));

        let app = AppState {
            db: db.clone(),
            controller,
            shared,
        };
        (router(app), events, db)
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    // -- Cycle endpoints ----------------------------------------------------

    #[tokio::test]
    async fn set_phase_returns_cycle_record() {
        let (app, _events, _db) = test_app().await;

        let response = app
            .oneshot(post_json("/api/cycle/phase", r#"{"phase":"VEGETATIVE"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["cycle"]["phase"], "VEGETATIVE");
        assert_eq!(json["cycle"]["autopilotActive"], false);
    }

    #[tokio::test]
    async fn set_phase_rejects_unknown_tag() {
        let (app, _events, db) = test_app().await;

        let response = app
            .oneshot(post_json("/api/cycle/phase", r#"{"phase":"MOON_PHASE"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let json = body_json(response).await;
        assert_eq!(json["error"], "invalid_phase");
        assert!(db.current_cycle().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn current_cycle_is_null_before_first_phase_set() {
        let (app, _events, _db) = test_app().await;

        let response = app.oneshot(get_req("/api/cycle/current")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_json(response).await.is_null());
    }

    #[tokio::test]
    async fn cycle_history_newest_first() {
        let (app, _events, _db) = test_app().await;

        app.clone()
            .oneshot(post_json("/api/cycle/phase", r#"{"phase":"GERMINATION"}"#))
            .await
            .unwrap();
        app.clone()
            .oneshot(post_json("/api/cycle/phase", r#"{"phase":"SEEDLING"}"#))
            .await
            .unwrap();

        let response = app.oneshot(get_req("/api/cycle/history")).await.unwrap();
        let json = body_json(response).await;
        let rows = json.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["phase"], "SEEDLING");
        assert!(rows[0]["endDate"].is_null());
        assert_eq!(rows[1]["phase"], "GERMINATION");
        assert!(!rows[1]["endDate"].is_null());
    }

    // -- Autopilot endpoints ------------------------------------------------

    #[tokio::test]
    async fn autopilot_start_requires_cycle() {
        let (app, _events, _db) = test_app().await;

        let response = app
            .oneshot(post_json("/api/autopilot/start", r#"{"password":"duffy"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["error"], "no_active_cycle");
    }

    #[tokio::test]
    async fn autopilot_start_rejects_bad_password() {
        let (app, _events, db) = test_app().await;

        app.clone()
            .oneshot(post_json("/api/cycle/phase", r#"{"phase":"VEGETATIVE"}"#))
            .await
            .unwrap();

        let response = app
            .oneshot(post_json("/api/autopilot/start", r#"{"password":"wrong"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["error"], "unauthorized");

        let cycle = db.current_cycle().await.unwrap().unwrap();
        assert!(!cycle.autopilot_active);
    }

    #[tokio::test]
    async fn autopilot_start_and_stop_full_flow() {
        let (app, events, db) = test_app().await;
        let mut rx = events.subscribe();

        app.clone()
            .oneshot(post_json("/api/cycle/phase", r#"{"phase":"VEGETATIVE"}"#))
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(post_json("/api/autopilot/start", r#"{"password":"duffy"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["success"], true);

        match rx.recv().await.unwrap() {
            OutboundEvent::HardwareCommand(settings) => {
                assert_eq!(settings.target_ph, Some(5.9));
                assert_eq!(settings.target_tds, Some(700.0));
            }
            other => panic!("expected hardware command, got {other:?}"),
        }

        let response = app
            .oneshot(post_json("/api/autopilot/stop", r#"{"password":"duffy"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let cycle = db.current_cycle().await.unwrap().unwrap();
        assert!(!cycle.autopilot_active);
    }

    // -- Telemetry + logs ---------------------------------------------------

    #[tokio::test]
    async fn ingest_then_read_back_sensor_history() {
        let (app, _events, _db) = test_app().await;

        let frame = r#"{"ts":1700000100,"ph":5.95,"tds":705,"waterTemp":19.4,"airTemp":24.2,"humidity":60}"#;
        let response = app
            .clone()
            .oneshot(post_json("/api/sensors/data", frame))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(get_req("/api/sensors/history?limit=10"))
            .await
            .unwrap();
        let json = body_json(response).await;
        let rows = json.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["ph"], 5.95);
        assert_eq!(rows[0]["waterTemp"], 19.4);
    }

    #[tokio::test]
    async fn logs_endpoint_reflects_audit_trail() {
        let (app, _events, _db) = test_app().await;

        app.clone()
            .oneshot(post_json("/api/cycle/phase", r#"{"phase":"FLUSH"}"#))
            .await
            .unwrap();

        let response = app.oneshot(get_req("/api/logs?limit=5")).await.unwrap();
        let json = body_json(response).await;
        let rows = json.as_array().unwrap();
        assert_eq!(rows[0]["level"], "INFO");
        assert_eq!(rows[0]["message"], "Growth phase changed to FLUSH");
    }

    // -- Status + health + index --------------------------------------------

    #[tokio::test]
    async fn status_tracks_phase_and_autopilot() {
        let (app, _events, _db) = test_app().await;

        app.clone()
            .oneshot(post_json("/api/cycle/phase", r#"{"phase":"VEGETATIVE"}"#))
            .await
            .unwrap();
        app.clone()
            .oneshot(post_json("/api/autopilot/start", r#"{"password":"duffy"}"#))
            .await
            .unwrap();

        let response = app.oneshot(get_req("/api/status")).await.unwrap();
        let json = body_json(response).await;
        assert_eq!(json["phase"], "VEGETATIVE");
        assert_eq!(json["autopilotActive"], true);
        assert_eq!(json["mqttConnected"], false);
    }

    #[tokio::test]
    async fn health_reports_ok_with_live_db() {
        let (app, _events, _db) = test_app().await;

        let response = app.oneshot(get_req("/api/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["database"], "connected");
    }

    #[tokio::test]
    async fn index_serves_html() {
        let (app, _events, _db) = test_app().await;

        let response = app.oneshot(get_req("/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(content_type.starts_with("text/html"));
    }
}
