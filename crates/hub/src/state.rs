use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<HubState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Live, in-memory view of the hub for the status endpoint. Rebuilt from
/// the database on restart; losing it costs nothing but the event ring.
pub struct HubState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub autopilot_active: bool,
    pub phase: Option<String>,
    pub nodes: HashMap<String, NodeStatus>,
    pub events: VecDeque<HubEvent>,
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
    pub last_frame: TelemetrySnapshot,
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySnapshot {
    pub ts: i64,
    pub ph: f64,
    pub tds: f64,
    pub water_temp: f64,
    pub air_temp: f64,
    pub humidity: f64,
}

#[derive(Clone, Serialize)]
pub struct HubEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Telemetry,
    Phase,
    Autopilot,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub autopilot_active: bool,
    pub phase: Option<String>,
    pub nodes: HashMap<String, NodeStatus>,
    pub events: Vec<HubEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl HubState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            autopilot_active: false,
            phase: None,
            nodes: HashMap::new(),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    /// Record a telemetry frame from a node (or the HTTP ingest path).
    pub fn record_telemetry(&mut self, node_id: &str, frame: TelemetrySnapshot) {
        let detail = format!(
            "{node_id}: pH={:.2} tds={:.0} water={:.1}°C rh={:.0}%",
            frame.ph, frame.tds, frame.water_temp, frame.humidity
        );

        self.nodes.insert(
            node_id.to_string(),
            NodeStatus {
                last_seen: OffsetDateTime::now_utc(),
                last_frame: frame,
            },
        );

        self.push_event(EventKind::Telemetry, detail);
    }

    /// Record a growth-phase change.
    pub fn record_phase(&mut self, tag: &str) {
        self.phase = Some(tag.to_string());
        self.push_event(EventKind::Phase, format!("phase set to {tag}"));
    }

    /// Record an autopilot toggle.
    pub fn record_autopilot(&mut self, active: bool) {
        self.autopilot_active = active;
        let detail = if active { "autopilot engaged" } else { "autopilot disengaged" };
        self.push_event(EventKind::Autopilot, detail.to_string());
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            autopilot_active: self.autopilot_active,
            phase: self.phase.clone(),
            nodes: self.nodes.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(HubEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
