use rumqttc::{AsyncClient, QoS};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

use crate::broadcast::{CommandSettings, OutboundEvent};

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

/// Setpoint / autopilot commands for field hardware.
pub(crate) const TOPIC_COMMAND: &str = "esp32/command";
/// Autopilot on/off notifications for UI clients.
pub(crate) const TOPIC_AUTOPILOT_STATUS: &str = "autopilot/status";

/// Extract node_id from "esp32/<node_id>/data".
pub(crate) fn extract_data_node(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == "esp32" && parts[2] == "data" {
        Some(parts[1])
    } else {
        None
    }
}

/// Extract node_id from "esp32/<node_id>/log".
pub(crate) fn extract_log_node(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == "esp32" && parts[2] == "log" {
        Some(parts[1])
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Inbound payloads
// ---------------------------------------------------------------------------

/// One telemetry frame as published by a field node.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TelemetryMsg {
    pub(crate) ts: i64,
    pub(crate) ph: f64,
    pub(crate) tds: f64,
    pub(crate) water_temp: f64,
    pub(crate) air_temp: f64,
    pub(crate) humidity: f64,
}

/// A log line forwarded by a field node into the audit ledger.
#[derive(Debug, Deserialize)]
pub(crate) struct NodeLogMsg {
    #[serde(default = "default_log_level")]
    pub(crate) level: String,
    pub(crate) message: String,
    #[serde(default = "default_log_source")]
    pub(crate) source: String,
}

fn default_log_level() -> String {
    "INFO".to_string()
}

fn default_log_source() -> String {
    "esp32".to_string()
}

// ---------------------------------------------------------------------------
// Outbound mapping + bridge
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct CommandEnvelope<'a> {
    settings: &'a CommandSettings,
}

#[derive(Serialize)]
struct StatusEnvelope {
    active: bool,
}

/// Map a typed event to its broker topic and JSON payload.
pub(crate) fn outbound(event: &OutboundEvent) -> (&'static str, Vec<u8>) {
    match event {
        OutboundEvent::HardwareCommand(settings) => (
            TOPIC_COMMAND,
            serde_json::to_vec(&CommandEnvelope { settings }).unwrap_or_default(),
        ),
        OutboundEvent::AutopilotStatus { active } => (
            TOPIC_AUTOPILOT_STATUS,
            serde_json::to_vec(&StatusEnvelope { active: *active }).unwrap_or_default(),
        ),
    }
}

/// Drain the outbound event channel into the broker. QoS 0: at-most-once,
/// no ack, no retry — a disconnected listener misses the command and is
/// expected to resync after reconnecting.
pub(crate) async fn bridge_outbound(
    mut rx: broadcast::Receiver<OutboundEvent>,
    client: AsyncClient,
) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                let (topic, payload) = outbound(&event);
                if let Err(e) = client.publish(topic, QoS::AtMostOnce, false, payload).await {
                    warn!(topic, "outbound publish failed: {e}");
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "outbound bridge lagged, events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
