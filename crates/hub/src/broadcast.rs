//! Outbound event fan-out. The controller pushes typed events into a
//! `tokio::sync::broadcast` channel; the MQTT bridge (and any test) drains a
//! subscription. Delivery is fire-and-forget, at-most-once: with no listener
//! connected the event is simply dropped, and field hardware reconciles by
//! re-reading state after it reconnects — the hub never retries.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::phase::Setpoint;

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// The settings block pushed to field hardware. Targets are present only
/// when engaging; a disengage carries just the flag.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandSettings {
    pub autopilot: bool,
    #[serde(rename = "targetPH", skip_serializing_if = "Option::is_none")]
    pub target_ph: Option<f64>,
    #[serde(rename = "targetTDS", skip_serializing_if = "Option::is_none")]
    pub target_tds: Option<f64>,
}

impl CommandSettings {
    pub fn engage(setpoint: Setpoint) -> Self {
        Self {
            autopilot: true,
            target_ph: Some(setpoint.ph),
            target_tds: Some(setpoint.tds),
        }
    }

    pub fn disengage() -> Self {
        Self {
            autopilot: false,
            target_ph: None,
            target_tds: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutboundEvent {
    /// Published on `esp32/command`; consumed by field hardware.
    HardwareCommand(CommandSettings),
    /// Published on `autopilot/status`; consumed by UI clients.
    AutopilotStatus { active: bool },
}

// ---------------------------------------------------------------------------
// Broadcaster
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<OutboundEvent>,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OutboundEvent> {
        self.tx.subscribe()
    }

    /// Fire-and-forget. A send with no subscribers is not an error.
    pub fn send(&self, event: OutboundEvent) {
        let _ = self.tx.send(event);
    }
}

// ===========================================================================
// Tests
// ===========================================================================
