//! Growth-phase catalogue: the closed set of cultivation phases and the
//! target environmental ranges for each.
//!
//! The table is built once at startup (compiled-in defaults, optionally
//! overridden from config.toml) and never mutated afterwards, so any number
//! of tasks may read it without synchronisation.

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Phases
// ---------------------------------------------------------------------------

/// One stage of the cultivation lifecycle. Wire tags (what the API accepts
/// and what parameter snapshots carry) are the SCREAMING_SNAKE forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GrowthPhase {
    Germination,
    Seedling,
    Vegetative,
    EarlyFlower,
    LateFlower,
    Flush,
}

impl GrowthPhase {
    pub const ALL: [GrowthPhase; 6] = [
        GrowthPhase::Germination,
        GrowthPhase::Seedling,
        GrowthPhase::Vegetative,
        GrowthPhase::EarlyFlower,
        GrowthPhase::LateFlower,
        GrowthPhase::Flush,
    ];

    /// Parse a wire tag. `None` for anything outside the closed set — the
    /// caller decides how to report that; nothing here mutates state.
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "GERMINATION" => Some(Self::Germination),
            "SEEDLING" => Some(Self::Seedling),
            "VEGETATIVE" => Some(Self::Vegetative),
            "EARLY_FLOWER" => Some(Self::EarlyFlower),
            "LATE_FLOWER" => Some(Self::LateFlower),
            "FLUSH" => Some(Self::Flush),
            _ => None,
        }
    }

    pub fn as_tag(self) -> &'static str {
        match self {
            Self::Germination => "GERMINATION",
            Self::Seedling => "SEEDLING",
            Self::Vegetative => "VEGETATIVE",
            Self::EarlyFlower => "EARLY_FLOWER",
            Self::LateFlower => "LATE_FLOWER",
            Self::Flush => "FLUSH",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for GrowthPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

// ---------------------------------------------------------------------------
// Target ranges
// ---------------------------------------------------------------------------

/// Target environmental ranges for one phase. `min <= max` for every bounded
/// pair; config validation enforces this before the table is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseParameters {
    pub ph_min: f64,
    pub ph_max: f64,
    /// ppm
    pub tds_min: i64,
    pub tds_max: i64,
    /// °C
    pub water_temp_min: f64,
    pub water_temp_max: f64,
    /// relative humidity, %
    pub humidity_min: f64,
    pub humidity_max: f64,
    /// hours on / hours off, e.g. "18/6"
    pub light_cycle: String,
}

/// The single target value per controlled quantity that field hardware
/// steers toward: the midpoint of each range, no rounding. Unit conversion,
/// if any, is the hardware's problem.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Setpoint {
    pub ph: f64,
    pub tds: f64,
}

impl Setpoint {
    pub fn derive(params: &PhaseParameters) -> Self {
        Self {
            ph: (params.ph_min + params.ph_max) / 2.0,
            tds: (params.tds_min + params.tds_max) as f64 / 2.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

/// Immutable mapping from phase to target ranges.
pub struct PhaseTable {
    entries: [PhaseParameters; 6],
}

impl PhaseTable {
    /// The stock grow recipe.
    pub fn defaults() -> Self {
        fn entry(
            ph: (f64, f64),
            tds: (i64, i64),
            water: (f64, f64),
            humidity: (f64, f64),
            light: &str,
        ) -> PhaseParameters {
            PhaseParameters {
                ph_min: ph.0,
                ph_max: ph.1,
                tds_min: tds.0,
                tds_max: tds.1,
                water_temp_min: water.0,
                water_temp_max: water.1,
                humidity_min: humidity.0,
                humidity_max: humidity.1,
                light_cycle: light.to_string(),
            }
        }

        Self {
            entries: [
                // Germination
                entry((5.8, 6.2), (0, 150), (20.0, 22.0), (70.0, 85.0), "18/6"),
                // Seedling
                entry((5.8, 6.2), (0, 400), (19.0, 22.0), (65.0, 80.0), "18/6"),
                // Vegetative
                entry((5.6, 6.2), (500, 900), (18.0, 22.0), (55.0, 70.0), "18/6"),
                // Early flower
                entry((5.8, 6.3), (900, 1100), (18.0, 21.0), (45.0, 55.0), "12/12"),
                // Late flower
                entry((6.0, 6.5), (1100, 1300), (18.0, 20.0), (40.0, 45.0), "12/12"),
                // Pre-harvest flush
                entry((6.0, 6.3), (0, 200), (18.0, 20.0), (40.0, 45.0), "12/12"),
            ],
        }
    }

    /// Target ranges for a phase. Total over the enum — tag validation
    /// happens where strings enter the system, not here.
    pub fn lookup(&self, phase: GrowthPhase) -> &PhaseParameters {
        &self.entries[phase.index()]
    }

    /// Replace one phase's ranges (startup config overrides only).
    pub fn set(&mut self, phase: GrowthPhase, params: PhaseParameters) {
        self.entries[phase.index()] = params;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
