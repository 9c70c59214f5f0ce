//! Stateful reservoir simulator standing in for the ESP32 field node.
//!
//! Models a recirculating hydroponic reservoir:
//! - Temporal coherence via random walk with mean reversion
//! - Nutrient uptake drift (pH creeps up, TDS bleeds down)
//! - Per-reading probe noise
//! - Occasional spikes (probe flakiness)
//! - Closed-loop dosing response: while autopilot is engaged, pH and TDS
//!   are steered toward the targets received from the hub
//!
//! Dosing here is deliberately naive — no pump interlocks, no minimum dose
//! interval — matching what the real firmware ships.

use std::fmt;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

/// Sample from N(mean, sigma).
fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Pre-configured simulation profiles selectable via `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Hovers near healthy values. Low noise, rare spikes. Good for
    /// exercising the dashboard without alarming drift.
    Stable,
    /// pH creeps up and TDS bleeds down each tick, the way an untended
    /// reservoir actually behaves. Shows autopilot doing real work.
    Drifting,
    /// High noise, ~8% spike rate. Tests the hub's tolerance for garbage
    /// probe readings.
    Flaky,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "stable" => Self::Stable,
            "flaky" => Self::Flaky,
            _ => Self::Drifting, // default
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stable => write!(f, "stable"),
            Self::Drifting => write!(f, "drifting"),
            Self::Flaky => write!(f, "flaky"),
        }
    }
}

// ---------------------------------------------------------------------------
// Targets
// ---------------------------------------------------------------------------

/// Setpoints received from the hub while autopilot is engaged.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Targets {
    pub ph: f64,
    pub tds: f64,
}

// ---------------------------------------------------------------------------
// Main simulator
// ---------------------------------------------------------------------------

/// Evolving "true" reservoir state plus noisy probe sampling.
pub struct ReservoirSim {
    ph: f64,
    tds: f64,
    water_temp: f64,
    air_temp: f64,
    humidity: f64,

    targets: Option<Targets>,

    // Uptake drift per tick
    ph_drift: f64,
    tds_drift: f64,

    // Random walk + probe noise
    walk_sigma: f64,
    probe_sigma_ph: f64,
    probe_sigma_tds: f64,

    // Spikes
    spike_prob: f32,

    // Dosing limits per tick
    max_ph_dose: f64,
    max_tds_dose: f64,
}

impl ReservoirSim {
    pub fn new(scenario: Scenario) -> Self {
        let (ph_drift, tds_drift, walk_sigma, spike_prob) = match scenario {
            Scenario::Stable => (0.0002, -0.05, 0.002, 0.002),
            Scenario::Drifting => (0.002, -0.4, 0.004, 0.01),
            Scenario::Flaky => (0.002, -0.4, 0.012, 0.08),
        };

        Self {
            ph: 6.1,
            tds: 820.0,
            water_temp: 19.5,
            air_temp: 24.0,
            humidity: 60.0,
            targets: None,
            ph_drift,
            tds_drift,
            walk_sigma,
            probe_sigma_ph: 0.02,
            probe_sigma_tds: 4.0,
            spike_prob,
            max_ph_dose: 0.05,
            max_tds_dose: 15.0,
        }
    }

    pub fn engage(&mut self, targets: Targets) {
        self.targets = Some(targets);
    }

    pub fn disengage(&mut self) {
        self.targets = None;
    }

    pub fn engaged(&self) -> bool {
        self.targets.is_some()
    }

    /// Advance the reservoir by one sample interval.
    pub fn tick(&mut self) {
        // Uptake drift + random walk
        self.ph += self.ph_drift + gaussian(0.0, self.walk_sigma);
        self.tds += self.tds_drift + gaussian(0.0, self.walk_sigma * 500.0);

        // Dosing: a proportional nudge toward each target, capped at what
        // one pump pulse could plausibly move per interval.
        if let Some(t) = self.targets {
            let ph_err = t.ph - self.ph;
            self.ph += (ph_err * 0.2).clamp(-self.max_ph_dose, self.max_ph_dose);

            let tds_err = t.tds - self.tds;
            self.tds += (tds_err * 0.2).clamp(-self.max_tds_dose, self.max_tds_dose);
        }

        // Environment mean-reverts around room climate
        self.water_temp += (19.5 - self.water_temp) * 0.05 + gaussian(0.0, 0.02);
        self.air_temp += (24.0 - self.air_temp) * 0.05 + gaussian(0.0, 0.05);
        self.humidity += (60.0 - self.humidity) * 0.05 + gaussian(0.0, 0.2);

        self.ph = self.ph.clamp(0.0, 14.0);
        self.tds = self.tds.max(0.0);
        self.humidity = self.humidity.clamp(0.0, 100.0);
    }

    /// One probe read of the current state: tick-independent electronic
    /// noise, plus the occasional spike on a flaky probe.
    pub fn sample(&self) -> Frame {
        let mut ph = gaussian(self.ph, self.probe_sigma_ph);
        let mut tds = gaussian(self.tds, self.probe_sigma_tds);

        if fastrand::f32() < self.spike_prob {
            // A spike hits one probe, not the whole frame.
            if fastrand::bool() {
                ph += gaussian(0.0, 0.8);
            } else {
                tds += gaussian(0.0, 150.0);
            }
        }

        Frame {
            ph: ph.clamp(0.0, 14.0),
            tds: tds.max(0.0),
            water_temp: gaussian(self.water_temp, 0.05),
            air_temp: gaussian(self.air_temp, 0.1),
            humidity: gaussian(self.humidity, 0.5).clamp(0.0, 100.0),
        }
    }
}

/// One probe read, before the MQTT envelope gets a timestamp.
#[derive(Debug, Clone, Copy)]
pub struct Frame {
    pub ph: f64,
    pub tds: f64,
    pub water_temp: f64,
    pub air_temp: f64,
    pub humidity: f64,
}

// ===========================================================================
// Tests
// ===========================================================================
