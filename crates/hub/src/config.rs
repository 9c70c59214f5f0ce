//! TOML config file loading, validation, and startup seeding: the operator
//! account and optional per-phase overrides of the grow recipe.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;

use crate::db::Db;
use crate::phase::{GrowthPhase, PhaseParameters, PhaseTable};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    pub operator: OperatorEntry,
    /// Keyed by wire tag, e.g. `[phases.VEGETATIVE]`.
    #[serde(default)]
    pub phases: HashMap<String, PhaseEntry>,
}

#[derive(Debug, Deserialize)]
pub struct OperatorEntry {
    pub username: String,
    /// bcrypt, as produced by `htpasswd -bnBC 12 "" <password>`.
    pub password_hash: String,
}

#[derive(Debug, Deserialize)]
pub struct PhaseEntry {
    pub ph_min: f64,
    pub ph_max: f64,
    pub tds_min: i64,
    pub tds_max: i64,
    pub water_temp_min: f64,
    pub water_temp_max: f64,
    pub humidity_min: f64,
    pub humidity_max: f64,
    pub light_cycle: String,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_operator(&mut errors);
        self.validate_phases(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_operator(&self, errors: &mut Vec<String>) {
        if self.operator.username.trim().is_empty() {
            errors.push("operator: username is empty".to_string());
        }
        if self.operator.password_hash.trim().is_empty() {
            errors.push("operator: password_hash is empty".to_string());
        } else if !self.operator.password_hash.starts_with("$2") {
            errors.push("operator: password_hash is not a bcrypt hash".to_string());
        }
    }

    fn validate_phases(&self, errors: &mut Vec<String>) {
        for (tag, p) in &self.phases {
            let ctx = || format!("phase '{tag}'");

            // ── Tag must be in the closed set ────────────────────
            if GrowthPhase::parse(tag).is_none() {
                errors.push(format!("{}: unknown growth phase tag", ctx()));
            }

            // ── pH bounds ────────────────────────────────────────
            for (name, v) in [("ph_min", p.ph_min), ("ph_max", p.ph_max)] {
                if !(0.0..=14.0).contains(&v) {
                    errors.push(format!("{}: {name} {v} out of range [0, 14]", ctx()));
                }
            }
            if p.ph_min > p.ph_max {
                errors.push(format!(
                    "{}: ph_min ({}) exceeds ph_max ({})",
                    ctx(),
                    p.ph_min,
                    p.ph_max
                ));
            }

            // ── TDS bounds ───────────────────────────────────────
            if p.tds_min < 0 {
                errors.push(format!("{}: tds_min must not be negative, got {}", ctx(), p.tds_min));
            }
            if p.tds_min > p.tds_max {
                errors.push(format!(
                    "{}: tds_min ({}) exceeds tds_max ({})",
                    ctx(),
                    p.tds_min,
                    p.tds_max
                ));
            }

            // ── Water temperature ────────────────────────────────
            for (name, v) in [
                ("water_temp_min", p.water_temp_min),
                ("water_temp_max", p.water_temp_max),
            ] {
                if !(0.0..=40.0).contains(&v) {
                    errors.push(format!("{}: {name} {v} out of range [0, 40]", ctx()));
                }
            }
            if p.water_temp_min > p.water_temp_max {
                errors.push(format!(
                    "{}: water_temp_min ({}) exceeds water_temp_max ({})",
                    ctx(),
                    p.water_temp_min,
                    p.water_temp_max
                ));
            }

            // ── Humidity ─────────────────────────────────────────
            for (name, v) in [("humidity_min", p.humidity_min), ("humidity_max", p.humidity_max)] {
                if !(0.0..=100.0).contains(&v) {
                    errors.push(format!("{}: {name} {v} out of range [0, 100]", ctx()));
                }
            }
            if p.humidity_min > p.humidity_max {
                errors.push(format!(
                    "{}: humidity_min ({}) exceeds humidity_max ({})",
                    ctx(),
                    p.humidity_min,
                    p.humidity_max
                ));
            }

            // ── Light cycle: "on/off" hours summing to 24 ────────
            if !light_cycle_is_valid(&p.light_cycle) {
                errors.push(format!(
                    "{}: light_cycle '{}' must be on/off hours summing to 24 (e.g. \"18/6\")",
                    ctx(),
                    p.light_cycle
                ));
            }
        }
    }

    /// Stock recipe with this config's overrides applied. Call after
    /// `validate` — an invalid entry must never reach the table.
    pub fn build_table(&self) -> PhaseTable {
        let mut table = PhaseTable::defaults();
        for (tag, p) in &self.phases {
            if let Some(phase) = GrowthPhase::parse(tag) {
                table.set(
                    phase,
                    PhaseParameters {
                        ph_min: p.ph_min,
                        ph_max: p.ph_max,
                        tds_min: p.tds_min,
                        tds_max: p.tds_max,
                        water_temp_min: p.water_temp_min,
                        water_temp_max: p.water_temp_max,
                        humidity_min: p.humidity_min,
                        humidity_max: p.humidity_max,
                        light_cycle: p.light_cycle.clone(),
                    },
                );
            }
        }
        table
    }
}

fn light_cycle_is_valid(s: &str) -> bool {
    let Some((on, off)) = s.split_once('/') else {
        return false;
    };
    match (on.parse::<u8>(), off.parse::<u8>()) {
        (Ok(on), Ok(off)) => u32::from(on) + u32::from(off) == 24,
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Seed the operator account from the config into the database.
pub async fn apply(config: &Config, db: &Db) -> Result<()> {
    db.upsert_user(&config.operator.username, &config.operator.password_hash, "admin")
        .await
        .with_context(|| format!("failed to seed operator '{}'", config.operator.username))?;

    tracing::info!(
        operator = %config.operator.username,
        phase_overrides = config.phases.len(),
        "config applied"
    );

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
