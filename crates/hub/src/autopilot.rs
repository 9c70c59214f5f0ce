//! Autopilot controller: the single write path for growth-cycle state.
//!
//! Two modes (autopilot off/on) orthogonal to the six growth phases. Every
//! mutation of the current cycle, the phase-occupancy ledger, and the audit
//! log goes through here; a write lock serializes the newest-cycle
//! read-modify-write so concurrent requests cannot produce a second open
//! history interval or a lost update.
//!
//! ```text
//! AUTOPILOT_OFF ──[start, credential ok, cycle exists]──▶ AUTOPILOT_ON
//!       ▲                                                     │
//!       └───────────────[stop, credential ok]─────────────────┘
//! ```
//!
//! While AUTOPILOT_ON, every phase change re-derives the setpoint from the
//! new parameter snapshot and pushes it to field hardware.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::auth::Authorizer;
use crate::broadcast::{Broadcaster, CommandSettings, OutboundEvent};
use crate::db::{now_unix, Db, GrowthCycleRow};
use crate::phase::{GrowthPhase, PhaseTable, Setpoint};
use crate::state::SharedState;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ControlError {
    /// Tag outside the closed phase set. Nothing was written.
    #[error("unknown growth phase '{0}'")]
    InvalidPhase(String),
    /// Credential mismatch or missing operator account — indistinguishable.
    #[error("invalid operator credential")]
    Unauthorized,
    /// Autopilot needs a cycle to act on and none has been created yet.
    #[error("no active growth cycle")]
    NoActiveCycle,
    /// Storage failure; the whole operation rolled back.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct Autopilot {
    db: Db,
    phases: Arc<PhaseTable>,
    auth: Authorizer,
    events: Broadcaster,
    shared: SharedState,
    /// Serializes every newest-cycle read-modify-write. The "exactly one
    /// open history row" invariant depends on this.
    write_lock: Mutex<()>,
}

impl Autopilot {
    pub fn new(
        db: Db,
        phases: Arc<PhaseTable>,
        auth: Authorizer,
        events: Broadcaster,
        shared: SharedState,
    ) -> Self {
        Self {
            db,
            phases,
            auth,
            events,
            shared,
            write_lock: Mutex::new(()),
        }
    }

    /// Move the current cycle to `tag`, creating the cycle on first use.
    /// Closes the open phase interval, opens a new one, appends the audit
    /// entry — one transaction. If autopilot is engaged, the new setpoint
    /// goes out to hardware immediately, no separate toggle required.
    pub async fn set_phase(&self, tag: &str) -> Result<GrowthCycleRow, ControlError> {
        let phase = GrowthPhase::parse(tag)
            .ok_or_else(|| ControlError::InvalidPhase(tag.to_string()))?;
        let params = self.phases.lookup(phase);
        let snapshot = serde_json::to_string(params)
            .map_err(|e| ControlError::Internal(e.into()))?;
        let message = format!("Growth phase changed to {phase}");

        let _guard = self.write_lock.lock().await;
        let cycle = self
            .db
            .set_phase_tx(phase.as_tag(), &snapshot, &message, now_unix())
            .await?;

        if cycle.autopilot_active {
            let setpoint = Setpoint::derive(params);
            self.events
                .send(OutboundEvent::HardwareCommand(CommandSettings::engage(setpoint)));
            info!(
                phase = %phase,
                target_ph = setpoint.ph,
                target_tds = setpoint.tds,
                "setpoint pushed for new phase"
            );
        }

        {
            let mut st = self.shared.write().await;
            st.record_phase(phase.as_tag());
        }
        info!(phase = %phase, cycle_id = cycle.id, "growth phase changed");
        Ok(cycle)
    }

    /// Engage autopilot on the current cycle and push the setpoint derived
    /// from the cycle's stored parameter snapshot.
    pub async fn start(&self, password: &str) -> Result<(), ControlError> {
        self.authorize(password).await?;

        let _guard = self.write_lock.lock().await;
        let cycle = self
            .db
            .set_autopilot_tx(true, "INFO", "Autopilot activated by user", now_unix())
            .await?
            .ok_or(ControlError::NoActiveCycle)?;

        // The snapshot, not a fresh table lookup: an operator-retuned table
        // at next boot must not silently retarget a running cycle.
        let params = cycle.snapshot()?;
        let setpoint = Setpoint::derive(&params);

        self.events
            .send(OutboundEvent::HardwareCommand(CommandSettings::engage(setpoint)));
        self.events.send(OutboundEvent::AutopilotStatus { active: true });

        {
            let mut st = self.shared.write().await;
            st.record_autopilot(true);
        }
        info!(
            cycle_id = cycle.id,
            phase = %cycle.phase,
            target_ph = setpoint.ph,
            target_tds = setpoint.tds,
            "autopilot engaged"
        );
        Ok(())
    }

    /// Disengage autopilot on the current cycle.
    pub async fn stop(&self, password: &str) -> Result<(), ControlError> {
        self.authorize(password).await?;

        let _guard = self.write_lock.lock().await;
        let cycle = self
            .db
            .set_autopilot_tx(false, "WARNING", "Autopilot deactivated by user", now_unix())
            .await?
            .ok_or(ControlError::NoActiveCycle)?;

        self.events
            .send(OutboundEvent::HardwareCommand(CommandSettings::disengage()));
        self.events.send(OutboundEvent::AutopilotStatus { active: false });

        {
            let mut st = self.shared.write().await;
            st.record_autopilot(false);
        }
        warn!(cycle_id = cycle.id, "autopilot disengaged by operator");
        Ok(())
    }

    async fn authorize(&self, password: &str) -> Result<(), ControlError> {
        match self.auth.verify(password).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(ControlError::Unauthorized),
            Err(e) => {
                error!("credential check failed: {e:#}");
                Err(ControlError::Internal(e))
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::HubState;
    use tokio::sync::broadcast::error::TryRecvError;
    use tokio::sync::RwLock;

    const PASSWORD: &str = "duffy";

    /// Full controller over an in-memory store with the operator seeded.
    async fn test_controller() -> (Arc<Autopilot>, Broadcaster, Db) {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();

        let hash = bcrypt::hash(PASSWORD, 4).unwrap();
        db.upsert_user("jack", &hash, "admin").await.unwrap();

        let events = Broadcaster::new(16);
        let shared: SharedState = Arc::new(RwLock::new(HubState::new()));
        let controller = Autopilot::new(
            db.clone(),
            Arc::new(PhaseTable::defaults()),
            Authorizer::new(db.clone(), "jack"),
            events.clone(),
            Arc::clone(&shared),
        );
        (Arc::new(controller), events, db)
    }

    fn expect_engage(event: OutboundEvent, ph: f64, tds: f64) {
        match event {
            OutboundEvent::HardwareCommand(settings) => {
                assert!(settings.autopilot);
                assert_eq!(settings.target_ph, Some(ph));
                assert_eq!(settings.target_tds, Some(tds));
            }
            other => panic!("expected hardware command, got {other:?}"),
        }
    }

    // -- set_phase ----------------------------------------------------------

    #[tokio::test]
    async fn set_phase_creates_cycle_with_autopilot_off() {
        let (ctl, events, _db) = test_controller().await;
        let mut rx = events.subscribe();

        let cycle = ctl.set_phase("VEGETATIVE").await.unwrap();
        assert_eq!(cycle.phase, "VEGETATIVE");
        assert!(!cycle.autopilot_active);

        // autopilot off: nothing goes to hardware
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn set_phase_invalid_tag_mutates_nothing() {
        let (ctl, events, db) = test_controller().await;
        let mut rx = events.subscribe();

        let err = ctl.set_phase("RIPENING").await.unwrap_err();
        assert!(matches!(err, ControlError::InvalidPhase(_)));

        assert!(db.current_cycle().await.unwrap().is_none());
        assert!(db.phase_history().await.unwrap().is_empty());
        assert!(db.recent_logs(10).await.unwrap().is_empty());
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn set_phase_snapshots_table_parameters() {
        let (ctl, _events, _db) = test_controller().await;
        let cycle = ctl.set_phase("LATE_FLOWER").await.unwrap();
        let params = cycle.snapshot().unwrap();
        assert_eq!(params.ph_min, 6.0);
        assert_eq!(params.tds_max, 1300);
    }

    #[tokio::test]
    async fn repeated_set_phase_keeps_one_open_interval() {
        let (ctl, _events, db) = test_controller().await;
        ctl.set_phase("GERMINATION").await.unwrap();
        ctl.set_phase("SEEDLING").await.unwrap();
        ctl.set_phase("SEEDLING").await.unwrap(); // same phase, history still rolls

        let history = db.phase_history().await.unwrap();
        assert_eq!(history.len(), 3);
        let open: Vec<_> = history.iter().filter(|h| h.end_date.is_none()).collect();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].phase, "SEEDLING");
    }

    // -- start --------------------------------------------------------------

    #[tokio::test]
    async fn start_without_cycle_is_rejected_without_broadcast() {
        let (ctl, events, _db) = test_controller().await;
        let mut rx = events.subscribe();

        let err = ctl.start(PASSWORD).await.unwrap_err();
        assert!(matches!(err, ControlError::NoActiveCycle));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn start_with_wrong_password_leaves_flag_untouched() {
        let (ctl, events, db) = test_controller().await;
        ctl.set_phase("VEGETATIVE").await.unwrap();
        let mut rx = events.subscribe();

        let err = ctl.start("daffy").await.unwrap_err();
        assert!(matches!(err, ControlError::Unauthorized));

        let cycle = db.current_cycle().await.unwrap().unwrap();
        assert!(!cycle.autopilot_active);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn start_broadcasts_midpoint_setpoints() {
        // Vegetative defaults: pH 5.6–6.2, TDS 500–900 → 5.9 / 700
        let (ctl, events, db) = test_controller().await;
        ctl.set_phase("VEGETATIVE").await.unwrap();
        let mut rx = events.subscribe();

        ctl.start(PASSWORD).await.unwrap();

        expect_engage(rx.recv().await.unwrap(), 5.9, 700.0);
        assert_eq!(
            rx.recv().await.unwrap(),
            OutboundEvent::AutopilotStatus { active: true }
        );

        let cycle = db.current_cycle().await.unwrap().unwrap();
        assert!(cycle.autopilot_active);
    }

    #[tokio::test]
    async fn start_logs_info_audit_entry() {
        let (ctl, _events, db) = test_controller().await;
        ctl.set_phase("VEGETATIVE").await.unwrap();
        ctl.start(PASSWORD).await.unwrap();

        let logs = db.recent_logs(5).await.unwrap();
        assert_eq!(logs[0].level, "INFO");
        assert_eq!(logs[0].message, "Autopilot activated by user");
    }

    // -- stop ---------------------------------------------------------------

    #[tokio::test]
    async fn stop_broadcasts_disengage_and_status() {
        let (ctl, events, db) = test_controller().await;
        ctl.set_phase("VEGETATIVE").await.unwrap();
        ctl.start(PASSWORD).await.unwrap();
        let mut rx = events.subscribe();

        ctl.stop(PASSWORD).await.unwrap();

        match rx.recv().await.unwrap() {
            OutboundEvent::HardwareCommand(settings) => {
                assert!(!settings.autopilot);
                assert!(settings.target_ph.is_none());
                assert!(settings.target_tds.is_none());
            }
            other => panic!("expected hardware command, got {other:?}"),
        }
        assert_eq!(
            rx.recv().await.unwrap(),
            OutboundEvent::AutopilotStatus { active: false }
        );

        let cycle = db.current_cycle().await.unwrap().unwrap();
        assert!(!cycle.autopilot_active);

        let logs = db.recent_logs(5).await.unwrap();
        assert_eq!(logs[0].level, "WARNING");
        assert_eq!(logs[0].message, "Autopilot deactivated by user");
    }

    #[tokio::test]
    async fn stop_requires_credential_and_cycle_too() {
        let (ctl, _events, _db) = test_controller().await;
        assert!(matches!(
            ctl.stop("daffy").await.unwrap_err(),
            ControlError::Unauthorized
        ));
        assert!(matches!(
            ctl.stop(PASSWORD).await.unwrap_err(),
            ControlError::NoActiveCycle
        ));
    }

    // -- phase change with autopilot engaged --------------------------------

    #[tokio::test]
    async fn phase_change_while_engaged_pushes_new_setpoint() {
        let (ctl, events, _db) = test_controller().await;
        ctl.set_phase("EARLY_FLOWER").await.unwrap();
        ctl.start(PASSWORD).await.unwrap();
        let mut rx = events.subscribe();

        // Late flower defaults: pH 6.0–6.5, TDS 1100–1300 → 6.25 / 1200
        ctl.set_phase("LATE_FLOWER").await.unwrap();

        expect_engage(rx.recv().await.unwrap(), 6.25, 1200.0);
        // no status toggle rides along with a phase change
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn phase_change_while_disengaged_stays_silent() {
        let (ctl, events, _db) = test_controller().await;
        ctl.set_phase("EARLY_FLOWER").await.unwrap();
        let mut rx = events.subscribe();

        ctl.set_phase("LATE_FLOWER").await.unwrap();
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    // -- end-to-end scenario ------------------------------------------------

    #[tokio::test]
    async fn fresh_store_vegetative_then_start_scenario() {
        let (ctl, events, db) = test_controller().await;

        let cycle = ctl.set_phase("VEGETATIVE").await.unwrap();
        assert!(!cycle.autopilot_active);

        let mut rx = events.subscribe();
        ctl.start(PASSWORD).await.unwrap();
        expect_engage(rx.recv().await.unwrap(), 5.9, 700.0);

        let open: Vec<_> = db
            .phase_history()
            .await
            .unwrap()
            .into_iter()
            .filter(|h| h.end_date.is_none())
            .collect();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].phase, "VEGETATIVE");
    }

    // -- concurrency --------------------------------------------------------

    #[tokio::test]
    async fn concurrent_phase_changes_keep_history_consistent() {
        let (ctl, _events, db) = test_controller().await;

        let mut handles = Vec::new();
        for i in 0..8 {
            let ctl = Arc::clone(&ctl);
            let tag = if i % 2 == 0 { "VEGETATIVE" } else { "EARLY_FLOWER" };
            handles.push(tokio::spawn(async move { ctl.set_phase(tag).await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let history = db.phase_history().await.unwrap();
        assert_eq!(history.len(), 8);
        let open: Vec<_> = history.iter().filter(|h| h.end_date.is_none()).collect();
        assert_eq!(open.len(), 1, "exactly one open interval after racing writers");

        // single cycle row, matching the last interval opened
        let cycle = db.current_cycle().await.unwrap().unwrap();
        assert_eq!(cycle.phase, open[0].phase);
    }
}
