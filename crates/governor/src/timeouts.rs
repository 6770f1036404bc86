//! Scheduled cancellation for runs that outlive their tenant's timeout.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use runwarden_core::domain::run::{AgentRun, RunId};
use runwarden_core::errors::ApplicationError;
use runwarden_core::lifecycle::KillReason;
use runwarden_db::repositories::{RunRepository, TeamRepository};

use crate::error::persistence;
use crate::kill_switch::KillSwitch;

pub const TIMEOUT_ACTOR: &str = "timeout-scheduler";
pub const TIMEOUT_DETAIL: &str = "timeout";

/// Pending timeout tasks keyed by run.
#[derive(Clone, Default)]
pub struct Timers {
    pending: Arc<Mutex<HashMap<RunId, JoinHandle<()>>>>,
}

impl Timers {
    fn pending(&self) -> MutexGuard<'_, HashMap<RunId, JoinHandle<()>>> {
        match self.pending.lock() {
            Ok(pending) => pending,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Cancels the run's timer, if any.
    pub fn disarm(&self, run_id: &RunId) {
        if let Some(handle) = self.pending().remove(run_id) {
            handle.abort();
        }
    }

    /// Drops the entry without cancelling the task; used by a timer that is
    /// already firing.
    fn release(&self, run_id: &RunId) {
        self.pending().remove(run_id);
    }

    pub fn armed(&self) -> usize {
        self.pending().len()
    }

    pub fn disarm_all(&self) {
        for (_, handle) in self.pending().drain() {
            handle.abort();
        }
    }
}

#[derive(Clone)]
pub struct TimeoutScheduler {
    timers: Timers,
    kill_switch: KillSwitch,
    teams: Arc<dyn TeamRepository>,
    runs: Arc<dyn RunRepository>,
    enabled: bool,
}

impl TimeoutScheduler {
    pub fn new(
        timers: Timers,
        kill_switch: KillSwitch,
        teams: Arc<dyn TeamRepository>,
        runs: Arc<dyn RunRepository>,
        enabled: bool,
    ) -> Self {
        Self { timers, kill_switch, teams, runs, enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn armed(&self) -> usize {
        self.timers.armed()
    }

    /// Schedules a `policy:timeout` kill at `deadline`. A deadline in the past
    /// fires immediately.
    pub fn arm(&self, run_id: &RunId, deadline: DateTime<Utc>) {
        if !self.enabled {
            return;
        }
        let delay = (deadline - Utc::now()).to_std().unwrap_or_default();
        let timers = self.timers.clone();
        let kill_switch = self.kill_switch.clone();
        let task_run_id = run_id.clone();

        // Registered under the lock so a timer that fires at once cannot
        // release its entry before the entry exists.
        let mut pending = self.timers.pending();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            timers.release(&task_run_id);
            fire(&kill_switch, &task_run_id).await;
        });
        if let Some(previous) = pending.insert(run_id.clone(), handle) {
            previous.abort();
        }
    }

    pub fn disarm(&self, run_id: &RunId) {
        self.timers.disarm(run_id);
    }

    /// Boot-time pass over running runs: kills those already past their
    /// deadline and arms timers for the rest. Returns the runs killed.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<Vec<RunId>, ApplicationError> {
        if !self.enabled {
            return Ok(Vec::new());
        }

        let running = self.runs.list_running().await.map_err(persistence)?;
        let mut killed = Vec::new();
        for run in running {
            let Some(deadline) = self.deadline(&run).await? else {
                continue;
            };
            if deadline <= now {
                if fire(&self.kill_switch, &run.run_id).await {
                    killed.push(run.run_id);
                }
            } else {
                self.arm(&run.run_id, deadline);
            }
        }

        info!(
            event_name = "governance.timeouts.swept",
            killed = killed.len(),
            armed = self.timers.armed(),
            "run timeout sweep finished"
        );
        Ok(killed)
    }

    pub fn shutdown(&self) {
        self.timers.disarm_all();
    }

    async fn deadline(&self, run: &AgentRun) -> Result<Option<DateTime<Utc>>, ApplicationError> {
        let team = self.teams.find_by_id(run.team_id).await.map_err(persistence)?;
        Ok(team.map(|team| run.started_at + team.run_timeout()))
    }
}

/// Returns whether this call moved the run to `killed`.
async fn fire(kill_switch: &KillSwitch, run_id: &RunId) -> bool {
    let correlation_id = format!("timeout-{}", Uuid::new_v4().simple());
    let reason = match KillReason::policy(TIMEOUT_DETAIL) {
        Ok(reason) => reason,
        Err(error) => {
            error!(event_name = "governance.timeouts.failed", run_id = %run_id, error = %error, "invalid timeout reason");
            return false;
        }
    };

    match kill_switch.kill(run_id, reason, TIMEOUT_ACTOR, &correlation_id).await {
        Ok(applied) => {
            if applied.changed {
                warn!(
                    event_name = "governance.run.timed_out",
                    run_id = %run_id,
                    correlation_id = %correlation_id,
                    "run killed after exceeding its timeout"
                );
            }
            applied.changed
        }
        Err(error) => {
            error!(
                event_name = "governance.timeouts.failed",
                run_id = %run_id,
                error = %error,
                "timeout kill failed"
            );
            false
        }
    }
}
