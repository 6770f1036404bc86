//! Runwarden governor: the stateful services around the core rules.
//!
//! - **PolicyStore** - tenants and their budget policies
//! - **CredentialRegistry** - issuing, verifying and revoking API keys
//! - **RunRegistry** - run lifecycle, progress accounting and budget enforcement
//! - **KillSwitch** - idempotent forced termination
//! - **TimeoutScheduler** - kills runs that outlive their tenant's timeout
//! - **Ingestor** - request log ingestion, optionally driving runs
//! - **Reconciler** - accumulated spend against the request log
//!
//! Every status or flag change goes through `RunTransitions`, which emits the
//! matching alert once, after commit.

pub mod credentials;
mod error;
pub mod guard;
pub mod ingest;
pub mod kill_switch;
pub mod locks;
pub mod policy_store;
pub mod reconcile;
pub mod registry;
pub mod stores;
pub mod timeouts;
pub mod transitions;

use std::sync::Arc;

use chrono::{DateTime, Utc};

use runwarden_core::alerts::AlertSink;
use runwarden_core::config::GovernanceConfig;
use runwarden_core::domain::run::RunId;
use runwarden_core::errors::ApplicationError;
use runwarden_db::DbPool;

pub use credentials::{CredentialRegistry, IssuedCredential};
pub use guard::{BudgetGuard, BudgetReport, RunContext};
pub use ingest::{BatchReport, Ingestor};
pub use kill_switch::KillSwitch;
pub use locks::RunLocks;
pub use policy_store::PolicyStore;
pub use reconcile::{DayReconciliation, Reconciler};
pub use registry::{ProgressReport, RunRegistry, StartRun};
pub use stores::Stores;
pub use timeouts::{TimeoutScheduler, Timers};
pub use transitions::{Applied, RunTransitions};

/// All governance services wired over one set of stores and one alert sink.
#[derive(Clone)]
pub struct Governor {
    pub policies: PolicyStore,
    pub credentials: CredentialRegistry,
    pub runs: RunRegistry,
    pub kill_switch: KillSwitch,
    pub ingest: Ingestor,
    pub reconciler: Reconciler,
    pub timeouts: TimeoutScheduler,
}

impl Governor {
    pub fn new(stores: Stores, alerts: Arc<dyn AlertSink>, governance: &GovernanceConfig) -> Self {
        let locks = RunLocks::default();
        let timers = Timers::default();

        let transitions = RunTransitions::new(stores.runs.clone(), alerts, timers.clone());
        let kill_switch = KillSwitch::new(transitions.clone(), locks.clone());
        let policies = PolicyStore::new(stores.teams.clone(), stores.policies.clone());
        let credentials = CredentialRegistry::new(
            stores.teams.clone(),
            stores.credentials.clone(),
            stores.spend.clone(),
        );
        let guard =
            BudgetGuard::new(policies.clone(), stores.credentials.clone(), stores.spend.clone());
        let timeouts = TimeoutScheduler::new(
            timers,
            kill_switch.clone(),
            stores.teams.clone(),
            stores.runs.clone(),
            governance.enforce_timeouts,
        );
        let runs = RunRegistry::new(
            policies.clone(),
            credentials.clone(),
            stores.runs.clone(),
            guard,
            transitions,
            kill_switch.clone(),
            timeouts.clone(),
            locks,
        );
        let ingest =
            Ingestor::new(stores.request_logs.clone(), runs.clone(), governance.ingest_drives_runs);
        let reconciler = Reconciler::new(stores.spend, stores.request_logs);

        Self { policies, credentials, runs, kill_switch, ingest, reconciler, timeouts }
    }

    pub fn sqlite(pool: DbPool, alerts: Arc<dyn AlertSink>, governance: &GovernanceConfig) -> Self {
        Self::new(Stores::sqlite(pool), alerts, governance)
    }

    /// Re-arms timeouts for runs that survived a restart and kills the ones
    /// already overdue.
    pub async fn resume(&self, now: DateTime<Utc>) -> Result<Vec<RunId>, ApplicationError> {
        self.timeouts.sweep(now).await
    }

    pub fn shutdown(&self) {
        self.timeouts.shutdown();
    }
}
