use std::future::Future;
use std::time::Duration;

use runwarden_core::config::{AppConfig, GovernanceConfig, LoadOptions};
use runwarden_db::{connect_with_settings, migrations};
use runwarden_governor::Governor;
use runwarden_slack::build_alert_sink;

use crate::commands::CommandResult;

const ALERT_FLUSH: Duration = Duration::from_secs(5);

/// Runs `action` against a migrated database with a governor whose alerts go
/// to the configured webhook. Timers are never armed from the CLI.
pub(crate) fn with_governor<F, Fut>(command: &str, action: F) -> CommandResult
where
    F: FnOnce(Governor) -> Fut,
    Fut: Future<Output = CommandResult>,
{
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                command,
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            );
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                command,
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                3,
            );
        }
    };

    runtime.block_on(async {
        let pool = match connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        {
            Ok(pool) => pool,
            Err(error) => {
                return CommandResult::failure(command, "db_connectivity", error.to_string(), 4)
            }
        };
        if let Err(error) = migrations::run_pending(&pool).await {
            return CommandResult::failure(command, "migration", error.to_string(), 5);
        }

        let (alerts, worker) = match build_alert_sink(&config.alerts) {
            Ok(built) => built,
            Err(error) => return CommandResult::failure(command, "alerts", error.to_string(), 3),
        };
        let governance = GovernanceConfig {
            ingest_drives_runs: config.governance.ingest_drives_runs,
            enforce_timeouts: false,
        };
        let governor = Governor::sqlite(pool.clone(), alerts, &governance);

        let result = action(governor).await;
        if let Some(worker) = worker {
            worker.shutdown(ALERT_FLUSH).await;
        }
        pool.close().await;
        result
    })
}
