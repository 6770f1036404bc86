use chrono::Utc;
use runwarden_core::config::{AppConfig, ConfigError, LoadOptions};
use runwarden_core::errors::ApplicationError;
use runwarden_db::{connect_with_settings, migrations, DbPool};
use runwarden_governor::Governor;
use runwarden_slack::{build_alert_sink, DeliveryError, DispatcherWorker};
use thiserror::Error;
use tracing::info;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub governor: Governor,
    pub alert_worker: Option<DispatcherWorker>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("alert dispatcher could not be built: {0}")]
    Alerts(#[source] DeliveryError),
    #[error("run timeout sweep failed: {0}")]
    Resume(#[source] ApplicationError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let (alerts, alert_worker) = build_alert_sink(&config.alerts).map_err(BootstrapError::Alerts)?;
    let governor = Governor::sqlite(db_pool.clone(), alerts, &config.governance);

    let killed = governor.resume(Utc::now()).await.map_err(BootstrapError::Resume)?;
    info!(
        event_name = "system.bootstrap.runs_resumed",
        correlation_id = "bootstrap",
        overdue_killed = killed.len(),
        timers_armed = governor.timeouts.armed(),
        "running runs resumed"
    );

    Ok(Application { config, db_pool, governor, alert_worker })
}

#[cfg(test)]
mod tests {
    use runwarden_core::config::{ConfigOverrides, LoadOptions};

    use crate::bootstrap::bootstrap;

    fn overrides(database_url: &str, secret: &str) -> LoadOptions {
        LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some(database_url.to_string()),
                internal_secret: Some(secret.to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        }
    }

    #[tokio::test]
    async fn bootstrap_fails_fast_without_an_internal_secret() {
        let result = bootstrap(overrides("sqlite::memory:", "short")).await;

        let message = result.err().expect("error").to_string();
        assert!(message.contains("ingest.internal_secret"));
    }

    #[tokio::test]
    async fn bootstrap_migrates_and_wires_the_governor() {
        let app = bootstrap(overrides("sqlite::memory:", "0123456789abcdef"))
            .await
            .expect("bootstrap should succeed with valid overrides");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master \
             WHERE type = 'table' AND name IN ('team', 'api_key', 'budget_policy', 'agent_run', 'request_log')",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("table count");
        assert_eq!(table_count, 5, "bootstrap should expose the governance tables");
        assert!(app.alert_worker.is_none(), "alerts are disabled by default");

        app.governor.shutdown();
        app.db_pool.close().await;
    }
}
