use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MIN_INTERNAL_SECRET_LEN: usize = 16;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub ingest: IngestConfig,
    pub alerts: AlertsConfig,
    pub governance: GovernanceConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct IngestConfig {
    pub internal_secret: SecretString,
}

#[derive(Clone, Debug)]
pub struct AlertsConfig {
    pub enabled: bool,
    pub webhook_url: Option<SecretString>,
    pub timeout_secs: u64,
    pub queue_capacity: usize,
}

impl AlertsConfig {
    /// Delivery only happens when alerts are enabled and a webhook is set.
    pub fn is_deliverable(&self) -> bool {
        self.enabled
            && self.webhook_url.as_ref().is_some_and(|url| !url.expose_secret().trim().is_empty())
    }
}

#[derive(Clone, Debug)]
pub struct GovernanceConfig {
    pub ingest_drives_runs: bool,
    pub enforce_timeouts: bool,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub server_port: Option<u16>,
    pub internal_secret: Option<String>,
    pub alerts_enabled: Option<bool>,
    pub alerts_webhook_url: Option<String>,
    pub enforce_timeouts: Option<bool>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://runwarden.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            ingest: IngestConfig { internal_secret: String::new().into() },
            alerts: AlertsConfig {
                enabled: false,
                webhook_url: None,
                timeout_secs: 5,
                queue_capacity: 256,
            },
            governance: GovernanceConfig { ingest_drives_runs: true, enforce_timeouts: true },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("runwarden.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(ingest) = patch.ingest {
            if let Some(internal_secret_value) = ingest.internal_secret {
                self.ingest.internal_secret = secret_value(internal_secret_value);
            }
        }

        if let Some(alerts) = patch.alerts {
            if let Some(enabled) = alerts.enabled {
                self.alerts.enabled = enabled;
            }
            if let Some(webhook_url) = alerts.webhook_url {
                self.alerts.webhook_url = Some(secret_value(webhook_url));
            }
            if let Some(timeout_secs) = alerts.timeout_secs {
                self.alerts.timeout_secs = timeout_secs;
            }
            if let Some(queue_capacity) = alerts.queue_capacity {
                self.alerts.queue_capacity = queue_capacity;
            }
        }

        if let Some(governance) = patch.governance {
            if let Some(ingest_drives_runs) = governance.ingest_drives_runs {
                self.governance.ingest_drives_runs = ingest_drives_runs;
            }
            if let Some(enforce_timeouts) = governance.enforce_timeouts {
                self.governance.enforce_timeouts = enforce_timeouts;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("RUNWARDEN_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("RUNWARDEN_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("RUNWARDEN_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("RUNWARDEN_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("RUNWARDEN_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("RUNWARDEN_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("RUNWARDEN_SERVER_PORT") {
            self.server.port = parse_u16("RUNWARDEN_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("RUNWARDEN_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("RUNWARDEN_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        let internal_secret = read_env("RUNWARDEN_INGEST_INTERNAL_SECRET")
            .or_else(|| read_env("RUNWARDEN_INTERNAL_SECRET"));
        if let Some(value) = internal_secret {
            self.ingest.internal_secret = secret_value(value);
        }

        if let Some(value) = read_env("RUNWARDEN_ALERTS_ENABLED") {
            self.alerts.enabled = parse_bool("RUNWARDEN_ALERTS_ENABLED", &value)?;
        }
        let webhook_url = read_env("RUNWARDEN_ALERTS_WEBHOOK_URL")
            .or_else(|| read_env("RUNWARDEN_SLACK_WEBHOOK_URL"));
        if let Some(value) = webhook_url {
            self.alerts.webhook_url = Some(secret_value(value));
        }
        if let Some(value) = read_env("RUNWARDEN_ALERTS_TIMEOUT_SECS") {
            self.alerts.timeout_secs = parse_u64("RUNWARDEN_ALERTS_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("RUNWARDEN_ALERTS_QUEUE_CAPACITY") {
            self.alerts.queue_capacity =
                parse_usize("RUNWARDEN_ALERTS_QUEUE_CAPACITY", &value)?;
        }

        if let Some(value) = read_env("RUNWARDEN_GOVERNANCE_INGEST_DRIVES_RUNS") {
            self.governance.ingest_drives_runs =
                parse_bool("RUNWARDEN_GOVERNANCE_INGEST_DRIVES_RUNS", &value)?;
        }
        if let Some(value) = read_env("RUNWARDEN_GOVERNANCE_ENFORCE_TIMEOUTS") {
            self.governance.enforce_timeouts =
                parse_bool("RUNWARDEN_GOVERNANCE_ENFORCE_TIMEOUTS", &value)?;
        }

        let log_level =
            read_env("RUNWARDEN_LOGGING_LEVEL").or_else(|| read_env("RUNWARDEN_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("RUNWARDEN_LOGGING_FORMAT").or_else(|| read_env("RUNWARDEN_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(port) = overrides.server_port {
            self.server.port = port;
        }
        if let Some(internal_secret) = overrides.internal_secret {
            self.ingest.internal_secret = secret_value(internal_secret);
        }
        if let Some(enabled) = overrides.alerts_enabled {
            self.alerts.enabled = enabled;
        }
        if let Some(webhook_url) = overrides.alerts_webhook_url {
            self.alerts.webhook_url = Some(secret_value(webhook_url));
        }
        if let Some(enforce_timeouts) = overrides.enforce_timeouts {
            self.governance.enforce_timeouts = enforce_timeouts;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_server(&self.server)?;
        validate_ingest(&self.ingest)?;
        validate_alerts(&self.alerts)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("runwarden.toml"), PathBuf::from("config/runwarden.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_ingest(ingest: &IngestConfig) -> Result<(), ConfigError> {
    let secret = ingest.internal_secret.expose_secret();
    if secret.trim().is_empty() {
        return Err(ConfigError::Validation(
            "ingest.internal_secret is required. Set RUNWARDEN_INGEST_INTERNAL_SECRET to the value the proxy sends in X-Internal-Secret".to_string(),
        ));
    }
    if secret.chars().count() < MIN_INTERNAL_SECRET_LEN {
        return Err(ConfigError::Validation(format!(
            "ingest.internal_secret must be at least {MIN_INTERNAL_SECRET_LEN} characters"
        )));
    }
    Ok(())
}

fn validate_alerts(alerts: &AlertsConfig) -> Result<(), ConfigError> {
    if let Some(url) = &alerts.webhook_url {
        let url = url.expose_secret().trim();
        if !url.is_empty() && !url.starts_with("https://") && !url.starts_with("http://") {
            return Err(ConfigError::Validation(
                "alerts.webhook_url must start with https:// or http://".to_string(),
            ));
        }
    }

    if alerts.timeout_secs == 0 || alerts.timeout_secs > 60 {
        return Err(ConfigError::Validation(
            "alerts.timeout_secs must be in range 1..=60".to_string(),
        ));
    }

    if alerts.queue_capacity == 0 {
        return Err(ConfigError::Validation(
            "alerts.queue_capacity must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn invalid_override(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() }
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| invalid_override(key, value))
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| invalid_override(key, value))
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| invalid_override(key, value))
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.parse::<usize>().map_err(|_| invalid_override(key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse::<bool>().map_err(|_| invalid_override(key, value))
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    server: Option<ServerPatch>,
    ingest: Option<IngestPatch>,
    alerts: Option<AlertsPatch>,
    governance: Option<GovernancePatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct IngestPatch {
    internal_secret: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AlertsPatch {
    enabled: Option<bool>,
    webhook_url: Option<String>,
    timeout_secs: Option<u64>,
    queue_capacity: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct GovernancePatch {
    ingest_drives_runs: Option<bool>,
    enforce_timeouts: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    const SECRET: &str = "proxy-shared-secret-0001";

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_RUNWARDEN_SECRET", SECRET);
        env::set_var("TEST_RUNWARDEN_WEBHOOK", "https://hooks.slack.com/services/T/B/X");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("runwarden.toml");
            fs::write(
                &path,
                r#"
[ingest]
internal_secret = "${TEST_RUNWARDEN_SECRET}"

[alerts]
enabled = true
webhook_url = "${TEST_RUNWARDEN_WEBHOOK}"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.ingest.internal_secret.expose_secret() == SECRET,
                "internal secret should be interpolated from environment",
            )?;
            ensure(config.alerts.is_deliverable(), "alerts should be deliverable")?;
            Ok(())
        })();

        clear_vars(&["TEST_RUNWARDEN_SECRET", "TEST_RUNWARDEN_WEBHOOK"]);
        result
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("RUNWARDEN_INTERNAL_SECRET", SECRET);
        env::set_var("RUNWARDEN_LOG_LEVEL", "warn");
        env::set_var("RUNWARDEN_LOG_FORMAT", "json");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warn level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Json),
                "json logging format should be set from env var",
            )?;
            Ok(())
        })();

        clear_vars(&["RUNWARDEN_INTERNAL_SECRET", "RUNWARDEN_LOG_LEVEL", "RUNWARDEN_LOG_FORMAT"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("RUNWARDEN_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("RUNWARDEN_INGEST_INTERNAL_SECRET", "secret-from-env-000001");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("runwarden.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[ingest]
internal_secret = "secret-from-file-000001"

[server]
port = 9090

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(config.server.port == 9090, "file port should win over default")?;
            ensure(
                config.ingest.internal_secret.expose_secret() == "secret-from-env-000001",
                "env secret should win over file and defaults",
            )?;
            Ok(())
        })();

        clear_vars(&["RUNWARDEN_DATABASE_URL", "RUNWARDEN_INGEST_INTERNAL_SECRET"]);
        result
    }

    #[test]
    fn missing_internal_secret_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let error = match AppConfig::load(LoadOptions::default()) {
            Ok(_) => {
                return Err("expected validation failure but config load succeeded".to_string())
            }
            Err(error) => error,
        };
        let has_message = matches!(
            error,
            ConfigError::Validation(ref message) if message.contains("ingest.internal_secret")
        );
        ensure(has_message, "validation failure should mention ingest.internal_secret")
    }

    #[test]
    fn short_internal_secret_is_rejected() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let result = AppConfig::load(LoadOptions {
            overrides: ConfigOverrides {
                internal_secret: Some("short".to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        });
        ensure(
            matches!(result, Err(ConfigError::Validation(ref message)) if message.contains("at least")),
            "short secret should fail validation",
        )
    }

    #[test]
    fn invalid_webhook_scheme_is_rejected() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let result = AppConfig::load(LoadOptions {
            overrides: ConfigOverrides {
                internal_secret: Some(SECRET.to_string()),
                alerts_enabled: Some(true),
                alerts_webhook_url: Some("ftp://example.com/hook".to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        });
        ensure(
            matches!(result, Err(ConfigError::Validation(ref message)) if message.contains("alerts.webhook_url")),
            "non-http webhook should fail validation",
        )
    }

    #[test]
    fn enabled_alerts_without_webhook_are_not_deliverable() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let config = AppConfig::load(LoadOptions {
            overrides: ConfigOverrides {
                internal_secret: Some(SECRET.to_string()),
                alerts_enabled: Some(true),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .map_err(|err| format!("config load failed: {err}"))?;

        ensure(!config.alerts.is_deliverable(), "missing webhook means no delivery")
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let config = AppConfig::load(LoadOptions {
            overrides: ConfigOverrides {
                internal_secret: Some("super-secret-internal-value".to_string()),
                alerts_webhook_url: Some("https://hooks.slack.com/services/SECRETPATH".to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .map_err(|err| format!("config load failed: {err}"))?;
        let debug = format!("{config:?}");

        ensure(
            !debug.contains("super-secret-internal-value"),
            "debug output should not contain internal secret",
        )?;
        ensure(!debug.contains("SECRETPATH"), "debug output should not contain webhook url")?;
        ensure(
            matches!(config.logging.format, LogFormat::Compact),
            "default logging format should be compact",
        )
    }
}
