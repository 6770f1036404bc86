use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use runwarden_core::config::{AppConfig, LoadOptions};
use secrecy::ExposeSecret;
use toml::Value;

/// One effective setting and the environment variables that can set it.
struct Setting {
    key: &'static str,
    value: String,
    env_keys: &'static [&'static str],
}

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for setting in settings(&config) {
        let source = field_source(
            setting.key,
            setting.env_keys,
            config_file_doc.as_ref(),
            config_file_path.as_deref(),
        );
        lines.push(format!("- {} = {} (source: {source})", setting.key, setting.value));
    }
    lines.join("\n")
}

fn settings(config: &AppConfig) -> Vec<Setting> {
    let webhook = match &config.alerts.webhook_url {
        Some(url) => redact_url(url.expose_secret()),
        None => "<unset>".to_string(),
    };

    vec![
        Setting {
            key: "database.url",
            value: config.database.url.clone(),
            env_keys: &["RUNWARDEN_DATABASE_URL"],
        },
        Setting {
            key: "database.max_connections",
            value: config.database.max_connections.to_string(),
            env_keys: &["RUNWARDEN_DATABASE_MAX_CONNECTIONS"],
        },
        Setting {
            key: "database.timeout_secs",
            value: config.database.timeout_secs.to_string(),
            env_keys: &["RUNWARDEN_DATABASE_TIMEOUT_SECS"],
        },
        Setting {
            key: "server.bind_address",
            value: config.server.bind_address.clone(),
            env_keys: &["RUNWARDEN_SERVER_BIND_ADDRESS"],
        },
        Setting {
            key: "server.port",
            value: config.server.port.to_string(),
            env_keys: &["RUNWARDEN_SERVER_PORT"],
        },
        Setting {
            key: "server.graceful_shutdown_secs",
            value: config.server.graceful_shutdown_secs.to_string(),
            env_keys: &["RUNWARDEN_SERVER_GRACEFUL_SHUTDOWN_SECS"],
        },
        Setting {
            key: "ingest.internal_secret",
            value: redact_secret(config.ingest.internal_secret.expose_secret()),
            env_keys: &["RUNWARDEN_INGEST_INTERNAL_SECRET", "RUNWARDEN_INTERNAL_SECRET"],
        },
        Setting {
            key: "alerts.enabled",
            value: config.alerts.enabled.to_string(),
            env_keys: &["RUNWARDEN_ALERTS_ENABLED"],
        },
        Setting {
            key: "alerts.webhook_url",
            value: webhook,
            env_keys: &["RUNWARDEN_ALERTS_WEBHOOK_URL", "RUNWARDEN_SLACK_WEBHOOK_URL"],
        },
        Setting {
            key: "alerts.timeout_secs",
            value: config.alerts.timeout_secs.to_string(),
            env_keys: &["RUNWARDEN_ALERTS_TIMEOUT_SECS"],
        },
        Setting {
            key: "alerts.queue_capacity",
            value: config.alerts.queue_capacity.to_string(),
            env_keys: &["RUNWARDEN_ALERTS_QUEUE_CAPACITY"],
        },
        Setting {
            key: "governance.ingest_drives_runs",
            value: config.governance.ingest_drives_runs.to_string(),
            env_keys: &["RUNWARDEN_GOVERNANCE_INGEST_DRIVES_RUNS"],
        },
        Setting {
            key: "governance.enforce_timeouts",
            value: config.governance.enforce_timeouts.to_string(),
            env_keys: &["RUNWARDEN_GOVERNANCE_ENFORCE_TIMEOUTS"],
        },
        Setting {
            key: "logging.level",
            value: config.logging.level.clone(),
            env_keys: &["RUNWARDEN_LOGGING_LEVEL", "RUNWARDEN_LOG_LEVEL"],
        },
        Setting {
            key: "logging.format",
            value: format!("{:?}", config.logging.format),
            env_keys: &["RUNWARDEN_LOGGING_FORMAT", "RUNWARDEN_LOG_FORMAT"],
        },
    ]
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("runwarden.toml"), PathBuf::from("config/runwarden.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn redact_secret(secret: &str) -> String {
    if secret.trim().is_empty() {
        "<empty>".to_string()
    } else {
        format!("<redacted {} chars>", secret.chars().count())
    }
}

/// Keeps the scheme and host; webhook paths carry the credential.
fn redact_url(url: &str) -> String {
    let trimmed = url.trim();
    match trimmed.split_once("://") {
        Some((scheme, rest)) => {
            let host = rest.split('/').next().unwrap_or_default();
            format!("{scheme}://{host}/***")
        }
        None if trimmed.is_empty() => "<empty>".to_string(),
        None => "<redacted>".to_string(),
    }
}
