//! Telemetry ingestion: appends request logs and, when enabled, feeds each
//! record that names a running run into that run's progress.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use runwarden_core::domain::request_log::{NewRequestLog, RequestLog, TelemetryRecord};
use runwarden_core::domain::run::{RunFlag, RunProgress};
use runwarden_core::errors::{ApplicationError, DomainError};
use runwarden_db::repositories::{RepositoryError, RequestLogRepository};

use crate::error::persistence;
use crate::registry::RunRegistry;

pub const INGEST_ACTOR: &str = "ingest";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub inserted: usize,
    pub skipped: usize,
}

#[derive(Clone)]
pub struct Ingestor {
    request_logs: Arc<dyn RequestLogRepository>,
    runs: RunRegistry,
    drives_runs: bool,
}

impl Ingestor {
    pub fn new(request_logs: Arc<dyn RequestLogRepository>, runs: RunRegistry, drives_runs: bool) -> Self {
        Self { request_logs, runs, drives_runs }
    }

    pub async fn ingest_one(
        &self,
        record: TelemetryRecord,
        correlation_id: &str,
    ) -> Result<RequestLog, ApplicationError> {
        let entry = record.validate()?;
        let stored = self.request_logs.insert(entry, Utc::now()).await.map_err(|error| match error {
            RepositoryError::Conflict(_) => {
                ApplicationError::Domain(DomainError::MalformedTelemetry(
                    "request_id has already been ingested".to_owned(),
                ))
            }
            other => persistence(other),
        })?;

        debug!(
            event_name = "ingest.record.stored",
            id = stored.id,
            request_id = %stored.entry.request_id,
            correlation_id,
            "request log stored"
        );

        if self.drives_runs {
            self.drive_run(&stored.entry, correlation_id).await;
        }
        Ok(stored)
    }

    /// Stores every well-formed record; malformed or rejected ones are
    /// counted as skipped and never fail the batch.
    pub async fn ingest_batch(&self, records: Vec<Value>, correlation_id: &str) -> BatchReport {
        let mut report = BatchReport::default();
        for (index, raw) in records.into_iter().enumerate() {
            let outcome = match serde_json::from_value::<TelemetryRecord>(raw) {
                Ok(record) => self.ingest_one(record, correlation_id).await.map(|_| ()),
                Err(error) => Err(DomainError::MalformedTelemetry(error.to_string()).into()),
            };
            match outcome {
                Ok(()) => report.inserted += 1,
                Err(error) => {
                    report.skipped += 1;
                    warn!(
                        event_name = "ingest.record.skipped",
                        index,
                        error = %error,
                        correlation_id,
                        "telemetry record skipped"
                    );
                }
            }
        }

        info!(
            event_name = "ingest.batch.finished",
            inserted = report.inserted,
            skipped = report.skipped,
            correlation_id,
            "telemetry batch ingested"
        );
        report
    }

    /// A record for a run that is unknown or no longer running only lands in
    /// the request log.
    async fn drive_run(&self, entry: &NewRequestLog, correlation_id: &str) {
        let Some(run_id) = entry.run_id.as_ref() else {
            return;
        };
        let progress = RunProgress::single_call(entry.total_tokens, entry.cost_usd, entry.latency_ms);
        let report = match self.runs.record_progress(run_id, progress, correlation_id).await {
            Ok(report) => report,
            Err(ApplicationError::Domain(
                error @ (DomainError::RunNotActive { .. } | DomainError::NotFound { .. }),
            )) => {
                debug!(
                    event_name = "ingest.run.ignored",
                    run_id = %run_id,
                    reason = %error,
                    correlation_id,
                    "telemetry names no running run"
                );
                return;
            }
            Err(error) => {
                warn!(
                    event_name = "ingest.run.failed",
                    run_id = %run_id,
                    error = %error,
                    correlation_id,
                    "failed to apply telemetry to run"
                );
                return;
            }
        };

        if entry.loop_detected && report.run.is_running() {
            if let Err(error) = self
                .runs
                .raise_flag(run_id, RunFlag::LoopDetected, INGEST_ACTOR, correlation_id)
                .await
            {
                warn!(
                    event_name = "ingest.run.failed",
                    run_id = %run_id,
                    error = %error,
                    correlation_id,
                    "failed to flag loop from telemetry"
                );
            }
        }
    }
}
