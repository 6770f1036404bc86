use chrono::Utc;
use runwarden_core::domain::run::RunId;
use runwarden_core::lifecycle::KillReason;
use serde_json::json;

use crate::commands::session::with_governor;
use crate::commands::CommandResult;

pub const CLI_ACTOR: &str = "cli";

/// Kills a run. Killing a run that already finished reports it unchanged.
pub fn kill(run_id: String, reason: String, actor: Option<String>) -> CommandResult {
    with_governor("run kill", |governor| async move {
        let reason = match KillReason::from_operator_input(&reason) {
            Ok(reason) => reason,
            Err(error) => return CommandResult::from_application("run kill", error.into()),
        };
        let actor = actor.unwrap_or_else(|| CLI_ACTOR.to_string());
        let correlation_id = format!("cli-{}", uuid::Uuid::new_v4().simple());

        match governor.runs.kill(&RunId(run_id), reason, &actor, &correlation_id).await {
            Ok(applied) => {
                let message = if applied.changed {
                    format!("run {} killed", applied.run.run_id)
                } else {
                    format!("run {} was already {}", applied.run.run_id, applied.run.status.as_str())
                };
                CommandResult::success_with(
                    "run kill",
                    message,
                    &json!({"changed": applied.changed, "run": applied.run}),
                )
            }
            Err(error) => CommandResult::from_application("run kill", error),
        }
    })
}

pub fn show(run_id: String) -> CommandResult {
    with_governor("run show", |governor| async move {
        let run_id = RunId(run_id);
        let run = match governor.runs.find(&run_id).await {
            Ok(run) => run,
            Err(error) => return CommandResult::from_application("run show", error),
        };
        let transitions = match governor.runs.transitions(&run_id).await {
            Ok(transitions) => transitions,
            Err(error) => return CommandResult::from_application("run show", error),
        };
        let duration_seconds = run.duration(Utc::now()).num_seconds().max(0);

        CommandResult::success_with(
            "run show",
            format!("run {} is {}", run.run_id, run.status.as_str()),
            &json!({"run": run, "duration_seconds": duration_seconds, "transitions": transitions}),
        )
    })
}
