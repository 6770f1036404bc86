use runwarden_core::domain::team::NewTeam;
use rust_decimal::Decimal;

use crate::commands::session::with_governor;
use crate::commands::CommandResult;

#[derive(Clone, Debug, Default)]
pub struct CreateTeam {
    pub name: String,
    pub slug: String,
    pub default_daily_budget: Option<Decimal>,
    pub default_monthly_budget: Option<Decimal>,
    pub max_steps_per_run: Option<u32>,
    pub timeout_seconds: Option<u32>,
}

pub fn create(args: CreateTeam) -> CommandResult {
    with_governor("team create", |governor| async move {
        let mut team = NewTeam::new(args.name, args.slug);
        team.default_daily_budget = args.default_daily_budget;
        team.default_monthly_budget = args.default_monthly_budget;
        if let Some(max_steps) = args.max_steps_per_run {
            team.max_steps_per_run = max_steps;
        }
        if let Some(timeout) = args.timeout_seconds {
            team.timeout_seconds = timeout;
        }

        match governor.policies.create_team(team).await {
            Ok(team) => CommandResult::success_with(
                "team create",
                format!("created team `{}` with id {}", team.slug, team.id),
                &team,
            ),
            Err(error) => CommandResult::from_application("team create", error),
        }
    })
}
