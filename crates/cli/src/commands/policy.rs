use runwarden_core::domain::policy::NewBudgetPolicy;
use runwarden_core::domain::team::TeamId;
use rust_decimal::Decimal;

use crate::commands::session::with_governor;
use crate::commands::CommandResult;

#[derive(Clone, Debug, Default)]
pub struct CreatePolicy {
    pub team_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub per_run_limit: Option<Decimal>,
    pub daily_limit: Option<Decimal>,
    pub monthly_limit: Option<Decimal>,
    pub alert_threshold: Option<Decimal>,
    pub no_auto_kill: bool,
}

pub fn create(args: CreatePolicy) -> CommandResult {
    with_governor("policy create", |governor| async move {
        let mut policy = NewBudgetPolicy::new(TeamId(args.team_id), args.name);
        policy.description = args.description;
        policy.per_run_limit = args.per_run_limit;
        policy.daily_limit = args.daily_limit;
        policy.monthly_limit = args.monthly_limit;
        policy.alert_threshold = args.alert_threshold;
        policy.auto_kill_enabled = !args.no_auto_kill;

        match governor.policies.create_policy(policy).await {
            Ok(policy) => CommandResult::success_with(
                "policy create",
                format!("created policy {} for team {}", policy.id, policy.team_id),
                &policy,
            ),
            Err(error) => CommandResult::from_application("policy create", error),
        }
    })
}
