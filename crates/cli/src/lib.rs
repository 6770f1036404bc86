pub mod commands;

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use rust_decimal::Decimal;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "runwarden",
    about = "Runwarden operator CLI",
    long_about = "Operate agent-run governance: migrations, config inspection, tenants, budget policies, API keys, run kills and spend reconciliation.",
    after_help = "Examples:\n  runwarden doctor --json\n  runwarden team create --name Research --slug research\n  runwarden run kill 3f2a... --reason \"runaway loop\""
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, alert delivery, and DB connectivity")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(subcommand, about = "Manage tenants")]
    Team(TeamCommand),
    #[command(subcommand, about = "Manage budget policies")]
    Policy(PolicyCommand),
    #[command(subcommand, about = "Issue and rotate API keys")]
    Key(KeyCommand),
    #[command(subcommand, about = "Inspect and kill agent runs")]
    Run(RunCommand),
    #[command(about = "Compare a tenant's accumulated daily spend with the request log")]
    Reconcile {
        #[arg(long)]
        team_id: i64,
        #[arg(long, help = "UTC day as YYYY-MM-DD; defaults to today")]
        day: Option<NaiveDate>,
    },
}

#[derive(Debug, Subcommand)]
enum TeamCommand {
    #[command(about = "Create a tenant")]
    Create(TeamCreateArgs),
}

#[derive(Debug, Args)]
struct TeamCreateArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    slug: String,
    #[arg(long, help = "Daily limit used when no policy sets one")]
    default_daily_budget: Option<Decimal>,
    #[arg(long, help = "Monthly limit used when no policy sets one")]
    default_monthly_budget: Option<Decimal>,
    #[arg(long)]
    max_steps_per_run: Option<u32>,
    #[arg(long, help = "Wall-clock limit for a run, in seconds")]
    timeout_seconds: Option<u32>,
}

#[derive(Debug, Subcommand)]
enum PolicyCommand {
    #[command(about = "Create an active budget policy for a tenant")]
    Create(PolicyCreateArgs),
}

#[derive(Debug, Args)]
struct PolicyCreateArgs {
    #[arg(long)]
    team_id: i64,
    #[arg(long)]
    name: String,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    per_run_limit: Option<Decimal>,
    #[arg(long)]
    daily_limit: Option<Decimal>,
    #[arg(long)]
    monthly_limit: Option<Decimal>,
    #[arg(long, help = "Run cost above which a cost alert is sent")]
    alert_threshold: Option<Decimal>,
    #[arg(long, help = "Flag runs that exceed a limit without killing them")]
    no_auto_kill: bool,
}

#[derive(Debug, Subcommand)]
enum KeyCommand {
    #[command(about = "Issue an API key; the secret is printed once")]
    Issue(KeyIssueArgs),
    #[command(about = "Replace the secret of an existing API key")]
    Regenerate {
        #[arg(long)]
        id: i64,
    },
}

#[derive(Debug, Args)]
struct KeyIssueArgs {
    #[arg(long)]
    team_id: i64,
    #[arg(long)]
    name: String,
    #[arg(long)]
    user_id: Option<i64>,
    #[arg(long, help = "Overrides the tenant daily limit for spend made with this key")]
    daily_budget: Option<Decimal>,
    #[arg(long)]
    max_steps_per_run: Option<u32>,
    #[arg(long = "allow-model", help = "Repeatable; an empty list allows every model")]
    allowed_models: Vec<String>,
    #[arg(long)]
    expires_in_days: Option<u32>,
}

#[derive(Debug, Subcommand)]
enum RunCommand {
    #[command(about = "Kill a running agent run")]
    Kill {
        run_id: String,
        #[arg(long)]
        reason: String,
        #[arg(long)]
        actor: Option<String>,
    },
    #[command(about = "Show a run with its transition history")]
    Show { run_id: String },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
        Command::Team(TeamCommand::Create(args)) => {
            commands::team::create(commands::team::CreateTeam {
                name: args.name,
                slug: args.slug,
                default_daily_budget: args.default_daily_budget,
                default_monthly_budget: args.default_monthly_budget,
                max_steps_per_run: args.max_steps_per_run,
                timeout_seconds: args.timeout_seconds,
            })
        }
        Command::Policy(PolicyCommand::Create(args)) => {
            commands::policy::create(commands::policy::CreatePolicy {
                team_id: args.team_id,
                name: args.name,
                description: args.description,
                per_run_limit: args.per_run_limit,
                daily_limit: args.daily_limit,
                monthly_limit: args.monthly_limit,
                alert_threshold: args.alert_threshold,
                no_auto_kill: args.no_auto_kill,
            })
        }
        Command::Key(KeyCommand::Issue(args)) => commands::key::issue(commands::key::IssueKey {
            team_id: args.team_id,
            name: args.name,
            user_id: args.user_id,
            daily_budget: args.daily_budget,
            max_steps_per_run: args.max_steps_per_run,
            allowed_models: args.allowed_models,
            expires_in_days: args.expires_in_days,
        }),
        Command::Key(KeyCommand::Regenerate { id }) => commands::key::regenerate(id),
        Command::Run(RunCommand::Kill { run_id, reason, actor }) => {
            commands::run::kill(run_id, reason, actor)
        }
        Command::Run(RunCommand::Show { run_id }) => commands::run::show(run_id),
        Command::Reconcile { team_id, day } => commands::reconcile::run(team_id, day),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
