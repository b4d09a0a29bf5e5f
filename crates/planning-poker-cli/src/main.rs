use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use planning_poker_api::{
    CastVoteRequest, PokerApi, VoteStoreConfig, WriteMode, DEFAULT_EXTENSION_ID, DEFAULT_FIELD_KEY,
};
use planning_poker_core::{
    Estimate, EstimateOptions, Participant, ParticipantId, RawEstimateOptions, RecordId,
};
use serde_json::Value;
use tracing::debug;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "pp")]
#[command(about = "Planning poker vote store CLI")]
struct Cli {
    #[arg(long, default_value = "./planning_poker.sqlite3")]
    db: PathBuf,

    #[arg(long, default_value = DEFAULT_EXTENSION_ID)]
    extension_id: String,

    /// Comma separated estimate cards, in rank order.
    #[arg(long, default_value = "0,1,2,3,5,8,13,21")]
    values: String,

    #[arg(long, default_value_t = false)]
    include_unknown: bool,

    #[arg(long, default_value = "optimistic")]
    write_mode: WriteMode,

    #[arg(long, default_value_t = 5)]
    max_write_attempts: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Votes {
        #[command(subcommand)]
        command: VotesCommand,
    },
    Tally(RecordArgs),
    Session(SessionArgs),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
    IntegrityCheck,
    Fields,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum VotesCommand {
    Show(RecordArgs),
    Cast(CastArgs),
    Withdraw(WithdrawArgs),
}

#[derive(Debug, Args)]
struct RecordArgs {
    #[arg(long)]
    record: String,
}

#[derive(Debug, Args)]
struct ParticipantArgs {
    #[arg(long)]
    participant_id: String,
    #[arg(long)]
    name: String,
    #[arg(long, default_value = "")]
    avatar_url: String,
}

impl ParticipantArgs {
    fn to_participant(&self) -> Participant {
        Participant::new(self.participant_id.as_str(), self.name.as_str(), self.avatar_url.as_str())
    }
}

#[derive(Debug, Args)]
struct EstimateArgs {
    #[arg(long, conflicts_with = "unknown", allow_negative_numbers = true)]
    estimate: Option<i64>,
    /// Cast the unknown card instead of a number.
    #[arg(long, default_value_t = false)]
    unknown: bool,
}

impl EstimateArgs {
    fn resolve(&self) -> Result<Option<Estimate>> {
        match (self.estimate, self.unknown) {
            (Some(value), false) => Ok(Some(Estimate::Points(value))),
            (None, true) => Ok(Some(Estimate::Unknown)),
            (None, false) => Ok(None),
            (Some(_), true) => Err(anyhow!("--estimate and --unknown are mutually exclusive")),
        }
    }
}

#[derive(Debug, Args)]
struct CastArgs {
    #[command(flatten)]
    record: RecordArgs,
    #[command(flatten)]
    participant: ParticipantArgs,
    #[command(flatten)]
    estimate: EstimateArgs,
}

#[derive(Debug, Args)]
struct WithdrawArgs {
    #[command(flatten)]
    record: RecordArgs,
    #[arg(long)]
    participant_id: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SessionAction {
    /// Load and show what this participant may see.
    View,
    Submit,
    Reveal,
    Change,
}

#[derive(Debug, Args)]
struct SessionArgs {
    #[command(flatten)]
    record: RecordArgs,
    #[command(flatten)]
    participant: ParticipantArgs,
    #[arg(long, value_enum, default_value_t = SessionAction::View)]
    action: SessionAction,
    #[command(flatten)]
    estimate: EstimateArgs,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn build_api(cli: &Cli) -> Result<PokerApi> {
    let options =
        EstimateOptions::parse(&RawEstimateOptions::from_csv(&cli.values, cli.include_unknown))?;
    let config = VoteStoreConfig {
        extension_id: cli.extension_id.clone(),
        field_key: DEFAULT_FIELD_KEY.to_string(),
        write_mode: cli.write_mode,
        max_write_attempts: cli.max_write_attempts,
    };
    debug!(?options, ?config, "cli configuration parsed");
    Ok(PokerApi::new(cli.db.clone(), options, config))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let api = build_api(&cli)?;
    match cli.command {
        Command::Db { command } => run_db(command, &api),
        Command::Votes { command } => run_votes(command, &api).await,
        Command::Tally(args) => run_tally(&args, &api).await,
        Command::Session(args) => run_session(&args, &api).await,
    }
}

fn run_db(command: DbCommand, api: &PokerApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => emit_json(serde_json::to_value(api.migrate(args.dry_run)?)?),
        DbCommand::Backup(args) => {
            api.backup(&args.out)?;
            emit_json(serde_json::json!({
                "backup_file": args.out.display().to_string()
            }))
        }
        DbCommand::Restore(args) => {
            api.restore(&args.input)?;
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "restored_from": args.input.display().to_string(),
                "schema_version": status.current_version
            }))
        }
        DbCommand::IntegrityCheck => emit_json(serde_json::to_value(api.integrity_check()?)?),
        DbCommand::Fields => emit_json(serde_json::json!({ "fields": api.list_fields()? })),
    }
}

async fn run_votes(command: VotesCommand, api: &PokerApi) -> Result<()> {
    let votes = match command {
        VotesCommand::Show(args) => api.fetch_votes(&RecordId::new(args.record)).await?,
        VotesCommand::Cast(args) => {
            let estimate = args
                .estimate
                .resolve()?
                .ok_or_else(|| anyhow!("votes cast requires --estimate <N> or --unknown"))?;
            let request =
                CastVoteRequest { participant: args.participant.to_participant(), estimate };
            api.cast_vote(&RecordId::new(args.record.record), request).await?
        }
        VotesCommand::Withdraw(args) => {
            api.withdraw_vote(
                &RecordId::new(args.record.record),
                &ParticipantId::new(args.participant_id),
            )
            .await?
        }
    };
    emit_json(serde_json::to_value(&votes)?)
}

async fn run_tally(args: &RecordArgs, api: &PokerApi) -> Result<()> {
    let record_id = RecordId::new(args.record.as_str());
    let report = api.tally(&record_id).await?;
    emit_json(serde_json::json!({
        "record_id": record_id,
        "average_label": report.summary.average_label(),
        "summary": report.summary,
        "rounded_average": report.rounded_average,
        "votes": report.votes
    }))
}

async fn run_session(args: &SessionArgs, api: &PokerApi) -> Result<()> {
    let mut session =
        api.session(RecordId::new(args.record.record.as_str()), args.participant.to_participant());
    session.load().await?;

    match args.action {
        SessionAction::View => {}
        SessionAction::Submit => {
            let estimate = args
                .estimate
                .resolve()?
                .ok_or_else(|| anyhow!("session submit requires --estimate <N> or --unknown"))?;
            session.submit(estimate).await?;
        }
        SessionAction::Reveal => {
            session.reveal_without_voting()?;
        }
        SessionAction::Change => {
            session.change_vote().await?;
        }
    }

    emit_json(serde_json::to_value(session.view())?)
}
