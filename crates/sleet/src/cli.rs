//! Command line interface and the handlers behind each subcommand.

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use sleet_core::config::ConfigArgs;
use sleet_core::signal::spawn_shutdown_handler;
use sleet_core::topology::PipelineResults;
use sleet_core::{PipelineContext, run_pipelines};
use snafu::ResultExt;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::error::{PipelineError, SetupSnafu};
use crate::run::{Run, RunStore, run_id};
use crate::scheduler::{Registration, ScheduledPipeline, Scheduler, parse_logical_time};

#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run every configured pipeline on its schedule until shutdown
    Serve(ServeArgs),
    /// Execute or resume a single run, then exit
    Run(RunArgs),
    /// Print the recorded state of a run as JSON
    Status(StatusArgs),
}

impl Cli {
    pub fn config_args(&self) -> &ConfigArgs {
        match &self.command {
            Command::Serve(args) => &args.config,
            Command::Run(args) => &args.config,
            Command::Status(args) => &args.config,
        }
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    #[command(flatten)]
    pub config: ConfigArgs,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// Pipeline name as it appears in the config
    #[arg(short, long)]
    pub pipeline: String,

    /// Logical time of the run (RFC 3339 or YYYY-MM-DD); defaults to the
    /// latest ended schedule slot
    #[arg(short = 't', long)]
    pub logical_time: Option<String>,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// Pipeline name as it appears in the config
    #[arg(short, long)]
    pub pipeline: String,

    /// Logical time of the run (RFC 3339 or YYYY-MM-DD); defaults to the
    /// most recent recorded run
    #[arg(short = 't', long)]
    pub logical_time: Option<String>,
}

impl RunArgs {
    /// The requested logical time, or the latest slot that has ended by `now`.
    ///
    /// An explicit request may precede the schedule's start date.
    pub fn resolve_logical_time(
        &self,
        registration: &Registration,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, PipelineError> {
        match &self.logical_time {
            Some(value) => parse_logical_time(value),
            None => Ok(registration.latest_slot(now).unwrap_or_else(|| {
                registration.interval.floor(now) - registration.interval.length()
            })),
        }
    }
}

/// Schedule every pipeline and run until all of them stop.
pub async fn serve(
    config: &Config,
) -> Result<PipelineResults<ScheduledPipeline>, PipelineError> {
    let scheduler = Scheduler::from_config(config)?;
    info!("Registered {} pipeline schedule(s)", scheduler.len());

    run_pipelines(&config.metrics, &config.global, "pipeline", |context| {
        ScheduledPipeline::from_config(config, &scheduler, context)
    })
    .await
    .context(SetupSnafu)
}

/// Execute or resume the run selected by `args`.
///
/// A shutdown signal cancels the run between or inside steps; it resumes
/// from the interrupted step on the next invocation.
pub async fn run_once(config: &Config, args: &RunArgs) -> Result<Run, PipelineError> {
    let (key, pipeline) = config.pipeline(&args.pipeline)?;
    let mut scheduler = Scheduler::new();
    let registration = scheduler.register(key.clone(), &pipeline.schedule)?;
    let logical_time = args.resolve_logical_time(registration, Utc::now())?;

    let shutdown = CancellationToken::new();
    spawn_shutdown_handler(shutdown.clone());
    let context = PipelineContext::from_global(&config.global, shutdown);

    let coordinator = Coordinator::build(key.clone(), pipeline.clone(), &context).await?;
    info!(target = %key, logical_time = %logical_time, "Executing run");
    Ok(coordinator.execute(logical_time).await?)
}

/// The recorded run selected by `args`, if one exists.
pub async fn status(config: &Config, args: &StatusArgs) -> Result<Option<Run>, PipelineError> {
    let (key, pipeline) = config.pipeline(&args.pipeline)?;
    let runs = RunStore::open(&pipeline.state_uri, None, pipeline.storage_options.clone())
        .await?
        .with_call_timeout(pipeline.remote_call_timeout());

    let run = match &args.logical_time {
        Some(value) => {
            let logical_time = parse_logical_time(value)?;
            runs.load(key.id(), &run_id(key.id(), logical_time)).await?
        }
        None => runs.latest(key.id()).await?,
    };
    Ok(run)
}
