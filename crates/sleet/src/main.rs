//! Sleet CLI: scheduled file-arrival partition loader.

use std::process::ExitCode;

use clap::Parser;
use tracing::info;

use sleet::cli::{self, Cli, Command};
use sleet::{Config, RunState, init_tracing};

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let args = Cli::parse();

    let paths = args.config_args().config_paths();
    if paths.is_empty() {
        eprintln!("Error: no config files or directories specified");
        return ExitCode::FAILURE;
    }

    info!("Loading config from {} source(s)", paths.len());

    let config = match Config::from_paths(&paths) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            return ExitCode::FAILURE;
        }
    };

    match &args.command {
        Command::Serve(_) => serve(&config).await,
        Command::Run(run_args) => match cli::run_once(&config, run_args).await {
            Ok(run) => {
                info!(run_id = %run.id, state = %run.state, outcome = ?run.outcome, "Run finished");
                if run.state == RunState::Succeeded {
                    ExitCode::SUCCESS
                } else {
                    ExitCode::FAILURE
                }
            }
            Err(e) => {
                eprintln!("Run failed: {e}");
                ExitCode::FAILURE
            }
        },
        Command::Status(status) => match cli::status(&config, status).await {
            Ok(Some(run)) => match serde_json::to_string_pretty(&run) {
                Ok(json) => {
                    println!("{json}");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("Failed to encode run: {e}");
                    ExitCode::FAILURE
                }
            },
            Ok(None) => {
                eprintln!("No run recorded for pipeline '{}'", status.pipeline);
                ExitCode::FAILURE
            }
            Err(e) => {
                eprintln!("Status failed: {e}");
                ExitCode::FAILURE
            }
        },
    }
}

async fn serve(config: &Config) -> ExitCode {
    info!(
        "Starting sleet with {} pipeline(s)",
        config.pipeline_count()
    );
    for (key, pipeline) in &config.pipelines {
        info!(
            "  Pipeline: {} ({}/{} -> {})",
            key, pipeline.raw_namespace, pipeline.raw_prefix, pipeline.target_table.name
        );
    }

    match cli::serve(config).await {
        Ok(results) => {
            let failed = results.iter().filter(|(_, r)| r.is_err()).count();
            if failed == 0 {
                ExitCode::SUCCESS
            } else {
                eprintln!("{failed} pipeline(s) failed");
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            eprintln!("Pipeline setup failed: {e}");
            ExitCode::FAILURE
        }
    }
}
