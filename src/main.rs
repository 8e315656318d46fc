//! churnwatch CLI.
//!
//! Usage:
//!   churnwatch members [all|at-risk|critical] [limit]
//!   churnwatch stats
//!   churnwatch analytics
//!   churnwatch outreach [limit]
//!   churnwatch watch
//!
//! Config is read from `CHURNWATCH_CONFIG` or `~/.churnwatch/config.json`.
//! Results are printed as JSON; failures print an error payload and exit 1.

use std::process::ExitCode;
use std::sync::Arc;

use serde::Serialize;

use churnwatch_lib::scheduler::Scheduler;
use churnwatch_lib::services;
use churnwatch_lib::state::{load_config, EngineState};
use churnwatch_lib::{EngineError, ErrorPayload, MemberFilter};

const USAGE: &str = "usage: churnwatch <members [all|at-risk|critical] [limit] | stats | analytics | outreach [limit] | watch>";

fn print_json<T: Serialize>(value: &T) -> Result<(), EngineError> {
    let out = serde_json::to_string_pretty(value)
        .map_err(|e| EngineError::InvalidRequest(format!("Failed to serialize result: {}", e)))?;
    println!("{}", out);
    Ok(())
}

fn parse_limit(arg: Option<&String>) -> Result<Option<usize>, EngineError> {
    arg.map(|s| {
        s.parse::<usize>()
            .map_err(|_| EngineError::InvalidRequest(format!("Invalid limit: {}", s)))
    })
    .transpose()
}

async fn execute(args: &[String]) -> Result<(), EngineError> {
    let command = args
        .first()
        .ok_or_else(|| EngineError::InvalidRequest(USAGE.to_string()))?;

    let config = load_config()?;
    let state = Arc::new(EngineState::from_config(config)?);

    match command.as_str() {
        "members" => {
            let filter = match args.get(1) {
                Some(f) => f.parse::<MemberFilter>()?,
                None => MemberFilter::All,
            };
            let limit = parse_limit(args.get(2))?;
            print_json(&services::list_members(&state, filter, limit).await?)
        }
        "stats" => print_json(&*services::get_stats(&state).await?),
        "analytics" => print_json(&*services::get_analytics_snapshot(&state).await?),
        "outreach" => {
            let limit = parse_limit(args.get(1))?;
            print_json(&services::outreach_today(&state, limit).await?)
        }
        "watch" => {
            let record = services::refresh(&state).await?;
            print_json(&record)?;
            let Some(scheduler) = Scheduler::new(state.clone()) else {
                return Ok(());
            };
            let handle = scheduler.spawn();
            tokio::signal::ctrl_c()
                .await
                .map_err(|e| EngineError::Configuration(format!("Failed to wait for Ctrl-C: {}", e)))?;
            log::info!("Shutting down");
            handle.abort();
            Ok(())
        }
        other => Err(EngineError::InvalidRequest(format!(
            "Unknown command: {}. {}",
            other, USAGE
        ))),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match execute(&args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            let payload = ErrorPayload::from(&e);
            match serde_json::to_string_pretty(&payload) {
                Ok(json) => eprintln!("{}", json),
                Err(_) => eprintln!("{}", e),
            }
            ExitCode::FAILURE
        }
    }
}
