use std::{process::ExitCode, time::Duration};

use clap::Parser;
use env_logger::Env;
use log::error;

use task_engine::app::cli;
use task_engine::{EngineConfig, FailurePolicy, RetryPolicy, TaskManager};

#[derive(Parser, Debug)]
#[command(name = "task-engine", version, about = "Interactive console for the threaded task engine")]
struct Args {
    /// Milliseconds a worker waits on an empty queue before re-checking shutdown
    #[arg(long, env = "TASK_ENGINE_POLL_MS", default_value_t = 500)]
    poll_ms: u64,

    /// stop-worker or record-only
    #[arg(long, env = "TASK_ENGINE_FAILURE_POLICY", default_value_t = FailurePolicy::StopWorker)]
    failure_policy: FailurePolicy,

    /// Workers started per type when no count is given
    #[arg(long, env = "TASK_ENGINE_WORKERS", default_value_t = 1)]
    workers: usize,

    /// Task types to start workers for at launch
    #[arg(long = "type", value_name = "TYPE", default_value = "shell")]
    types: Vec<String>,

    #[arg(long, env = "TASK_ENGINE_RETRY_ATTEMPTS", default_value_t = 5)]
    retry_attempts: u32,

    #[arg(long, env = "TASK_ENGINE_RETRY_DELAY_MS", default_value_t = 2000)]
    retry_delay_ms: u64,
}

impl Args {
    fn config(&self) -> EngineConfig {
        EngineConfig {
            poll_timeout: Duration::from_millis(self.poll_ms),
            failure_policy: self.failure_policy,
            workers_per_type: self.workers,
            retry: RetryPolicy::new(self.retry_attempts, Duration::from_millis(self.retry_delay_ms)),
        }
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let manager = TaskManager::with_config(args.config());
    let mut workers = Vec::new();
    for task_type in &args.types {
        match manager.spawn_workers(task_type.as_str(), args.workers) {
            Ok(spawned) => workers.extend(spawned),
            Err(e) => {
                error!("{}", e);
                manager.request_shutdown();
                return ExitCode::FAILURE;
            }
        }
    }

    if let Err(e) = cli::run_cli(manager, workers) {
        error!("Console failed: {}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
