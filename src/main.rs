//! lockrun: run a command while holding a distributed lock in etcd.
//!
//! This is the main entry point for the `lockrun` CLI. It parses and
//! validates the configuration, then hands over to the supervisor and
//! exits with the code it reports.

mod cli;
mod config;
mod error;
mod exit_codes;
mod heartbeat;
mod locks;
mod store;
mod supervisor;

#[cfg(test)]
mod test_support;

use clap::{CommandFactory, Parser};
use cli::Cli;
use config::Config;
use std::process::ExitCode;
use std::sync::Arc;
use store::EtcdClient;
use supervisor::Supervisor;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    // Argument errors and --help are not failures: print and exit 0.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return ExitCode::from(exit_codes::SUCCESS as u8);
        }
    };

    init_tracing(cli.verbose);

    let config = match Config::resolve(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error: {}", err);
            eprintln!("{}", Cli::command().render_usage());
            return ExitCode::from(err.exit_code() as u8);
        }
    };

    if let Ok(yaml) = config.to_yaml() {
        debug!("effective configuration:\n{}", yaml);
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Error: failed to start async runtime: {}", err);
            return ExitCode::from(exit_codes::ACQUIRE_FAILURE as u8);
        }
    };

    let code = runtime.block_on(run(config));
    ExitCode::from(code as u8)
}

async fn run(config: Config) -> i32 {
    let store = match EtcdClient::new(&config.endpoint, config.request_timeout()) {
        Ok(store) => store,
        Err(err) => {
            error!(endpoint = %config.endpoint, error = %err, "failed to create store client");
            return exit_codes::ACQUIRE_FAILURE;
        }
    };

    Supervisor::new(config, Arc::new(store)).run().await
}

/// Log to stderr. `RUST_LOG` wins over `--verbose`.
fn init_tracing(verbose: bool) {
    let default = if verbose {
        "lockrun=debug"
    } else {
        "lockrun=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
