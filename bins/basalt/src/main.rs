//! ```text
//! basalt CONFIG                                  master: store + workers
//! basalt CONFIG ctl WORKER METHOD PATH [BODY]    one configuration request
//! ```
//!
//! Workers are this same executable started with `BASALT_WORKER_ID` set.

mod master;

use anyhow::{Context, Result};
use basalt_config::BasaltConfig;
use basalt_worker::Worker;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const WORKER_ENV: &str = "BASALT_WORKER_ID";

#[derive(Parser)]
#[command(name = "basalt")]
#[command(about = "Shared configuration store with worker fan-out", long_about = None)]
struct Cli {
    /// TOML configuration file
    config: PathBuf,

    #[command(subcommand)]
    cmd: Option<Cmd>,
}

#[derive(Subcommand)]
enum Cmd {
    /// Send one configuration request to a worker's admin socket
    Ctl {
        worker: usize,
        method: String,
        path: String,
        body: Option<String>,
    },
}

fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = BasaltConfig::load(cli.config.display().to_string())
        .with_context(|| format!("loading {}", cli.config.display()))?;

    if let Some(Cmd::Ctl {
        worker,
        method,
        path,
        body,
    }) = &cli.cmd
    {
        return ctl(&config, *worker, method, path, body.as_deref().unwrap_or_default());
    }

    init_tracing(&config.log_level);

    match std::env::var(WORKER_ENV) {
        Ok(id) => {
            let id: usize = id.parse().with_context(|| format!("{WORKER_ENV}={id}"))?;
            let mut worker =
                Worker::start(id, &config).with_context(|| format!("starting worker {id}"))?;
            worker.run()?;
            Ok(())
        }
        Err(_) => master::run(&config, &cli.config),
    }
}

fn ctl(config: &BasaltConfig, worker: usize, method: &str, path: &str, body: &str) -> Result<()> {
    let (status, body) =
        basalt_worker::request(config.admin_socket(worker), method, path, body.as_bytes())
            .with_context(|| format!("talking to worker {worker}"))?;
    println!("{status}");
    if !body.is_empty() {
        print!("{}", String::from_utf8_lossy(&body));
    }
    if status >= 400 {
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_master_and_ctl_invocations() {
        let cli = Cli::try_parse_from(["basalt", "basalt.toml"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("basalt.toml"));
        assert!(cli.cmd.is_none());

        let cli = Cli::try_parse_from(["basalt", "b.toml", "ctl", "2", "PUT", "/routes", "[]"]).unwrap();
        let Some(Cmd::Ctl {
            worker,
            method,
            path,
            body,
        }) = cli.cmd
        else {
            panic!("expected ctl");
        };
        assert_eq!((worker, method.as_str(), path.as_str()), (2, "PUT", "/routes"));
        assert_eq!(body.as_deref(), Some("[]"));

        assert!(Cli::try_parse_from(["basalt", "b.toml", "ctl", "x", "GET", "/"]).is_err());
        assert!(Cli::try_parse_from(["basalt"]).is_err());
    }
}
