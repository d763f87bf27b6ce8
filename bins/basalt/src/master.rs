//! Master process: creates the shared store, installs the initial
//! configuration, then keeps one child per worker slot alive.

use crate::WORKER_ENV;
use anyhow::{Context, Result};
use basalt_config::BasaltConfig;
use basalt_engine::JsonConfigEngine;
use basalt_notify::ConfigEngine;
use basalt_shm::{ConfigStore, StoreOptions};
use std::path::Path;
use std::process::{Child, Command};
use std::time::Duration;
use tracing::{info, warn};

const REAP_INTERVAL: Duration = Duration::from_millis(200);

pub fn run(config: &BasaltConfig, config_path: &Path) -> Result<()> {
    std::fs::create_dir_all(&config.socket_dir)
        .with_context(|| format!("creating {}", config.socket_dir))?;

    let store = ConfigStore::create(
        &config.shm_file_path,
        StoreOptions {
            arena_size: config.arena_size,
            spin: config.lock_spin,
        },
    )
    .with_context(|| format!("creating config store {}", config.shm_file_path))?;
    info!(path = %config.shm_file_path, arena_size = config.arena_size, "config store created");

    if let Some(path) = &config.initial_config {
        let bytes = std::fs::read(path).with_context(|| format!("reading {path}"))?;
        JsonConfigEngine::new()
            .parse(&bytes)
            .with_context(|| format!("validating {path}"))?;
        let report = store.install(&bytes)?;
        info!(
            path = %path,
            bytes = bytes.len(),
            generation = report.generation,
            "initial configuration installed"
        );
    }

    let exe = std::env::current_exe().context("locating own executable")?;
    let spawn = |id: usize| -> Result<Child> {
        let child = Command::new(&exe)
            .arg(config_path)
            .env(WORKER_ENV, id.to_string())
            .spawn()
            .with_context(|| format!("spawning worker {id}"))?;
        info!(worker = id, pid = child.id(), "worker spawned");
        Ok(child)
    };

    let mut workers: Vec<Child> = (0..config.workers).map(&spawn).collect::<Result<_>>()?;

    loop {
        std::thread::sleep(REAP_INTERVAL);
        for (id, child) in workers.iter_mut().enumerate() {
            let Some(status) = child.try_wait().context("reaping workers")? else {
                continue;
            };
            let pid = child.id();
            warn!(worker = id, pid, %status, "worker exited, respawning");
            // A worker killed inside a critical section leaves the lock taken.
            store.force_unlock(u64::from(pid));
            *child = spawn(id)?;
        }
    }
}
