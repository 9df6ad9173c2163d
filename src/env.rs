//! Host environment file: static facts about where this agent runs,
//! attached to self metrics. The file is optional; read errors yield an
//! empty environment so startup never blocks on it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Environment files larger than this are truncated on read.
const MAX_ENV_FILE_SIZE: u64 = 16 * 1024 * 1024;

/// Contents of the host environment YAML file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Env {
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub env: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub dc: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub cluster: String,
    #[serde(default)]
    pub owner: String,
}

/// Shared snapshot of the environment, refreshed by a watcher task.
#[derive(Default)]
pub struct Loader {
    env: RwLock<Env>,
    path: PathBuf,
    last_modified: RwLock<Option<SystemTime>>,
}

impl Loader {
    pub fn load(&self) -> Env {
        self.env.read().clone()
    }
}

/// Reads the environment file, capped at 16 MiB.
pub fn read_env_file(path: &Path) -> Result<Env> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("opening env file {}", path.display()))?;
    let mut data = String::new();
    std::io::Read::read_to_string(
        &mut std::io::Read::take(file, MAX_ENV_FILE_SIZE),
        &mut data,
    )
    .context("reading env file")?;
    serde_yaml::from_str(&data).context("parsing env YAML")
}

/// Reads the environment file once and starts a watcher task that re-reads
/// it on modification. An empty path returns an inert loader.
pub fn listen_env_file(path: &str, cancel: CancellationToken) -> Arc<Loader> {
    let loader = Arc::new(Loader {
        env: RwLock::new(Env::default()),
        path: PathBuf::from(path),
        last_modified: RwLock::new(None),
    });
    if path.is_empty() {
        return loader;
    }

    match read_env_file(&loader.path) {
        Ok(env) => {
            info!(?env, "read env file");
            *loader.env.write() = env;
        }
        Err(e) => warn!(error = %e, "env file read failed, starting with empty environment"),
    }
    *loader.last_modified.write() = modified_time(&loader.path);

    let watcher = Arc::clone(&loader);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let modified = modified_time(&watcher.path);
            if modified == *watcher.last_modified.read() {
                continue;
            }
            *watcher.last_modified.write() = modified;
            match read_env_file(&watcher.path) {
                Ok(env) => {
                    info!(?env, "env file changed");
                    *watcher.env.write() = env;
                }
                // Keep the previous snapshot on a bad read.
                Err(e) => warn!(error = %e, "env file re-read failed"),
            }
        }
    });
    loader
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
