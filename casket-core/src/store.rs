// casket-core/src/store.rs
//! On-disk action logs: `<root>/state/actions/<token>/<version>.json`.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use casket_common::config::Config;
use casket_common::error::{CasketError, Result};
use casket_common::model::ActionLog;
use tempfile::NamedTempFile;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

type InstallKey = (String, String);

#[derive(Debug)]
pub struct ActionLogStore {
    dir: PathBuf,
    locks: Mutex<HashMap<InstallKey, Arc<AsyncMutex<()>>>>,
}

impl ActionLogStore {
    pub fn new(config: &Config) -> Result<Self> {
        let dir = config.action_logs_dir();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn path_for(&self, token: &str, version: &str) -> PathBuf {
        self.dir.join(token).join(format!("{version}.json"))
    }

    pub fn load(&self, token: &str, version: &str) -> Result<Option<ActionLog>> {
        let path = self.path_for(token, version);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Replaces the log atomically so a crash never leaves a torn file.
    pub fn save(&self, log: &ActionLog) -> Result<()> {
        let path = self.path_for(&log.token, &log.version);
        let parent = path
            .parent()
            .ok_or_else(|| CasketError::Generic(format!("Invalid log path {}", path.display())))?;
        fs::create_dir_all(parent)?;
        let mut tmp = NamedTempFile::new_in(parent)?;
        serde_json::to_writer_pretty(&mut tmp, log)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| CasketError::Io(Arc::new(e.error)))?;
        debug!("Saved action log {}", path.display());
        Ok(())
    }

    pub fn remove(&self, token: &str, version: &str) -> Result<()> {
        let path = self.path_for(token, version);
        match fs::remove_file(&path) {
            Ok(()) => debug!("Removed action log {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if let Some(parent) = path.parent() {
            prune_empty_dir(parent);
        }
        Ok(())
    }

    /// Every readable log, sorted by token then version.
    pub fn list(&self) -> Result<Vec<ActionLog>> {
        let mut logs = Vec::new();
        if !self.dir.is_dir() {
            return Ok(logs);
        }
        for token_dir in fs::read_dir(&self.dir)? {
            let token_dir = token_dir?.path();
            if !token_dir.is_dir() {
                continue;
            }
            for entry in fs::read_dir(&token_dir)? {
                let path = entry?.path();
                if path.extension().is_none_or(|ext| ext != "json") {
                    continue;
                }
                match fs::read(&path)
                    .map_err(CasketError::from)
                    .and_then(|b| serde_json::from_slice::<ActionLog>(&b).map_err(Into::into))
                {
                    Ok(log) => logs.push(log),
                    Err(e) => warn!("Skipping unreadable action log {}: {}", path.display(), e),
                }
            }
        }
        logs.sort_by(|a, b| (&a.token, &a.version).cmp(&(&b.token, &b.version)));
        Ok(logs)
    }

    /// Logs for every installed version of `token`.
    pub fn installed(&self, token: &str) -> Result<Vec<ActionLog>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|log| log.token == token)
            .collect())
    }

    /// Serializes transactions on the same `(token, version)` within this process.
    pub async fn lock(&self, token: &str, version: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            // Only the map holds these: nobody owns or waits for them.
            locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
            locks
                .entry((token.to_string(), version.to_string()))
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        mutex.lock_owned().await
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Removes `dir` if it is empty; anything else is left alone.
pub(crate) fn prune_empty_dir(dir: &Path) {
    if fs::read_dir(dir).is_ok_and(|mut entries| entries.next().is_none()) {
        if let Err(e) = fs::remove_dir(dir) {
            debug!("Could not prune {}: {}", dir.display(), e);
        }
    }
}
