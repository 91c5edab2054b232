// casket-core/src/engine.rs
//! Wires the gate, fetcher, verifier, stage manager and executors into
//! transactions, one per `(token, version)` at a time.

use std::fs;
use std::sync::Arc;
use std::time::Instant;

use casket_common::catalog::Catalog;
use casket_common::config::Config;
use casket_common::error::{CasketError, Result};
use casket_common::model::{ActionLog, Descriptor};
use casket_common::pipeline::PipelineEvent;
use casket_net::{verify_artifact, ArtifactSource, FetchRequest, HttpFetcher, Verification};
use chrono::Local;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::command::{CommandRunner, SystemCommandRunner};
use crate::install::Installer;
use crate::lifecycle::{self, GateOverrides};
use crate::stage::StageManager;
use crate::store::ActionLogStore;
use crate::uninstall::{UninstallReport, Uninstaller};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, Default)]
pub struct InstallOptions {
    /// Replace existing targets; they are restored if the install fails.
    pub force: bool,
    pub allow_manual_review: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed {
        token: String,
        version: String,
        unverified: bool,
        warnings: Vec<String>,
        caveats: Option<String>,
    },
    AlreadyInstalled {
        token: String,
        version: String,
    },
}

pub struct Engine {
    config: Config,
    catalog: Arc<Catalog>,
    store: Arc<ActionLogStore>,
    source: Arc<dyn ArtifactSource>,
    runner: Arc<dyn CommandRunner>,
    stager: StageManager,
    event_tx: broadcast::Sender<PipelineEvent>,
    cancel: CancellationToken,
    max_workers: usize,
}

impl Engine {
    pub fn new(
        config: Config,
        catalog: Catalog,
        source: Arc<dyn ArtifactSource>,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self> {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self::with_event_channel(config, catalog, source, runner, event_tx)
    }

    /// An engine that downloads over HTTP and runs real system commands.
    pub fn with_system_defaults(config: Config, catalog: Catalog) -> Result<Self> {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let fetcher = HttpFetcher::new(&config)?.with_events(event_tx.clone());
        Self::with_event_channel(
            config,
            catalog,
            Arc::new(fetcher),
            Arc::new(SystemCommandRunner),
            event_tx,
        )
    }

    fn with_event_channel(
        config: Config,
        catalog: Catalog,
        source: Arc<dyn ArtifactSource>,
        runner: Arc<dyn CommandRunner>,
        event_tx: broadcast::Sender<PipelineEvent>,
    ) -> Result<Self> {
        for dir in [
            config.bin_dir(),
            config.caskroom_dir(),
            config.downloads_dir(),
            config.staging_dir(),
        ] {
            fs::create_dir_all(&dir)?;
        }
        let store = Arc::new(ActionLogStore::new(&config)?);
        let max_workers = std::cmp::max(1, num_cpus::get_physical().saturating_sub(1)).min(6);
        debug!("Engine ready at {} with {} workers", config.casket_root.display(), max_workers);
        Ok(Self {
            stager: StageManager::new(&config),
            config,
            catalog: Arc::new(catalog),
            store,
            source,
            runner,
            event_tx,
            cancel: CancellationToken::new(),
            max_workers,
        })
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.event_tx.subscribe()
    }

    /// Cancelling this token rolls back every running transaction.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Action logs of everything installed, including unfinished installs.
    pub fn installed(&self) -> Result<Vec<ActionLog>> {
        self.store.list()
    }

    fn send_event(&self, event: PipelineEvent) {
        let _ = self.event_tx.send(event);
    }

    fn gate(&self, descriptor: &Descriptor, overrides: GateOverrides) -> Result<Vec<String>> {
        let today = Local::now().date_naive();
        let warnings = lifecycle::evaluate(descriptor, overrides, today).into_result(&descriptor.token)?;
        for warning in &warnings {
            warn!("{}", warning);
            self.send_event(PipelineEvent::LogWarn {
                message: warning.clone(),
            });
        }
        Ok(warnings)
    }

    fn check_cancelled(&self, token: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(CasketError::Cancelled(token.to_string()));
        }
        Ok(())
    }

    /// Installs `token`, or reports it as already installed. Every failure is
    /// also announced once as `TransactionFailed`.
    pub async fn install(&self, token: &str, opts: InstallOptions) -> Result<InstallOutcome> {
        let result = self.install_one(token, opts).await;
        if let Err(e) = &result {
            error!("Install of {} failed: {}", token, e);
            self.send_event(PipelineEvent::transaction_failed(token, e));
        }
        result
    }

    async fn install_one(&self, token: &str, opts: InstallOptions) -> Result<InstallOutcome> {
        let descriptor = self.catalog.get(token)?;
        let warnings = self.gate(
            &descriptor,
            GateOverrides {
                allow_manual_review: opts.allow_manual_review,
            },
        )?;
        let version = descriptor.effective_version().to_string();
        let _guard = self.store.lock(token, &version).await;

        if let Some(log) = self.store.load(token, &version)? {
            if log.is_complete() {
                debug!("{} {} is already installed", token, version);
                self.send_event(PipelineEvent::AlreadyInstalled {
                    token: token.to_string(),
                    version,
                });
                return Ok(InstallOutcome::AlreadyInstalled {
                    token: token.to_string(),
                    version: log.version,
                });
            }
            self.recover(log).await?;
        }

        self.send_event(PipelineEvent::TransactionStarted {
            token: token.to_string(),
            version: version.clone(),
        });
        let log = self.run_transaction(descriptor, opts).await?;
        self.send_event(PipelineEvent::TransactionSucceeded {
            token: token.to_string(),
            version: version.clone(),
        });
        Ok(InstallOutcome::Installed {
            token: token.to_string(),
            version,
            unverified: log.unverified,
            warnings,
            caveats: log.caveats,
        })
    }

    async fn recover(&self, log: ActionLog) -> Result<()> {
        let config = self.config.clone();
        let store = Arc::clone(&self.store);
        let runner = Arc::clone(&self.runner);
        let cancel = self.cancel.clone();
        tokio::task::spawn_blocking(move || {
            Installer::new(&config, &store, runner.as_ref(), &cancel).recover(&log)
        })
        .await
        .map_err(|e| CasketError::Generic(format!("Recovery task failed: {e}")))?
    }

    async fn fetch_verified(
        &self,
        descriptor: &Descriptor,
    ) -> Result<(std::path::PathBuf, Verification)> {
        let token = descriptor.token.as_str();
        let checksum = descriptor.checksum()?;
        if self.config.require_checksum && !checksum.is_verifiable() {
            return Err(CasketError::Validation(format!(
                "{token} has no checksum and CASKET_REQUIRE_CHECKSUM is set"
            )));
        }
        let ctx = descriptor.template_context(&self.config);
        let request = FetchRequest {
            token: token.to_string(),
            version: ctx.version.clone(),
            url: descriptor.resolved_url(&ctx)?,
            checksum: checksum.clone(),
        };

        self.check_cancelled(token)?;
        let fetched = self.source.fetch(&request, &self.cancel).await?;
        self.send_event(PipelineEvent::DownloadFinished {
            token: token.to_string(),
            path: fetched.path.clone(),
            size_bytes: fetched.size_bytes,
            cached: fetched.cached,
        });
        self.check_cancelled(token)?;

        let verification = match verify_artifact(&fetched.path, &checksum) {
            Ok(v) => v,
            Err(e) => {
                if matches!(e, CasketError::ChecksumMismatch { .. }) {
                    warn!("Removing corrupt download {}", fetched.path.display());
                    if let Err(rm) = fs::remove_file(&fetched.path) {
                        warn!("Failed to remove {}: {}", fetched.path.display(), rm);
                    }
                }
                return Err(e);
            }
        };
        self.send_event(PipelineEvent::Verified {
            token: token.to_string(),
            digest: match &verification {
                Verification::Verified { digest } => Some(digest.clone()),
                Verification::Unverified { .. } => None,
            },
        });
        Ok((fetched.path, verification))
    }

    async fn run_transaction(&self, descriptor: Arc<Descriptor>, opts: InstallOptions) -> Result<ActionLog> {
        let (artifact, verification) = self.fetch_verified(&descriptor).await?;
        let unverified = !verification.is_verified();

        let config = self.config.clone();
        let store = Arc::clone(&self.store);
        let runner = Arc::clone(&self.runner);
        let cancel = self.cancel.clone();
        let events = self.event_tx.clone();
        let stager = self.stager.clone();
        tokio::task::spawn_blocking(move || {
            let version = descriptor.effective_version();
            // Dropped at the end of this closure on every path.
            let staged = stager.stage(&artifact, &descriptor.token, version)?;
            let _ = events.send(PipelineEvent::Staged {
                token: descriptor.token.clone(),
                path: staged.path().to_path_buf(),
            });
            let installer = Installer::new(&config, &store, runner.as_ref(), &cancel)
                .force(opts.force)
                .with_events(&events);
            installer.install(&descriptor, staged.path(), unverified)
        })
        .await
        .map_err(|e| CasketError::Generic(format!("Install task failed: {e}")))?
    }

    /// Installs several casks concurrently, at most `max_workers` at a time.
    /// Results come back in the order of `tokens`.
    pub async fn install_many(
        self: &Arc<Self>,
        tokens: &[String],
        opts: InstallOptions,
    ) -> Vec<(String, Result<InstallOutcome>)> {
        let started = Instant::now();
        self.send_event(PipelineEvent::PipelineStarted {
            total_jobs: tokens.len(),
        });
        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let mut set = JoinSet::new();
        for (index, token) in tokens.iter().cloned().enumerate() {
            let engine = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            set.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => engine.install(&token, opts).await,
                    Err(e) => Err(CasketError::Generic(format!("Worker pool closed: {e}"))),
                };
                (index, token, result)
            });
        }

        let mut results: Vec<Option<(String, Result<InstallOutcome>)>> =
            tokens.iter().map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, token, result)) => results[index] = Some((token, result)),
                Err(e) => error!("Install task panicked: {}", e),
            }
        }
        let results: Vec<_> = results
            .into_iter()
            .zip(tokens)
            .map(|(result, token)| {
                result.unwrap_or_else(|| {
                    (
                        token.clone(),
                        Err(CasketError::Generic(format!("Install task for {token} aborted"))),
                    )
                })
            })
            .collect();

        let fail_count = results.iter().filter(|(_, r)| r.is_err()).count();
        self.send_event(PipelineEvent::PipelineFinished {
            duration_secs: started.elapsed().as_secs_f64(),
            success_count: results.len() - fail_count,
            fail_count,
        });
        results
    }

    /// Fetches the artifact of `token` and checks it against its checksum.
    /// The manual-review flag does not apply since nothing is installed.
    pub async fn verify(&self, token: &str) -> Result<Verification> {
        let descriptor = self.catalog.get(token)?;
        self.gate(
            &descriptor,
            GateOverrides {
                allow_manual_review: true,
            },
        )?;
        let (_, verification) = self.fetch_verified(&descriptor).await?;
        Ok(verification)
    }

    /// Uninstalls every installed version of `token`.
    pub async fn uninstall(&self, token: &str) -> Result<UninstallReport> {
        let logs = self.store.installed(token)?;
        if logs.is_empty() {
            return Err(CasketError::NotFound(format!("{token} is not installed")));
        }
        let mut report = UninstallReport::default();
        let mut removed = 0;
        for snapshot in logs {
            let _guard = self.store.lock(token, &snapshot.version).await;
            // The snapshot may predate a transaction that held the lock.
            let Some(log) = self.store.load(token, &snapshot.version)? else {
                debug!("{} {} was removed meanwhile", token, snapshot.version);
                continue;
            };
            removed += 1;
            let config = self.config.clone();
            let store = Arc::clone(&self.store);
            let runner = Arc::clone(&self.runner);
            let events = self.event_tx.clone();
            let part = tokio::task::spawn_blocking(move || {
                Uninstaller::new(&config, &store, runner.as_ref())
                    .with_events(&events)
                    .uninstall(&log)
            })
            .await
            .map_err(|e| CasketError::Generic(format!("Uninstall task failed: {e}")))??;
            report.warnings.extend(part.warnings);
        }
        if removed == 0 {
            return Err(CasketError::NotFound(format!("{token} is not installed")));
        }
        Ok(report)
    }

    /// Uninstalls `token` if installed, then removes its user data.
    pub async fn zap(&self, token: &str) -> Result<UninstallReport> {
        let descriptor = self.catalog.get(token)?;
        let snapshots = self.store.installed(token)?;
        let mut guards = Vec::with_capacity(snapshots.len());
        let mut logs = Vec::with_capacity(snapshots.len());
        for snapshot in &snapshots {
            guards.push(self.store.lock(token, &snapshot.version).await);
            if let Some(log) = self.store.load(token, &snapshot.version)? {
                logs.push(log);
            }
        }
        let config = self.config.clone();
        let store = Arc::clone(&self.store);
        let runner = Arc::clone(&self.runner);
        let events = self.event_tx.clone();
        let report = tokio::task::spawn_blocking(move || {
            Uninstaller::new(&config, &store, runner.as_ref())
                .with_events(&events)
                .zap(&descriptor, &logs)
        })
        .await
        .map_err(|e| CasketError::Generic(format!("Zap task failed: {e}")))?;
        drop(guards);
        report
    }
}
