#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use casket_common::catalog::Catalog;
use casket_common::config::Config;
use casket_common::error::{CasketError, FetchErrorKind, Result};
use casket_common::model::Descriptor;
use casket_core::{CommandOutput, CommandRunner, CommandSpec, Engine, SystemCommandRunner};
use casket_net::validation::sha256_file;
use casket_net::{ArtifactSource, FetchRequest, FetchedArtifact};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;

/// Runs absolute-path programs (test scripts) for real, without elevation,
/// and fakes every system tool invoked by bare name. `installer` and
/// `pkgutil` share a small in-memory receipt database.
#[derive(Default)]
pub struct RecordingRunner {
    calls: Mutex<Vec<CommandSpec>>,
    fail_program: Mutex<Option<String>>,
    cancel_after: Mutex<Option<(String, CancellationToken)>>,
    receipts: Mutex<BTreeSet<String>>,
    pkg_registers: Mutex<Option<String>>,
}

impl RecordingRunner {
    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    pub fn program_calls(&self, name: &str) -> Vec<CommandSpec> {
        self.calls()
            .into_iter()
            .filter(|c| c.program_name() == name)
            .collect()
    }

    /// Every later run of `name` exits with status 1.
    pub fn fail(&self, name: &str) {
        *self.fail_program.lock().unwrap() = Some(name.to_string());
    }

    /// Cancels `token` right after `name` has run.
    pub fn cancel_after(&self, name: &str, token: CancellationToken) {
        *self.cancel_after.lock().unwrap() = Some((name.to_string(), token));
    }

    /// The receipt id the fake `installer` registers.
    pub fn pkg_registers(&self, id: &str) {
        *self.pkg_registers.lock().unwrap() = Some(id.to_string());
    }

    pub fn receipts(&self) -> BTreeSet<String> {
        self.receipts.lock().unwrap().clone()
    }

    fn fake(&self, spec: &CommandSpec) -> CommandOutput {
        let args: Vec<String> = spec
            .args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        let ok = |stdout: String| CommandOutput {
            exit_code: 0,
            stdout,
            stderr: String::new(),
        };
        match (spec.program_name().as_str(), args.first().map(String::as_str)) {
            ("installer", _) => {
                if let Some(id) = self.pkg_registers.lock().unwrap().clone() {
                    self.receipts.lock().unwrap().insert(id);
                }
                ok(String::new())
            }
            ("pkgutil", Some("--pkgs")) => {
                let listing: Vec<String> = self.receipts().into_iter().collect();
                ok(listing.join("\n"))
            }
            ("pkgutil", Some("--pkg-info")) => {
                if self.receipts().contains(&args[1]) {
                    ok(format!("package-id: {}\nvolume: /\nlocation: \n", args[1]))
                } else {
                    CommandOutput {
                        exit_code: 1,
                        stdout: String::new(),
                        stderr: format!("No receipt for '{}' found at '/'.", args[1]),
                    }
                }
            }
            ("pkgutil", Some("--only-files")) => ok(String::new()),
            ("pkgutil", Some("--forget")) => {
                self.receipts.lock().unwrap().remove(&args[1]);
                ok(format!("Forgot package '{}' on '/'.", args[1]))
            }
            // Nothing is loaded.
            ("launchctl", Some("list")) => CommandOutput {
                exit_code: 113,
                ..Default::default()
            },
            _ => ok(String::new()),
        }
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(spec.clone());
        let name = spec.program_name();
        if self.fail_program.lock().unwrap().as_deref() == Some(name.as_str()) {
            return Ok(CommandOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: "injected failure".to_string(),
            });
        }
        let output = if spec.program.is_absolute() {
            let mut unprivileged = spec.clone();
            unprivileged.elevate = false;
            SystemCommandRunner.run(&unprivileged)?
        } else {
            self.fake(spec)
        };
        if let Some((program, token)) = self.cancel_after.lock().unwrap().as_ref() {
            if *program == name {
                token.cancel();
            }
        }
        Ok(output)
    }
}

/// Serves registered fixture files and counts every fetch.
pub struct CountingSource {
    downloads: PathBuf,
    artifacts: Mutex<HashMap<String, PathBuf>>,
    calls: AtomicUsize,
}

impl CountingSource {
    pub fn new(downloads: PathBuf) -> Self {
        Self {
            downloads,
            artifacts: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn register(&self, token: &str, fixture: &Path) {
        self.artifacts
            .lock()
            .unwrap()
            .insert(token.to_string(), fixture.to_path_buf());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArtifactSource for CountingSource {
    async fn fetch(&self, request: &FetchRequest, cancel: &CancellationToken) -> Result<FetchedArtifact> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if cancel.is_cancelled() {
            return Err(CasketError::Cancelled(request.token.clone()));
        }
        let fixture = self
            .artifacts
            .lock()
            .unwrap()
            .get(&request.token)
            .cloned()
            .ok_or_else(|| CasketError::Fetch {
                token: request.token.clone(),
                url: request.url.clone(),
                kind: FetchErrorKind::Permanent,
                message: "HTTP status 404 Not Found".to_string(),
            })?;
        fs::create_dir_all(&self.downloads)?;
        let path = self.downloads.join(format!(
            "{}--{}--{}",
            request.token,
            request.version,
            fixture.file_name().unwrap().to_string_lossy()
        ));
        let size_bytes = fs::copy(&fixture, &path)?;
        Ok(FetchedArtifact {
            path,
            size_bytes,
            cached: false,
        })
    }
}

pub struct Sandbox {
    pub root: TempDir,
    pub fixtures: TempDir,
    pub config: Config,
    pub runner: Arc<RecordingRunner>,
    pub source: Arc<CountingSource>,
}

impl Sandbox {
    pub fn new() -> Self {
        let root = TempDir::new().unwrap();
        let fixtures = TempDir::new().unwrap();
        let config = Config::for_root(root.path());
        let source = Arc::new(CountingSource::new(config.downloads_dir()));
        Self {
            root,
            fixtures,
            config,
            runner: Arc::new(RecordingRunner::default()),
            source,
        }
    }

    pub fn engine(&self, descriptors: Vec<Descriptor>) -> Arc<Engine> {
        self.engine_with(self.config.clone(), descriptors)
    }

    pub fn engine_with(&self, config: Config, descriptors: Vec<Descriptor>) -> Arc<Engine> {
        let catalog = Catalog::from_descriptors(descriptors).unwrap();
        let source: Arc<dyn ArtifactSource> = self.source.clone();
        let runner: Arc<dyn CommandRunner> = self.runner.clone();
        Arc::new(Engine::new(config, catalog, source, runner).unwrap())
    }

    /// Builds a zip artifact for `token` and returns its sha256.
    pub fn zip_artifact(&self, token: &str, file_name: &str, entries: &[(&str, &str)]) -> String {
        let path = self.fixtures.path().join(format!("{token}-{file_name}"));
        let mut writer = zip::ZipWriter::new(File::create(&path).unwrap());
        for (name, body) in entries {
            let mode = if name.ends_with(".sh") || name.contains("/MacOS/") || name.starts_with("bin/") {
                0o755
            } else {
                0o644
            };
            writer
                .start_file(
                    name.to_string(),
                    SimpleFileOptions::default().unix_permissions(mode),
                )
                .unwrap();
            writer.write_all(body.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
        self.source.register(token, &path);
        sha256_file(&path).unwrap()
    }

    /// Writes an executable shell script outside the sandbox.
    pub fn script(&self, name: &str, body: &str) -> PathBuf {
        let path = self.fixtures.path().join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.root.path().join(rel)
    }

    /// Everything under the root except the download cache and scratch space.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        let mut entries = BTreeMap::new();
        for entry in WalkDir::new(self.root.path()).min_depth(1) {
            let entry = entry.unwrap();
            let rel = entry.path().strip_prefix(self.root.path()).unwrap();
            if rel.starts_with("cache") || rel.starts_with("tmp") {
                continue;
            }
            let kind = if entry.path_is_symlink() {
                format!("link -> {}", fs::read_link(entry.path()).unwrap().display())
            } else if entry.file_type().is_dir() {
                "dir".to_string()
            } else {
                format!("file: {}", fs::read_to_string(entry.path()).unwrap_or_default())
            };
            entries.insert(rel.display().to_string(), kind);
        }
        entries
    }
}

pub fn descriptor(value: serde_json::Value) -> Descriptor {
    serde_json::from_value(value).unwrap()
}
