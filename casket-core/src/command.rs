// casket-core/src/command.rs
//! External command execution. Every privileged operation goes through a
//! [`CommandRunner`] so elevation is decided per command, never per process.

use std::ffi::OsString;
use std::fmt;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use casket_common::error::{CasketError, Result};
use tracing::{debug, error};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    /// Lines fed to stdin, each terminated by a newline.
    pub input: Vec<String>,
    pub elevate: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            input: Vec::new(),
            elevate: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn input(mut self, lines: &[String]) -> Self {
        self.input = lines.to_vec();
        self
    }

    pub fn elevated(mut self, elevate: bool) -> Self {
        self.elevate = elevate;
        self
    }

    /// File name of the program, e.g. `pkgutil`.
    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.to_string_lossy().into_owned())
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.elevate {
            f.write_str("sudo ")?;
        }
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs external programs. A non-zero exit is reported in the output, not as an
/// error; only failing to launch the program is an error.
pub trait CommandRunner: Send + Sync {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;

    /// Like [`CommandRunner::run`] but turns a non-zero exit into `CommandExec`.
    fn run_checked(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let output = self.run(spec)?;
        if output.success() {
            Ok(output)
        } else {
            Err(CasketError::CommandExec(format!(
                "'{}' exited with status {}: {}",
                spec,
                output.exit_code,
                output.stderr.trim()
            )))
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        debug!("Executing: {}", spec);
        let mut cmd = if spec.elevate {
            let sudo = which::which("sudo").map_err(|e| {
                CasketError::CommandExec(format!("'{spec}' needs elevation but sudo is unavailable: {e}"))
            })?;
            let mut c = Command::new(sudo);
            c.arg(&spec.program);
            c
        } else {
            Command::new(&spec.program)
        };
        cmd.args(&spec.args)
            .stdin(if spec.input.is_empty() {
                Stdio::null()
            } else {
                Stdio::piped()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            error!("Failed to spawn {}: {}", spec, e);
            CasketError::CommandExec(format!("Failed to spawn '{spec}': {e}"))
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            for line in &spec.input {
                match writeln!(stdin, "{line}") {
                    Ok(()) => {}
                    // The program exited without reading all of its input.
                    Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => break,
                    Err(e) => return Err(e.into()),
                }
            }
        }

        let output = child.wait_with_output()?;
        let result = CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        debug!("'{}' exited with {}", spec, result.exit_code);
        Ok(result)
    }
}
