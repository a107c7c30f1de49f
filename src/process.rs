//! Centralized command execution with consistent error handling.
//!
//! Every host inspection command goes through [`Cmd`], which captures
//! stdout/stderr and enforces a timeout. A timeout is reported as an ordinary
//! command failure.

use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error};

use crate::error::{Error, Result};

/// Default timeout for host inspection commands.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Result of a command execution.
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// Exit status of the command.
    pub status: ExitStatus,
    /// Captured stdout as a string.
    pub stdout: String,
    /// Captured stderr as a string.
    pub stderr: String,
}

impl CommandResult {
    /// Returns true if the command exited successfully.
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Get the exit code, or -1 if terminated by signal.
    pub fn code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }

    /// Get stdout, trimmed of whitespace.
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    /// Get stderr, trimmed of whitespace.
    pub fn stderr_trimmed(&self) -> &str {
        self.stderr.trim()
    }
}

/// Builder for configuring command execution.
pub struct Cmd {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    /// If true, don't fail on non-zero exit.
    allow_fail: bool,
    /// If true, don't log output of a failed command.
    quiet: bool,
    /// Custom error message prefix.
    error_prefix: Option<String>,
}

impl Cmd {
    /// Create a new command builder.
    pub fn new(program: impl AsRef<str>) -> Self {
        Self {
            program: program.as_ref().to_string(),
            args: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            allow_fail: false,
            quiet: false,
            error_prefix: None,
        }
    }

    /// Add a single argument.
    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

    /// Add multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for arg in args {
            self.args.push(arg.as_ref().to_string());
        }
        self
    }

    /// Add a path as an argument.
    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.to_string_lossy().into_owned());
        self
    }

    /// Set the timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Allow non-zero exit codes without failing.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// Don't log stdout/stderr when the command fails.
    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    /// Set a custom error message prefix.
    pub fn error_msg(mut self, msg: impl AsRef<str>) -> Self {
        self.error_prefix = Some(msg.as_ref().to_string());
        self
    }

    fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    fn failure(&self, message: String) -> Error {
        let message = match &self.error_prefix {
            Some(prefix) => format!("{}: {}", prefix, message),
            None => message,
        };
        Error::Command {
            program: self.program.clone(),
            message,
        }
    }

    /// Run the command and capture output.
    pub fn run(self) -> Result<CommandResult> {
        debug!("Running command: {}", self.command_line());

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.failure(format!("failed to execute, is it installed? ({})", e)))?;

        let stdout = spawn_reader(child.stdout.take());
        let stderr = spawn_reader(child.stderr.take());

        let status = match wait_with_timeout(&mut child, self.timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(self.failure(format!("timed out after {:?}", self.timeout)));
            }
            Err(e) => return Err(self.failure(format!("failed waiting for exit: {}", e))),
        };

        let result = CommandResult {
            status,
            stdout: stdout.join().unwrap_or_default(),
            stderr: stderr.join().unwrap_or_default(),
        };

        if !result.success() {
            if !self.quiet {
                error!("Failed to run command: {}", self.command_line());
                if !result.stdout_trimmed().is_empty() {
                    error!("Command output:\n{}", result.stdout_trimmed());
                }
                if !result.stderr_trimmed().is_empty() {
                    error!("Command error:\n{}", result.stderr_trimmed());
                }
            }
            if !self.allow_fail {
                let stderr = result.stderr_trimmed();
                let message = if stderr.is_empty() {
                    format!("exit code {}", result.code())
                } else {
                    format!("exit code {}: {}", result.code(), stderr)
                };
                return Err(self.failure(message));
            }
        }

        Ok(result)
    }
}

fn spawn_reader<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn wait_with_timeout(child: &mut Child, timeout: Duration) -> std::io::Result<Option<ExitStatus>> {
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if start.elapsed() > timeout {
            return Ok(None);
        }
        thread::sleep(Duration::from_millis(10));
    }
}

// =============================================================================
// Convenience functions
// =============================================================================

/// Run a command with arguments. Fails with stderr on error.
pub fn run<I, S>(program: &str, args: I) -> Result<CommandResult>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    Cmd::new(program).args(args).run()
}

/// Find a program in PATH.
pub fn which(program: &str) -> Option<std::path::PathBuf> {
    which::which(program).ok()
}

// =============================================================================
// Tests
// =============================================================================
