//! The job side of the background executor.
//!
//! Once detached, the executor runs exactly one command: it records its start in the
//! status file, captures both output streams, waits for the command and writes the
//! terminal record. Failures never escape as a process error; they become exit codes in
//! the status file.

use super::status::{StatusPersister, EXIT_INTERNAL_ERROR, EXIT_OS_ERROR};
use super::stream_logger::{stamp_line, OutputStream, StreamLogger};
use crate::error::{PgDeckError, PgDeckResult};
use parking_lot::Mutex;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use thiserror::Error;
use tokio::process::{Child, Command};

/// Job directory of the executor.
pub const OUTDIR_VAR: &str = "OUTDIR";

/// Name of the environment variable holding the job's database password.
pub const PROCID_VAR: &str = "PROCID";

/// Set on the Windows re-invocation that actually runs the job.
pub const FOREGROUND_VAR: &str = "BGP_FOREGROUND";

/// Variable the command reads its password from.
pub const PASSWORD_VAR: &str = "PGPASSWORD";

const DQ_MARKER: &str = "#DQ#";

/// Protect an argument containing double quotes from the Windows command line.
pub fn escape_arg(arg: &str) -> String {
    if arg.contains('"') {
        format!("{DQ_MARKER}{arg}{DQ_MARKER}")
    } else {
        arg.to_string()
    }
}

/// Undo [`escape_arg`].
pub fn unescape_arg(arg: &str) -> &str {
    if arg.len() >= 2 * DQ_MARKER.len() {
        if let Some(inner) = arg.strip_prefix(DQ_MARKER).and_then(|a| a.strip_suffix(DQ_MARKER))
        {
            return inner;
        }
    }
    arg
}

/// Everything the executor needs to run one job.
#[derive(Clone)]
pub struct JobSpec {
    /// Job directory `D`
    pub out_dir: PathBuf,
    /// Name of the variable carrying the password
    pub proc_id: String,
    /// Program followed by its arguments
    pub command: Vec<String>,
    password: Option<String>,
}

impl std::fmt::Debug for JobSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobSpec")
            .field("out_dir", &self.out_dir)
            .field("proc_id", &self.proc_id)
            .field("command", &self.command)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl JobSpec {
    /// Build a job from command-line arguments (without the executor's own name) and
    /// an environment lookup.
    pub fn from_parts<I>(args: I, var: impl Fn(&str) -> Option<String>) -> PgDeckResult<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let out_dir = var(OUTDIR_VAR)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| PgDeckError::config(format!("{OUTDIR_VAR} is not set")))?;
        let proc_id = var(PROCID_VAR)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| PgDeckError::config(format!("{PROCID_VAR} is not set")))?;

        let out_dir = PathBuf::from(out_dir);
        if !out_dir.is_dir() {
            return Err(PgDeckError::config(format!(
                "Output directory {} does not exist",
                out_dir.display()
            )));
        }

        let command: Vec<String> =
            args.into_iter().map(|arg| unescape_arg(&arg).to_string()).collect();
        if command.is_empty() {
            return Err(PgDeckError::config("No command to execute"));
        }

        let password = var(&proc_id);
        Ok(Self { out_dir, proc_id, command, password })
    }

    /// Job of the running executor process.
    pub fn from_env() -> PgDeckResult<Self> {
        Self::from_parts(std::env::args().skip(1), |name| std::env::var(name).ok())
    }

    /// Diagnostic log of executor process `pid`.
    pub fn log_path(&self, pid: u32) -> PathBuf {
        self.out_dir.join(format!("log_{pid}"))
    }

    /// Whether a password will be handed to the command.
    pub fn has_password(&self) -> bool {
        self.password.is_some()
    }
}

/// Failure while running the command.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The operating system refused, e.g. executable not found
    #[error("{context}: {source}")]
    Os {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Internal(#[from] PgDeckError),
}

impl ProcessError {
    fn os(context: impl Into<String>, source: io::Error) -> Self {
        Self::Os { context: context.into(), source }
    }

    /// Exit code recorded for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Os { .. } => EXIT_OS_ERROR,
            Self::Internal(_) => EXIT_INTERNAL_ERROR,
        }
    }
}

/// Exit code of a finished command; a signal death is the negated signal number.
pub fn exit_code_of(status: ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    status.code().unwrap_or(EXIT_INTERNAL_ERROR)
}

/// Run the job described by `spec` and write its status record.
///
/// Returns the exit code written to the terminal record. An error is returned only if
/// the status file itself cannot be written.
pub async fn run_job(spec: JobSpec) -> PgDeckResult<i32> {
    let status = Arc::new(Mutex::new(StatusPersister::new(&spec.out_dir)));
    status.lock().started(std::process::id())?;
    tracing::info!(pid = std::process::id(), command = ?spec.command, "Job started");

    let task = tokio::spawn(execute(spec.clone(), status.clone()));
    let exit_code = match task.await {
        Ok(Ok(code)) => {
            tracing::info!(exit_code = code, "Command exited");
            code
        }
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Command failed");
            report(&spec, &e.to_string()).await;
            e.exit_code()
        }
        Err(e) => {
            let message = match e.try_into_panic() {
                Ok(payload) => panic_message(payload.as_ref()),
                Err(e) => e.to_string(),
            };
            tracing::error!(error = %message, "Executor panicked");
            report(&spec, &format!("Executor panicked: {message}")).await;
            EXIT_INTERNAL_ERROR
        }
    };

    status.lock().finished(exit_code)?;
    tracing::info!(exit_code, "Job finished");
    Ok(exit_code)
}

async fn execute(
    spec: JobSpec,
    status: Arc<Mutex<StatusPersister>>,
) -> Result<i32, ProcessError> {
    let (program, args) = spec
        .command
        .split_first()
        .ok_or_else(|| PgDeckError::process("No command to execute"))?;

    let mut command = Command::new(program);
    command.args(args).stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
    if let Some(ref password) = spec.password {
        tracing::debug!(proc_id = %spec.proc_id, "Exporting password to the command");
        command.env(PASSWORD_VAR, password);
    }

    tracing::debug!(program = %program, "Starting the command");
    let mut child = command
        .spawn()
        .map_err(|e| ProcessError::os(format!("Failed to start {program}"), e))?;

    let pid = child.id().ok_or_else(|| PgDeckError::process("Command exited before start"))?;
    status.lock().started(pid)?;
    tracing::info!(pid, "Command running");

    let (out_lines, err_lines) = match capture(&spec, &mut child).await {
        Ok(counts) => counts,
        Err(e) => {
            // Without its output being read the command must not outlive the job.
            tracing::warn!(pid, error = %e, "Output capture failed, killing the command");
            if let Err(kill) = child.start_kill() {
                tracing::debug!(pid, error = %kill, "Kill failed");
            }
            match child.wait().await {
                Ok(exit) => tracing::debug!(pid, exit_code = exit_code_of(exit), "Command reaped"),
                Err(wait) => tracing::debug!(pid, error = %wait, "Failed to reap the command"),
            }
            return Err(e);
        }
    };
    tracing::debug!(out_lines, err_lines, "Output captured, waiting for the command");

    let exit = child
        .wait()
        .await
        .map_err(|e| ProcessError::os("Failed to wait for the command", e))?;
    Ok(exit_code_of(exit))
}

/// Close the status of a job that cannot be run by this process at all.
///
/// For failures before the async job machinery exists: `reason` goes to `D/err` and the
/// record becomes terminal with exit code 501.
pub fn abandon_job(spec: &JobSpec, reason: &str) -> PgDeckResult<()> {
    tracing::error!(reason, "Abandoning the job");
    let mut err = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(spec.out_dir.join(OutputStream::Stderr.file_name()))?;
    for line in reason.lines() {
        err.write_all(&stamp_line(line.as_bytes()))?;
    }

    let mut status = StatusPersister::new(&spec.out_dir);
    status.started(std::process::id())?;
    status.finished(EXIT_INTERNAL_ERROR)
}

/// Copy both output streams of `child` into the job directory.
async fn capture(spec: &JobSpec, child: &mut Child) -> Result<(u64, u64), ProcessError> {
    let stdout = child.stdout.take().ok_or_else(|| PgDeckError::process("stdout not piped"))?;
    let stderr = child.stderr.take().ok_or_else(|| PgDeckError::process("stderr not piped"))?;

    let out = StreamLogger::open(&spec.out_dir, OutputStream::Stdout)
        .await
        .map_err(|e| ProcessError::os("Failed to open the output log", e))?;
    let err = StreamLogger::open(&spec.out_dir, OutputStream::Stderr)
        .await
        .map_err(|e| ProcessError::os("Failed to open the error log", e))?;

    tokio::try_join!(out.drain(stdout), err.drain(stderr))
        .map_err(|e| ProcessError::os("Failed to capture output", e))
}

/// Append a failure description to `D/err`.
async fn report(spec: &JobSpec, message: &str) {
    let result = async {
        let mut err = StreamLogger::open(&spec.out_dir, OutputStream::Stderr).await?;
        for line in message.lines() {
            err.log(line.as_bytes()).await?;
        }
        io::Result::Ok(())
    }
    .await;
    if let Err(e) = result {
        tracing::error!(error = %e, "Failed to record the failure in the error log");
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}
