//! Starting background jobs and following their progress.
//!
//! [`JobLauncher`] runs the `pgdeck-executor` binary for a command inside a fresh job
//! directory. The executor detaches and returns at once; the returned [`BackgroundJob`]
//! then reads the status record and the captured output from disk.

use super::executor::{escape_arg, OUTDIR_VAR, PROCID_VAR};
use super::status::{JobStatus, StatusRecord};
use super::stream_logger::{OutputLine, OutputStream};
use crate::error::{PgDeckError, PgDeckResult};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use uuid::Uuid;

/// A command to run in the background.
#[derive(Clone, Default)]
pub struct JobRequest {
    pub program: String,
    pub args: Vec<String>,
    /// Database password handed to the command as `PGPASSWORD`
    pub password: Option<String>,
}

impl std::fmt::Debug for JobRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRequest")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl JobRequest {
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into(), ..Default::default() }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }
}

/// Starts executor processes.
#[derive(Debug, Clone)]
pub struct JobLauncher {
    executor: PathBuf,
    jobs_dir: PathBuf,
}

impl JobLauncher {
    pub fn new(executor: PathBuf, jobs_dir: PathBuf) -> Self {
        Self { executor, jobs_dir }
    }

    pub fn jobs_dir(&self) -> &Path {
        &self.jobs_dir
    }

    /// Start `request` in the background.
    ///
    /// Returns once the executor has confirmed it detached. The job itself may not have
    /// written its first status yet.
    pub async fn launch(&self, request: JobRequest) -> PgDeckResult<BackgroundJob> {
        let id = Uuid::new_v4();
        let dir = self.jobs_dir.join(id.to_string());
        tokio::fs::create_dir_all(&dir).await?;

        let proc_id = format!("PGDECK_JOB_{}", id.simple()).to_uppercase();
        let mut command = Command::new(&self.executor);
        command
            .arg(escape_arg(&request.program))
            .args(request.args.iter().map(|arg| escape_arg(arg)))
            .env(OUTDIR_VAR, &dir)
            .env(PROCID_VAR, &proc_id)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(ref password) = request.password {
            command.env(&proc_id, password);
        }

        tracing::info!(job_id = %id, program = %request.program, "Launching background job");
        let status = command.status().await.map_err(|e| {
            PgDeckError::process_with_source(
                format!("Failed to start {}", self.executor.display()),
                e,
            )
        })?;
        if !status.success() {
            return Err(PgDeckError::process(format!(
                "Executor exited with {status} before the job was detached"
            )));
        }

        Ok(BackgroundJob { id, dir })
    }

    /// Reattach to a job started earlier.
    pub fn job(&self, id: Uuid) -> Option<BackgroundJob> {
        let dir = self.jobs_dir.join(id.to_string());
        dir.is_dir().then_some(BackgroundJob { id, dir })
    }
}

/// New output of one stream since a byte offset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputChunk {
    pub lines: Vec<OutputLine>,
    /// Offset to pass on the next poll
    pub next_offset: u64,
}

/// Handle on a launched job.
#[derive(Debug, Clone)]
pub struct BackgroundJob {
    id: Uuid,
    dir: PathBuf,
}

impl BackgroundJob {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Job directory `D`.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Raw status record, `None` before the executor wrote it.
    pub fn record(&self) -> PgDeckResult<Option<StatusRecord>> {
        StatusRecord::read(&self.dir)
    }

    pub fn status(&self) -> PgDeckResult<JobStatus> {
        Ok(JobStatus::from_record(self.record()?.as_ref()))
    }

    /// Complete lines of `stream` written after `offset`.
    ///
    /// A line still being written is left for the next poll.
    pub fn read_output(&self, stream: OutputStream, offset: u64) -> PgDeckResult<OutputChunk> {
        let path = self.dir.join(stream.file_name());
        let mut file = match std::fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(OutputChunk { lines: Vec::new(), next_offset: offset });
            }
            Err(e) => return Err(e.into()),
        };
        file.seek(SeekFrom::Start(offset))?;
        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;

        let complete = raw.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
        let lines = raw[..complete]
            .split_inclusive(|b| *b == b'\n')
            .filter_map(OutputLine::parse)
            .collect();
        Ok(OutputChunk { lines, next_offset: offset + complete as u64 })
    }

    /// Poll the status every `interval` until the job finishes or `timeout` passes.
    pub async fn wait(&self, interval: Duration, timeout: Duration) -> PgDeckResult<JobStatus> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let status = self.status()?;
            if status.is_finished() {
                return Ok(status);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(PgDeckError::process(format!(
                    "Job {} still running after {timeout:?}",
                    self.id
                )));
            }
            tokio::time::sleep(interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_read_output_leaves_partial_line() {
        let dir = tempfile::tempdir().unwrap();
        let job = BackgroundJob { id: Uuid::new_v4(), dir: dir.path().to_path_buf() };

        let empty = job.read_output(OutputStream::Stdout, 0).unwrap();
        assert_eq!(empty, OutputChunk::default());

        let mut file = std::fs::File::create(dir.path().join("out")).unwrap();
        file.write_all(b"240309070501042,one\n240309070501043,two\n2403090705").unwrap();

        let first = job.read_output(OutputStream::Stdout, 0).unwrap();
        let texts: Vec<_> = first.lines.iter().map(|l| l.text.as_str()).collect();
        assert_eq!(texts, vec!["one", "two"]);
        assert_eq!(first.next_offset, 40);

        file.write_all(b"01044,three\n").unwrap();
        let second = job.read_output(OutputStream::Stdout, first.next_offset).unwrap();
        assert_eq!(second.lines.len(), 1);
        assert_eq!(second.lines[0].text, "three");

        let none = job.read_output(OutputStream::Stdout, second.next_offset).unwrap();
        assert!(none.lines.is_empty());
        assert_eq!(none.next_offset, second.next_offset);
    }

    #[tokio::test]
    async fn test_missing_executor_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = JobLauncher::new(dir.path().join("no-executor"), dir.path().join("jobs"));
        let err = launcher.launch(JobRequest::new("true")).await.unwrap_err();
        assert_eq!(err.category(), "Process");
        assert!(launcher.job(Uuid::new_v4()).is_none());
    }

    #[test]
    fn test_request_debug_hides_password() {
        let request = JobRequest::new("pg_dump").args(["-d", "sales"]).with_password("pw!");
        let shown = format!("{request:?}");
        assert!(shown.contains("pg_dump"));
        assert!(!shown.contains("pw!"));
    }
}
