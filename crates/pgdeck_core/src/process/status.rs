//! On-disk status record of a background job.
//!
//! The record lives in `D/status` as a JSON object holding `start_time`, `end_time`,
//! `exit_code` and `pid` as they become known. It is rewritten wholesale through a
//! temporary file and a rename, so a poller never sees a torn write.

use crate::error::{PgDeckError, PgDeckResult};
use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

/// File name of the status record inside a job directory.
pub const STATUS_FILE: &str = "status";

/// Time format of `start_time` and `end_time`.
pub const STATUS_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f %z";

/// Exit code recorded when the command could not be run because of an OS error.
pub const EXIT_OS_ERROR: i32 = 500;

/// Exit code recorded for any other executor failure.
pub const EXIT_INTERNAL_ERROR: i32 = 501;

/// Current UTC time in status format.
pub fn status_time_now() -> String {
    format_status_time(Utc::now())
}

pub fn format_status_time(time: DateTime<Utc>) -> String {
    time.format(STATUS_TIME_FORMAT).to_string()
}

pub fn parse_status_time(text: &str) -> Option<JobTime> {
    DateTime::parse_from_str(text, STATUS_TIME_FORMAT).ok()
}

/// Contents of `D/status`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

impl StatusRecord {
    /// Whether the job has finished.
    pub fn is_terminal(&self) -> bool {
        self.exit_code.is_some()
    }

    /// Read the record of a job directory, `None` before the first write.
    pub fn read(dir: &Path) -> PgDeckResult<Option<Self>> {
        let path = dir.join(STATUS_FILE);
        match std::fs::read_to_string(&path) {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Writes the status record of one job.
#[derive(Debug)]
pub struct StatusPersister {
    path: PathBuf,
    record: StatusRecord,
}

impl StatusPersister {
    pub fn new(dir: &Path) -> Self {
        Self { path: dir.join(STATUS_FILE), record: StatusRecord::default() }
    }

    pub fn record(&self) -> &StatusRecord {
        &self.record
    }

    /// Record a (re)start by process `pid`.
    pub fn started(&mut self, pid: u32) -> PgDeckResult<()> {
        self.ensure_open()?;
        self.record.start_time = Some(status_time_now());
        self.record.pid = Some(pid);
        self.write()
    }

    /// Record the terminal state. The record is immutable afterwards.
    pub fn finished(&mut self, exit_code: i32) -> PgDeckResult<()> {
        self.ensure_open()?;
        self.record.end_time = Some(status_time_now());
        self.record.exit_code = Some(exit_code);
        self.write()
    }

    fn ensure_open(&self) -> PgDeckResult<()> {
        if self.record.is_terminal() {
            return Err(PgDeckError::process(format!(
                "Status of {} is already terminal",
                self.path.display()
            )));
        }
        Ok(())
    }

    fn write(&self) -> PgDeckResult<()> {
        let json = serde_json::to_vec(&self.record)?;
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        tracing::debug!(status = %String::from_utf8_lossy(&json), "Status updated");
        Ok(())
    }
}

/// Timestamp read back from a status record.
pub type JobTime = DateTime<FixedOffset>;

/// Lifecycle state of a job as seen by a poller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    /// No status written yet
    Spawning,
    Running { pid: u32, start_time: Option<JobTime> },
    /// Command exited with code 0
    Completed { start_time: Option<JobTime>, end_time: Option<JobTime> },
    /// Command exited non-zero, was killed, or could not be run
    Failed { exit_code: i32, end_time: Option<JobTime> },
}

impl JobStatus {
    pub fn from_record(record: Option<&StatusRecord>) -> Self {
        let Some(record) = record else {
            return Self::Spawning;
        };
        let start_time = record.start_time.as_deref().and_then(parse_status_time);
        let end_time = record.end_time.as_deref().and_then(parse_status_time);
        match (record.exit_code, record.pid) {
            (Some(0), _) => Self::Completed { start_time, end_time },
            (Some(exit_code), _) => Self::Failed { exit_code, end_time },
            (None, Some(pid)) => Self::Running { pid, start_time },
            (None, None) => Self::Spawning,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_status_time_format() {
        let time = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap()
            + chrono::Duration::microseconds(42);
        let text = format_status_time(time);
        assert_eq!(text, "2024-03-09 07:05:01.000042 +0000");
        assert_eq!(parse_status_time(&text).unwrap(), time);
    }

    #[test]
    fn test_persister_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let mut persister = StatusPersister::new(dir.path());
        assert_eq!(StatusRecord::read(dir.path()).unwrap(), None);

        persister.started(10).unwrap();
        let on_disk = StatusRecord::read(dir.path()).unwrap().unwrap();
        assert_eq!(on_disk.pid, Some(10));
        assert!(on_disk.end_time.is_none());
        let status = JobStatus::from_record(Some(&on_disk));
        assert!(matches!(status, JobStatus::Running { pid: 10, .. }));

        persister.started(11).unwrap();
        persister.finished(3).unwrap();
        let on_disk = StatusRecord::read(dir.path()).unwrap().unwrap();
        assert_eq!(on_disk.pid, Some(11));
        assert_eq!(on_disk.exit_code, Some(3));
        assert!(!dir.path().join("status.tmp").exists());

        let start = parse_status_time(on_disk.start_time.as_deref().unwrap()).unwrap();
        let end = parse_status_time(on_disk.end_time.as_deref().unwrap()).unwrap();
        assert!(start <= end);

        // Terminal records are immutable.
        assert!(persister.finished(0).is_err());
        assert!(persister.started(12).is_err());
        assert_eq!(StatusRecord::read(dir.path()).unwrap().unwrap(), on_disk);
    }

    #[test]
    fn test_status_json_keys() {
        let record = StatusRecord { pid: Some(4), exit_code: Some(0), ..Default::default() };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value, serde_json::json!({ "pid": 4, "exit_code": 0 }));
        assert!(matches!(JobStatus::from_record(Some(&record)), JobStatus::Completed { .. }));
        assert_eq!(JobStatus::from_record(None), JobStatus::Spawning);

        let killed = StatusRecord { exit_code: Some(-9), ..record };
        assert!(matches!(
            JobStatus::from_record(Some(&killed)),
            JobStatus::Failed { exit_code: -9, .. }
        ));
    }
}
