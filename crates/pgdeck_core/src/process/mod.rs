//! Background jobs run by the detached `pgdeck-executor`.
//!
//! - `detach` - Leaving the launcher's process group and session
//! - `executor` - Running one command and recording its outcome
//! - `stream_logger` - Timestamped capture of stdout and stderr
//! - `status` - The on-disk status record
//! - `launcher` - Starting jobs and polling them from the web tier
//!
//! Layout of a job directory `D`: `D/out`, `D/err`, `D/status` and one diagnostic log
//! `D/log_<pid>` per executor process.

pub mod detach;
pub mod executor;
pub mod launcher;
pub mod status;
pub mod stream_logger;

pub use detach::{isolate_from_interrupts, platform_detacher, Detacher, Detachment};
#[cfg(unix)]
pub use detach::PosixDetacher;
#[cfg(windows)]
pub use detach::WindowsDetacher;
pub use executor::{abandon_job, run_job, JobSpec, ProcessError};
pub use launcher::{BackgroundJob, JobLauncher, JobRequest, OutputChunk};
pub use status::{JobStatus, StatusPersister, StatusRecord, EXIT_INTERNAL_ERROR, EXIT_OS_ERROR};
pub use stream_logger::{OutputLine, OutputStream, StreamLogger};
