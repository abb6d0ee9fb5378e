//! End-to-end tests of the detached executor.
//!
//! Each test launches the real `pgdeck-executor` binary through `JobLauncher` and polls
//! the job directory the way the web tier does.

#![cfg(unix)]

use pgdeck_core::process::status::{parse_status_time, EXIT_OS_ERROR};
use pgdeck_core::process::{BackgroundJob, JobLauncher, JobRequest, JobStatus, OutputStream};
use std::path::Path;
use std::process::Command;
use std::time::Duration;

const EXECUTOR: &str = env!("CARGO_BIN_EXE_pgdeck-executor");

fn launcher(root: &Path) -> JobLauncher {
    JobLauncher::new(EXECUTOR.into(), root.join("jobs"))
}

async fn finish(job: &BackgroundJob) -> JobStatus {
    job.wait(Duration::from_millis(50), Duration::from_secs(30)).await.unwrap()
}

fn texts(job: &BackgroundJob, stream: OutputStream) -> Vec<String> {
    let chunk = job.read_output(stream, 0).unwrap();
    chunk.lines.into_iter().map(|line| line.text).collect()
}

#[tokio::test]
async fn test_sleep_completes_with_empty_output() {
    let root = tempfile::tempdir().unwrap();
    let job = launcher(root.path()).launch(JobRequest::new("sleep").arg("1")).await.unwrap();

    // The launcher returns as soon as the executor detached.
    assert!(!job.status().unwrap().is_finished());

    let status = finish(&job).await;
    let JobStatus::Completed { start_time, end_time } = status else {
        panic!("unexpected status {status:?}");
    };
    assert!(start_time.unwrap() <= end_time.unwrap());

    let record = job.record().unwrap().unwrap();
    assert_eq!(record.exit_code, Some(0));
    assert!(record.pid.is_some());
    assert_eq!(std::fs::metadata(job.dir().join("out")).unwrap().len(), 0);
    assert_eq!(std::fs::metadata(job.dir().join("err")).unwrap().len(), 0);
}

#[tokio::test]
async fn test_missing_executable_records_os_error() {
    let root = tempfile::tempdir().unwrap();
    let request = JobRequest::new("/nonexistent/pgdeck-test-tool");
    let job = launcher(root.path()).launch(request).await.unwrap();

    let status = finish(&job).await;
    assert!(matches!(status, JobStatus::Failed { exit_code: EXIT_OS_ERROR, .. }));

    let err = texts(&job, OutputStream::Stderr).join("\n");
    assert!(err.contains("/nonexistent/pgdeck-test-tool"), "{err}");
    assert!(err.contains("os error"), "{err}");

    let record = job.record().unwrap().unwrap();
    let start = parse_status_time(record.start_time.as_deref().unwrap()).unwrap();
    let end = parse_status_time(record.end_time.as_deref().unwrap()).unwrap();
    assert!(start <= end);
}

#[tokio::test]
async fn test_output_lines_are_complete_and_ordered() {
    let root = tempfile::tempdir().unwrap();
    let script = "i=1; while [ $i -le 200 ]; do echo line $i; i=$((i+1)); done; echo done >&2";
    let request = JobRequest::new("sh").args(["-c", script]);
    let job = launcher(root.path()).launch(request).await.unwrap();

    assert!(matches!(finish(&job).await, JobStatus::Completed { .. }));
    let size = std::fs::metadata(job.dir().join("out")).unwrap().len();

    let chunk = job.read_output(OutputStream::Stdout, 0).unwrap();
    let expected: Vec<String> = (1..=200).map(|i| format!("line {i}")).collect();
    let got: Vec<String> = chunk.lines.iter().map(|line| line.text.clone()).collect();
    assert_eq!(got, expected);
    assert!(chunk.lines.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    assert_eq!(chunk.next_offset, size);
    assert_eq!(texts(&job, OutputStream::Stderr), vec!["done"]);

    // Nothing is appended once the terminal status is visible.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(std::fs::metadata(job.dir().join("out")).unwrap().len(), size);
}

#[tokio::test]
async fn test_password_and_quoted_arguments_reach_the_command() {
    let root = tempfile::tempdir().unwrap();
    let launcher = launcher(root.path());

    let request = JobRequest::new("sh")
        .args(["-c", "echo \"$PGPASSWORD\""])
        .with_password("s3cret pw");
    let job = launcher.launch(request).await.unwrap();
    assert!(matches!(finish(&job).await, JobStatus::Completed { .. }));
    assert_eq!(texts(&job, OutputStream::Stdout), vec!["s3cret pw"]);

    let request = JobRequest::new("printf").args(["%s\\n", "say \"hi\""]);
    let job = launcher.launch(request).await.unwrap();
    assert!(matches!(finish(&job).await, JobStatus::Completed { .. }));
    assert_eq!(texts(&job, OutputStream::Stdout), vec!["say \"hi\""]);
}

#[tokio::test]
async fn test_worker_survives_interrupts() {
    let root = tempfile::tempdir().unwrap();
    let request = JobRequest::new("sh").args(["-c", "echo $PPID >&2; sleep 2; echo done"]);
    let job = launcher(root.path()).launch(request).await.unwrap();

    // The command's parent is the detached worker.
    let mut worker = None;
    for _ in 0..100 {
        if let Some(pid) = texts(&job, OutputStream::Stderr).first() {
            worker = Some(pid.clone());
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let worker = worker.expect("worker pid not reported");

    for signal in ["-TERM", "-INT"] {
        let status = Command::new("kill").args([signal, worker.as_str()]).status().unwrap();
        assert!(status.success(), "kill {signal} {worker}");
    }

    let status = finish(&job).await;
    assert!(matches!(status, JobStatus::Completed { .. }), "{status:?}");
    assert_eq!(job.record().unwrap().unwrap().exit_code, Some(0));
    assert_eq!(texts(&job, OutputStream::Stdout), vec!["done"]);
}

#[tokio::test]
async fn test_diagnostic_log_is_written() {
    let root = tempfile::tempdir().unwrap();
    let job = launcher(root.path()).launch(JobRequest::new("true")).await.unwrap();
    finish(&job).await;

    let logs: Vec<_> = std::fs::read_dir(job.dir())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("log_"))
        .collect();
    assert_eq!(logs.len(), 1, "{logs:?}");

    let log = std::fs::read_to_string(job.dir().join(&logs[0])).unwrap();
    assert!(log.contains("Starting the process executor"));
    assert!(log.contains("Command exited"));
}

#[test]
fn test_missing_environment_fails_fast() {
    let root = tempfile::tempdir().unwrap();

    let output = Command::new(EXECUTOR)
        .arg("true")
        .env_remove("OUTDIR")
        .env("PROCID", "PGDECK_TEST")
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("OUTDIR"));

    let output = Command::new(EXECUTOR)
        .arg("true")
        .env("OUTDIR", root.path())
        .env_remove("PROCID")
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(!root.path().join("status").exists());
}
