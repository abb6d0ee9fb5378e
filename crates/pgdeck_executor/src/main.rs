//! pgdeck-executor - runs one background job detached from the web server.
//!
//! Usage: `OUTDIR=<job dir> PROCID=<password variable> pgdeck-executor <program> [args...]`
//!
//! Exit status 0 means the job was handed to a detached process; its outcome is in
//! `$OUTDIR/status`. Exit status 1 means the job could not be started at all.

use pgdeck_core::logging::init_job_logging;
use pgdeck_core::process::{
    abandon_job, isolate_from_interrupts, platform_detacher, run_job, Detachment, JobSpec,
};
use std::process::ExitCode;

fn main() -> ExitCode {
    let spec = match JobSpec::from_env() {
        Ok(spec) => spec,
        Err(e) => {
            eprintln!("pgdeck-executor: {e}");
            return ExitCode::FAILURE;
        }
    };

    // The log is named after the first executor process and shared with its fork.
    let log_path = spec.log_path(std::process::id());
    if let Err(e) = init_job_logging(&log_path) {
        eprintln!("pgdeck-executor: cannot open {}: {e}", log_path.display());
        return ExitCode::FAILURE;
    }
    tracing::info!(pid = std::process::id(), ?spec, "Starting the process executor");

    if let Err(e) = isolate_from_interrupts() {
        tracing::error!(error = %e, "Failed to install the interrupt handlers");
        return ExitCode::FAILURE;
    }

    match platform_detacher().detach(&spec) {
        Ok(Detachment::Launcher { child_pid }) => {
            tracing::info!(child_pid, "[PARENT] Exiting");
            return ExitCode::SUCCESS;
        }
        Ok(Detachment::Worker) => {}
        Err(e) => {
            tracing::error!(error = %e, "Failed to detach");
            return ExitCode::FAILURE;
        }
    }

    // Built only after the fork: a runtime's threads would not survive it.
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "Failed to create the tokio runtime");
            let reason = format!("Failed to create the tokio runtime: {e}");
            if let Err(e) = abandon_job(&spec, &reason) {
                tracing::error!(error = %e, "Failed to record the job status");
            }
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run_job(spec)) {
        Ok(exit_code) => {
            tracing::info!(exit_code, "Bye");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to record the job status");
            ExitCode::FAILURE
        }
    }
}
