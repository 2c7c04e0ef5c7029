//! Batch driver for containerized structure refinement.
//!
//! Datasets are discovered under an input root (one sub-directory each, with a
//! structure file and a reflection-data file), then each dataset without a
//! finished result gets a fresh `<output_root>/<dataset>` directory, one run of
//! the refinement container, and a `feedback.txt` with the captured output.

mod config;
mod discovery;
mod driver;
mod invoke;
mod workspace;

pub use config::{
    load_config, CompiledPatterns, ContainerConfig, PatternConfig, RunConfig, CONFIG_TEMPLATE,
};
pub use discovery::{discover_targets, DiscoveryError, Target, TargetSet};
pub use driver::{
    plan_targets, run_targets, BatchReport, PlannedAction, PlannedTarget, TargetOutcome,
    TargetStatus, JOB_RECORD_FILE,
};
pub use invoke::{run_job, ContainerInvoker, Feedback, Invoker, JobSpec};
pub use workspace::{is_complete, reset_output_location, OutputSpaceError};

use anyhow::Result;
use std::path::PathBuf;
use tracing::{info, warn};

pub const RUN_SUMMARY_FILE: &str = "run_summary.json";

/// Dry-run result: the resolved config and what would happen to each target.
#[derive(Debug)]
pub struct BatchPlan {
    pub config: RunConfig,
    pub targets: Vec<PlannedTarget>,
}

impl BatchPlan {
    pub fn to_run(&self) -> usize {
        self.targets
            .iter()
            .filter(|t| t.action == PlannedAction::Run)
            .count()
    }

    pub fn to_skip(&self) -> usize {
        self.targets.len() - self.to_run()
    }
}

pub fn run_batch(config: &RunConfig) -> Result<BatchReport> {
    run_batch_with(config, &ContainerInvoker)
}

/// Discovers targets and drives every one of them through `invoker`.
///
/// Only configuration and discovery problems are returned as errors; job
/// failures end up in the report.
pub fn run_batch_with(config: &RunConfig, invoker: &dyn Invoker) -> Result<BatchReport> {
    config.validate()?;
    let patterns = config.compile_patterns()?;
    let targets = discover_targets(&config.input_root, &patterns)?;
    info!(
        input_root = %config.input_root.display(),
        output_root = %config.output_root.display(),
        targets = targets.len(),
        concurrency = config.concurrency,
        "starting batch"
    );

    let report = run_targets(config, &patterns, &targets, invoker);

    let summary_path = summary_path(config);
    if let Err(e) = workspace::atomic_write_json_pretty(&summary_path, &report.to_json()) {
        warn!(path = %summary_path.display(), error = %e, "could not write run summary");
    }
    info!(
        processed = report.processed(),
        skipped = report.skipped(),
        failed = report.failed(),
        "batch finished"
    );
    if report.failed() > 0 {
        warn!(failed = ?report.failed_tags(), "some targets failed");
    }
    Ok(report)
}

/// Discovery plus completion checks, without touching any output location.
pub fn describe_batch(config: &RunConfig) -> Result<BatchPlan> {
    config.validate()?;
    let patterns = config.compile_patterns()?;
    let targets = discover_targets(&config.input_root, &patterns)?;
    Ok(BatchPlan {
        config: config.clone(),
        targets: plan_targets(config, &patterns, &targets),
    })
}

pub fn summary_path(config: &RunConfig) -> PathBuf {
    config.output_root.join(RUN_SUMMARY_FILE)
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::invoke::{Feedback, Invoker, JobSpec};
    use chrono::Utc;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    pub fn scratch_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "redo_{}_{}_{}",
            label,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("scratch dir");
        dir
    }

    /// Records which targets were invoked and mimics the container: writes a
    /// final model into the output location when `exit_code` is zero.
    pub struct RecordingInvoker {
        exit_code: i32,
        calls: Mutex<Vec<String>>,
    }

    impl RecordingInvoker {
        pub fn new(exit_code: i32) -> Self {
            Self {
                exit_code,
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn calls(&self) -> Vec<String> {
            let mut calls = self.calls.lock().expect("calls").clone();
            calls.sort();
            calls
        }
    }

    impl Invoker for RecordingInvoker {
        fn invoke(&self, spec: &JobSpec) -> Feedback {
            self.calls.lock().expect("calls").push(spec.tag.clone());
            assert!(spec.output_location.is_dir(), "output location not prepared");
            assert_eq!(
                fs::read_dir(&spec.output_location).expect("read").count(),
                0,
                "output location not empty before invoke"
            );
            if self.exit_code == 0 {
                fs::write(
                    spec.output_location.join(format!("{}_final.pdb", spec.tag)),
                    "ATOM",
                )
                .expect("final model");
            }
            let now = Utc::now();
            Feedback {
                command: spec.command_line(),
                stdout: format!("refined {}\n", spec.tag).into_bytes(),
                stderr: Vec::new(),
                exit_code: Some(self.exit_code),
                launch_error: None,
                started_at: now,
                finished_at: now,
            }
        }
    }

    /// Shell script standing in for the container front-end. Echoes its
    /// arguments, writes to stderr, creates `<dirout>/<name>_final.pdb` and
    /// exits with `exit_code`.
    #[cfg(unix)]
    pub fn fake_runtime(dir: &Path, exit_code: i32) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-runtime.sh");
        let script = format!(
            "#!/bin/sh\n\
             echo \"args: $*\"\n\
             echo \"refinement warning\" 1>&2\n\
             for a in \"$@\"; do\n\
             \x20 case \"$a\" in --dirout=*) d=\"${{a#--dirout=}}\";; esac\n\
             done\n\
             touch \"$d/$(basename \"$d\")_final.pdb\"\n\
             exit {}\n",
            exit_code
        );
        fs::write(&path, script).expect("script");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
        path
    }
}
