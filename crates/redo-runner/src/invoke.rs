use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing::info;

use crate::config::RunConfig;
use crate::discovery::Target;

/// Everything needed to launch the refinement container for one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSpec {
    pub tag: String,
    pub runtime: String,
    pub data_mount: String,
    pub output_mount: String,
    pub image: String,
    pub structure: PathBuf,
    pub reflections: PathBuf,
    pub output_location: PathBuf,
}

impl JobSpec {
    pub fn for_target(config: &RunConfig, target: &Target) -> Self {
        Self {
            tag: target.tag.clone(),
            runtime: config.container.runtime.clone(),
            data_mount: config.container.data_mount.clone(),
            output_mount: config.container.output_mount.clone(),
            image: config.container.image.clone(),
            structure: target.structure.clone(),
            reflections: target.reflections.clone(),
            output_location: config.output_location(&target.tag),
        }
    }

    /// Program followed by its arguments.
    pub fn argv(&self) -> Vec<String> {
        vec![
            self.runtime.clone(),
            "run".to_string(),
            "--bind".to_string(),
            self.data_mount.clone(),
            "--bind".to_string(),
            self.output_mount.clone(),
            self.image.clone(),
            "--local".to_string(),
            format!("--xyzin={}", self.structure.display()),
            format!("--mtzin={}", self.reflections.display()),
            format!("--dirout={}", self.output_location.display()),
        ]
    }

    pub fn command_line(&self) -> String {
        shell_join(&self.argv())
    }
}

/// Captured result of one launch attempt. Stream contents are kept as the
/// raw bytes the tool wrote.
#[derive(Debug, Clone)]
pub struct Feedback {
    pub command: String,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// `None` when the process was killed by a signal or never started.
    pub exit_code: Option<i32>,
    pub launch_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl Feedback {
    pub fn succeeded(&self) -> bool {
        self.launch_error.is_none() && self.exit_code == Some(0)
    }

    pub fn status_label(&self) -> String {
        if self.launch_error.is_some() {
            return "launch_failed".to_string();
        }
        match self.exit_code {
            Some(code) => code.to_string(),
            None => "signal".to_string(),
        }
    }

    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }

    /// Bytes persisted as the feedback sidecar. Both streams are copied
    /// verbatim under their own headers.
    pub fn render(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(format!("command: {}\n", self.command).as_bytes());
        out.extend_from_slice(format!("exit_status: {}\n", self.status_label()).as_bytes());
        if let Some(err) = &self.launch_error {
            out.extend_from_slice(format!("launch_error: {}\n", err).as_bytes());
        }
        push_section(&mut out, "----- stdout -----\n", &self.stdout);
        push_section(&mut out, "----- stderr -----\n", &self.stderr);
        out
    }
}

fn push_section(out: &mut Vec<u8>, header: &str, body: &[u8]) {
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(body);
    if !body.is_empty() && !body.ends_with(b"\n") {
        out.push(b'\n');
    }
}

/// Runs one job to completion. Implementations must be shareable across
/// worker threads.
pub trait Invoker: Sync {
    fn invoke(&self, spec: &JobSpec) -> Feedback;
}

/// Launches the configured container front-end as a child process.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContainerInvoker;

impl Invoker for ContainerInvoker {
    fn invoke(&self, spec: &JobSpec) -> Feedback {
        run_job(spec)
    }
}

/// Blocks until the child exits. Any exit code is accepted here; a launch
/// failure is folded into the returned feedback instead of an error.
pub fn run_job(spec: &JobSpec) -> Feedback {
    let argv = spec.argv();
    let command = shell_join(&argv);
    info!(dataset = %spec.tag, command = %command, "running command");

    let started_at = Utc::now();
    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..]);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    match cmd.output() {
        Ok(output) => Feedback {
            command,
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.status.code(),
            launch_error: None,
            started_at,
            finished_at: Utc::now(),
        },
        Err(e) => Feedback {
            command,
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit_code: None,
            launch_error: Some(format!("failed to launch {}: {}", argv[0], e)),
            started_at,
            finished_at: Utc::now(),
        },
    }
}

fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}
