use anyhow::{anyhow, Context, Result};
use glob::Pattern;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_RUNTIME: &str = "singularity";
pub const DEFAULT_IMAGE: &str = "/pdbredo/pdbredo.simg";
pub const DEFAULT_DATA_MOUNT: &str = "/data";
pub const DEFAULT_OUTPUT_MOUNT: &str = "/output";
pub const DEFAULT_STRUCTURE_GLOB: &str = "*.pdb";
pub const DEFAULT_REFLECTIONS_GLOB: &str = "*.mtz";
pub const DEFAULT_COMPLETION_MARKER: &str = "*_final.pdb";
pub const DEFAULT_FEEDBACK_FILE: &str = "feedback.txt";

/// Immutable run configuration, built once and shared by reference with every
/// worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub input_root: PathBuf,
    pub output_root: PathBuf,
    pub concurrency: usize,
    pub container: ContainerConfig,
    pub patterns: PatternConfig,
    pub feedback_file: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Container front-end executable, invoked as `<runtime> run ...`.
    pub runtime: String,
    pub image: String,
    pub data_mount: String,
    pub output_mount: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternConfig {
    pub structure: String,
    pub reflections: String,
    pub completion_marker: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            input_root: PathBuf::new(),
            output_root: PathBuf::new(),
            concurrency: 1,
            container: ContainerConfig::default(),
            patterns: PatternConfig::default(),
            feedback_file: DEFAULT_FEEDBACK_FILE.to_string(),
        }
    }
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            runtime: DEFAULT_RUNTIME.to_string(),
            image: DEFAULT_IMAGE.to_string(),
            data_mount: DEFAULT_DATA_MOUNT.to_string(),
            output_mount: DEFAULT_OUTPUT_MOUNT.to_string(),
        }
    }
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            structure: DEFAULT_STRUCTURE_GLOB.to_string(),
            reflections: DEFAULT_REFLECTIONS_GLOB.to_string(),
            completion_marker: DEFAULT_COMPLETION_MARKER.to_string(),
        }
    }
}

/// File-name patterns compiled once per run.
#[derive(Debug, Clone)]
pub struct CompiledPatterns {
    pub structure: Pattern,
    pub reflections: Pattern,
    pub completion_marker: Pattern,
}

impl RunConfig {
    pub fn new(input_root: impl Into<PathBuf>, output_root: impl Into<PathBuf>) -> Self {
        Self {
            input_root: input_root.into(),
            output_root: output_root.into(),
            ..Self::default()
        }
    }

    /// Reports every invalid field in one error rather than stopping at the
    /// first.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        if self.input_root.as_os_str().is_empty() {
            problems.push("input_root is required".to_string());
        }
        if self.output_root.as_os_str().is_empty() {
            problems.push("output_root is required".to_string());
        }
        if self.concurrency == 0 {
            problems.push("concurrency must be at least 1".to_string());
        }
        for (field, value) in [
            ("container.runtime", &self.container.runtime),
            ("container.image", &self.container.image),
            ("container.data_mount", &self.container.data_mount),
            ("container.output_mount", &self.container.output_mount),
        ] {
            if value.trim().is_empty() {
                problems.push(format!("{} must not be empty", field));
            }
        }
        if self.feedback_file.trim().is_empty()
            || self.feedback_file.contains('/')
            || self.feedback_file.contains('\\')
        {
            problems.push(format!(
                "feedback_file must be a plain file name (got '{}')",
                self.feedback_file
            ));
        }
        if self.feedback_file == crate::driver::JOB_RECORD_FILE {
            problems.push(format!(
                "feedback_file must not be '{}'; that name holds the job record",
                crate::driver::JOB_RECORD_FILE
            ));
        }
        for (field, value) in [
            ("patterns.structure", &self.patterns.structure),
            ("patterns.reflections", &self.patterns.reflections),
            ("patterns.completion_marker", &self.patterns.completion_marker),
        ] {
            if let Err(e) = Pattern::new(value) {
                problems.push(format!("{} is not a valid glob '{}': {}", field, value, e));
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(anyhow!(
                "invalid run configuration:\n{}",
                problems
                    .iter()
                    .map(|p| format!("  - {}", p))
                    .collect::<Vec<_>>()
                    .join("\n")
            ))
        }
    }

    pub fn compile_patterns(&self) -> Result<CompiledPatterns> {
        Ok(CompiledPatterns {
            structure: Pattern::new(&self.patterns.structure)
                .with_context(|| format!("patterns.structure: {}", self.patterns.structure))?,
            reflections: Pattern::new(&self.patterns.reflections)
                .with_context(|| format!("patterns.reflections: {}", self.patterns.reflections))?,
            completion_marker: Pattern::new(&self.patterns.completion_marker).with_context(
                || format!("patterns.completion_marker: {}", self.patterns.completion_marker),
            )?,
        })
    }

    pub fn output_location(&self, tag: &str) -> PathBuf {
        self.output_root.join(tag)
    }

    fn resolve_relative_to(&mut self, base: &Path) {
        if !self.input_root.as_os_str().is_empty() && self.input_root.is_relative() {
            self.input_root = base.join(&self.input_root);
        }
        if !self.output_root.as_os_str().is_empty() && self.output_root.is_relative() {
            self.output_root = base.join(&self.output_root);
        }
    }
}

/// Loads a YAML run file. Relative roots are resolved against the file's
/// directory.
pub fn load_config(path: &Path) -> Result<RunConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read run config {}", path.display()))?;
    let mut config: RunConfig = serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse run config {}", path.display()))?;
    let base = path.parent().unwrap_or(Path::new("."));
    config.resolve_relative_to(base);
    Ok(config)
}

pub const CONFIG_TEMPLATE: &str = "\
# redo-batch run configuration
input_root: ''                  # REQUIRED: one sub-directory per dataset
output_root: ''                 # REQUIRED: <output_root>/<dataset> is recreated per job
concurrency: 1
container:
  runtime: singularity
  image: /pdbredo/pdbredo.simg
  data_mount: /data
  output_mount: /output
patterns:
  structure: '*.pdb'
  reflections: '*.mtz'
  completion_marker: '*_final.pdb'
feedback_file: feedback.txt
";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::scratch_dir;

    #[test]
    fn template_parses_to_defaults_apart_from_roots() {
        let parsed: RunConfig = serde_yaml::from_str(CONFIG_TEMPLATE).expect("template parses");
        assert_eq!(parsed, RunConfig::default());
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let parsed: RunConfig = serde_yaml::from_str(
            "input_root: /in\noutput_root: /out\ncontainer:\n  image: other.simg\n",
        )
        .expect("parse");
        assert_eq!(parsed.container.image, "other.simg");
        assert_eq!(parsed.container.runtime, DEFAULT_RUNTIME);
        assert_eq!(parsed.patterns.structure, DEFAULT_STRUCTURE_GLOB);
        assert_eq!(parsed.concurrency, 1);
        parsed.validate().expect("valid");
    }

    #[test]
    fn validate_reports_all_problems() {
        let config = RunConfig {
            concurrency: 0,
            container: ContainerConfig {
                image: " ".to_string(),
                ..ContainerConfig::default()
            },
            patterns: PatternConfig {
                structure: "[".to_string(),
                ..PatternConfig::default()
            },
            feedback_file: "nested/feedback.txt".to_string(),
            ..RunConfig::default()
        };
        let msg = config.validate().expect_err("should fail").to_string();
        assert!(msg.contains("input_root"), "{}", msg);
        assert!(msg.contains("output_root"), "{}", msg);
        assert!(msg.contains("concurrency"), "{}", msg);
        assert!(msg.contains("container.image"), "{}", msg);
        assert!(msg.contains("patterns.structure"), "{}", msg);
        assert!(msg.contains("feedback_file"), "{}", msg);
        assert!(!msg.contains("container.runtime"), "{}", msg);
    }

    #[test]
    fn feedback_file_cannot_shadow_job_record() {
        let mut config = RunConfig::new("/in", "/out");
        config.feedback_file = "job.json".to_string();
        let msg = config.validate().expect_err("should fail").to_string();
        assert!(msg.contains("job record"), "{}", msg);

        config.feedback_file = "refine.log".to_string();
        config.validate().expect("valid");
    }

    #[test]
    fn load_config_resolves_relative_roots() {
        let dir = scratch_dir("config_relative");
        let path = dir.join("run.yaml");
        fs::write(&path, "input_root: inputs\noutput_root: /abs/out\nconcurrency: 4\n")
            .expect("write");
        let config = load_config(&path).expect("load");
        assert_eq!(config.input_root, dir.join("inputs"));
        assert_eq!(config.output_root, PathBuf::from("/abs/out"));
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.output_location("ds1"), PathBuf::from("/abs/out/ds1"));
        let _ = fs::remove_dir_all(dir);
    }
}
