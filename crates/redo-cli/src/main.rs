use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "redo-batch",
    version = "0.3.0",
    about = "Run containerized refinement over a directory of datasets"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct RunArgs {
    /// YAML run file; flags below override its values.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Directory with one sub-directory per dataset.
    #[arg(short = 'i', long, aliases = ["initial-model", "initial_model"])]
    input_root: Option<PathBuf>,
    #[arg(short = 'o', long, alias = "output")]
    output_root: Option<PathBuf>,
    #[arg(short = 'n', long, aliases = ["n-procs", "n_procs"])]
    concurrency: Option<usize>,
    #[arg(long, aliases = ["data-dir", "data_dir"])]
    data_mount: Option<String>,
    #[arg(long, aliases = ["output-dir", "output_dir"])]
    output_mount: Option<String>,
    #[arg(long, aliases = ["image-path", "image_path"])]
    image: Option<String>,
    /// Container front-end executable.
    #[arg(long)]
    runtime: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    Run {
        #[command(flatten)]
        args: RunArgs,
        /// Exit with status 2 when any target failed.
        #[arg(long)]
        fail_on_job_error: bool,
        #[arg(long)]
        json: bool,
    },
    Describe {
        #[command(flatten)]
        args: RunArgs,
        #[arg(long)]
        json: bool,
    },
    Init {
        #[arg(long, default_value = "redo.yaml")]
        path: PathBuf,
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Outcome { payload, exit_code }) => {
            if let Some(payload) = payload {
                emit_json(&payload);
            }
            if exit_code != 0 {
                std::process::exit(exit_code);
            }
            Ok(())
        }
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err)));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("redo_runner=info,redo_batch=info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

struct Outcome {
    payload: Option<Value>,
    exit_code: i32,
}

impl Outcome {
    fn done() -> Self {
        Self {
            payload: None,
            exit_code: 0,
        }
    }
}

fn run_command(command: Commands) -> Result<Outcome> {
    match command {
        Commands::Run {
            args,
            fail_on_job_error,
            json,
        } => {
            let config = resolve_config(&args)?;
            let report = redo_runner::run_batch(&config)?;
            let exit_code = if fail_on_job_error && report.failed() > 0 {
                2
            } else {
                0
            };
            if json {
                let mut payload = json!({
                    "ok": true,
                    "command": "run",
                    "summary_path": redo_runner::summary_path(&config).display().to_string(),
                });
                if let Some(obj) = payload.as_object_mut() {
                    obj.insert("report".to_string(), report.to_json());
                }
                return Ok(Outcome {
                    payload: Some(payload),
                    exit_code,
                });
            }
            println!("targets: {}", report.total());
            println!("processed: {}", report.processed());
            println!("succeeded: {}", report.succeeded());
            println!("skipped: {}", report.skipped());
            println!("failed: {}", report.failed());
            for tag in report.failed_tags() {
                println!("failed_target: {}", tag);
            }
            println!(
                "summary: {}",
                redo_runner::summary_path(&config).display()
            );
            Ok(Outcome {
                payload: None,
                exit_code,
            })
        }
        Commands::Describe { args, json } => {
            let config = resolve_config(&args)?;
            let plan = redo_runner::describe_batch(&config)?;
            if json {
                return Ok(Outcome {
                    payload: Some(json!({
                        "ok": true,
                        "command": "describe",
                        "config": plan.config,
                        "to_run": plan.to_run(),
                        "to_skip": plan.to_skip(),
                        "targets": plan.targets,
                    })),
                    exit_code: 0,
                });
            }
            print_plan(&plan);
            Ok(Outcome::done())
        }
        Commands::Init { path, force } => {
            write_config_template(&path, force)?;
            println!("wrote: {}", path.display());
            println!(
                "next: edit {} and fill in the fields marked REQUIRED",
                path.display()
            );
            println!("next: redo-batch describe --config {}", path.display());
            Ok(Outcome::done())
        }
    }
}

fn resolve_config(args: &RunArgs) -> Result<redo_runner::RunConfig> {
    let mut config = match &args.config {
        Some(path) => redo_runner::load_config(path)?,
        None => redo_runner::RunConfig::default(),
    };
    if let Some(v) = &args.input_root {
        config.input_root = v.clone();
    }
    if let Some(v) = &args.output_root {
        config.output_root = v.clone();
    }
    if let Some(v) = args.concurrency {
        config.concurrency = v;
    }
    if let Some(v) = &args.data_mount {
        config.container.data_mount = v.clone();
    }
    if let Some(v) = &args.output_mount {
        config.container.output_mount = v.clone();
    }
    if let Some(v) = &args.image {
        config.container.image = v.clone();
    }
    if let Some(v) = &args.runtime {
        config.container.runtime = v.clone();
    }
    config.validate()?;
    Ok(config)
}

fn write_config_template(path: &Path, force: bool) -> Result<()> {
    if !force && path.exists() {
        return Err(anyhow!(
            "config file already exists (use --force): {}",
            path.display()
        ));
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, redo_runner::CONFIG_TEMPLATE)?;
    Ok(())
}

fn print_plan(plan: &redo_runner::BatchPlan) {
    println!("input_root: {}", plan.config.input_root.display());
    println!("output_root: {}", plan.config.output_root.display());
    println!("concurrency: {}", plan.config.concurrency);
    println!("runtime: {}", plan.config.container.runtime);
    println!("image: {}", plan.config.container.image);
    println!(
        "binds: {} {}",
        plan.config.container.data_mount, plan.config.container.output_mount
    );
    println!("targets: {}", plan.targets.len());
    println!("to_run: {}", plan.to_run());
    println!("to_skip: {}", plan.to_skip());
    for planned in &plan.targets {
        let action = match planned.action {
            redo_runner::PlannedAction::Run => "run",
            redo_runner::PlannedAction::Skip => "skip",
        };
        println!(
            "  {} [{}] xyzin={} mtzin={}",
            planned.target.tag,
            action,
            planned.target.structure.display(),
            planned.target.reflections.display()
        );
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\"}}}}"
        ),
    }
}

fn json_error(code: &str, message: String) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. } | Commands::Describe { json, .. } => *json,
        Commands::Init { .. } => false,
    }
}
