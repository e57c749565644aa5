//! CLI command definitions for swe-kiln.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use crate::builder::BuildConfig;
use crate::error::DatasetError;
use crate::pipeline::{run_build, run_validate_single, PipelineConfig};
use crate::tables::DEFAULT_REGISTRY;

/// Default HuggingFace dataset holding the benchmark instances.
const DEFAULT_DATASET: &str = "R2E-Gym/SWE-Bench-Verified";

/// Default per-step validation timeout in seconds.
const DEFAULT_VALIDATION_TIMEOUT_SECS: u64 = 600;

/// Build and validate reproducible benchmark Docker images.
#[derive(Parser)]
#[command(name = "swe-kiln")]
#[command(about = "Build and validate program-repair benchmark Docker images")]
#[command(version)]
#[command(
    long_about = "swe-kiln builds the three-tier (base -> env -> instance) Docker images that \
package one program-repair benchmark instance each, and gates dataset acceptance with a \
two-step differential validation: declared fail-to-pass tests must fail on the buggy commit \
and pass once the gold patch is applied, while pass-to-pass tests must pass in both states.\n\n\
Example usage:\n  swe-kiln build --limit 5 --validate\n  swe-kiln validate namanjain12/sympy_final:abc123 --instance-id sympy__sympy-12345"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Build Docker images from a HuggingFace dataset.
    ///
    /// Images are built in 3 tiers for maximum layer reuse: one base image
    /// per architecture, one env image per distinct dependency spec, and
    /// one instance image per bug-bearing commit.
    Build(BuildArgs),

    /// Validate a single already-built image with the two-step
    /// fail-to-pass / pass-to-pass checks.
    Validate(ValidateArgs),
}

/// Arguments for the build command.
#[derive(Parser, Debug)]
pub struct BuildArgs {
    /// HuggingFace dataset name.
    #[arg(long, default_value = DEFAULT_DATASET)]
    pub dataset: String,

    /// Dataset split.
    #[arg(long, default_value = "test")]
    pub split: String,

    /// Docker registry prefix for image names.
    #[arg(long, env = "R2E_DOCKER_REGISTRY", default_value = DEFAULT_REGISTRY)]
    pub registry: String,

    /// Parallel workers for env and instance builds.
    #[arg(long, default_value = "4")]
    pub max_workers: usize,

    /// Force rebuild even if images already exist.
    #[arg(long)]
    pub force_rebuild: bool,

    /// Max number of instances to build.
    #[arg(long)]
    pub limit: Option<usize>,

    /// Comma-separated instance IDs to build.
    #[arg(long)]
    pub instance_ids: Option<String>,

    /// Run two-step validation after building.
    #[arg(long)]
    pub validate: bool,

    /// Timeout per validation step (seconds).
    #[arg(long, default_value_t = DEFAULT_VALIDATION_TIMEOUT_SECS)]
    pub validation_timeout: u64,

    /// Save build logs/scripts/Dockerfile for ALL builds (not just failures).
    #[arg(long)]
    pub verbose_logs: bool,

    /// Push images that pass every gate to the registry.
    #[arg(long)]
    pub push: bool,

    /// Root directory for logs and outcome records.
    #[arg(long, default_value = "output/swe_kiln")]
    pub output_dir: PathBuf,
}

/// Arguments for the validate command.
#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Docker image name to validate.
    pub image: String,

    /// Instance ID for looking up test expectations.
    #[arg(long)]
    pub instance_id: String,

    /// HuggingFace dataset name.
    #[arg(long, default_value = DEFAULT_DATASET)]
    pub dataset: String,

    /// Dataset split.
    #[arg(long, default_value = "test")]
    pub split: String,

    /// Docker registry prefix (used for key derivation in reports).
    #[arg(long, env = "R2E_DOCKER_REGISTRY", default_value = DEFAULT_REGISTRY)]
    pub registry: String,

    /// Timeout per validation step (seconds).
    #[arg(long, default_value_t = DEFAULT_VALIDATION_TIMEOUT_SECS)]
    pub timeout: u64,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before
/// running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parse arguments and run the selected command.
pub async fn run() -> anyhow::Result<ExitCode> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with already-parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.command {
        Commands::Build(args) => run_build_command(args).await,
        Commands::Validate(args) => run_validate_command(args).await,
    }
}

async fn run_build_command(args: BuildArgs) -> anyhow::Result<ExitCode> {
    let instance_ids = args
        .instance_ids
        .map(|csv| csv.split(',').map(|s| s.trim().to_string()).collect());

    let config = PipelineConfig {
        dataset: args.dataset,
        split: args.split,
        registry: args.registry,
        limit: args.limit,
        instance_ids,
        build: BuildConfig {
            max_workers: args.max_workers,
            force_rebuild: args.force_rebuild,
            verbose_logs: args.verbose_logs,
            output_dir: args.output_dir,
        },
        validate: args.validate,
        validation_timeout: args.validation_timeout,
        push: args.push,
    };

    let summary = run_build(&config).await?;

    println!("Build summary:");
    println!("  total instances : {}", summary.total);
    println!("  built           : {}", summary.built);
    println!("  build failed    : {}", summary.build_failed);
    if config.validate {
        println!("  validated pass  : {}", summary.validated_passed);
        println!("  validated fail  : {}", summary.validated_failed);
        if summary.validated_failed > 0 {
            return Ok(ExitCode::from(1));
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_validate_command(args: ValidateArgs) -> anyhow::Result<ExitCode> {
    let result = run_validate_single(
        &args.image,
        &args.instance_id,
        &args.dataset,
        &args.split,
        &args.registry,
        args.timeout,
    )
    .await;

    match result {
        Ok(validation) => {
            println!("{}", validation.detailed_log());
            if validation.passed {
                println!("Validation PASSED");
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::from(1))
            }
        }
        Err(e) => {
            if matches!(
                e.downcast_ref::<DatasetError>(),
                Some(DatasetError::InstanceNotFound(_))
            ) {
                error!(instance = %args.instance_id, "instance not found in dataset");
                return Ok(ExitCode::from(2));
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_build_args_defaults() {
        let cli = Cli::parse_from(["swe-kiln", "build"]);
        match cli.command {
            Commands::Build(args) => {
                assert_eq!(args.dataset, DEFAULT_DATASET);
                assert_eq!(args.split, "test");
                assert_eq!(args.max_workers, 4);
                assert_eq!(args.validation_timeout, 600);
                assert!(!args.force_rebuild);
                assert!(!args.validate);
            }
            _ => panic!("expected build command"),
        }
    }

    #[test]
    fn test_validate_args() {
        let cli = Cli::parse_from([
            "swe-kiln",
            "validate",
            "reg/sympy_final:abc",
            "--instance-id",
            "sympy__sympy-1",
            "--timeout",
            "120",
        ]);
        match cli.command {
            Commands::Validate(args) => {
                assert_eq!(args.image, "reg/sympy_final:abc");
                assert_eq!(args.instance_id, "sympy__sympy-1");
                assert_eq!(args.timeout, 120);
            }
            _ => panic!("expected validate command"),
        }
    }

    #[test]
    fn test_instance_ids_csv_split() {
        let cli = Cli::parse_from([
            "swe-kiln",
            "build",
            "--instance-ids",
            "a__1, b__2,c__3",
        ]);
        match cli.command {
            Commands::Build(args) => {
                let ids: Vec<String> = args
                    .instance_ids
                    .unwrap()
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .collect();
                assert_eq!(ids, vec!["a__1", "b__2", "c__3"]);
            }
            _ => panic!("expected build command"),
        }
    }
}
