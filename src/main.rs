use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use serde_json::to_writer_pretty;
use slimstage::artifact::{load_config, verify_artifact};
use slimstage::lockfile::{generate_lock, load_lock};
use slimstage::observability::{MetricsSnapshot, log_snapshot};
use slimstage::pipeline::{BuildPlan, build_pipeline};
use slimstage::presets::generate_preset;
use slimstage::recipe::Recipe;
use slimstage::security::{compute_sha256, generate_sbom, write_sha256};
use slimstage::validation::{ValidationReport, validate_context, validate_recipe};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

#[cfg(feature = "otel")]
use opentelemetry::KeyValue;
#[cfg(feature = "otel")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "otel")]
use opentelemetry_sdk::{resource::Resource, trace as sdktrace};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let otlp_endpoint_for_tracing = match &cli.command {
        Commands::Build { otlp_endpoint, .. } => otlp_endpoint.clone(),
        _ => None,
    };

    configure_tracing(otlp_endpoint_for_tracing.as_deref())?;

    let command_result: Result<()> = match cli.command {
        Commands::Build {
            recipe,
            locked,
            dry_run,
            print_metrics,
            metrics_json,
            metrics_prometheus,
            otlp_endpoint: _,
        } => build_recipe(
            recipe,
            locked,
            dry_run,
            MetricsOutputs {
                print: print_metrics,
                json: metrics_json,
                prometheus: metrics_prometheus,
            },
        ),
        Commands::Validate { recipe } => validate_recipe_cmd(recipe),
        Commands::Lock { recipe, output } => lock_recipe(recipe, output),
        Commands::Verify { artifact } => verify_artifact_cmd(&artifact),
        Commands::Inspect { artifact } => inspect_artifact(&artifact),
        Commands::Recipe { action } => recipe_command(action),
        Commands::Security { action } => security_command(action),
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "slimstage", &mut io::stdout());
            Ok(())
        }
    };

    #[cfg(feature = "otel")]
    if otlp_endpoint_for_tracing.is_some() {
        opentelemetry::global::shutdown_tracer_provider();
    }

    command_result
}

fn configure_tracing(otlp_endpoint: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(io::stderr);

    #[cfg(feature = "otel")]
    {
        if let Some(endpoint) = otlp_endpoint {
            let tracer =
                opentelemetry_otlp::new_pipeline()
                    .tracing()
                    .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(
                        vec![KeyValue::new("service.name", "slimstage")],
                    )))
                    .with_exporter(
                        opentelemetry_otlp::new_exporter()
                            .tonic()
                            .with_endpoint(endpoint),
                    )
                    .install_simple()?;

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
        } else {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
        }
    }

    #[cfg(not(feature = "otel"))]
    {
        if let Some(endpoint) = otlp_endpoint {
            eprintln!(
                "warning: --otlp-endpoint '{}' requested but OpenTelemetry support is not enabled. Rebuild with --features otel.",
                endpoint
            );
        }

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()
            .map_err(|err| anyhow!(err.to_string()))?;
    }

    Ok(())
}

struct MetricsOutputs {
    print: bool,
    json: Option<PathBuf>,
    prometheus: Option<PathBuf>,
}

impl MetricsOutputs {
    fn requested(&self) -> bool {
        self.print || self.json.is_some() || self.prometheus.is_some()
    }

    fn emit(&self, snapshot: &MetricsSnapshot) -> Result<()> {
        if self.print {
            log_snapshot(snapshot);
        }
        if let Some(path) = &self.json {
            create_parent(path, "metrics")?;
            let file = File::create(path)
                .with_context(|| format!("Failed to create metrics file: {}", path.display()))?;
            to_writer_pretty(file, snapshot)
                .with_context(|| format!("Failed to write metrics JSON: {}", path.display()))?;
            info!(metrics = %path.display(), "Metrics JSON written");
        }
        if let Some(path) = &self.prometheus {
            create_parent(path, "metrics")?;
            fs::write(path, snapshot.to_prometheus()).with_context(|| {
                format!("Failed to write Prometheus metrics: {}", path.display())
            })?;
            info!(metrics = %path.display(), "Prometheus metrics written");
        }
        Ok(())
    }
}

fn create_parent(path: &Path, what: &str) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {what} directory: {}", parent.display()))?;
    }
    Ok(())
}

fn build_recipe(
    recipe_path: PathBuf,
    locked: Option<PathBuf>,
    dry_run: bool,
    metrics: MetricsOutputs,
) -> Result<()> {
    let recipe = Recipe::load(&recipe_path)?;
    let base_dir = Recipe::base_dir(&recipe_path);

    let report = validate_recipe(&recipe);
    for warning in &report.warnings {
        warn!(file = %recipe_path.display(), "{warning}");
    }

    let pins = match &locked {
        Some(lock_path) => {
            let lock = load_lock(lock_path)?;
            lock.check_recipe(&recipe)?;
            info!(lockfile = %lock_path.display(), packages = lock.packages.len(), "Using lockfile");
            Some(lock.pins())
        }
        None => {
            warn!(
                file = %recipe_path.display(),
                "No lockfile given; unpinned requirements resolve to the newest matching version"
            );
            None
        }
    };

    let plan = BuildPlan::from_recipe(&recipe, &base_dir, pins)?;
    let executor = build_pipeline(plan);

    if dry_run {
        info!(
            stages = ?executor.stage_names(),
            output = %recipe.output_dir(&base_dir).display(),
            "Recipe loaded; dry run, nothing built"
        );
        return Ok(());
    }

    let metrics_handle = executor.metrics();
    let outcome = executor.execute();
    if metrics.requested() {
        metrics.emit(&metrics_handle.snapshot())?;
    }
    let result = outcome?;

    let artifact = &result.artifact;
    info!(
        artifact = %artifact.artifact_id,
        output = %artifact.dir.display(),
        packages = artifact.report.packages.len(),
        "Build completed"
    );
    println!("{}  {}", artifact.artifact_id, artifact.dir.display());
    Ok(())
}

fn report_validation(recipe_path: &Path, report: &ValidationReport) {
    for warning in &report.warnings {
        warn!(file = %recipe_path.display(), "{warning}");
    }
    for error_msg in &report.errors {
        error!(file = %recipe_path.display(), "{error_msg}");
    }
}

fn validate_recipe_cmd(recipe_path: PathBuf) -> Result<()> {
    let recipe = Recipe::load(&recipe_path)?;
    let base_dir = Recipe::base_dir(&recipe_path);
    let mut report = validate_recipe(&recipe);
    report.merge(validate_context(&recipe, &base_dir));
    report_validation(&recipe_path, &report);

    if report.is_ok() {
        info!(file = %recipe_path.display(), "Recipe validation passed");
        Ok(())
    } else {
        Err(anyhow!(
            "Recipe validation failed with {} error(s)",
            report.errors.len()
        ))
    }
}

fn lock_recipe(recipe_path: PathBuf, output_path: PathBuf) -> Result<()> {
    let recipe = Recipe::load(&recipe_path)?;
    let base_dir = Recipe::base_dir(&recipe_path);
    let report = validate_recipe(&recipe);
    report_validation(&recipe_path, &report);

    if !report.is_ok() {
        return Err(anyhow!(
            "Cannot generate lockfile due to {} validation error(s)",
            report.errors.len()
        ));
    }

    create_parent(&output_path, "lockfile")?;
    let lock = generate_lock(&recipe, &base_dir, &output_path)?;
    info!(
        lockfile = %output_path.display(),
        packages = lock.packages.len(),
        "Lockfile generated successfully"
    );

    Ok(())
}

fn verify_artifact_cmd(artifact: &Path) -> Result<()> {
    let audit = verify_artifact(artifact)?;
    if audit.is_clean() {
        println!("{}: ok", artifact.display());
        return Ok(());
    }
    for violation in &audit.violations {
        error!(artifact = %artifact.display(), "{violation}");
    }
    bail!(
        "Artifact verification failed with {} violation(s)",
        audit.violations.len()
    )
}

fn inspect_artifact(artifact: &Path) -> Result<()> {
    let config = load_config(artifact)?;
    to_writer_pretty(io::stdout().lock(), &config).context("Failed to print runtime config")?;
    println!();
    Ok(())
}

fn recipe_command(command: RecipeCommands) -> Result<()> {
    match command {
        RecipeCommands::New { preset, output } => {
            let destination =
                output.unwrap_or_else(|| PathBuf::from(format!("recipes/{preset}.yaml")));
            let generated = generate_preset(&preset, &destination)?;
            info!(
                preset = %preset,
                path = %generated.display(),
                "Preset recipe generated"
            );
            Ok(())
        }
        RecipeCommands::Lint { recipes } => lint_recipes(&recipes),
    }
}

fn lint_recipes(recipes: &[PathBuf]) -> Result<()> {
    if recipes.is_empty() {
        bail!("No recipe files supplied for linting");
    }

    let mut failures = 0usize;

    for recipe_path in recipes {
        match Recipe::load(recipe_path) {
            Ok(recipe) => {
                let report = validate_recipe(&recipe);
                report_validation(recipe_path, &report);
                if report.is_ok() {
                    info!(file = %recipe_path.display(), "Lint passed");
                } else {
                    failures += 1;
                }
            }
            Err(err) => {
                failures += 1;
                error!(file = %recipe_path.display(), "Failed to load recipe: {err}");
            }
        }
    }

    if failures > 0 {
        bail!("Lint failed for {failures} recipe(s)");
    }

    info!("All recipe lint checks passed");
    Ok(())
}

fn security_command(command: SecurityCommands) -> Result<()> {
    match command {
        SecurityCommands::Sbom { artifact, output } => {
            generate_sbom(&artifact, &output)?;
            info!(sbom = %output.display(), "SBOM generated");
            Ok(())
        }
        SecurityCommands::Digest { path, output } => {
            if let Some(out_path) = output {
                let digest = write_sha256(&path, &out_path)?;
                println!("{}  {}", digest, path.display());
                info!(
                    file = %path.display(),
                    digest_output = %out_path.display(),
                    "SHA256 digest written"
                );
            } else {
                let digest = compute_sha256(&path)?;
                println!("{}  {}", digest, path.display());
                info!(file = %path.display(), "SHA256 computed");
            }
            Ok(())
        }
    }
}

#[derive(Parser)]
#[command(
    name = "slimstage",
    version,
    about = "Two-stage builder for minimal, non-root runtime artifacts"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the artifact described by a recipe.
    Build {
        recipe: PathBuf,
        #[arg(long)]
        locked: Option<PathBuf>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        print_metrics: bool,
        #[arg(long = "metrics-json")]
        metrics_json: Option<PathBuf>,
        #[arg(long = "metrics-prometheus")]
        metrics_prometheus: Option<PathBuf>,
        #[arg(long = "otlp-endpoint")]
        otlp_endpoint: Option<String>,
    },
    Validate {
        recipe: PathBuf,
    },
    Lock {
        recipe: PathBuf,
        output: PathBuf,
    },
    /// Re-run the audit on a finished artifact directory.
    Verify {
        artifact: PathBuf,
    },
    /// Print an artifact's runtime config.
    Inspect {
        artifact: PathBuf,
    },
    Recipe {
        #[command(subcommand)]
        action: RecipeCommands,
    },
    Security {
        #[command(subcommand)]
        action: SecurityCommands,
    },
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum RecipeCommands {
    New {
        #[arg(long)]
        preset: String,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    Lint {
        #[arg(required = true)]
        recipes: Vec<PathBuf>,
    },
}

#[derive(Subcommand)]
enum SecurityCommands {
    Sbom {
        #[arg(long)]
        artifact: PathBuf,
        #[arg(long)]
        output: PathBuf,
    },
    Digest {
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        output: Option<PathBuf>,
    },
}
