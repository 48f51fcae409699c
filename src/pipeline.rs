use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{error, info, instrument};

use crate::artifact::{ROOTFS_DIR, RuntimeArtifact, write_artifact};
use crate::assemble::{AssembledImage, AssemblyPlan, BaseLayer, StripPolicy, assemble, discard};
use crate::audit::audit_artifact;
use crate::error::{BuildError, BuildResult};
use crate::identity::{ExecutionIdentity, OwnedImage, reduce_privileges};
use crate::index::LocalIndex;
use crate::invoke::{DeclaredArtifact, EnvironmentOptions, declare_entrypoint};
use crate::materialize::{MaterializedEnvironment, materialize};
use crate::observability::MetricsCollector;
use crate::recipe::{InterpreterSpec, Recipe, ResolverSpec};
use crate::resolver::{
    CommandInstaller, EnvironmentRequest, IsolatedEnvironment, LockPins, ResolverBackend,
};
use crate::validation::validate_recipe;

/// Intermediate products of a build. Each stage takes its predecessor's slot
/// and fills its own, so nothing reads back from a later stage.
#[derive(Debug, Default)]
pub struct BuildArtifact {
    pub isolated: Option<IsolatedEnvironment>,
    pub materialized: Option<MaterializedEnvironment>,
    pub assembled: Option<AssembledImage>,
    pub owned: Option<OwnedImage>,
    pub declared: Option<DeclaredArtifact>,
}

fn take<T>(slot: &mut Option<T>, stage: &str) -> BuildResult<T> {
    slot.take().ok_or_else(|| {
        BuildError::Configuration(format!("stage '{stage}' ran before its input was produced"))
    })
}

#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub output_dir: PathBuf,
    pub staging_dir: PathBuf,
}

pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;
    fn run(&self, artifact: &mut BuildArtifact, ctx: &PipelineContext) -> BuildResult<()>;
}

pub struct ResolveStage {
    request: EnvironmentRequest,
}

impl Stage for ResolveStage {
    fn name(&self) -> &'static str {
        "resolve"
    }

    fn run(&self, artifact: &mut BuildArtifact, _ctx: &PipelineContext) -> BuildResult<()> {
        artifact.isolated = Some(self.request.build()?);
        Ok(())
    }
}

pub struct MaterializeStage {
    prefix: String,
}

impl Stage for MaterializeStage {
    fn name(&self) -> &'static str {
        "materialize"
    }

    fn run(&self, artifact: &mut BuildArtifact, _ctx: &PipelineContext) -> BuildResult<()> {
        let isolated = take(&mut artifact.isolated, self.name())?;
        artifact.materialized = Some(materialize(isolated, &self.prefix)?);
        Ok(())
    }
}

pub struct AssembleStage {
    plan: AssemblyPlan,
}

impl Stage for AssembleStage {
    fn name(&self) -> &'static str {
        "assemble"
    }

    fn run(&self, artifact: &mut BuildArtifact, _ctx: &PipelineContext) -> BuildResult<()> {
        let materialized = take(&mut artifact.materialized, self.name())?;
        artifact.assembled = Some(assemble(materialized, &self.plan)?);
        Ok(())
    }
}

pub struct ReducePrivilegesStage {
    identity: ExecutionIdentity,
}

impl Stage for ReducePrivilegesStage {
    fn name(&self) -> &'static str {
        "reduce-privileges"
    }

    fn run(&self, artifact: &mut BuildArtifact, _ctx: &PipelineContext) -> BuildResult<()> {
        let assembled = take(&mut artifact.assembled, self.name())?;
        artifact.owned = Some(reduce_privileges(assembled, &self.identity)?);
        Ok(())
    }
}

pub struct DeclareEntrypointStage {
    options: EnvironmentOptions,
}

impl Stage for DeclareEntrypointStage {
    fn name(&self) -> &'static str {
        "declare-entrypoint"
    }

    fn run(&self, artifact: &mut BuildArtifact, _ctx: &PipelineContext) -> BuildResult<()> {
        let owned = take(&mut artifact.owned, self.name())?;
        artifact.declared = Some(declare_entrypoint(owned, &self.options)?);
        Ok(())
    }
}

/// A recipe with every path resolved and every value checked.
#[derive(Debug, Clone)]
pub struct BuildPlan {
    pub request: EnvironmentRequest,
    pub prefix: String,
    pub assembly: AssemblyPlan,
    pub identity: ExecutionIdentity,
    pub options: EnvironmentOptions,
    pub output_dir: PathBuf,
}

impl BuildPlan {
    pub fn from_recipe(recipe: &Recipe, base_dir: &Path, pins: Option<LockPins>) -> BuildResult<Self> {
        let report = validate_recipe(recipe);
        if !report.is_ok() {
            return Err(BuildError::Configuration(report.errors.join("; ")));
        }

        let identity = ExecutionIdentity::new(
            &recipe.identity.user,
            recipe.identity.uid,
            recipe.identity.gid,
        )?;
        let backend = match &recipe.resolver {
            ResolverSpec::LocalIndex { path } => {
                ResolverBackend::LocalIndex(LocalIndex::open(&base_dir.join(path))?)
            }
            ResolverSpec::Command { program, args } => ResolverBackend::Command(CommandInstaller {
                program: program.clone(),
                args: args.clone(),
            }),
        };
        let interpreter = InterpreterSpec {
            name: recipe.interpreter.name.clone(),
            version: recipe.interpreter.version.clone(),
            distribution: base_dir.join(&recipe.interpreter.distribution),
        };

        let output_dir = recipe.output_dir(base_dir);
        let assembly = AssemblyPlan {
            entrypoint: recipe.entrypoint_path(base_dir),
            workdir: recipe.workdir.clone(),
            base: BaseLayer {
                reference: recipe.base.reference.parse()?,
                path: base_dir.join(&recipe.base.path),
            },
            base_path: recipe.environment.base_path.clone(),
            strip: StripPolicy::new(&recipe.strip)?,
            staging_dir: partial_dir(&output_dir),
        };

        Ok(Self {
            request: EnvironmentRequest {
                manifest_path: recipe.manifest_path(base_dir),
                interpreter,
                backend,
                build_tools: recipe.build_tools.clone(),
                pins,
            },
            prefix: recipe.environment.prefix.clone(),
            assembly,
            identity,
            options: EnvironmentOptions::from_spec(&recipe.environment)?,
            output_dir,
        })
    }
}

/// `<output>.partial`, the directory a build writes before promotion.
pub fn partial_dir(output_dir: &Path) -> PathBuf {
    let mut name = output_dir
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("artifact"));
    name.push(".partial");
    output_dir.with_file_name(name)
}

pub struct PipelineExecutor {
    stages: Vec<Box<dyn Stage>>,
    ctx: PipelineContext,
    build_tools: Vec<String>,
    metrics: MetricsCollector,
}

impl PipelineExecutor {
    pub fn new(stages: Vec<Box<dyn Stage>>, ctx: PipelineContext, build_tools: Vec<String>) -> Self {
        Self {
            stages,
            ctx,
            build_tools,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    #[instrument(skip(self, artifact))]
    fn process(&self, artifact: &mut BuildArtifact) -> BuildResult<()> {
        for stage in &self.stages {
            let span = tracing::span!(tracing::Level::INFO, "stage", stage = stage.name());
            let _span_guard = span.enter();
            let _timer = self.metrics.start_stage(stage.name());
            stage.run(artifact, &self.ctx)?;
        }
        Ok(())
    }

    /// Run every stage, audit the result and promote it to the output
    /// directory. On any failure the partial output is removed and the
    /// previous artifact, if any, is left untouched.
    pub fn execute(&self) -> BuildResult<PipelineResult> {
        self.metrics.reset();
        let total_start = Instant::now();
        discard(&self.ctx.staging_dir);

        let mut artifact = BuildArtifact::default();
        let outcome = self
            .process(&mut artifact)
            .and_then(|()| self.finalize(&mut artifact));
        // Drop every intermediate (and the first-stage context) before cleanup.
        drop(artifact);

        self.metrics.record_total_duration(total_start.elapsed());
        match outcome {
            Ok(result) => {
                self.metrics.record_success();
                Ok(result)
            }
            Err(err) => {
                self.metrics.record_failure();
                discard(&self.ctx.staging_dir);
                error!(kind = err.kind(), "Build failed: {err}");
                Err(err)
            }
        }
    }

    fn finalize(&self, artifact: &mut BuildArtifact) -> BuildResult<PipelineResult> {
        let declared = take(&mut artifact.declared, "finalize")?;
        let rootfs = self.ctx.staging_dir.join(ROOTFS_DIR);
        audit_artifact(&rootfs, &declared.config, &self.build_tools)?.into_result()?;

        let mut written = write_artifact(&declared, &self.ctx.staging_dir)?;
        let image = &declared.owned.image;
        self.metrics
            .record_files(image.files_copied, image.stripped.len());

        promote(&self.ctx.staging_dir, &self.ctx.output_dir)?;
        written.dir = self.ctx.output_dir.clone();
        info!(
            output = %self.ctx.output_dir.display(),
            artifact = %written.artifact_id,
            "Artifact promoted"
        );
        Ok(PipelineResult { artifact: written })
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.metrics.clone()
    }
}

fn promote(staging_dir: &Path, output_dir: &Path) -> BuildResult<()> {
    if output_dir.exists() {
        fs::remove_dir_all(output_dir).map_err(|err| {
            BuildError::io(format!("Failed to replace {}", output_dir.display()), err)
        })?;
    }
    fs::rename(staging_dir, output_dir).map_err(|err| {
        BuildError::io(format!("Failed to promote {}", staging_dir.display()), err)
    })
}

#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub artifact: RuntimeArtifact,
}

pub fn build_pipeline(plan: BuildPlan) -> PipelineExecutor {
    let ctx = PipelineContext {
        output_dir: plan.output_dir.clone(),
        staging_dir: plan.assembly.staging_dir.clone(),
    };
    let build_tools = plan.request.build_tools.clone();
    let stages: Vec<Box<dyn Stage>> = vec![
        Box::new(ResolveStage {
            request: plan.request,
        }),
        Box::new(MaterializeStage {
            prefix: plan.prefix,
        }),
        Box::new(AssembleStage {
            plan: plan.assembly,
        }),
        Box::new(ReducePrivilegesStage {
            identity: plan.identity,
        }),
        Box::new(DeclareEntrypointStage {
            options: plan.options,
        }),
    ];
    PipelineExecutor::new(stages, ctx, build_tools)
}
