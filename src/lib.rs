pub mod artifact;
pub mod assemble;
pub mod audit;
pub mod error;
pub mod identity;
pub mod index;
pub mod invoke;
pub mod lockfile;
pub mod manifest;
pub mod materialize;
pub mod observability;
pub mod pipeline;
pub mod presets;
pub mod recipe;
pub mod resolver;
pub mod security;
pub mod tree;
pub mod validation;
pub mod version;

pub use error::{BuildError, BuildResult};
pub use pipeline::{BuildPlan, PipelineExecutor, PipelineResult, build_pipeline};
pub use recipe::Recipe;
