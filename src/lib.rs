// vocalsplit - 多阶段人声分离任务流水线

pub mod audio;
pub mod config;
pub mod error;
pub mod jobs;
pub mod logging;
pub mod models;
pub mod pipeline;
pub mod utils;

pub use config::AppConfig;
pub use error::{AppError, AppResult, ErrorKind, JobError};
pub use jobs::{ArtifactRole, CancelOutcome, Job, JobState, ProgressEvent, Scheduler};
pub use models::{FsModelRegistry, ModelRegistry, ResolvedModel};
pub use pipeline::{Engines, PipelineRunner};
