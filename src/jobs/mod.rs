// 任务模型、注册表与调度

pub mod job;
pub mod progress;
pub mod registry;
pub mod scheduler;

pub use job::{ArtifactRole, Job, JobRequest, JobState};
pub use progress::{ChannelObserver, ProgressEvent, ProgressObserver, ProgressReporter};
pub use registry::{JobOutputs, JobRegistry};
pub use scheduler::{CancelOutcome, Scheduler};
