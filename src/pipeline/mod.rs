// 分离流水线

pub mod fallback;
pub mod layout;
pub mod runner;
pub mod stages;

pub use fallback::select_best_vocal;
pub use layout::OutputLayout;
pub use runner::{Engines, JobOutcome, PipelineRunner};
