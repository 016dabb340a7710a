//! Pipeline engine: fetch or claim emails, fan them out to a fixed worker
//! pool through a bounded queue, and count what got delivered.

pub mod mailer;
pub mod pipeline;
mod worker;

pub use mailer::SimulatedMailer;
pub use pipeline::{FetchStrategy, Pipeline, PipelineConfig, RunError, RunSummary};
