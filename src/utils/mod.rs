//! Shared helpers

mod logger;
mod timer;

pub use logger::init_logger;
pub use timer::StepTimings;
