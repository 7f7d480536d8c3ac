//! Training support: optimizer configuration and the differentiation pass.

mod config;
mod differentiate;

pub use config::TrainingConfig;
pub use differentiate::differentiate;
