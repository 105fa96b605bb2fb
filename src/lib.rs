//! Library root for the `herm_dpo` crate
//! Scores preference pairs with a policy/reference model pair via DPO implicit rewards

// Core error handling
pub mod errors;

// Configuration & CLI
pub mod cli;
pub mod config;
pub mod logging;

// Data preparation
pub mod conversation;
pub mod dataset;
pub mod tokenize;
pub mod collator;

// Models & inference
pub mod dpo;
pub mod model;

// Hub access, results & the end-to-end run
pub mod eval_runner;
pub mod hub;
pub mod results;

#[cfg(test)]
mod tests {
    pub mod config;
    pub mod pipeline;
    pub mod test_utils;
}

pub use config::EvalConfig;
pub use dpo::{DpoInference, StepRewards};
pub use errors::{EvalError, EvalResult};
pub use eval_runner::run_evaluation;
pub use results::EvalResults;
