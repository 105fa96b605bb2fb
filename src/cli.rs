use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use crate::config::{CliOverrides, EvalConfig};
use crate::eval_runner::run_evaluation;
use crate::logging::init_logging;

/// Command-line interface for DPO reward evaluation
#[derive(Parser, Debug)]
#[command(
    name = "herm_dpo",
    version,
    about = "Evaluate a causal LM as a DPO implicit reward model on preference pairs"
)]
pub struct Cli {
    /// Path to the policy model (local directory or hub repo id)
    #[arg(long)]
    pub model: Option<String>,

    /// Path to the reference model (local directory or hub repo id)
    #[arg(long = "ref_model")]
    pub ref_model: Option<String>,

    /// Path to a non-matching tokenizer
    #[arg(long)]
    pub tokenizer: Option<String>,

    /// Chat template name
    #[arg(long = "chat_template")]
    pub chat_template: Option<String>,

    /// Do not upload results to the hub (for debugging)
    #[arg(long = "do_not_save")]
    pub do_not_save: bool,

    /// Batch size for inference
    #[arg(long = "batch_size")]
    pub batch_size: Option<usize>,

    /// Run on common preference sets instead of the core evaluation set
    #[arg(long = "pref_sets")]
    pub pref_sets: bool,

    /// Configuration file
    #[arg(long, default_value = "herm.toml")]
    pub config: PathBuf,

    /// Local results file
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Maximum tokens per prompt + completion
    #[arg(long = "max_length")]
    pub max_length: Option<usize>,

    /// Maximum prompt tokens kept when truncating
    #[arg(long = "max_prompt_length")]
    pub max_prompt_length: Option<usize>,

    /// Run on CPU even when an accelerator is available
    #[arg(long)]
    pub cpu: bool,

    /// Print the resolved configuration and exit
    #[arg(long = "show_config")]
    pub show_config: bool,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Flags that override file and environment configuration.
    ///
    /// Boolean flags only override when set, so `do_not_save = true` in the
    /// config file is not undone by omitting the flag.
    pub fn overrides(&self) -> CliOverrides {
        CliOverrides {
            model: self.model.clone(),
            ref_model: self.ref_model.clone(),
            tokenizer: self.tokenizer.clone(),
            chat_template: self.chat_template.clone(),
            batch_size: self.batch_size,
            do_not_save: self.do_not_save.then_some(true),
            pref_sets: self.pref_sets.then_some(true),
            force_cpu: self.cpu.then_some(true),
            output_path: self.output.clone(),
            max_length: self.max_length,
            max_prompt_length: self.max_prompt_length,
        }
    }
}

/// Set up logging, resolve configuration and run the evaluation.
pub fn run(cli: &Cli) -> Result<()> {
    init_logging(cli.verbose);

    let config = EvalConfig::load(&cli.config, &cli.overrides())
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;

    if cli.show_config {
        println!("{}", config.to_toml()?);
        return Ok(());
    }

    run_evaluation(&config).context("reward model evaluation failed")?;
    Ok(())
}
