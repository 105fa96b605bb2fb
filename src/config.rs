// Evaluation configuration: defaults, TOML file, HERM_ environment, CLI overrides

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::errors::{EvalError, EvalResult};

/// Results repository used when none is configured
pub const DEFAULT_RESULTS_REPO: &str = "ai2-adapt-dev/HERM-Results";

/// Which end of an over-long prompt survives truncation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TruncationMode {
    KeepEnd,
    KeepStart,
}

/// One file inside a dataset source, tagged with the subset it belongs to.
///
/// When `subset` is `None` the subset is read from each record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFile {
    pub path: String,
    #[serde(default)]
    pub subset: Option<String>,
}

/// Where a preference dataset lives: a hub dataset repo, or a local
/// directory when `local_dir` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSource {
    pub repo_id: String,
    #[serde(default = "default_revision")]
    pub revision: String,
    #[serde(default)]
    pub local_dir: Option<PathBuf>,
    pub files: Vec<SourceFile>,
}

fn default_revision() -> String {
    "main".to_string()
}

impl DatasetSource {
    fn core_default() -> Self {
        Self {
            repo_id: "allenai/rm-eval-completions".into(),
            revision: default_revision(),
            local_dir: None,
            files: vec![SourceFile {
                path: "data/filtered-00000-of-00001.parquet".into(),
                subset: None,
            }],
        }
    }

    fn pref_sets_default() -> Self {
        let splits = [
            "anthropic_harmless",
            "anthropic_helpful",
            "anthropic_hhh",
            "mtbench_gpt4",
            "mtbench_human",
            "shp",
            "summarize",
            "summarize_prompted",
            "pku_better",
            "pku_safer",
        ];
        Self {
            repo_id: "allenai/pref-test-sets".into(),
            revision: default_revision(),
            local_dir: None,
            files: splits
                .iter()
                .map(|split| SourceFile {
                    path: format!("data/{split}-00000-of-00001.parquet"),
                    subset: Some((*split).to_string()),
                })
                .collect(),
        }
    }
}

/// Fully resolved configuration for one evaluation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalConfig {
    pub model: String,
    pub ref_model: String,
    #[serde(default)]
    pub tokenizer: Option<String>,
    pub chat_template: String,
    pub batch_size: usize,
    #[serde(default)]
    pub do_not_save: bool,
    #[serde(default)]
    pub pref_sets: bool,
    #[serde(default)]
    pub force_cpu: bool,
    pub output_path: PathBuf,
    pub results_repo: String,
    pub hub_endpoint: String,
    #[serde(default)]
    pub hf_token: Option<String>,
    pub max_length: usize,
    pub max_prompt_length: usize,
    pub truncation_mode: TruncationMode,
    pub core_set: DatasetSource,
    pub pref_sets_source: DatasetSource,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            model: "Qwen/Qwen2-0.5B-Instruct".into(),
            ref_model: "Qwen/Qwen2-0.5B".into(),
            tokenizer: None,
            chat_template: "tulu".into(),
            batch_size: 64,
            do_not_save: false,
            pref_sets: false,
            force_cpu: false,
            output_path: PathBuf::from("results/metrics.json"),
            results_repo: DEFAULT_RESULTS_REPO.into(),
            hub_endpoint: "https://huggingface.co".into(),
            hf_token: None,
            max_length: 512,
            max_prompt_length: 128,
            truncation_mode: TruncationMode::KeepEnd,
            core_set: DatasetSource::core_default(),
            pref_sets_source: DatasetSource::pref_sets_default(),
        }
    }
}

/// Values supplied on the command line. `None` leaves the file/env value in place.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CliOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ref_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokenizer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub do_not_save: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pref_sets: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub force_cpu: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_prompt_length: Option<usize>,
}

impl EvalConfig {
    /// Layer defaults, the TOML file, `HERM_*` variables and CLI overrides.
    pub fn load(config_path: &Path, overrides: &CliOverrides) -> EvalResult<Self> {
        let figment = Figment::from(Serialized::defaults(EvalConfig::default()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed("HERM_"))
            .merge(Env::raw().only(&["HF_TOKEN"]).map(|_| "hf_token".into()))
            .merge(Serialized::defaults(overrides));

        let config: EvalConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> EvalResult<()> {
        if self.batch_size == 0 {
            return Err(EvalError::validation(
                "batch_size",
                "must be greater than zero",
            ));
        }
        if self.max_prompt_length >= self.max_length {
            return Err(EvalError::validation(
                "max_prompt_length",
                format!(
                    "must be smaller than max_length ({} >= {})",
                    self.max_prompt_length, self.max_length
                ),
            ));
        }
        if !self.do_not_save && self.results_repo.trim().is_empty() {
            return Err(EvalError::validation(
                "results_repo",
                "cannot be empty when uploading results",
            ));
        }
        if self.model.trim().is_empty() || self.ref_model.trim().is_empty() {
            return Err(EvalError::validation(
                "model",
                "policy and reference model paths must be set",
            ));
        }
        Ok(())
    }

    /// Tokenizer location: the explicit override or the policy model.
    pub fn tokenizer_path(&self) -> &str {
        self.tokenizer.as_deref().unwrap_or(&self.model)
    }

    /// Resolved configuration as TOML, with the hub token redacted.
    pub fn to_toml(&self) -> EvalResult<String> {
        let mut shown = self.clone();
        if shown.hf_token.is_some() {
            shown.hf_token = Some("<redacted>".into());
        }
        toml::to_string_pretty(&shown)
            .map_err(|e| EvalError::config(format!("rendering configuration: {e}")))
    }

    /// Dataset source selected by `--pref_sets`.
    pub fn dataset_source(&self) -> &DatasetSource {
        if self.pref_sets {
            &self.pref_sets_source
        } else {
            &self.core_set
        }
    }
}
