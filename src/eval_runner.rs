//! End-to-end evaluation run: dataset, tokenization, batched DPO inference,
//! grouping, local save and optional upload.

use std::path::Path;

use candle_core::Device;
use chrono::Utc;
use tracing::info;

use crate::collator::{batches, num_batches, DpoCollator};
use crate::config::EvalConfig;
use crate::conversation::Conversation;
use crate::dataset::load_eval_dataset;
use crate::dpo::{DpoInference, LABEL_PAD_TOKEN_ID};
use crate::errors::EvalResult;
use crate::hub::{commit_message, results_path_in_repo, HubClient};
use crate::logging::batch_progress;
use crate::model::{dtype_for, load_causal_lm, select_device, ModelFiles};
use crate::results::EvalResults;
use crate::tokenize::{tokenize_row, HfTokenizer, TokenEncoder, TokenizeOptions, TokenizedPair};

/// Load the tokenizer from a local directory or a hub model repo.
pub fn load_tokenizer(path_or_repo: &str, hub: &HubClient) -> EvalResult<HfTokenizer> {
    let dir = Path::new(path_or_repo);
    if dir.is_dir() {
        let config = dir.join("tokenizer_config.json");
        return HfTokenizer::from_files(
            &dir.join("tokenizer.json"),
            config.exists().then_some(config.as_path()),
        );
    }

    let tokenizer = hub.model_file(path_or_repo, "tokenizer.json")?;
    let config = hub.model_file(path_or_repo, "tokenizer_config.json").ok();
    HfTokenizer::from_files(&tokenizer, config.as_deref())
}

/// Score every pair in dataset order; 1 where the chosen reward wins.
pub fn score_pairs(
    dpo: &mut DpoInference,
    collator: &DpoCollator,
    pairs: &[TokenizedPair],
    batch_size: usize,
    device: &Device,
) -> EvalResult<Vec<u8>> {
    let total = num_batches(pairs.len(), batch_size);
    let pb = batch_progress(total);
    let mut outcomes = Vec::with_capacity(pairs.len());

    for (step, chunk) in batches(pairs, batch_size).enumerate() {
        info!("RM inference step {step}/{total}");
        let batch = collator.collate(chunk, device)?;
        let rewards = dpo.inference_step(&batch)?;
        outcomes.extend(rewards.outcomes());
        pb.inc(1);
    }

    pb.finish_and_clear();
    Ok(outcomes)
}

/// Tokenize all formatted pairs with one encoder.
pub fn tokenize_dataset(
    encoder: &dyn TokenEncoder,
    pairs: &[crate::dataset::FormattedPair],
    opts: &TokenizeOptions,
) -> EvalResult<Vec<TokenizedPair>> {
    pairs
        .iter()
        .map(|pair| tokenize_row(encoder, pair, opts))
        .collect()
}

/// Run a full evaluation described by `config`.
pub fn run_evaluation(config: &EvalConfig) -> EvalResult<EvalResults> {
    let started = Utc::now();
    info!(
        "Running reward model on {} with chat template {}",
        config.model, config.chat_template
    );

    let conv = Conversation::from_name(&config.chat_template)?;
    let hub = HubClient::new(config.hub_endpoint.clone(), config.hf_token.clone())?;

    info!("*** Load dataset ***");
    let tokenizer = load_tokenizer(config.tokenizer_path(), &hub)?;
    let dataset = load_eval_dataset(config.dataset_source(), &conv, &hub)?;

    info!("*** Load reward model ***");
    let device = select_device(config.force_cpu);
    let dtype = dtype_for(&device);
    let policy = load_causal_lm(&ModelFiles::resolve(&config.model, &hub)?, dtype, &device)?;
    let reference = load_causal_lm(&ModelFiles::resolve(&config.ref_model, &hub)?, dtype, &device)?;
    let mut dpo = DpoInference::new(policy, reference);

    let opts = TokenizeOptions {
        max_length: config.max_length,
        max_prompt_length: config.max_prompt_length,
        truncation_mode: config.truncation_mode,
    };
    let tokenized = tokenize_dataset(&tokenizer, &dataset.pairs, &opts)?;
    let collator = DpoCollator::new(tokenizer.pad_token_id(), LABEL_PAD_TOKEN_ID);

    let outcomes = score_pairs(&mut dpo, &collator, &tokenized, config.batch_size, &device)?;
    let results = EvalResults::from_outcomes(
        &config.model,
        &config.chat_template,
        &outcomes,
        &dataset.subsets,
    )?;

    for line in results.summary_lines() {
        println!("{line}");
    }

    results.save(&config.output_path)?;

    if !config.do_not_save {
        let url = hub.upload_file(
            &config.output_path,
            &results_path_in_repo(&config.model, config.pref_sets),
            &config.results_repo,
            &commit_message(&config.model),
        )?;
        info!("Uploaded reward model scores to {url}");
    }

    let elapsed = Utc::now() - started;
    info!(
        pairs = outcomes.len(),
        seconds = elapsed.num_seconds(),
        "Evaluation complete"
    );
    Ok(results)
}
