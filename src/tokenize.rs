//! Tokenization of formatted preference pairs into DPO model inputs.

use std::path::Path;

use serde_json::Value;
use tokenizers::Tokenizer;
use tracing::debug;

use crate::config::TruncationMode;
use crate::dataset::FormattedPair;
use crate::dpo::LABEL_PAD_TOKEN_ID;
use crate::errors::{EvalError, EvalResult};

/// Text-to-id encoding plus the special tokens DPO tokenization needs.
pub trait TokenEncoder {
    /// Encode without adding special tokens.
    fn encode(&self, text: &str) -> EvalResult<Vec<u32>>;
    fn bos_token_id(&self) -> Option<u32>;
    fn eos_token_id(&self) -> u32;
    fn pad_token_id(&self) -> u32;
}

/// A `tokenizer.json` tokenizer with its special token ids resolved.
pub struct HfTokenizer {
    tokenizer: Tokenizer,
    bos: Option<u32>,
    eos: u32,
    pad: u32,
}

const BOS_CANDIDATES: [&str; 3] = ["<s>", "<|begin_of_text|>", "<bos>"];
const EOS_CANDIDATES: [&str; 5] = ["</s>", "<|endoftext|>", "<|end_of_text|>", "<|im_end|>", "<eos>"];

/// A special-token entry of `tokenizer_config.json`.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SpecialToken {
    /// Key missing, or no config at all.
    Unset,
    /// Key present but null: the tokenizer has no such token.
    Disabled,
    Named(String),
}

fn special_token(config: Option<&Value>, key: &str) -> SpecialToken {
    match config.and_then(|c| c.get(key)) {
        None => SpecialToken::Unset,
        Some(Value::String(s)) => SpecialToken::Named(s.clone()),
        Some(Value::Object(map)) => match map.get("content").and_then(Value::as_str) {
            Some(content) => SpecialToken::Named(content.to_string()),
            None => SpecialToken::Disabled,
        },
        Some(_) => SpecialToken::Disabled,
    }
}

impl HfTokenizer {
    /// Load `tokenizer.json`, reading special tokens from `tokenizer_config.json`
    /// when one is given.
    pub fn from_files(tokenizer_path: &Path, config_path: Option<&Path>) -> EvalResult<Self> {
        let tokenizer = Tokenizer::from_file(tokenizer_path).map_err(|e| {
            EvalError::tokenizer(format!("loading {}: {e}", tokenizer_path.display()))
        })?;

        let config: Option<Value> = match config_path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .map_err(|e| EvalError::io(format!("reading {}", path.display()), e))?;
                Some(serde_json::from_str(&text).map_err(|e| {
                    EvalError::serialization(format!("parsing {}", path.display()), e)
                })?)
            }
            None => None,
        };

        Self::from_tokenizer(tokenizer, config.as_ref())
    }

    pub fn from_tokenizer(tokenizer: Tokenizer, config: Option<&Value>) -> EvalResult<Self> {
        let lookup = |configured: SpecialToken, candidates: &[&str]| -> Option<u32> {
            let fallback = || candidates.iter().find_map(|t| tokenizer.token_to_id(t));
            match configured {
                SpecialToken::Disabled => None,
                SpecialToken::Named(token) => tokenizer.token_to_id(&token).or_else(fallback),
                SpecialToken::Unset => fallback(),
            }
        };

        let bos = lookup(special_token(config, "bos_token"), &BOS_CANDIDATES);
        let eos = lookup(special_token(config, "eos_token"), &EOS_CANDIDATES)
            .ok_or_else(|| EvalError::tokenizer("tokenizer has no EOS token"))?;
        let pad = lookup(special_token(config, "pad_token"), &[]).unwrap_or(eos);

        debug!(?bos, eos, pad, "Resolved special tokens");
        Ok(Self {
            tokenizer,
            bos,
            eos,
            pad,
        })
    }
}

impl TokenEncoder for HfTokenizer {
    fn encode(&self, text: &str) -> EvalResult<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| EvalError::tokenizer(format!("encoding text: {e}")))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn bos_token_id(&self) -> Option<u32> {
        self.bos
    }

    fn eos_token_id(&self) -> u32 {
        self.eos
    }

    fn pad_token_id(&self) -> u32 {
        self.pad
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenizeOptions {
    pub max_length: usize,
    pub max_prompt_length: usize,
    pub truncation_mode: TruncationMode,
}

/// One side (chosen or rejected) of a tokenized pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizedSequence {
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
    pub labels: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizedPair {
    pub chosen: TokenizedSequence,
    pub rejected: TokenizedSequence,
}

/// Split the encoding of `prompt + answer` into prompt ids and answer ids.
///
/// When a token spans the prompt/answer boundary the prompt prefix of the
/// full encoding differs from the standalone prompt encoding; the boundary
/// then moves back by one token.
fn build_tokenized_answer(
    encoder: &dyn TokenEncoder,
    prompt_ids: &[u32],
    full_text: &str,
) -> EvalResult<(Vec<u32>, Vec<u32>)> {
    let full_ids = encoder.encode(full_text)?;
    let mut start = prompt_ids.len().min(full_ids.len());
    if full_ids[..start] != prompt_ids[..start] || start < prompt_ids.len() {
        start = start.saturating_sub(1);
    }
    Ok((full_ids[..start].to_vec(), full_ids[start..].to_vec()))
}

fn truncate(ids: &mut Vec<u32>, keep: usize, mode: TruncationMode) {
    if ids.len() <= keep {
        return;
    }
    match mode {
        TruncationMode::KeepStart => ids.truncate(keep),
        TruncationMode::KeepEnd => {
            ids.drain(..ids.len() - keep);
        }
    }
}

fn assemble(prompt: &[u32], answer: &[u32]) -> TokenizedSequence {
    let input_ids: Vec<u32> = prompt.iter().chain(answer).copied().collect();
    let mut labels: Vec<i64> = input_ids.iter().map(|&id| id as i64).collect();
    for label in labels.iter_mut().take(prompt.len()) {
        *label = LABEL_PAD_TOKEN_ID;
    }
    TokenizedSequence {
        attention_mask: vec![1; input_ids.len()],
        input_ids,
        labels,
    }
}

/// Tokenize a formatted pair into chosen/rejected inputs with prompt-masked labels.
pub fn tokenize_row(
    encoder: &dyn TokenEncoder,
    pair: &FormattedPair,
    opts: &TokenizeOptions,
) -> EvalResult<TokenizedPair> {
    let prompt_ids = encoder.encode(&pair.prompt)?;
    let (mut chosen_prompt, mut chosen_answer) =
        build_tokenized_answer(encoder, &prompt_ids, &pair.text_chosen)?;
    let (mut rejected_prompt, mut rejected_answer) =
        build_tokenized_answer(encoder, &prompt_ids, &pair.text_rejected)?;

    if let Some(bos) = encoder.bos_token_id() {
        for prompt in [&mut chosen_prompt, &mut rejected_prompt] {
            if prompt.first() != Some(&bos) {
                prompt.insert(0, bos);
            }
        }
    }
    let eos = encoder.eos_token_id();
    for answer in [&mut chosen_answer, &mut rejected_answer] {
        if answer.last() != Some(&eos) {
            answer.push(eos);
        }
    }

    let longer_answer = chosen_answer.len().max(rejected_answer.len());
    let prompt_len = chosen_prompt.len().max(rejected_prompt.len());
    if prompt_len + longer_answer > opts.max_length {
        truncate(&mut chosen_prompt, opts.max_prompt_length, opts.truncation_mode);
        truncate(&mut rejected_prompt, opts.max_prompt_length, opts.truncation_mode);
    }

    let prompt_len = chosen_prompt.len().max(rejected_prompt.len());
    if prompt_len + longer_answer > opts.max_length {
        let answer_budget = opts.max_length - opts.max_prompt_length;
        chosen_answer.truncate(answer_budget);
        rejected_answer.truncate(answer_budget);
    }

    Ok(TokenizedPair {
        chosen: assemble(&chosen_prompt, &chosen_answer),
        rejected: assemble(&rejected_prompt, &rejected_answer),
    })
}
