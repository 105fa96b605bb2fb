//! Preference dataset loading and chat formatting.
//!
//! Two record shapes are accepted. Evaluation-set rows carry a `prompt`
//! (plain text or a list of turns) with `chosen`/`rejected` reply strings.
//! Preference-set rows carry `chosen`/`rejected` as complete conversations;
//! the prompt is every turn before the final assistant reply.
//!
//! Files are JSONL, JSON arrays, or Parquet. Parquet record batches are
//! converted to JSON rows so both paths share the same record parsing.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::{DatasetSource, SourceFile};
use crate::conversation::{Conversation, Message, Role};
use crate::errors::{EvalError, EvalResult};
use crate::hub::HubClient;

/// A normalized preference pair.
#[derive(Debug, Clone, PartialEq)]
pub struct PreferenceRecord {
    pub prompt: Vec<Message>,
    pub chosen: String,
    pub rejected: String,
    pub subset: String,
}

/// Chat-templated text for one pair. Both completions extend `prompt`.
#[derive(Debug, Clone, PartialEq)]
pub struct FormattedPair {
    pub prompt: String,
    pub text_chosen: String,
    pub text_rejected: String,
}

/// Formatted pairs with their subset labels kept alongside, in dataset order.
#[derive(Debug, Clone, Default)]
pub struct EvalDataset {
    pub pairs: Vec<FormattedPair>,
    pub subsets: Vec<String>,
}

impl EvalDataset {
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum TextOrTurns {
    Text(String),
    Turns(Vec<Message>),
}

#[derive(Debug, Clone, Deserialize)]
struct RawRecord {
    #[serde(default)]
    prompt: Option<TextOrTurns>,
    chosen: TextOrTurns,
    rejected: TextOrTurns,
    #[serde(default)]
    subset: Option<String>,
}

fn final_reply(field: &str, value: &TextOrTurns) -> EvalResult<String> {
    match value {
        TextOrTurns::Text(text) => Ok(text.clone()),
        TextOrTurns::Turns(turns) => match turns.last() {
            Some(last) if last.role == Role::Assistant => Ok(last.content.clone()),
            _ => Err(EvalError::dataset(format!(
                "'{field}' conversation does not end with an assistant turn"
            ))),
        },
    }
}

impl RawRecord {
    fn normalize(self, file_subset: Option<&str>) -> EvalResult<PreferenceRecord> {
        let prompt = match (&self.chosen, self.prompt) {
            (TextOrTurns::Turns(turns), _) if turns.len() > 1 => turns[..turns.len() - 1].to_vec(),
            (_, Some(TextOrTurns::Text(text))) => vec![Message::user(text)],
            (_, Some(TextOrTurns::Turns(turns))) => turns,
            (_, None) => {
                return Err(EvalError::dataset(
                    "record has no prompt and 'chosen' is not a full conversation",
                ))
            }
        };

        match prompt.last() {
            Some(last) if last.role == Role::User => {}
            _ => {
                return Err(EvalError::dataset(
                    "prompt must end with a user turn",
                ))
            }
        }

        let subset = file_subset
            .map(str::to_string)
            .or(self.subset)
            .ok_or_else(|| EvalError::dataset("record has no subset label"))?;

        Ok(PreferenceRecord {
            prompt,
            chosen: final_reply("chosen", &self.chosen)?,
            rejected: final_reply("rejected", &self.rejected)?,
            subset,
        })
    }
}

/// Parse one JSON row into a normalized record.
pub fn parse_record(value: Value, file_subset: Option<&str>) -> EvalResult<PreferenceRecord> {
    let raw: RawRecord = serde_json::from_value(value)
        .map_err(|e| EvalError::serialization("decoding preference record", e))?;
    raw.normalize(file_subset)
}

/// Apply the chat template to a record.
pub fn format_pair(conv: &Conversation, record: &PreferenceRecord) -> EvalResult<FormattedPair> {
    let prompt = conv.render(&record.prompt, true)?;

    let mut turns = record.prompt.clone();
    turns.push(Message::assistant(record.chosen.clone()));
    let text_chosen = conv.render(&turns, false)?;

    if let Some(last) = turns.last_mut() {
        last.content = record.rejected.clone();
    }
    let text_rejected = conv.render(&turns, false)?;

    if !text_chosen.starts_with(&prompt) || !text_rejected.starts_with(&prompt) {
        return Err(EvalError::template(format!(
            "template '{}' does not render completions as an extension of the prompt",
            conv.name
        )));
    }

    Ok(FormattedPair {
        prompt,
        text_chosen,
        text_rejected,
    })
}

/// Read every row of a JSONL, JSON or Parquet file as a JSON value.
pub fn read_rows(path: &Path) -> EvalResult<Vec<Value>> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();

    match extension.as_str() {
        "jsonl" => read_jsonl(path),
        "json" => {
            let file = File::open(path)
                .map_err(|e| EvalError::io(format!("opening {}", path.display()), e))?;
            serde_json::from_reader(BufReader::new(file))
                .map_err(|e| EvalError::serialization(format!("parsing {}", path.display()), e))
        }
        "parquet" => read_parquet(path),
        other => Err(EvalError::dataset(format!(
            "unsupported dataset file extension '{other}' for {}",
            path.display()
        ))),
    }
}

fn read_jsonl(path: &Path) -> EvalResult<Vec<Value>> {
    let file =
        File::open(path).map_err(|e| EvalError::io(format!("opening {}", path.display()), e))?;
    let mut rows = Vec::new();

    for (line_num, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| EvalError::io(format!("reading {}", path.display()), e))?;
        if line.trim().is_empty() {
            continue;
        }
        let value = serde_json::from_str(&line).map_err(|e| {
            EvalError::serialization(format!("{} line {}", path.display(), line_num + 1), e)
        })?;
        rows.push(value);
    }

    Ok(rows)
}

fn read_parquet(path: &Path) -> EvalResult<Vec<Value>> {
    let file =
        File::open(path).map_err(|e| EvalError::io(format!("opening {}", path.display()), e))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .and_then(|builder| builder.build())
        .map_err(|e| {
            EvalError::dataset(format!("not a valid Parquet file {}: {e}", path.display()))
        })?;

    let mut rows = Vec::new();
    for batch in reader {
        let batch = batch.map_err(|e| {
            EvalError::dataset(format!("reading record batch from {}: {e}", path.display()))
        })?;
        rows.extend(batch_to_rows(&batch)?);
    }
    Ok(rows)
}

fn batch_to_rows(batch: &RecordBatch) -> EvalResult<Vec<Value>> {
    if batch.num_rows() == 0 {
        return Ok(Vec::new());
    }
    let mut writer = arrow::json::ArrayWriter::new(Vec::new());
    writer
        .write_batches(&[batch])
        .and_then(|_| writer.finish())
        .map_err(|e| EvalError::dataset(format!("converting record batch to JSON: {e}")))?;
    let buf = writer.into_inner();
    serde_json::from_slice(&buf)
        .map_err(|e| EvalError::serialization("decoding converted record batch", e))
}

/// Resolve a source file to a local path, downloading from the hub if needed.
fn resolve_file(source: &DatasetSource, file: &SourceFile, hub: &HubClient) -> EvalResult<PathBuf> {
    match &source.local_dir {
        Some(dir) => {
            let path = dir.join(&file.path);
            if !path.exists() {
                return Err(EvalError::dataset(format!(
                    "dataset file {} does not exist",
                    path.display()
                )));
            }
            Ok(path)
        }
        None => hub.dataset_file(&source.repo_id, &source.revision, &file.path),
    }
}

/// Load, normalize and format every record of `source`.
pub fn load_eval_dataset(
    source: &DatasetSource,
    conv: &Conversation,
    hub: &HubClient,
) -> EvalResult<EvalDataset> {
    let mut dataset = EvalDataset::default();

    for file in &source.files {
        let path = resolve_file(source, file, hub)?;
        let rows = read_rows(&path)?;
        debug!(file = %path.display(), rows = rows.len(), "Read dataset file");

        for (row_num, row) in rows.into_iter().enumerate() {
            let record = parse_record(row, file.subset.as_deref()).map_err(|e| {
                EvalError::dataset(format!("{} row {}: {e}", file.path, row_num + 1))
            })?;
            let pair = format_pair(conv, &record)?;
            dataset.pairs.push(pair);
            dataset.subsets.push(record.subset);
        }
    }

    if dataset.is_empty() {
        return Err(EvalError::dataset(format!(
            "no preference records found in {}",
            source.repo_id
        )));
    }

    info!(
        records = dataset.len(),
        files = source.files.len(),
        template = conv.name,
        "Loaded evaluation dataset"
    );
    Ok(dataset)
}
