// Per-subset accuracy and the local results file

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::info;

use crate::errors::{EvalError, EvalResult};

/// Correct/total counts for one subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SubsetScore {
    pub correct: usize,
    pub total: usize,
}

impl SubsetScore {
    pub fn accuracy(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f64 / self.total as f64
        }
    }
}

/// Grouped evaluation results plus run metadata.
#[derive(Debug, Clone)]
pub struct EvalResults {
    pub model: String,
    pub chat_template: String,
    pub subsets: BTreeMap<String, SubsetScore>,
}

impl EvalResults {
    /// Group per-pair outcomes (1 = chosen preferred) by subset label.
    pub fn from_outcomes(
        model: &str,
        chat_template: &str,
        outcomes: &[u8],
        subsets: &[String],
    ) -> EvalResult<Self> {
        if outcomes.len() != subsets.len() {
            return Err(EvalError::validation(
                "results",
                format!(
                    "{} outcomes for {} subset labels",
                    outcomes.len(),
                    subsets.len()
                ),
            ));
        }

        let mut grouped: BTreeMap<String, SubsetScore> = BTreeMap::new();
        for (outcome, subset) in outcomes.iter().zip(subsets) {
            let score = grouped
                .entry(subset.clone())
                .or_insert(SubsetScore { correct: 0, total: 0 });
            score.correct += usize::from(*outcome > 0);
            score.total += 1;
        }

        Ok(Self {
            model: model.to_string(),
            chat_template: chat_template.to_string(),
            subsets: grouped,
        })
    }

    /// `{subset}: {correct}/{total} ({accuracy})` lines, in subset order.
    ///
    /// Accuracy always shows a fractional part: `1.0`, not `1`.
    pub fn summary_lines(&self) -> Vec<String> {
        self.subsets
            .iter()
            .map(|(name, s)| format!("{name}: {}/{} ({:?})", s.correct, s.total, s.accuracy()))
            .collect()
    }

    /// Results object with sorted keys: metadata plus one accuracy per subset.
    pub fn to_value(&self) -> Value {
        let mut sorted: BTreeMap<String, Value> = BTreeMap::new();
        sorted.insert("model".into(), Value::from(self.model.clone()));
        sorted.insert("chat_template".into(), Value::from(self.chat_template.clone()));
        for (name, score) in &self.subsets {
            sorted.insert(name.clone(), Value::from(score.accuracy()));
        }
        Value::Object(sorted.into_iter().collect::<Map<String, Value>>())
    }

    /// Pretty JSON with four-space indentation.
    pub fn to_json(&self) -> EvalResult<String> {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        self.to_value()
            .serialize(&mut ser)
            .map_err(|e| EvalError::serialization("encoding results", e))?;
        String::from_utf8(buf).map_err(|e| EvalError::validation("results", e.to_string()))
    }

    /// Replace `path` with the results JSON, creating its directory.
    pub fn save(&self, path: &Path) -> EvalResult<String> {
        let dumped = self.to_json()?;
        info!("Stored local JSON data {dumped}.");

        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .map_err(|e| EvalError::io(format!("creating {}", dir.display()), e))?;
        }
        if path.is_file() {
            std::fs::remove_file(path)
                .map_err(|e| EvalError::io(format!("removing old {}", path.display()), e))?;
        }
        std::fs::write(path, &dumped)
            .map_err(|e| EvalError::io(format!("writing {}", path.display()), e))?;
        Ok(dumped)
    }
}
