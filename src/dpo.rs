//! DPO implicit-reward inference.
//!
//! The implicit reward of a completion is the policy model's summed
//! log-probability of its tokens minus the reference model's:
//!
//! ```text
//! r(x, y) = log pi(y|x) - log pi_ref(y|x)
//! ```
//!
//! Chosen and rejected rows run through each model in a single concatenated
//! forward pass.

use candle_core::{DType, Tensor, D};
use tracing::debug;

use crate::collator::PaddedBatch;
use crate::errors::{EvalError, EvalResult};
use crate::model::CausalLm;

/// Label value excluded from the log-probability sum.
pub const LABEL_PAD_TOKEN_ID: i64 = -100;

/// Summed log-probability of each row's labels.
///
/// `logits` is `[B, L, V]`, `labels` is `[B, L]`. Position `t` of the logits
/// predicts label `t + 1`; labels equal to [`LABEL_PAD_TOKEN_ID`] are skipped.
/// Returns `[B]` in F32.
pub fn batch_logps(logits: &Tensor, labels: &Tensor) -> candle_core::Result<Tensor> {
    let (batch, seq_len, _vocab) = logits.dims3()?;
    if seq_len < 2 {
        return Tensor::zeros(batch, DType::F32, logits.device());
    }

    let logits = logits.narrow(1, 0, seq_len - 1)?.to_dtype(DType::F32)?;
    let labels = labels.narrow(1, 1, seq_len - 1)?.to_dtype(DType::I64)?;

    let mask = labels.ne(LABEL_PAD_TOKEN_ID)?;
    let safe_labels = mask.where_cond(&labels, &labels.zeros_like()?)?;
    let index = safe_labels.to_dtype(DType::U32)?.unsqueeze(2)?.contiguous()?;

    let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
    let per_token = log_probs.gather(&index, 2)?.squeeze(2)?;

    per_token.mul(&mask.to_dtype(DType::F32)?)?.sum(1)
}

/// Rewards for one batch, in pair order.
#[derive(Debug, Clone, PartialEq)]
pub struct StepRewards {
    pub chosen: Vec<f32>,
    pub rejected: Vec<f32>,
}

impl StepRewards {
    /// 1 where the chosen reward is strictly greater, else 0.
    pub fn outcomes(&self) -> Vec<u8> {
        self.chosen
            .iter()
            .zip(&self.rejected)
            .map(|(c, r)| u8::from(c > r))
            .collect()
    }
}

/// Policy and reference models scored side by side.
pub struct DpoInference {
    policy: Box<dyn CausalLm>,
    reference: Box<dyn CausalLm>,
}

impl DpoInference {
    pub fn new(policy: Box<dyn CausalLm>, reference: Box<dyn CausalLm>) -> Self {
        Self { policy, reference }
    }

    /// Run one model over a concatenated batch and split the per-row
    /// log-probabilities into `(chosen, rejected)`.
    pub fn concatenated_forward(
        model: &mut dyn CausalLm,
        batch: &PaddedBatch,
    ) -> EvalResult<(Tensor, Tensor)> {
        let logits = model
            .forward_logits(&batch.input_ids, &batch.attention_mask)
            .map_err(|e| EvalError::model("forward pass", e))?;
        let logps = batch_logps(&logits, &batch.labels)
            .map_err(|e| EvalError::model("computing sequence log-probabilities", e))?;

        let chosen = logps
            .narrow(0, 0, batch.pairs)
            .map_err(|e| EvalError::model("splitting chosen rows", e))?;
        let rejected = logps
            .narrow(0, batch.pairs, batch.pairs)
            .map_err(|e| EvalError::model("splitting rejected rows", e))?;
        Ok((chosen, rejected))
    }

    /// Implicit rewards for every pair in `batch`.
    pub fn inference_step(&mut self, batch: &PaddedBatch) -> EvalResult<StepRewards> {
        let (policy_chosen, policy_rejected) =
            Self::concatenated_forward(self.policy.as_mut(), batch)?;
        let (ref_chosen, ref_rejected) =
            Self::concatenated_forward(self.reference.as_mut(), batch)?;

        let chosen = policy_chosen
            .sub(&ref_chosen)
            .and_then(|t| t.to_vec1::<f32>())
            .map_err(|e| EvalError::model("chosen log-ratio", e))?;
        let rejected = policy_rejected
            .sub(&ref_rejected)
            .and_then(|t| t.to_vec1::<f32>())
            .map_err(|e| EvalError::model("rejected log-ratio", e))?;

        debug!(pairs = batch.pairs, "Computed DPO rewards");
        Ok(StepRewards { chosen, rejected })
    }
}
