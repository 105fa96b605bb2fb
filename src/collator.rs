use candle_core::{Device, Tensor};

use crate::errors::{EvalError, EvalResult};
use crate::tokenize::{TokenizedPair, TokenizedSequence};

/// A padded batch of `pairs` preference pairs.
///
/// Rows `0..pairs` hold the chosen sequences and rows `pairs..2*pairs` the
/// rejected ones, all right-padded to the same length.
#[derive(Debug)]
pub struct PaddedBatch {
    pub input_ids: Tensor,
    pub attention_mask: Tensor,
    pub labels: Tensor,
    pub pairs: usize,
}

/// Right-pads tokenized pairs into a single concatenated batch.
#[derive(Debug, Clone, Copy)]
pub struct DpoCollator {
    pub pad_token_id: u32,
    pub label_pad_token_id: i64,
}

impl DpoCollator {
    pub fn new(pad_token_id: u32, label_pad_token_id: i64) -> Self {
        Self {
            pad_token_id,
            label_pad_token_id,
        }
    }

    /// Host-side padding: returns flattened `(input_ids, attention_mask, labels)`
    /// and the padded row length.
    pub fn pad(&self, pairs: &[TokenizedPair]) -> EvalResult<(Vec<u32>, Vec<u32>, Vec<i64>, usize)> {
        if pairs.is_empty() {
            return Err(EvalError::validation("batch", "cannot collate an empty batch"));
        }

        let rows: Vec<&TokenizedSequence> = pairs
            .iter()
            .map(|p| &p.chosen)
            .chain(pairs.iter().map(|p| &p.rejected))
            .collect();
        let max_len = rows.iter().map(|r| r.input_ids.len()).max().unwrap_or(0);

        let mut input_ids = Vec::with_capacity(rows.len() * max_len);
        let mut attention_mask = Vec::with_capacity(rows.len() * max_len);
        let mut labels = Vec::with_capacity(rows.len() * max_len);

        for row in rows {
            let pad = max_len - row.input_ids.len();
            input_ids.extend_from_slice(&row.input_ids);
            input_ids.extend(std::iter::repeat(self.pad_token_id).take(pad));
            attention_mask.extend_from_slice(&row.attention_mask);
            attention_mask.extend(std::iter::repeat(0u32).take(pad));
            labels.extend_from_slice(&row.labels);
            labels.extend(std::iter::repeat(self.label_pad_token_id).take(pad));
        }

        Ok((input_ids, attention_mask, labels, max_len))
    }

    /// Pad and move a slice of pairs onto `device`.
    pub fn collate(&self, pairs: &[TokenizedPair], device: &Device) -> EvalResult<PaddedBatch> {
        let (input_ids, attention_mask, labels, max_len) = self.pad(pairs)?;
        let shape = (pairs.len() * 2, max_len);

        Ok(PaddedBatch {
            input_ids: Tensor::from_vec(input_ids, shape, device)
                .map_err(|e| EvalError::model("building input_ids", e))?,
            attention_mask: Tensor::from_vec(attention_mask, shape, device)
                .map_err(|e| EvalError::model("building attention_mask", e))?,
            labels: Tensor::from_vec(labels, shape, device)
                .map_err(|e| EvalError::model("building labels", e))?,
            pairs: pairs.len(),
        })
    }
}

/// Consecutive batches in dataset order; the last one may be short.
pub fn batches(pairs: &[TokenizedPair], batch_size: usize) -> impl Iterator<Item = &[TokenizedPair]> {
    pairs.chunks(batch_size.max(1))
}

pub fn num_batches(len: usize, batch_size: usize) -> usize {
    len.div_ceil(batch_size.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(ids: &[u32], prompt_len: usize) -> TokenizedSequence {
        TokenizedSequence {
            input_ids: ids.to_vec(),
            attention_mask: vec![1; ids.len()],
            labels: ids
                .iter()
                .enumerate()
                .map(|(i, &id)| if i < prompt_len { -100 } else { id as i64 })
                .collect(),
        }
    }

    #[test]
    fn pads_to_longest_row_with_chosen_first() {
        let pairs = vec![
            TokenizedPair {
                chosen: seq(&[5, 6, 7], 1),
                rejected: seq(&[5, 8], 1),
            },
            TokenizedPair {
                chosen: seq(&[9, 10], 1),
                rejected: seq(&[9, 11, 12, 13], 1),
            },
        ];
        let collator = DpoCollator::new(0, -100);
        let (ids, mask, labels, max_len) = collator.pad(&pairs).unwrap();

        assert_eq!(max_len, 4);
        assert_eq!(&ids[0..4], &[5, 6, 7, 0]);
        assert_eq!(&ids[4..8], &[9, 10, 0, 0]);
        assert_eq!(&ids[8..12], &[5, 8, 0, 0]);
        assert_eq!(&ids[12..16], &[9, 11, 12, 13]);
        assert_eq!(&mask[4..8], &[1, 1, 0, 0]);
        assert_eq!(&labels[8..12], &[-100, 8, -100, -100]);
    }

    #[test]
    fn collate_builds_tensors_on_device() {
        let pairs = vec![TokenizedPair {
            chosen: seq(&[1, 2, 3], 1),
            rejected: seq(&[1, 4], 1),
        }];
        let batch = DpoCollator::new(0, -100)
            .collate(&pairs, &Device::Cpu)
            .unwrap();
        assert_eq!(batch.pairs, 1);
        assert_eq!(batch.input_ids.dims(), &[2, 3]);
        assert_eq!(
            batch.attention_mask.to_vec2::<u32>().unwrap(),
            vec![vec![1, 1, 1], vec![1, 1, 0]]
        );
        assert!(crate::model::ensure_right_padded(&batch.attention_mask).is_ok());
        assert_eq!(
            batch.labels.to_vec2::<i64>().unwrap(),
            vec![vec![-100, 2, 3], vec![-100, 4, -100]]
        );
    }

    #[test]
    fn empty_batch_is_rejected() {
        assert!(DpoCollator::new(0, -100).pad(&[]).is_err());
    }

    #[test]
    fn batches_keep_order_and_short_tail() {
        let pairs: Vec<TokenizedPair> = (0..5)
            .map(|i| TokenizedPair {
                chosen: seq(&[i], 0),
                rejected: seq(&[i], 0),
            })
            .collect();
        let sizes: Vec<usize> = batches(&pairs, 2).map(|b| b.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(num_batches(5, 2), 3);
        assert_eq!(num_batches(4, 2), 2);
    }
}
