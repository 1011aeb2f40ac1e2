//! Dual-objective batch collation.
//!
//! Every example is rendered twice: a predict view supervising the target
//! text and an explain view supervising the rationale. Both views tokenize
//! the same prompt under different task prefixes, right-pad with the pad
//! token (EOS, since base Llama checkpoints define no pad token) and mask
//! prompt and padding positions to [`IGNORE_INDEX`] in the labels.

use mlx_rs::Array;

use crate::loss::IGNORE_INDEX;
use crate::model::TokenizerWrapper;

use super::streaming::TrainExample;

pub const PREDICT_PREFIX: &str = "predict: ";
pub const EXPLAIN_PREFIX: &str = "explain: ";

/// Tokenized batch for one objective view.
pub struct EncodedBatch {
    /// [batch, seq] i32 token ids.
    pub input_ids: Array,
    /// [batch, seq] i32 labels, `IGNORE_INDEX` over prompt and padding.
    pub labels: Array,
}

/// Both views of one batch, sharing examples and padding rules.
pub struct DualBatch {
    pub predict: EncodedBatch,
    pub explain: EncodedBatch,
}

pub struct DualObjectiveCollator {
    tokenizer: TokenizerWrapper,
    max_seq_len: usize,
}

impl DualObjectiveCollator {
    pub fn new(tokenizer: TokenizerWrapper, max_seq_len: usize) -> Self {
        Self {
            tokenizer,
            max_seq_len,
        }
    }

    pub fn tokenizer(&self) -> &TokenizerWrapper {
        &self.tokenizer
    }

    pub fn collate(&self, examples: &[TrainExample]) -> anyhow::Result<DualBatch> {
        if examples.is_empty() {
            anyhow::bail!("cannot collate an empty batch");
        }

        let predict = self.encode_view(examples, PREDICT_PREFIX, |ex| &ex.target)?;
        let explain = self.encode_view(examples, EXPLAIN_PREFIX, |ex| &ex.rationale)?;

        Ok(DualBatch { predict, explain })
    }

    fn encode_view<'a>(
        &self,
        examples: &'a [TrainExample],
        prefix: &str,
        completion: impl Fn(&'a TrainExample) -> &'a str,
    ) -> anyhow::Result<EncodedBatch> {
        let eos = self.tokenizer.eos_token_id() as i32;
        let pad = self.tokenizer.pad_token_id() as i32;

        let mut rows: Vec<(Vec<i32>, Vec<i32>)> = Vec::with_capacity(examples.len());
        let mut max_len = 0usize;

        for ex in examples {
            let prompt_text = format!("{}{}", prefix, ex.prompt);
            let full_text = format!("{}{}", prompt_text, completion(ex));

            let prompt_ids = self.tokenizer.encode(&prompt_text, true)?;
            let mut full_ids: Vec<i32> = self
                .tokenizer
                .encode(&full_text, true)?
                .into_iter()
                .map(|id| id as i32)
                .collect();
            full_ids.push(eos);

            full_ids.truncate(self.max_seq_len);

            // The prompt may itself exceed max_seq_len; the whole row is then
            // masked and contributes nothing
            let prompt_len = prompt_ids.len().min(full_ids.len());

            let mut labels: Vec<i32> = full_ids.clone();
            for label in labels.iter_mut().take(prompt_len) {
                *label = IGNORE_INDEX;
            }

            max_len = max_len.max(full_ids.len());
            rows.push((full_ids, labels));
        }

        // Right padding
        let batch = rows.len();
        let mut input_data = Vec::with_capacity(batch * max_len);
        let mut label_data = Vec::with_capacity(batch * max_len);

        for (input_ids, labels) in rows {
            let fill = max_len - input_ids.len();
            input_data.extend_from_slice(&input_ids);
            input_data.extend(std::iter::repeat(pad).take(fill));
            label_data.extend_from_slice(&labels);
            label_data.extend(std::iter::repeat(IGNORE_INDEX).take(fill));
        }

        let shape = [batch as i32, max_len as i32];
        Ok(EncodedBatch {
            input_ids: Array::from_slice(&input_data, &shape),
            labels: Array::from_slice(&label_data, &shape),
        })
    }
}
