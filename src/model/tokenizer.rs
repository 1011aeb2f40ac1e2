//! Tokenizer integration using HuggingFace tokenizers

use std::path::Path;
use tokenizers::Tokenizer;

pub struct TokenizerWrapper {
    tokenizer: Tokenizer,
    eos_token_id: u32,
}

impl TokenizerWrapper {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let tokenizer = Tokenizer::from_file(path)
            .map_err(|e| anyhow::anyhow!("Failed to load tokenizer: {}", e))?;

        let eos_token_id = tokenizer
            .token_to_id("</s>")
            .or_else(|| tokenizer.token_to_id("<|endoftext|>"))
            .ok_or_else(|| anyhow::anyhow!("tokenizer defines no known EOS token"))?;

        Ok(Self {
            tokenizer,
            eos_token_id,
        })
    }

    /// Load `tokenizer.json` from a resolved model directory.
    pub fn from_model_dir(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        Self::from_file(dir.as_ref().join("tokenizer.json"))
    }

    pub fn eos_token_id(&self) -> u32 {
        self.eos_token_id
    }

    /// The pad token mirrors EOS; base Llama checkpoints define no pad token.
    pub fn pad_token_id(&self) -> u32 {
        self.eos_token_id
    }

    pub fn encode(&self, text: &str, add_special_tokens: bool) -> anyhow::Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, add_special_tokens)
            .map_err(|e| anyhow::anyhow!("Tokenization error: {}", e))?;
        Ok(encoding.get_ids().to_vec())
    }

    pub fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> anyhow::Result<String> {
        self.tokenizer
            .decode(ids, skip_special_tokens)
            .map_err(|e| anyhow::anyhow!("Decode error: {}", e))
    }

    pub fn encode_batch(
        &self,
        texts: &[&str],
        add_special_tokens: bool,
    ) -> anyhow::Result<Vec<Vec<u32>>> {
        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), add_special_tokens)
            .map_err(|e| anyhow::anyhow!("Batch tokenization error: {}", e))?;
        Ok(encodings.iter().map(|e| e.get_ids().to_vec()).collect())
    }
}
