//! Bundled backend: models that ship a prebuilt `tokenizer.json`.

use crate::{Result, TokenizerError};

#[derive(Debug)]
pub struct BundledModel {
    inner: tokenizers::Tokenizer,
}

impl BundledModel {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_bytes(bytes)
            .map_err(|e| TokenizerError::Bundled(e.to_string()))?;
        Ok(Self { inner })
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    pub fn token_text(&self, id: u32) -> Option<String> {
        self.inner.id_to_token(id)
    }

    /// Special tokens are segmented upstream, so the inner encoder never adds
    /// its own.
    pub fn encode_into(&self, text: &str, out: &mut Vec<u32>) -> Result<()> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| TokenizerError::Bundled(e.to_string()))?;
        out.extend_from_slice(encoding.get_ids());
        Ok(())
    }

    pub fn decode(&self, ids: &[u32], skip_special: bool) -> Result<String> {
        self.inner
            .decode(ids, skip_special)
            .map_err(|e| TokenizerError::Bundled(e.to_string()))
    }
}
