//! Tokenizer manifest config.

use std::collections::HashMap;

use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenizerKind {
    #[default]
    Bpe,
    Unigram,
    /// Prebuilt `tokenizer.json` consumed through the `tokenizers` crate.
    Bundled,
}

/// The `tokenizer` block of the model manifest. Unknown keys are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenizerConfig {
    #[serde(rename = "type", default)]
    pub kind: TokenizerKind,

    /// BPE vocabulary: token string -> id.
    #[serde(default)]
    pub vocab: HashMap<String, u32>,

    /// BPE merge table. Present for completeness; the longest-match encoder
    /// does not re-apply merges after choosing a token.
    #[serde(default)]
    pub merges: Vec<String>,

    /// Unigram pieces: (token string, log score).
    #[serde(default)]
    pub scores: Vec<(String, f32)>,

    /// Extra special tokens: string -> id.
    #[serde(default)]
    pub special_tokens: HashMap<String, u32>,

    #[serde(default)]
    pub bos_id: Option<u32>,
    #[serde(default)]
    pub eos_id: Option<u32>,
    #[serde(default)]
    pub pad_id: Option<u32>,
    #[serde(default)]
    pub unk_id: Option<u32>,

    #[serde(default)]
    pub add_bos: bool,
    #[serde(default)]
    pub add_eos: bool,
    /// Prepend a word-boundary marker to the first word (sentencepiece style).
    #[serde(default)]
    pub add_space_prefix: bool,
}
