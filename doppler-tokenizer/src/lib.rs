//! Doppler tokenizer core
//!
//! Backend-polymorphic text <-> token-id conversion. Three backends share one
//! surface: greedy longest-match BPE, Unigram Viterbi, and the `tokenizers`
//! crate for models that ship a prebuilt `tokenizer.json`. Special tokens are
//! segmented out before the backend runs so their strings never merge into
//! neighboring text.

pub mod bpe;
pub mod bundled;
pub mod config;
pub mod special;
pub mod unigram;

use thiserror::Error;
use tracing::warn;

use bpe::BpeModel;
use bundled::BundledModel;
use config::{TokenizerConfig, TokenizerKind};
use special::{Segment, SpecialTokens};
use unigram::UnigramModel;

/// Sentencepiece word boundary marker.
pub const SPACE_MARKER: char = '\u{2581}';

#[derive(Error, Debug)]
pub enum TokenizerError {
    #[error("tokenizer not initialized: vocabulary is empty")]
    Uninitialized,

    #[error("unknown tokenizer backend '{0}'")]
    UnknownBackend(String),

    #[error("invalid tokenizer config: {0}")]
    InvalidConfig(String),

    #[error("bundled tokenizer error: {0}")]
    Bundled(String),
}

pub type Result<T> = std::result::Result<T, TokenizerError>;

enum Backend {
    Bpe(BpeModel),
    Unigram(UnigramModel),
    Bundled(BundledModel),
}

/// The engine-facing tokenizer: `encode` and `decode` plus policy flags.
pub struct Tokenizer {
    backend: Backend,
    specials: SpecialTokens,
    add_bos: bool,
    add_eos: bool,
    add_space_prefix: bool,
}

impl Tokenizer {
    /// Build a BPE or Unigram tokenizer from its manifest config.
    pub fn from_config(config: &TokenizerConfig) -> Result<Self> {
        let specials = SpecialTokens::from_config(config);
        let backend = match config.kind {
            TokenizerKind::Bpe => Backend::Bpe(BpeModel::from_config(config)?),
            TokenizerKind::Unigram => Backend::Unigram(UnigramModel::from_config(config)?),
            TokenizerKind::Bundled => {
                return Err(TokenizerError::InvalidConfig(
                    "bundled tokenizer needs serialized bytes, use Tokenizer::bundled".to_string(),
                ))
            }
        };
        Ok(Self {
            backend,
            specials,
            add_bos: config.add_bos,
            add_eos: config.add_eos,
            add_space_prefix: config.add_space_prefix,
        })
    }

    /// Wrap a serialized `tokenizer.json` in the bundled backend.
    pub fn bundled(bytes: &[u8], config: &TokenizerConfig) -> Result<Self> {
        let specials = SpecialTokens::from_config(config);
        Ok(Self {
            backend: Backend::Bundled(BundledModel::from_bytes(bytes)?),
            specials,
            add_bos: config.add_bos,
            add_eos: config.add_eos,
            add_space_prefix: config.add_space_prefix,
        })
    }

    pub fn vocab_size(&self) -> usize {
        match &self.backend {
            Backend::Bpe(m) => m.vocab_size(),
            Backend::Unigram(m) => m.vocab_size(),
            Backend::Bundled(m) => m.vocab_size(),
        }
    }

    pub fn specials(&self) -> &SpecialTokens {
        &self.specials
    }

    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        if self.vocab_size() == 0 {
            return Err(TokenizerError::Uninitialized);
        }

        let mut ids = Vec::new();
        if self.add_bos {
            if let Some(bos) = self.specials.bos {
                ids.push(bos);
            }
        }

        for segment in self.specials.segment(text) {
            match segment {
                Segment::Special(id) => ids.push(id),
                Segment::Text(plain) => self.encode_plain(&plain, &mut ids)?,
            }
        }

        if self.add_eos {
            if let Some(eos) = self.specials.eos {
                ids.push(eos);
            }
        }
        Ok(ids)
    }

    fn encode_plain(&self, text: &str, out: &mut Vec<u32>) -> Result<()> {
        match &self.backend {
            Backend::Bpe(m) => m.encode_into(text, self.add_space_prefix, out),
            Backend::Unigram(m) => m.encode_into(text, self.add_space_prefix, out),
            Backend::Bundled(m) => m.encode_into(text, out),
        }
    }

    pub fn decode(&self, ids: &[u32], skip_special: bool, trim: bool) -> Result<String> {
        let text = match &self.backend {
            Backend::Bundled(m) => m.decode(ids, skip_special)?,
            _ => {
                let mut bytes = Vec::new();
                for &id in ids {
                    if skip_special && self.specials.is_special(id) {
                        continue;
                    }
                    match self.token_text(id) {
                        Some(piece) => push_piece(&mut bytes, &piece),
                        None => warn!("decode: unknown token id {}", id),
                    }
                }
                String::from_utf8_lossy(&bytes).into_owned()
            }
        };
        Ok(if trim { text.trim().to_string() } else { text })
    }

    /// The raw vocabulary string for an id, if any.
    pub fn token_text(&self, id: u32) -> Option<String> {
        if let Some(text) = self.specials.text_for(id) {
            return Some(text.to_string());
        }
        match &self.backend {
            Backend::Bpe(m) => m.token_text(id).map(str::to_string),
            Backend::Unigram(m) => m.token_text(id).map(str::to_string),
            Backend::Bundled(m) => m.token_text(id),
        }
    }
}

/// Append one decoded piece, mapping byte tokens and word-boundary markers.
fn push_piece(bytes: &mut Vec<u8>, piece: &str) {
    if let Some(b) = parse_byte_token(piece) {
        bytes.push(b);
        return;
    }
    for ch in piece.chars() {
        match ch {
            SPACE_MARKER | '\u{0120}' => bytes.push(b' '), // ▁ and Ġ
            '\u{010A}' => bytes.push(b'\n'),               // Ċ
            _ => {
                let mut buf = [0u8; 4];
                bytes.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
}

/// `<0xHH>` byte-fallback tokens.
pub(crate) fn parse_byte_token(piece: &str) -> Option<u8> {
    let inner = piece.strip_prefix("<0x")?.strip_suffix('>')?;
    if inner.len() != 2 {
        return None;
    }
    u8::from_str_radix(inner, 16).ok()
}

pub(crate) fn byte_token(b: u8) -> String {
    format!("<0x{b:02X}>")
}
