//! Greedy longest-match BPE encoder.
//!
//! The merge table is honored implicitly: the vocabulary already contains
//! every merged token, so the longest vocabulary match at each position is
//! the final choice and merges are not re-applied afterwards.

use std::collections::HashMap;

use tracing::warn;

use crate::config::TokenizerConfig;
use crate::{byte_token, Result, TokenizerError, SPACE_MARKER};

/// Longest candidate considered at each position, in characters.
const MAX_MATCH_CHARS: usize = 32;

pub struct BpeModel {
    vocab: HashMap<String, u32>,
    id_to_token: HashMap<u32, String>,
    /// `<0xHH>` fallback ids, indexed by byte value.
    byte_ids: Vec<Option<u32>>,
    unk: Option<u32>,
    // Kept for completeness; longest-match does not re-apply merges.
    #[allow(dead_code)]
    merges: Vec<String>,
}

impl BpeModel {
    pub fn from_config(config: &TokenizerConfig) -> Result<Self> {
        if config.vocab.is_empty() {
            return Err(TokenizerError::Uninitialized);
        }
        let vocab = config.vocab.clone();
        let id_to_token = vocab.iter().map(|(s, &id)| (id, s.clone())).collect();
        let byte_ids = (0..=255u8).map(|b| vocab.get(&byte_token(b)).copied()).collect();

        Ok(Self {
            vocab,
            id_to_token,
            byte_ids,
            unk: config.unk_id,
            merges: config.merges.clone(),
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    pub fn token_text(&self, id: u32) -> Option<&str> {
        self.id_to_token.get(&id).map(String::as_str)
    }

    /// Tokenize one plain-text segment (specials already stripped).
    pub fn encode_into(&self, text: &str, add_space_prefix: bool, out: &mut Vec<u32>) -> Result<()> {
        let normalized = normalize(text, add_space_prefix);
        let chars: Vec<char> = normalized.chars().collect();

        let mut i = 0;
        while i < chars.len() {
            let max_len = MAX_MATCH_CHARS.min(chars.len() - i);
            let mut matched = None;
            for len in (1..=max_len).rev() {
                let candidate: String = chars[i..i + len].iter().collect();
                if let Some(&id) = self.vocab.get(&candidate) {
                    matched = Some((id, len));
                    break;
                }
            }

            match matched {
                Some((id, len)) => {
                    out.push(id);
                    i += len;
                }
                None => {
                    self.push_byte_fallback(chars[i], out);
                    i += 1;
                }
            }
        }
        Ok(())
    }

    fn push_byte_fallback(&self, ch: char, out: &mut Vec<u32>) {
        let mut buf = [0u8; 4];
        for &b in ch.encode_utf8(&mut buf).as_bytes() {
            match self.byte_ids[b as usize] {
                Some(id) => out.push(id),
                None => match self.unk {
                    Some(unk) => out.push(unk),
                    None => warn!("no byte token for 0x{:02X} and no unk id", b),
                },
            }
        }
    }
}

fn normalize(text: &str, add_space_prefix: bool) -> String {
    let mut normalized = String::with_capacity(text.len() + 3);
    if add_space_prefix && !text.starts_with(' ') {
        normalized.push(SPACE_MARKER);
    }
    for ch in text.chars() {
        normalized.push(if ch == ' ' { SPACE_MARKER } else { ch });
    }
    normalized
}
