//! Unigram Viterbi encoder.

use std::collections::HashMap;

use tracing::warn;

use crate::config::TokenizerConfig;
use crate::{byte_token, Result, TokenizerError, SPACE_MARKER};

const MAX_PIECE_CHARS: usize = 32;

/// Per-byte penalty when no vocabulary piece matches.
const BYTE_FALLBACK_SCORE: f64 = -10.0;

pub struct UnigramModel {
    pieces: HashMap<String, (u32, f64)>,
    id_to_token: HashMap<u32, String>,
    byte_ids: Vec<Option<u32>>,
    unk: Option<u32>,
}

#[derive(Clone)]
enum Step {
    Piece { id: u32, chars: usize },
    Bytes(char),
}

impl UnigramModel {
    pub fn from_config(config: &TokenizerConfig) -> Result<Self> {
        if config.scores.is_empty() {
            return Err(TokenizerError::Uninitialized);
        }
        let mut pieces = HashMap::with_capacity(config.scores.len());
        let mut id_to_token = HashMap::with_capacity(config.scores.len());
        for (id, (piece, score)) in config.scores.iter().enumerate() {
            pieces.insert(piece.clone(), (id as u32, *score as f64));
            id_to_token.insert(id as u32, piece.clone());
        }
        let byte_ids = (0..=255u8)
            .map(|b| pieces.get(&byte_token(b)).map(|&(id, _)| id))
            .collect();

        Ok(Self {
            pieces,
            id_to_token,
            byte_ids,
            unk: config.unk_id,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.pieces.len()
    }

    pub fn token_text(&self, id: u32) -> Option<&str> {
        self.id_to_token.get(&id).map(String::as_str)
    }

    /// Viterbi over char positions: `best[i]` is the maximum score of any
    /// segmentation reaching position `i`.
    pub fn encode_into(&self, text: &str, add_space_prefix: bool, out: &mut Vec<u32>) -> Result<()> {
        let normalized = normalize(text, add_space_prefix);
        let chars: Vec<char> = normalized.chars().collect();
        let n = chars.len();
        if n == 0 {
            return Ok(());
        }

        let mut best = vec![f64::NEG_INFINITY; n + 1];
        let mut back: Vec<Option<(usize, Step)>> = vec![None; n + 1];
        best[0] = 0.0;

        for i in 0..n {
            if best[i] == f64::NEG_INFINITY {
                continue;
            }
            let mut matched_any = false;
            let max_len = MAX_PIECE_CHARS.min(n - i);
            for len in 1..=max_len {
                let candidate: String = chars[i..i + len].iter().collect();
                if let Some(&(id, score)) = self.pieces.get(&candidate) {
                    matched_any = true;
                    let total = best[i] + score;
                    if total > best[i + len] {
                        best[i + len] = total;
                        back[i + len] = Some((i, Step::Piece { id, chars: len }));
                    }
                }
            }

            if !matched_any {
                // No piece starts here: single-char byte fallback with a
                // penalty proportional to its UTF-8 length.
                let ch = chars[i];
                let total = best[i] + BYTE_FALLBACK_SCORE * ch.len_utf8() as f64;
                if total > best[i + 1] {
                    best[i + 1] = total;
                    back[i + 1] = Some((i, Step::Bytes(ch)));
                }
            }
        }

        // Backtrack, then emit in forward order.
        let mut steps = Vec::new();
        let mut pos = n;
        while pos > 0 {
            let (prev, step) = back[pos]
                .clone()
                .ok_or_else(|| TokenizerError::InvalidConfig("no viterbi path".to_string()))?;
            steps.push(step);
            pos = prev;
        }
        for step in steps.into_iter().rev() {
            match step {
                Step::Piece { id, .. } => out.push(id),
                Step::Bytes(ch) => self.push_byte_fallback(ch, out),
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
