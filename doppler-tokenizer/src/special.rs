//! Special-token registry and pre-encode segmentation.

use std::collections::HashMap;

use crate::config::TokenizerConfig;

/// A chunk of input after special-token segmentation.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Text(String),
    Special(u32),
}

/// Configured special tokens plus every registered special string.
pub struct SpecialTokens {
    pub bos: Option<u32>,
    pub eos: Option<u32>,
    pub pad: Option<u32>,
    pub unk: Option<u32>,
    /// Sorted by decreasing string length so longer tokens win ties.
    registered: Vec<(String, u32)>,
    by_id: HashMap<u32, String>,
}

impl SpecialTokens {
    pub fn from_config(config: &TokenizerConfig) -> Self {
        let mut registered: Vec<(String, u32)> = config
            .special_tokens
            .iter()
            .map(|(s, &id)| (s.clone(), id))
            .collect();
        registered.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then(a.0.cmp(&b.0)));

        let by_id = registered.iter().map(|(s, id)| (*id, s.clone())).collect();

        Self {
            bos: config.bos_id,
            eos: config.eos_id,
            pad: config.pad_id,
            unk: config.unk_id,
            registered,
            by_id,
        }
    }

    pub fn is_special(&self, id: u32) -> bool {
        self.by_id.contains_key(&id)
            || [self.bos, self.eos, self.pad, self.unk].contains(&Some(id))
    }

    pub fn text_for(&self, id: u32) -> Option<&str> {
        self.by_id.get(&id).map(String::as_str)
    }

    /// Split `text` around special-token occurrences.
    ///
    /// Repeatedly finds the earliest occurrence of any registered special
    /// token in the remaining text; same-position ties go to the longest
    /// token. Plain text between occurrences is passed through for the
    /// backend to tokenize.
    pub fn segment(&self, text: &str) -> Vec<Segment> {
        let mut segments = Vec::new();
        let mut rest = text;

        while !rest.is_empty() {
            let mut earliest: Option<(usize, &str, u32)> = None;
            for (token, id) in &self.registered {
                if let Some(pos) = rest.find(token.as_str()) {
                    let better = match earliest {
                        None => true,
                        // registered is longest-first, so strictly-earlier only
                        Some((best_pos, _, _)) => pos < best_pos,
                    };
                    if better {
                        earliest = Some((pos, token.as_str(), *id));
                    }
                }
            }

            match earliest {
                Some((pos, token, id)) => {
                    if pos > 0 {
                        segments.push(Segment::Text(rest[..pos].to_string()));
                    }
                    segments.push(Segment::Special(id));
                    rest = &rest[pos + token.len()..];
                }
                None => {
                    segments.push(Segment::Text(rest.to_string()));
                    break;
                }
            }
        }
        segments
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specials() -> SpecialTokens {
        let mut config = TokenizerConfig::default();
        config.special_tokens.insert("<|eot|>".to_string(), 7);
        config.special_tokens.insert("<|eot|><|x|>".to_string(), 8);
        config.special_tokens.insert("<s>".to_string(), 1);
        config.bos_id = Some(1);
        SpecialTokens::from_config(&config)
    }

    #[test]
    fn test_segmentation_basic() {
        let s = specials();
        let segments = s.segment("hello<|eot|>world");
        assert_eq!(
            segments,
            vec![
                Segment::Text("hello".to_string()),
                Segment::Special(7),
                Segment::Text("world".to_string()),
            ]
        );
    }

    #[test]
    fn test_longest_token_wins_at_same_position() {
        let s = specials();
        let segments = s.segment("a<|eot|><|x|>b");
        assert_eq!(
            segments,
            vec![
                Segment::Text("a".to_string()),
                Segment::Special(8),
                Segment::Text("b".to_string()),
            ]
        );
    }

    #[test]
    fn test_special_at_edges() {
        let s = specials();
        assert_eq!(
            s.segment("<s>hi<|eot|>"),
            vec![
                Segment::Special(1),
                Segment::Text("hi".to_string()),
                Segment::Special(7),
            ]
        );
    }

    #[test]
    fn test_no_specials_is_one_segment() {
        let s = specials();
        assert_eq!(
            s.segment("plain text"),
            vec![Segment::Text("plain text".to_string())]
        );
    }

    #[test]
    fn test_is_special_covers_configured_ids() {
        let s = specials();
        assert!(s.is_special(1));
        assert!(s.is_special(7));
        assert!(!s.is_special(42));
    }
}
